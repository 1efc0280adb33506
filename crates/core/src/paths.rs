//! Relative-path helpers for working-copy paths.
//!
//! Working-copy relpaths are `/`-separated, never absolute, never contain
//! `.` or `..` segments, and use `""` for the working-copy root. Op-depths
//! are derived from these paths, so the helpers here are the foundation of
//! the layer model.

/// Number of path segments in `relpath`. The working-copy root is depth 0.
pub fn relpath_depth(relpath: &str) -> i64 {
    if relpath.is_empty() {
        0
    } else {
        relpath.split('/').count() as i64
    }
}

/// Join two relpaths, treating an empty side as the identity.
pub fn relpath_join(base: &str, child: &str) -> String {
    if base.is_empty() {
        child.to_string()
    } else if child.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{child}")
    }
}

/// If `child` is `ancestor` or inside it, return the remainder relative to
/// `ancestor` (empty for `child == ancestor`). Returns `None` otherwise.
pub fn skip_ancestor<'a>(ancestor: &str, child: &'a str) -> Option<&'a str> {
    if ancestor.is_empty() {
        return Some(child);
    }
    if child == ancestor {
        return Some("");
    }
    child
        .strip_prefix(ancestor)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// True when `child` is strictly below `ancestor`.
pub fn is_strict_descendant(ancestor: &str, child: &str) -> bool {
    matches!(skip_ancestor(ancestor, child), Some(rest) if !rest.is_empty())
}

/// Parent of `relpath`; the root is its own parent.
pub fn relpath_dirname(relpath: &str) -> &str {
    match relpath.rfind('/') {
        Some(idx) => &relpath[..idx],
        None => "",
    }
}

/// Final segment of `relpath`.
pub fn relpath_basename(relpath: &str) -> &str {
    match relpath.rfind('/') {
        Some(idx) => &relpath[idx + 1..],
        None => relpath,
    }
}

/// Longest common ancestor of two relpaths.
pub fn longest_ancestor(a: &str, b: &str) -> String {
    if a == b {
        return a.to_string();
    }
    let mut common = Vec::new();
    for (sa, sb) in a.split('/').zip(b.split('/')) {
        if sa == sb && !sa.is_empty() {
            common.push(sa);
        } else {
            break;
        }
    }
    common.join("/")
}
