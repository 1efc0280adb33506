//! File-content merging.
//!
//! The resolver treats the content merger and the pristine store as
//! external collaborators behind narrow traits. [`TextMerger`] is the
//! default three-way merger shipped with the crate: line-based, using
//! `diffy` patches with standard conflict markers as fallback. It is purely
//! functional relative to its inputs and never touches the working copy —
//! its result is a work item for the executor.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::MergeError;
use crate::models::{Checksum, PropChange, Props, TextConflictInfo};
use crate::workqueue::WorkItem;

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Outcome of a content merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The working file already matches the merged result.
    Unchanged,
    /// Local and incoming changes combined cleanly.
    Merged,
    /// Overlapping changes; the result carries conflict markers.
    Conflicted,
}

/// Result of invoking the file merger.
#[derive(Debug, Clone)]
pub struct FileMergeResult {
    /// Deferred write realizing the merge, if the file needs to change.
    pub work_item: Option<WorkItem>,
    /// Present when the merge conflicted.
    pub conflict: Option<TextConflictInfo>,
    pub outcome: MergeOutcome,
}

/// External three-way file merger.
///
/// `old_pristine` is the merge base, `new_pristine` the incoming side,
/// `working` the local file. `target_relpath` names the working-copy path
/// the produced work item should address.
pub trait FileMerger {
    fn merge(
        &self,
        old_pristine: &Path,
        new_pristine: &Path,
        working: &Path,
        target_relpath: &str,
        actual_props: &Props,
        prop_changes: &[PropChange],
    ) -> Result<FileMergeResult, MergeError>;
}

/// Resolves a content-addressed checksum to a local pristine file.
pub trait PristineStore {
    fn pristine_path(&self, checksum: &Checksum) -> Result<PathBuf, MergeError>;
}

// ---------------------------------------------------------------------------
// Filesystem pristine store
// ---------------------------------------------------------------------------

/// Pristine store laid out as `<root>/<first two hex chars>/<checksum>`.
pub struct FsPristineStore {
    root: PathBuf,
}

impl FsPristineStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Store `bytes` under their own checksum, returning the handle.
    pub fn install(&self, bytes: &[u8]) -> Result<Checksum, MergeError> {
        let checksum = Checksum::of_bytes(bytes);
        let dir = self.root.join(&checksum.as_str()[..2]);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(checksum.as_str());
        if !path.exists() {
            std::fs::write(&path, bytes)?;
        }
        debug!(checksum = %checksum, "installed pristine");
        Ok(checksum)
    }
}

impl PristineStore for FsPristineStore {
    fn pristine_path(&self, checksum: &Checksum) -> Result<PathBuf, MergeError> {
        let path = self
            .root
            .join(&checksum.as_str()[..2])
            .join(checksum.as_str());
        if path.exists() {
            Ok(path)
        } else {
            Err(MergeError::PristineNotFound(checksum.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Default text merger
// ---------------------------------------------------------------------------

/// Line-based three-way merge engine.
pub struct TextMerger;

impl FileMerger for TextMerger {
    fn merge(
        &self,
        old_pristine: &Path,
        new_pristine: &Path,
        working: &Path,
        target_relpath: &str,
        _actual_props: &Props,
        _prop_changes: &[PropChange],
    ) -> Result<FileMergeResult, MergeError> {
        info!(path = target_relpath, "performing three-way text merge");

        let base_bytes = std::fs::read(old_pristine)?;
        let theirs_bytes = std::fs::read(new_pristine)?;
        let ours_bytes = std::fs::read(working)?;

        let decoded = (
            String::from_utf8(base_bytes),
            String::from_utf8(theirs_bytes),
            String::from_utf8(ours_bytes),
        );
        let (base, theirs, ours) = match decoded {
            (Ok(base), Ok(theirs), Ok(ours)) => (base, theirs, ours),
            (base, theirs, _) => {
                // Binary content cannot be line-merged; flag a conflict and
                // leave the working file alone.
                debug!(path = target_relpath, "binary content, conflicting");
                let base = base.map(String::into_bytes).unwrap_or_else(|e| e.into_bytes());
                let theirs = theirs.map(String::into_bytes).unwrap_or_else(|e| e.into_bytes());
                return Ok(FileMergeResult {
                    work_item: None,
                    conflict: Some(conflict_info(&base, &theirs)),
                    outcome: MergeOutcome::Conflicted,
                });
            }
        };

        let (merged, has_conflicts) = three_way_merge(&base, &ours, &theirs);

        if !has_conflicts && merged == ours {
            debug!(path = target_relpath, "working file already merged");
            return Ok(FileMergeResult {
                work_item: None,
                conflict: None,
                outcome: MergeOutcome::Unchanged,
            });
        }

        let work_item = Some(WorkItem::FileWrite {
            path: target_relpath.to_string(),
            contents: merged,
        });

        if has_conflicts {
            Ok(FileMergeResult {
                work_item,
                conflict: Some(conflict_info(base.as_bytes(), theirs.as_bytes())),
                outcome: MergeOutcome::Conflicted,
            })
        } else {
            Ok(FileMergeResult {
                work_item,
                conflict: None,
                outcome: MergeOutcome::Merged,
            })
        }
    }
}

fn conflict_info(base: &[u8], theirs: &[u8]) -> TextConflictInfo {
    TextConflictInfo {
        old_checksum: Some(Checksum::of_bytes(base)),
        new_checksum: Some(Checksum::of_bytes(theirs)),
    }
}

/// Merge `ours` and `theirs` against `base`. Returns the merged content and
/// whether conflict markers were inserted.
fn three_way_merge(base: &str, ours: &str, theirs: &str) -> (String, bool) {
    // Fast path: if either side is identical to base, the other side wins
    // cleanly.
    if ours == base {
        return (theirs.to_string(), false);
    }
    if theirs == base {
        return (ours.to_string(), false);
    }
    // Fast path: both sides made the exact same change.
    if ours == theirs {
        return (ours.to_string(), false);
    }

    // Try applying the theirs-patch to ours, then the reverse.
    let patch_theirs = diffy::create_patch(base, theirs);
    if let Ok(merged) = diffy::apply(ours, &patch_theirs) {
        return (merged, false);
    }
    let patch_ours = diffy::create_patch(base, ours);
    if let Ok(merged) = diffy::apply(theirs, &patch_ours) {
        return (merged, false);
    }

    (generate_conflict_output(base, ours, theirs), true)
}

/// Produce standard conflict-marker output for a failed three-way merge.
fn generate_conflict_output(base: &str, ours: &str, theirs: &str) -> String {
    let base_lines: Vec<&str> = base.lines().collect();
    let ours_lines: Vec<&str> = ours.lines().collect();
    let theirs_lines: Vec<&str> = theirs.lines().collect();

    let mut output: Vec<String> = Vec::new();
    let max_len = ours_lines.len().max(theirs_lines.len());

    let mut i = 0;
    while i < max_len {
        match (ours_lines.get(i).copied(), theirs_lines.get(i).copied()) {
            (Some(o), Some(t)) if o == t => {
                output.push(o.to_string());
                i += 1;
            }
            (Some(_), _) | (_, Some(_)) => {
                // Collect the contiguous differing region from both sides.
                let mut ours_block = Vec::new();
                let mut theirs_block = Vec::new();
                let start = i;
                while i < max_len {
                    let ol = ours_lines.get(i).copied();
                    let tl = theirs_lines.get(i).copied();
                    if ol == tl {
                        break;
                    }
                    if let Some(o) = ol {
                        ours_block.push(o.to_string());
                    }
                    if let Some(t) = tl {
                        theirs_block.push(t.to_string());
                    }
                    i += 1;
                }

                output.push("<<<<<<< working copy".to_string());
                output.extend(ours_block);
                output.push("||||||| base".to_string());
                for k in start..i {
                    if let Some(b) = base_lines.get(k) {
                        output.push(b.to_string());
                    }
                }
                output.push("=======".to_string());
                output.extend(theirs_block);
                output.push(">>>>>>> incoming".to_string());
            }
            (None, None) => break,
        }
    }

    let mut merged = output.join("\n");
    if ours.ends_with('\n') || theirs.ends_with('\n') {
        merged.push('\n');
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merge_files(base: &str, ours: &str, theirs: &str) -> FileMergeResult {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base");
        let theirs_path = dir.path().join("theirs");
        let working_path = dir.path().join("working");
        std::fs::write(&base_path, base).unwrap();
        std::fs::write(&theirs_path, theirs).unwrap();
        std::fs::write(&working_path, ours).unwrap();

        TextMerger
            .merge(
                &base_path,
                &theirs_path,
                &working_path,
                "b/f",
                &Props::new(),
                &[],
            )
            .unwrap()
    }

    #[test]
    fn test_only_theirs_changed() {
        let result = merge_files("a\nb\n", "a\nb\n", "a\nB\n");
        assert_eq!(result.outcome, MergeOutcome::Merged);
        match result.work_item.unwrap() {
            WorkItem::FileWrite { path, contents } => {
                assert_eq!(path, "b/f");
                assert_eq!(contents, "a\nB\n");
            }
            other => panic!("unexpected work item {other:?}"),
        }
    }

    #[test]
    fn test_identical_changes_unchanged() {
        let result = merge_files("a\n", "x\n", "x\n");
        assert_eq!(result.outcome, MergeOutcome::Unchanged);
        assert!(result.work_item.is_none());
        assert!(result.conflict.is_none());
    }

    #[test]
    fn test_non_overlapping_changes_merge() {
        let base = "one\ntwo\nthree\nfour\nfive\nsix\nseven\neight\n";
        let ours = "ONE\ntwo\nthree\nfour\nfive\nsix\nseven\neight\n";
        let theirs = "one\ntwo\nthree\nfour\nfive\nsix\nseven\nEIGHT\n";
        let result = merge_files(base, ours, theirs);
        assert_eq!(result.outcome, MergeOutcome::Merged);
        match result.work_item.unwrap() {
            WorkItem::FileWrite { contents, .. } => {
                assert!(contents.contains("ONE"));
                assert!(contents.contains("EIGHT"));
            }
            other => panic!("unexpected work item {other:?}"),
        }
    }

    #[test]
    fn test_overlapping_changes_conflict() {
        let result = merge_files("line\n", "ours\n", "theirs\n");
        assert_eq!(result.outcome, MergeOutcome::Conflicted);
        assert!(result.conflict.is_some());
        match result.work_item.unwrap() {
            WorkItem::FileWrite { contents, .. } => {
                assert!(contents.contains("<<<<<<< working copy"));
                assert!(contents.contains("======="));
                assert!(contents.contains(">>>>>>> incoming"));
            }
            other => panic!("unexpected work item {other:?}"),
        }
    }

    #[test]
    fn test_pristine_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPristineStore::new(dir.path());

        let checksum = store.install(b"pristine content").unwrap();
        let path = store.pristine_path(&checksum).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"pristine content");

        let missing = Checksum::of_bytes(b"never stored");
        assert!(matches!(
            store.pristine_path(&missing),
            Err(MergeError::PristineNotFound(_))
        ));
    }
}
