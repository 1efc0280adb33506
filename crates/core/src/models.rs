//! Domain model types shared by the node store and the resolver.
//!
//! These types mirror what the store persists: node layers, conflict
//! skeletons, and the spooled notification records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::ResolveError;

/// Revision number. Negative values never occur in persisted rows.
pub type Revision = i64;

/// Working properties: name -> value, kept sorted for stable diffs.
pub type Props = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Node kind and presence
// ---------------------------------------------------------------------------

/// Kind of a node, on disk or in a layer. `None` means "no node".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
    #[default]
    None,
}

impl NodeKind {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "file" => Self::File,
            "dir" => Self::Dir,
            "symlink" => Self::Symlink,
            _ => Self::None,
        }
    }

    /// Files and symlinks share the file code paths (checksummed content).
    pub fn is_file_like(self) -> bool {
        matches!(self, Self::File | Self::Symlink)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Dir => write!(f, "dir"),
            Self::Symlink => write!(f, "symlink"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Presence of a node row at one op-depth layer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// A real node at this layer.
    #[default]
    Normal,
    /// The repository has no node here at this revision; the row records
    /// the absence together with its repository location.
    NotPresent,
    /// A lower layer is shadowed by a delete at this layer.
    BaseDeleted,
    Excluded,
    Incomplete,
    /// A plain delete with no repository location.
    Deleted,
}

impl Presence {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "normal" => Self::Normal,
            "not-present" => Self::NotPresent,
            "base-deleted" => Self::BaseDeleted,
            "excluded" => Self::Excluded,
            "incomplete" => Self::Incomplete,
            _ => Self::Deleted,
        }
    }

    /// Rows that only record a delete of some layer, carrying no content.
    pub fn is_delete_marker(self) -> bool {
        matches!(self, Self::BaseDeleted | Self::Deleted)
    }
}

impl std::fmt::Display for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::NotPresent => write!(f, "not-present"),
            Self::BaseDeleted => write!(f, "base-deleted"),
            Self::Excluded => write!(f, "excluded"),
            Self::Incomplete => write!(f, "incomplete"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Conflict vocabulary
// ---------------------------------------------------------------------------

/// The operation that produced an incoming change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Update,
    Switch,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Update => write!(f, "update"),
            Self::Switch => write!(f, "switch"),
        }
    }
}

/// Why the local side disagrees with the incoming change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    Edited,
    Deleted,
    MovedAway,
    Unversioned,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Edited => write!(f, "edited"),
            Self::Deleted => write!(f, "deleted"),
            Self::MovedAway => write!(f, "moved_away"),
            Self::Unversioned => write!(f, "unversioned"),
        }
    }
}

/// What the incoming change wanted to do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    Edit,
    Add,
    Delete,
}

impl std::fmt::Display for ConflictAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Edit => write!(f, "edit"),
            Self::Add => write!(f, "add"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Action reported to the notification sink.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifyAction {
    UpdateAdd,
    UpdateUpdate,
    UpdateDelete,
    TreeConflict,
    MoveBroken,
    UpdateCompleted,
}

impl NotifyAction {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "update_add" => Self::UpdateAdd,
            "update_update" => Self::UpdateUpdate,
            "update_delete" => Self::UpdateDelete,
            "tree_conflict" => Self::TreeConflict,
            "move_broken" => Self::MoveBroken,
            _ => Self::UpdateCompleted,
        }
    }
}

impl std::fmt::Display for NotifyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpdateAdd => write!(f, "update_add"),
            Self::UpdateUpdate => write!(f, "update_update"),
            Self::UpdateDelete => write!(f, "update_delete"),
            Self::TreeConflict => write!(f, "tree_conflict"),
            Self::MoveBroken => write!(f, "move_broken"),
            Self::UpdateCompleted => write!(f, "update_completed"),
        }
    }
}

/// Per-notification content / property outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifyState {
    Inapplicable,
    Unchanged,
    Changed,
    Merged,
    Conflicted,
}

impl NotifyState {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "unchanged" => Self::Unchanged,
            "changed" => Self::Changed,
            "merged" => Self::Merged,
            "conflicted" => Self::Conflicted,
            _ => Self::Inapplicable,
        }
    }
}

impl std::fmt::Display for NotifyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inapplicable => write!(f, "inapplicable"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Changed => write!(f, "changed"),
            Self::Merged => write!(f, "merged"),
            Self::Conflicted => write!(f, "conflicted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Update depth
// ---------------------------------------------------------------------------

/// Requested depth of a bulk update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    Empty,
    Files,
    Immediates,
    Infinity,
}

impl std::fmt::Display for Depth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Files => write!(f, "files"),
            Self::Immediates => write!(f, "immediates"),
            Self::Infinity => write!(f, "infinity"),
        }
    }
}

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

/// Content-addressed handle for pristine content: hex SHA-256.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Checksum(pub String);

impl Checksum {
    /// Digest of a byte buffer.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Conflict skeletons
// ---------------------------------------------------------------------------

/// One side of a conflict: a repository location plus node kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictVersion {
    pub repos_url: String,
    pub repos_uuid: String,
    pub path_in_repos: String,
    pub peg_rev: Revision,
    pub node_kind: NodeKind,
}

impl ConflictVersion {
    /// Same location, different path and kind.
    pub fn with_location(&self, path_in_repos: &str, node_kind: NodeKind) -> Self {
        Self {
            repos_url: self.repos_url.clone(),
            repos_uuid: self.repos_uuid.clone(),
            path_in_repos: path_in_repos.to_string(),
            peg_rev: self.peg_rev,
            node_kind,
        }
    }
}

/// Structural disagreement between a local operation and an incoming change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeConflictInfo {
    pub reason: ConflictReason,
    pub action: ConflictAction,
    /// Source op-root of the move, when `reason` is `MovedAway`.
    pub move_src_op_root: Option<String>,
}

/// A single conflicted property.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropConflictEntry {
    pub name: String,
    pub base: Option<String>,
    pub incoming: Option<String>,
    pub working: Option<String>,
}

/// Property conflicts recorded during a merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropConflictInfo {
    pub entries: Vec<PropConflictEntry>,
}

/// Text conflict left behind by a failed content merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextConflictInfo {
    pub old_checksum: Option<Checksum>,
    pub new_checksum: Option<Checksum>,
}

/// A pending conflict as persisted on the `actual` row of a node.
///
/// A skeleton is created on first detection and cleared only by an explicit
/// resolve. Equality is structural; the store treats a re-mark with an
/// equal skeleton as a no-op.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictSkeleton {
    pub operation: Option<Operation>,
    pub old_version: Option<ConflictVersion>,
    pub new_version: Option<ConflictVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<TreeConflictInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prop: Option<PropConflictInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextConflictInfo>,
}

impl ConflictSkeleton {
    pub fn is_tree_conflict(&self) -> bool {
        self.tree.is_some()
    }

    /// The operation, or an `UnsupportedConflict` error naming `path`.
    pub fn operation_for(&self, path: &str) -> Result<Operation, ResolveError> {
        self.operation
            .ok_or_else(|| ResolveError::UnsupportedConflict(path.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Store read results
// ---------------------------------------------------------------------------

/// One `nodes` row, as read by `depth_get_info`.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub presence: Presence,
    pub kind: NodeKind,
    pub revision: Option<Revision>,
    pub repos_id: Option<i64>,
    pub repos_path: Option<String>,
    pub checksum: Option<Checksum>,
    pub props: Option<Props>,
    pub moved_to: Option<String>,
    pub moved_here: bool,
}

/// Result of resolving a path against the recorded moves.
#[derive(Debug, Clone)]
pub struct MovedTo {
    /// Where the queried path itself ended up.
    pub dst_relpath: String,
    /// Root of the move destination (an op-root).
    pub dst_op_root: String,
    /// Root of the moved-away subtree at the source.
    pub src_root: String,
    /// Op-root of the layer recording the move source delete.
    pub src_op_root: String,
}

/// One recorded move, as enumerated for bumping.
#[derive(Debug, Clone)]
pub struct MovedPair {
    pub src_relpath: String,
    pub dst_relpath: String,
    pub src_op_depth: i64,
    pub kind: NodeKind,
}

/// A spooled notification record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub path: String,
    pub action: NotifyAction,
    pub kind: NodeKind,
    pub content_state: NotifyState,
    pub prop_state: NotifyState,
    pub old_revision: Option<Revision>,
    pub new_revision: Option<Revision>,
}

// ---------------------------------------------------------------------------
// Property diffs
// ---------------------------------------------------------------------------

/// A single property change between two property sets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropChange {
    pub name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Changes needed to turn `old` into `new`, in property-name order.
pub fn prop_diffs(old: &Props, new: &Props) -> Vec<PropChange> {
    let mut changes = Vec::new();
    for (name, old_value) in old {
        match new.get(name) {
            Some(new_value) if new_value == old_value => {}
            other => changes.push(PropChange {
                name: name.clone(),
                old_value: Some(old_value.clone()),
                new_value: other.cloned(),
            }),
        }
    }
    for (name, new_value) in new {
        if !old.contains_key(name) {
            changes.push(PropChange {
                name: name.clone(),
                old_value: None,
                new_value: Some(new_value.clone()),
            });
        }
    }
    changes.sort_by(|a, b| a.name.cmp(&b.name));
    changes
}

/// True when the two optional property sets carry the same properties.
pub fn props_match(a: Option<&Props>, b: Option<&Props>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => prop_diffs(a, b).is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [NodeKind::File, NodeKind::Dir, NodeKind::Symlink, NodeKind::None] {
            assert_eq!(NodeKind::from_str_val(&kind.to_string()), kind);
        }
    }

    #[test]
    fn test_presence_round_trip() {
        for presence in [
            Presence::Normal,
            Presence::NotPresent,
            Presence::BaseDeleted,
            Presence::Excluded,
            Presence::Incomplete,
            Presence::Deleted,
        ] {
            assert_eq!(Presence::from_str_val(&presence.to_string()), presence);
        }
    }

    #[test]
    fn test_checksum_of_bytes() {
        let a = Checksum::of_bytes(b"hello");
        let b = Checksum::of_bytes(b"hello");
        let c = Checksum::of_bytes(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_prop_diffs() {
        let old: Props = [("k".to_string(), "1".to_string())].into();
        let new: Props = [
            ("k".to_string(), "2".to_string()),
            ("n".to_string(), "x".to_string()),
        ]
        .into();
        let diffs = prop_diffs(&old, &new);
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].name, "k");
        assert_eq!(diffs[0].old_value.as_deref(), Some("1"));
        assert_eq!(diffs[0].new_value.as_deref(), Some("2"));
        assert_eq!(diffs[1].name, "n");
        assert_eq!(diffs[1].old_value, None);

        assert!(prop_diffs(&new, &new).is_empty());
        assert!(props_match(Some(&old), Some(&old)));
        assert!(!props_match(Some(&old), Some(&new)));
        assert!(!props_match(Some(&old), None));
        assert!(props_match(None, None));
    }

    #[test]
    fn test_skeleton_equality_ignores_nothing() {
        let skel = ConflictSkeleton {
            operation: Some(Operation::Update),
            tree: Some(TreeConflictInfo {
                reason: ConflictReason::MovedAway,
                action: ConflictAction::Edit,
                move_src_op_root: Some("a".into()),
            }),
            ..Default::default()
        };
        let same = skel.clone();
        assert_eq!(skel, same);

        let mut other = skel.clone();
        other.tree.as_mut().unwrap().reason = ConflictReason::Deleted;
        assert_ne!(skel, other);
    }

    #[test]
    fn test_skeleton_json_round_trip() {
        let skel = ConflictSkeleton {
            operation: Some(Operation::Switch),
            new_version: Some(ConflictVersion {
                repos_url: "https://repo.example/vcs".into(),
                repos_uuid: "uuid-1".into(),
                path_in_repos: "trunk/a".into(),
                peg_rev: 7,
                node_kind: NodeKind::Dir,
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&skel).unwrap();
        let back: ConflictSkeleton = serde_json::from_str(&json).unwrap();
        assert_eq!(skel, back);
    }
}
