//! Conflict detection, classification, and recording.
//!
//! Tree conflicts are raised at the op-root of the lowest working layer
//! shadowing the offending path, not at the path itself. The most recent
//! conflict root is remembered in the walk state; the depth-first drive
//! guarantees that everything under it is reached before any sibling, so
//! one remembered root suppresses nested raises on the same branch.

use tracing::{debug, info};

use crate::db::StoreTxn;
use crate::errors::{DatabaseError, ResolveError};
use crate::models::{
    prop_diffs, ConflictAction, ConflictReason, ConflictSkeleton, ConflictVersion, NodeKind,
    NotifyAction, NotifyState, Operation, PropChange, PropConflictEntry, PropConflictInfo, Props,
    TreeConflictInfo,
};
use crate::paths::{relpath_depth, relpath_dirname, skip_ancestor};

use super::{UpdateMoveState, WorkingVersion};

/// Context for marking one tree conflict: the update's version pair and the
/// destination root the conflicted path lives under.
pub(crate) struct MarkContext<'a> {
    pub operation: Operation,
    pub old_version: Option<&'a ConflictVersion>,
    pub new_version: &'a ConflictVersion,
    pub move_root_dst_relpath: &'a str,
}

impl<'a> MarkContext<'a> {
    pub fn from_state(state: &'a UpdateMoveState<'_>) -> Self {
        Self {
            operation: state.operation,
            old_version: state.old_version.as_ref(),
            new_version: &state.new_version,
            move_root_dst_relpath: &state.move_root_dst_relpath,
        }
    }
}

/// Check whether applying `action` at `relpath` collides with a working
/// layer above the destination op-depth. If so, raise a tree conflict at
/// the layer's op-root and remember it as the current conflict root.
///
/// Returns true when `relpath` is conflicted (newly or by an enclosing,
/// already-raised conflict).
pub(crate) fn check_tree_conflict(
    txn: &StoreTxn<'_>,
    state: &mut UpdateMoveState<'_>,
    relpath: &str,
    old_kind: NodeKind,
    new_kind: NodeKind,
    old_repos_path: Option<&str>,
    action: ConflictAction,
) -> Result<bool, ResolveError> {
    if state.under_conflict_root(relpath) {
        return Ok(true);
    }

    let Some(op_depth) = txn.lowest_op_depth_above(relpath, state.dst_op_depth)? else {
        return Ok(false);
    };

    // Widen to the layer's own op-root; that root is the conflict anchor.
    let mut conflict_root = relpath.to_string();
    let mut old_kind = old_kind;
    let mut new_kind = new_kind;
    let mut old_repos_path = old_repos_path.map(str::to_string);
    let mut action = action;
    while relpath_depth(&conflict_root) > op_depth {
        conflict_root = relpath_dirname(&conflict_root).to_string();
        old_kind = NodeKind::Dir;
        new_kind = NodeKind::Dir;
        old_repos_path = old_repos_path
            .as_deref()
            .map(|p| relpath_dirname(p).to_string());
        action = ConflictAction::Edit;
    }

    let moved = txn.op_depth_moved_to(&conflict_root, state.dst_op_depth)?;
    let (reason, move_src_op_root) = match moved {
        Some(m) => (ConflictReason::MovedAway, Some(m.src_op_root)),
        None => (ConflictReason::Deleted, None),
    };

    mark_tree_conflict(
        txn,
        &MarkContext::from_state(state),
        &conflict_root,
        old_kind,
        new_kind,
        old_repos_path.as_deref(),
        reason,
        action,
        move_src_op_root.as_deref(),
    )?;
    state.conflict_root = Some(conflict_root);

    Ok(true)
}

/// Mark a tree conflict on `relpath` unless a compatible one already
/// exists. An existing tree conflict with differing reason, action, or
/// move source fails with `ObstructedUpdate`; an existing text/property
/// conflict is extended in place.
#[allow(clippy::too_many_arguments)]
pub(crate) fn mark_tree_conflict(
    txn: &StoreTxn<'_>,
    ctx: &MarkContext<'_>,
    relpath: &str,
    old_kind: NodeKind,
    new_kind: NodeKind,
    old_repos_path: Option<&str>,
    reason: ConflictReason,
    action: ConflictAction,
    move_src_op_root: Option<&str>,
) -> Result<(), ResolveError> {
    // Compose the incoming repository location from the conflict anchor.
    let old_part = old_repos_path.and_then(|orp| {
        ctx.old_version
            .and_then(|ov| skip_ancestor(&ov.path_in_repos, orp))
    });
    let new_repos_path = match old_part {
        Some(part) => crate::paths::relpath_join(&ctx.new_version.path_in_repos, part),
        None => {
            let Some(child) = skip_ancestor(ctx.move_root_dst_relpath, relpath) else {
                return Err(ResolveError::ResolverFailure {
                    path: relpath.to_string(),
                    detail: "conflict anchor is outside the move destination".into(),
                });
            };
            crate::paths::relpath_join(&ctx.new_version.path_in_repos, child)
        }
    };

    let existing = txn.read_conflict(relpath)?;
    let mut skeleton = match existing {
        Some(existing) => {
            if existing.operation.is_none() {
                return Err(ResolveError::ResolverFailure {
                    path: relpath.to_string(),
                    detail: "already in conflict".into(),
                });
            }
            if let Some(tree) = &existing.tree {
                let compatible = tree.reason == reason
                    && tree.action == action
                    && (reason != ConflictReason::MovedAway
                        || tree.move_src_op_root.as_deref() == move_src_op_root);
                if !compatible {
                    return Err(DatabaseError::ObstructedUpdate(relpath.to_string()).into());
                }
                // Already a suitable tree conflict.
                debug!(path = relpath, "compatible tree conflict already recorded");
                return Ok(());
            }
            existing
        }
        None => ConflictSkeleton::default(),
    };

    skeleton.tree = Some(TreeConflictInfo {
        reason,
        action,
        move_src_op_root: move_src_op_root.map(str::to_string),
    });
    skeleton.operation = Some(ctx.operation);
    skeleton.old_version = match (reason, old_repos_path, ctx.old_version) {
        // Unversioned obstructions and local additions have no old version.
        (ConflictReason::Unversioned, _, _) | (_, None, _) => None,
        (_, Some(orp), Some(ov)) => Some(ov.with_location(orp, old_kind)),
        (_, Some(_), None) => None,
    };
    skeleton.new_version = Some(ctx.new_version.with_location(&new_repos_path, new_kind));

    txn.mark_conflict(relpath, &skeleton)?;
    info!(
        path = relpath,
        reason = %reason,
        action = %action,
        "raised tree conflict"
    );

    txn.notify_add(
        relpath,
        NotifyAction::TreeConflict,
        new_kind,
        NotifyState::Inapplicable,
        NotifyState::Inapplicable,
    )?;
    Ok(())
}

/// Outcome of the three-way property merge.
pub(crate) struct PropMergeResult {
    pub prop_state: NotifyState,
    pub conflict: Option<PropConflictInfo>,
    pub prop_changes: Vec<PropChange>,
    /// Working properties before the merge, as the merger wants them.
    pub actual_props: Props,
}

/// Merge the incoming property change into the working properties of
/// `relpath`.
///
/// Three-way merge with the pre-update properties as base, the post-update
/// properties as the incoming side, and the current working properties as
/// the local side. The actual row is cleared when the merged result matches
/// the post-update properties, which the layer replacement will record.
pub(crate) fn update_working_props(
    txn: &StoreTxn<'_>,
    relpath: &str,
    old_version: &WorkingVersion,
    new_version: &WorkingVersion,
) -> Result<PropMergeResult, ResolveError> {
    let actual_props = txn
        .read_actual_props(relpath)?
        .unwrap_or_else(|| old_version.props.clone());
    let prop_changes = prop_diffs(&old_version.props, &new_version.props);

    let mut merged = actual_props.clone();
    let mut conflicts: Vec<PropConflictEntry> = Vec::new();
    for change in &prop_changes {
        let working = actual_props.get(&change.name);
        if working == change.old_value.as_ref() {
            // Local side untouched; the incoming change applies.
            match &change.new_value {
                Some(value) => {
                    merged.insert(change.name.clone(), value.clone());
                }
                None => {
                    merged.remove(&change.name);
                }
            }
        } else if working == change.new_value.as_ref() {
            // Both sides made the same change.
        } else {
            conflicts.push(PropConflictEntry {
                name: change.name.clone(),
                base: change.old_value.clone(),
                incoming: change.new_value.clone(),
                working: working.cloned(),
            });
        }
    }

    let prop_state = if !conflicts.is_empty() {
        NotifyState::Conflicted
    } else if prop_changes.is_empty() {
        NotifyState::Unchanged
    } else if actual_props == old_version.props {
        NotifyState::Changed
    } else {
        NotifyState::Merged
    };

    // Clear the actual row when the merged result matches the incoming
    // properties; the node layer carries them after the layer replacement.
    if prop_diffs(&merged, &new_version.props).is_empty() {
        txn.set_actual_props(relpath, None)?;
    } else {
        txn.set_actual_props(relpath, Some(&merged))?;
    }

    debug!(path = relpath, state = %prop_state, changes = prop_changes.len(), "merged properties");
    Ok(PropMergeResult {
        prop_state,
        conflict: if conflicts.is_empty() {
            None
        } else {
            Some(PropConflictInfo { entries: conflicts })
        },
        prop_changes,
        actual_props,
    })
}

/// Render the human-readable reject text for a conflict skeleton's
/// property and text conflicts, written next to the file by the executor.
pub(crate) fn render_conflict_markers(skeleton: &ConflictSkeleton) -> String {
    let mut out = String::new();
    if let Some(prop) = &skeleton.prop {
        for entry in &prop.entries {
            let base = entry.base.as_deref().unwrap_or("<unset>");
            let incoming = entry.incoming.as_deref().unwrap_or("<deleted>");
            let working = entry.working.as_deref().unwrap_or("<deleted>");
            out.push_str(&format!(
                "Trying to change property '{}' from '{}' to '{}',\nbut the property has been locally changed to '{}'.\n",
                entry.name, base, incoming, working
            ));
        }
    }
    if skeleton.text.is_some() {
        out.push_str("Local edits conflict with the incoming content change; see the conflict markers in the working file.\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::errors::DatabaseError;
    use crate::models::Checksum;

    fn setup_db() -> Database {
        let db = Database::in_memory("/wc").unwrap();
        db.initialize().unwrap();
        db.acquire_write_lock("").unwrap();
        db
    }

    fn version(props: &[(&str, &str)]) -> WorkingVersion {
        WorkingVersion {
            checksum: Some(Checksum::of_bytes(b"x")),
            props: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_prop_merge_clean_change() {
        let db = setup_db();
        db.with_txn::<_, ResolveError, _>(|txn| {
            let old = version(&[("k", "1")]);
            let new = version(&[("k", "2")]);
            let result = update_working_props(txn, "b/f", &old, &new)?;
            assert_eq!(result.prop_state, NotifyState::Changed);
            assert!(result.conflict.is_none());
            // Result matches incoming props, so the actual row is cleared.
            assert!(txn.read_actual_props("b/f")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_prop_merge_with_local_divergence() {
        let db = setup_db();
        db.with_txn::<_, ResolveError, _>(|txn| {
            // Locally k was changed to "local"; incoming changes k 1 -> 2.
            let local: Props = [("k".to_string(), "local".to_string())].into();
            txn.set_actual_props("b/f", Some(&local))?;

            let old = version(&[("k", "1")]);
            let new = version(&[("k", "2")]);
            let result = update_working_props(txn, "b/f", &old, &new)?;
            assert_eq!(result.prop_state, NotifyState::Conflicted);
            let conflict = result.conflict.unwrap();
            assert_eq!(conflict.entries.len(), 1);
            assert_eq!(conflict.entries[0].working.as_deref(), Some("local"));
            // The divergent value stays recorded.
            assert_eq!(
                txn.read_actual_props("b/f")?.unwrap().get("k").map(String::as_str),
                Some("local")
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_prop_merge_disjoint_changes() {
        let db = setup_db();
        db.with_txn::<_, ResolveError, _>(|txn| {
            // Local added "mine"; incoming changes k.
            let local: Props = [
                ("k".to_string(), "1".to_string()),
                ("mine".to_string(), "here".to_string()),
            ]
            .into();
            txn.set_actual_props("b/f", Some(&local))?;

            let old = version(&[("k", "1")]);
            let new = version(&[("k", "2")]);
            let result = update_working_props(txn, "b/f", &old, &new)?;
            assert_eq!(result.prop_state, NotifyState::Merged);
            let merged = txn.read_actual_props("b/f")?.unwrap();
            assert_eq!(merged.get("k").map(String::as_str), Some("2"));
            assert_eq!(merged.get("mine").map(String::as_str), Some("here"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_mark_tree_conflict_incompatible_obstructs() {
        let db = setup_db();
        let new_version = ConflictVersion {
            repos_url: "https://repo.example/vcs".into(),
            repos_uuid: "uuid".into(),
            path_in_repos: "trunk".into(),
            peg_rev: 2,
            node_kind: NodeKind::Dir,
        };
        db.with_txn::<_, ResolveError, _>(|txn| {
            txn.create_move_spools()?;
            let ctx = MarkContext {
                operation: Operation::Update,
                old_version: None,
                new_version: &new_version,
                move_root_dst_relpath: "b",
            };
            mark_tree_conflict(
                txn,
                &ctx,
                "b/x",
                NodeKind::Dir,
                NodeKind::Dir,
                None,
                ConflictReason::Deleted,
                ConflictAction::Edit,
                None,
            )?;
            // Same conflict again: fine.
            mark_tree_conflict(
                txn,
                &ctx,
                "b/x",
                NodeKind::Dir,
                NodeKind::Dir,
                None,
                ConflictReason::Deleted,
                ConflictAction::Edit,
                None,
            )?;
            // Different reason: obstructed.
            let err = mark_tree_conflict(
                txn,
                &ctx,
                "b/x",
                NodeKind::Dir,
                NodeKind::Dir,
                None,
                ConflictReason::Edited,
                ConflictAction::Edit,
                None,
            )
            .unwrap_err();
            assert!(matches!(
                err,
                ResolveError::Database(DatabaseError::ObstructedUpdate(_))
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_render_markers() {
        let skeleton = ConflictSkeleton {
            prop: Some(PropConflictInfo {
                entries: vec![PropConflictEntry {
                    name: "k".into(),
                    base: Some("1".into()),
                    incoming: Some("2".into()),
                    working: Some("local".into()),
                }],
            }),
            ..Default::default()
        };
        let text = render_conflict_markers(&skeleton);
        assert!(text.contains("property 'k'"));
        assert!(text.contains("'local'"));
    }
}
