//! Edit receiver: applies driver events to the move destination.
//!
//! Each operation checks for tree conflicts first, then merges the incoming
//! change into the destination's working state — spooling work items for
//! the file effects and notification records for the outcome. Shadowed
//! nodes are never touched beyond their node rows; the layer replacement
//! still covers them.

use std::path::Path;

use tracing::{debug, info};

use crate::db::StoreTxn;
use crate::errors::ResolveError;
use crate::merge::MergeOutcome;
use crate::models::{
    Checksum, ConflictAction, ConflictReason, ConflictSkeleton, NodeKind, NotifyAction,
    NotifyState, Props,
};
use crate::paths::{relpath_depth, relpath_join, skip_ancestor};
use crate::workqueue::WorkItem;

use super::conflict::{
    check_tree_conflict, mark_tree_conflict, render_conflict_markers, update_working_props,
    MarkContext,
};
use super::{UpdateMoveState, WorkingVersion};

/// Kind of the on-disk node at `path`, `None` when nothing is there.
fn kind_on_disk(path: &Path) -> NodeKind {
    match std::fs::symlink_metadata(path) {
        Err(_) => NodeKind::None,
        Ok(meta) if meta.file_type().is_symlink() => NodeKind::Symlink,
        Ok(meta) if meta.is_dir() => NodeKind::Dir,
        Ok(_) => NodeKind::File,
    }
}

/// True when the working file's content no longer matches `checksum`.
/// A missing working file reads as unmodified.
fn file_locally_modified(abspath: &Path, checksum: Option<&Checksum>) -> bool {
    let Some(checksum) = checksum else {
        return false;
    };
    match std::fs::read(abspath) {
        Err(_) => false,
        Ok(bytes) => Checksum::of_bytes(&bytes) != *checksum,
    }
}

/// The incoming update added a directory at the source; mirror it at the
/// destination.
pub(crate) fn add_directory(
    txn: &StoreTxn<'_>,
    state: &mut UpdateMoveState<'_>,
    relpath: &str,
    _props: Option<Props>,
    shadowed: bool,
) -> Result<(), ResolveError> {
    let dst_info = txn.depth_get_info(relpath, state.dst_op_depth)?;
    let old_kind = dst_info.as_ref().map_or(NodeKind::None, |i| i.kind);
    let dst_repos_path = dst_info.and_then(|i| i.repos_path);

    let is_conflicted = check_tree_conflict(
        txn,
        state,
        relpath,
        old_kind,
        NodeKind::Dir,
        dst_repos_path.as_deref(),
        ConflictAction::Add,
    )?;
    if is_conflicted || shadowed {
        return Ok(());
    }

    let abspath = txn.abspath(relpath);
    match kind_on_disk(&abspath) {
        NodeKind::None => {
            txn.wq_add(&WorkItem::DirInstall {
                path: relpath.to_string(),
            })?;
        }
        NodeKind::Dir => {}
        disk_kind => {
            // An unversioned obstruction of a conflicting kind.
            mark_tree_conflict(
                txn,
                &MarkContext::from_state(state),
                relpath,
                disk_kind,
                NodeKind::Dir,
                dst_repos_path.as_deref(),
                ConflictReason::Unversioned,
                ConflictAction::Add,
                None,
            )?;
            state.conflict_root = Some(relpath.to_string());
            return Ok(());
        }
    }

    txn.notify_add(
        relpath,
        NotifyAction::UpdateAdd,
        NodeKind::Dir,
        NotifyState::Inapplicable,
        NotifyState::Inapplicable,
    )?;
    debug!(path = relpath, "added directory");
    Ok(())
}

/// The incoming update added a file at the source; install it at the
/// destination.
pub(crate) fn add_file(
    txn: &StoreTxn<'_>,
    state: &mut UpdateMoveState<'_>,
    relpath: &str,
    checksum: Option<Checksum>,
    _props: Option<Props>,
    shadowed: bool,
) -> Result<(), ResolveError> {
    let dst_info = txn.depth_get_info(relpath, state.dst_op_depth)?;
    let old_kind = dst_info.as_ref().map_or(NodeKind::None, |i| i.kind);
    let dst_repos_path = dst_info.and_then(|i| i.repos_path);

    let is_conflicted = check_tree_conflict(
        txn,
        state,
        relpath,
        old_kind,
        NodeKind::File,
        dst_repos_path.as_deref(),
        ConflictAction::Add,
    )?;
    if is_conflicted || shadowed {
        return Ok(());
    }

    let abspath = txn.abspath(relpath);
    let disk_kind = kind_on_disk(&abspath);
    if disk_kind != NodeKind::None {
        mark_tree_conflict(
            txn,
            &MarkContext::from_state(state),
            relpath,
            disk_kind,
            NodeKind::File,
            dst_repos_path.as_deref(),
            ConflictReason::Unversioned,
            ConflictAction::Add,
            None,
        )?;
        state.conflict_root = Some(relpath.to_string());
        return Ok(());
    }

    txn.wq_add(&WorkItem::FileInstall {
        path: relpath.to_string(),
        source: checksum,
        use_commit_times: state.env.config.use_commit_times,
        record_info: true,
    })?;

    txn.notify_add(
        relpath,
        NotifyAction::UpdateAdd,
        NodeKind::File,
        NotifyState::Inapplicable,
        NotifyState::Inapplicable,
    )?;
    debug!(path = relpath, "added file");
    Ok(())
}

/// The incoming update changed directory properties; merge them into the
/// destination's working properties. Children are the walker's business.
pub(crate) fn alter_directory(
    txn: &StoreTxn<'_>,
    state: &mut UpdateMoveState<'_>,
    relpath: &str,
    new_props: Option<Props>,
    shadowed: bool,
) -> Result<(), ResolveError> {
    let Some(dst_info) = txn.depth_get_info(relpath, state.dst_op_depth)? else {
        return Err(ResolveError::ResolverFailure {
            path: relpath.to_string(),
            detail: "altered directory has no destination layer".into(),
        });
    };
    if dst_info.kind != NodeKind::Dir {
        return Err(ResolveError::ResolverFailure {
            path: relpath.to_string(),
            detail: format!("expected a directory, found {}", dst_info.kind),
        });
    }

    let is_conflicted = check_tree_conflict(
        txn,
        state,
        relpath,
        dst_info.kind,
        NodeKind::Dir,
        dst_info.repos_path.as_deref(),
        ConflictAction::Edit,
    )?;
    if is_conflicted || shadowed {
        return Ok(());
    }

    let Some(new_props) = new_props else {
        return Ok(());
    };

    let old_version = WorkingVersion {
        checksum: None,
        props: dst_info.props.clone().unwrap_or_default(),
    };
    let new_version = WorkingVersion {
        checksum: None,
        props: new_props,
    };

    let merge = update_working_props(txn, relpath, &old_version, &new_version)?;

    if let Some(prop_conflict) = merge.conflict {
        let skeleton = conflict_skeleton_for(
            state,
            dst_info.repos_path.as_deref(),
            NodeKind::Dir,
            Some(prop_conflict),
            None,
        );
        txn.mark_conflict(relpath, &skeleton)?;
        txn.wq_add(&WorkItem::ConflictMarkers {
            path: relpath.to_string(),
            contents: render_conflict_markers(&skeleton),
        })?;
    }

    txn.notify_add(
        relpath,
        NotifyAction::UpdateUpdate,
        NodeKind::Dir,
        NotifyState::Inapplicable,
        merge.prop_state,
    )?;
    debug!(path = relpath, prop_state = %merge.prop_state, "altered directory");
    Ok(())
}

/// The incoming update changed file content and/or properties; merge both
/// into the destination's working state.
pub(crate) fn alter_file(
    txn: &StoreTxn<'_>,
    state: &mut UpdateMoveState<'_>,
    relpath: &str,
    new_checksum: Option<Checksum>,
    new_props: Option<Props>,
    shadowed: bool,
) -> Result<(), ResolveError> {
    let Some(dst_info) = txn.depth_get_info(relpath, state.dst_op_depth)? else {
        return Err(ResolveError::ResolverFailure {
            path: relpath.to_string(),
            detail: "altered file has no destination layer".into(),
        });
    };
    if !dst_info.kind.is_file_like() {
        return Err(ResolveError::ResolverFailure {
            path: relpath.to_string(),
            detail: format!("expected a file, found {}", dst_info.kind),
        });
    }

    let is_conflicted = check_tree_conflict(
        txn,
        state,
        relpath,
        dst_info.kind,
        NodeKind::File,
        dst_info.repos_path.as_deref(),
        ConflictAction::Edit,
    )?;
    if is_conflicted || shadowed {
        return Ok(());
    }

    let old_version = WorkingVersion {
        checksum: dst_info.checksum.clone(),
        props: dst_info.props.clone().unwrap_or_default(),
    };
    let checksum_changed = new_checksum.is_some() && new_checksum != old_version.checksum;
    let new_version = WorkingVersion {
        checksum: new_checksum.or_else(|| old_version.checksum.clone()),
        props: new_props
            .clone()
            .unwrap_or_else(|| old_version.props.clone()),
    };

    if checksum_changed || new_props.is_some() {
        update_working_file(
            txn,
            state,
            relpath,
            dst_info.repos_path.as_deref(),
            &old_version,
            &new_version,
        )?;
    }

    Ok(())
}

/// Merge the difference between `old_version` and `new_version` into the
/// working file at `relpath`.
fn update_working_file(
    txn: &StoreTxn<'_>,
    state: &mut UpdateMoveState<'_>,
    relpath: &str,
    repos_path: Option<&str>,
    old_version: &WorkingVersion,
    new_version: &WorkingVersion,
) -> Result<(), ResolveError> {
    let abspath = txn.abspath(relpath);

    let prop_merge = update_working_props(txn, relpath, old_version, new_version)?;
    let mut text_conflict = None;

    let content_state = if new_version.checksum != old_version.checksum {
        if !file_locally_modified(&abspath, old_version.checksum.as_ref()) {
            txn.wq_add(&WorkItem::FileInstall {
                path: relpath.to_string(),
                source: new_version.checksum.clone(),
                use_commit_times: state.env.config.use_commit_times,
                record_info: true,
            })?;
            NotifyState::Changed
        } else {
            // Three-way merge: pre-update pristine as base, post-update
            // pristine as the incoming side, the moved-here working file
            // as the local side.
            let old_checksum =
                old_version
                    .checksum
                    .as_ref()
                    .ok_or_else(|| ResolveError::ResolverFailure {
                        path: relpath.to_string(),
                        detail: "modified file has no recorded checksum".into(),
                    })?;
            let new_checksum =
                new_version
                    .checksum
                    .as_ref()
                    .ok_or_else(|| ResolveError::ResolverFailure {
                        path: relpath.to_string(),
                        detail: "incoming file has no checksum".into(),
                    })?;
            let old_pristine = state.env.pristines.pristine_path(old_checksum)?;
            let new_pristine = state.env.pristines.pristine_path(new_checksum)?;

            let result = state.env.merger.merge(
                &old_pristine,
                &new_pristine,
                &abspath,
                relpath,
                &prop_merge.actual_props,
                &prop_merge.prop_changes,
            )?;
            if let Some(item) = result.work_item {
                txn.wq_add(&item)?;
            }
            text_conflict = result.conflict;
            match result.outcome {
                MergeOutcome::Conflicted => NotifyState::Conflicted,
                _ => NotifyState::Merged,
            }
        }
    } else {
        NotifyState::Unchanged
    };

    if prop_merge.conflict.is_some() || text_conflict.is_some() {
        let skeleton = conflict_skeleton_for(
            state,
            repos_path,
            NodeKind::File,
            prop_merge.conflict,
            text_conflict,
        );
        txn.mark_conflict(relpath, &skeleton)?;
        txn.wq_add(&WorkItem::ConflictMarkers {
            path: relpath.to_string(),
            contents: render_conflict_markers(&skeleton),
        })?;
    }

    txn.notify_add(
        relpath,
        NotifyAction::UpdateUpdate,
        NodeKind::File,
        content_state,
        prop_merge.prop_state,
    )?;
    info!(
        path = relpath,
        content = %content_state,
        props = %prop_merge.prop_state,
        "updated working file"
    );
    Ok(())
}

/// Build the skeleton persisted for a text/property conflict, composing
/// the update's version pair at `repos_path`.
fn conflict_skeleton_for(
    state: &UpdateMoveState<'_>,
    repos_path: Option<&str>,
    kind: NodeKind,
    prop: Option<crate::models::PropConflictInfo>,
    text: Option<crate::models::TextConflictInfo>,
) -> ConflictSkeleton {
    let old_version = match (repos_path, state.old_version.as_ref()) {
        (Some(rp), Some(ov)) => Some(ov.with_location(rp, kind)),
        _ => None,
    };
    let new_path = repos_path
        .and_then(|rp| {
            state
                .old_version
                .as_ref()
                .and_then(|ov| skip_ancestor(&ov.path_in_repos, rp))
        })
        .map(|part| relpath_join(&state.new_version.path_in_repos, part))
        .unwrap_or_else(|| state.new_version.path_in_repos.clone());

    ConflictSkeleton {
        operation: Some(state.operation),
        old_version,
        new_version: Some(state.new_version.with_location(&new_path, kind)),
        tree: None,
        prop,
        text,
    }
}

/// The incoming update deleted the node at the source; remove it from the
/// destination, or raise a tree conflict when local changes would be lost.
pub(crate) fn delete(
    txn: &StoreTxn<'_>,
    state: &mut UpdateMoveState<'_>,
    relpath: &str,
    shadowed: bool,
) -> Result<(), ResolveError> {
    let dst_info = txn.depth_get_info(relpath, state.dst_op_depth)?;
    let dst_kind = dst_info.as_ref().map_or(NodeKind::None, |i| i.kind);
    let dst_repos_path = dst_info.as_ref().and_then(|i| i.repos_path.clone());

    // Check before retracting the delete to catch delete-delete conflicts
    // on the node itself; deleted children count as local modifications
    // below.
    let mut is_conflicted = check_tree_conflict(
        txn,
        state,
        relpath,
        dst_kind,
        NodeKind::None,
        dst_repos_path.as_deref(),
        ConflictAction::Delete,
    )?;

    if shadowed || is_conflicted {
        return Ok(());
    }

    let (is_modified, is_all_deletes) = local_mods(txn, state, relpath)?;
    let mut must_delete_working_nodes = false;
    if is_modified {
        let reason = if !is_all_deletes {
            // No layer exists at this node's own depth, so the modified
            // tree converts cleanly into a copy.
            txn.update_op_depth_recursive(relpath, state.dst_op_depth, relpath_depth(relpath))?;
            ConflictReason::Edited
        } else {
            txn.delete_working_op_depth_above(relpath, state.dst_op_depth)?;
            must_delete_working_nodes = true;
            ConflictReason::Deleted
        };
        is_conflicted = true;
        mark_tree_conflict(
            txn,
            &MarkContext::from_state(state),
            relpath,
            dst_kind,
            NodeKind::None,
            dst_repos_path.as_deref(),
            reason,
            ConflictAction::Delete,
            None,
        )?;
        state.conflict_root = Some(relpath.to_string());
    }

    if !is_conflicted || must_delete_working_nodes {
        for (child_relpath, child_kind) in
            txn.descendants_at_op_depth(relpath, state.dst_op_depth)?
        {
            txn.wq_add(&remove_item(&child_relpath, child_kind))?;
        }
        if dst_kind != NodeKind::None {
            txn.wq_add(&remove_item(relpath, dst_kind))?;

            if !is_conflicted {
                txn.notify_add(
                    relpath,
                    NotifyAction::UpdateDelete,
                    dst_kind,
                    NotifyState::Inapplicable,
                    NotifyState::Inapplicable,
                )?;
                debug!(path = relpath, kind = %dst_kind, "deleted node");
            }
        }
    }

    Ok(())
}

fn remove_item(relpath: &str, kind: NodeKind) -> WorkItem {
    if kind == NodeKind::Dir {
        WorkItem::DirRemove {
            path: relpath.to_string(),
            recursive: false,
        }
    } else {
        WorkItem::FileRemove {
            path: relpath.to_string(),
        }
    }
}

/// Local modifications under the destination subtree: working layers above
/// the destination op-depth, plus on-disk content drift of the layer's own
/// files. Returns `(is_modified, is_all_deletes)`.
fn local_mods(
    txn: &StoreTxn<'_>,
    state: &UpdateMoveState<'_>,
    relpath: &str,
) -> Result<(bool, bool), ResolveError> {
    let layers_above = txn.working_layers_above(relpath, state.dst_op_depth)?;
    let mut is_modified = !layers_above.is_empty();
    let mut is_all_deletes = layers_above
        .iter()
        .all(|(_, _, presence)| presence.is_delete_marker());

    for (row_relpath, row_kind) in txn.layer_rows(relpath, state.dst_op_depth)? {
        if !row_kind.is_file_like() {
            continue;
        }
        let Some(info) = txn.depth_get_info(&row_relpath, state.dst_op_depth)? else {
            continue;
        };
        if file_locally_modified(&txn.abspath(&row_relpath), info.checksum.as_ref()) {
            is_modified = true;
            is_all_deletes = false;
            break;
        }
    }

    Ok((is_modified, is_modified && is_all_deletes))
}

/// Retract the destination layer rows for a deleted node, preserving
/// base-delete shadows for any lower layer that would be uncovered.
pub(crate) fn delete_move_leaf(
    txn: &StoreTxn<'_>,
    state: &UpdateMoveState<'_>,
    relpath: &str,
) -> Result<(), ResolveError> {
    let parent_relpath = crate::paths::relpath_dirname(relpath);

    match txn.highest_op_depth_below(parent_relpath, state.dst_op_depth)? {
        Some(op_depth_below) => {
            // Remove non-shadowing rows, then convert the remaining
            // shadowing rows to presence base-deleted.
            txn.delete_no_lower_layer(relpath, state.dst_op_depth, op_depth_below)?;
            txn.replace_with_base_deleted(relpath, state.dst_op_depth)?;
        }
        None => {
            txn.delete_working_op_depth(relpath, state.dst_op_depth)?;
        }
    }

    txn.retract_parent_delete(relpath, state.dst_op_depth)?;
    Ok(())
}
