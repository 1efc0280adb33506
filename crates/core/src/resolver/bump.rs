//! Move bumping and move breaking.
//!
//! When a bulk update modifies the base under a moved-away subtree, the
//! move destination can often be fast-forwarded ("bumped") by rewriting
//! its op-depth layer directly, without driving the full editor. A move
//! that cannot be bumped — entangled layers, insufficient update depth —
//! gets a move-edit tree conflict on its source instead, to be resolved
//! later through [`resolve_moved_away`](super::resolve_moved_away).

use std::collections::HashSet;

use tracing::{debug, info};

use crate::db::{Database, StoreTxn};
use crate::errors::{CoreError, ResolveError};
use crate::models::{
    ConflictAction, ConflictReason, ConflictVersion, Depth, MovedPair, NodeKind, Notification,
    NotifyAction, NotifyState, Operation,
};
use crate::notify::{drain_move_notifications, reborrow_sink, NotifySink};
use crate::paths::{relpath_depth, relpath_dirname, skip_ancestor};

use super::conflict::{mark_tree_conflict, MarkContext};
use super::layer::replace_moved_layer;
use super::{get_tc_info, version_revisions};

/// Bump every move discovered under `local_relpath` after a bulk update to
/// `depth`, raising move-edit tree conflicts where bumping is not possible.
///
/// Spooled notifications (only conflicts notify here; clean bumps are
/// silent) are delivered to `sink` after commit.
pub fn bump_moved_away(
    db: &Database,
    local_relpath: &str,
    depth: Depth,
    mut sink: Option<&mut dyn NotifySink>,
) -> Result<(), CoreError> {
    info!(path = local_relpath, depth = %depth, "bumping moved-away subtrees");

    db.with_txn::<_, ResolveError, _>(|txn| {
        txn.create_move_spools()?;

        if !local_relpath.is_empty() {
            // Is the root of the update itself moved away? (Impossible for
            // the working-copy root.)
            if let Some(moved) = txn.op_depth_moved_to(local_relpath, 0)? {
                if moved.src_root != local_relpath {
                    bump_mark_tree_conflict(
                        txn,
                        &moved.src_root,
                        &moved.src_op_root,
                        &moved.dst_op_root,
                    )?;
                    return Ok(());
                }
            }
        }

        let mut src_done: HashSet<String> = HashSet::new();
        bump_moved_away_rec(txn, local_relpath, 0, depth, &mut src_done)
    })?;

    drain_move_notifications(db, None, None, reborrow_sink(&mut sink))?;
    Ok(())
}

/// Bump the moves recorded under `local_relpath` above `op_depth`,
/// recursing into bumped destinations for nested moves.
fn bump_moved_away_rec(
    txn: &StoreTxn<'_>,
    local_relpath: &str,
    op_depth: i64,
    depth: Depth,
    src_done: &mut HashSet<String>,
) -> Result<(), ResolveError> {
    for pair in txn.moved_pairs(local_relpath, op_depth)? {
        let (skip, src_depth) = check_bump_layer(local_relpath, depth, &pair);
        if skip {
            debug!(src = %pair.src_relpath, "move outside bump depth, skipping");
            continue;
        }

        let recurse = bump_moved_layer(txn, local_relpath, op_depth, &pair, src_depth, src_done)?;
        if recurse {
            bump_moved_away_rec(
                txn,
                &pair.dst_relpath,
                relpath_depth(&pair.dst_relpath),
                depth,
                src_done,
            )?;
        }
    }
    Ok(())
}

/// Is `pair`'s source within `bump_depth` from `bump_root`? Returns
/// `(skip, remaining depth at the source)`.
fn check_bump_layer(bump_root: &str, bump_depth: Depth, pair: &MovedPair) -> (bool, Depth) {
    let Some(relpath) = skip_ancestor(bump_root, &pair.src_relpath) else {
        return (true, bump_depth);
    };

    if bump_depth == Depth::Infinity {
        return (false, Depth::Infinity);
    }
    if relpath.is_empty() {
        return (false, bump_depth);
    }

    match bump_depth {
        Depth::Empty => (true, bump_depth),
        Depth::Files if pair.kind != NodeKind::File => (true, bump_depth),
        Depth::Files | Depth::Immediates => {
            if relpath_depth(relpath) > 1 {
                (true, Depth::Empty)
            } else {
                (false, Depth::Empty)
            }
        }
        Depth::Infinity => unreachable!("handled above"),
    }
}

/// Determine whether one move can be bumped and, if so, perform the layer
/// rewrite. Returns true when descendants of the destination should be
/// examined for nested moves.
fn bump_moved_layer(
    txn: &StoreTxn<'_>,
    local_relpath: &str,
    op_depth: i64,
    pair: &MovedPair,
    src_depth: Depth,
    src_done: &mut HashSet<String>,
) -> Result<bool, ResolveError> {
    txn.verify_write_lock(local_relpath)?;

    // An intervening layer means the move is entangled with other local
    // operations and cannot be fast-forwarded.
    if txn.has_layer_between(&pair.src_relpath, op_depth, pair.src_op_depth)? {
        debug!(src = %pair.src_relpath, "intervening layer, not bumping");
        return Ok(false);
    }

    let can_bump = if op_depth == 0 {
        depth_sufficient_to_bump(txn, &pair.src_relpath, op_depth, src_depth)?
    } else {
        // Having chosen to bump an entire base-tree move there is always
        // sufficient depth for nested subtree moves.
        true
    };

    if !can_bump {
        bump_mark_tree_conflict(txn, &pair.src_relpath, &pair.src_relpath, &pair.dst_relpath)?;
        return Ok(false);
    }

    let mut src_root_relpath = pair.src_relpath.clone();
    while relpath_depth(&src_root_relpath) > pair.src_op_depth {
        src_root_relpath = relpath_dirname(&src_root_relpath).to_string();
    }

    if !src_done.insert(pair.src_relpath.clone()) {
        return Ok(false);
    }

    // A tree conflict on the move source means the user must resolve it;
    // the resolver will transfer the changes then.
    if txn.read_conflict(&src_root_relpath)?.is_some() {
        debug!(src = %src_root_relpath, "move source carries a conflict, not bumping");
        return Ok(false);
    }

    replace_moved_layer(txn, &pair.src_relpath, &pair.dst_relpath, op_depth)?;
    info!(src = %pair.src_relpath, dst = %pair.dst_relpath, "bumped move");
    Ok(true)
}

/// Can `depth` cover the whole tree at `relpath` at `op_depth`?
fn depth_sufficient_to_bump(
    txn: &StoreTxn<'_>,
    relpath: &str,
    op_depth: i64,
    depth: Depth,
) -> Result<bool, ResolveError> {
    match depth {
        Depth::Infinity => Ok(true),
        Depth::Empty => Ok(!txn.op_depth_children_exist(relpath, op_depth)?),
        Depth::Files => Ok(!txn.has_non_file_children(relpath, op_depth)?),
        Depth::Immediates => Ok(!txn.has_grandchildren(relpath, op_depth)?),
    }
}

/// Mark a move-edit tree conflict on `move_src_root_relpath`, describing
/// the pre-update state (from the move destination) and the post-update
/// state (from the new base at the source op-root).
fn bump_mark_tree_conflict(
    txn: &StoreTxn<'_>,
    move_src_root_relpath: &str,
    move_src_op_root_relpath: &str,
    move_dst_op_root_relpath: &str,
) -> Result<(), ResolveError> {
    txn.verify_write_lock(move_src_op_root_relpath)?;
    txn.verify_write_lock(move_dst_op_root_relpath)?;

    // Post-update information from the new move source base node.
    let Some(new_info) = txn.depth_get_info(move_src_op_root_relpath, 0)? else {
        return Err(ResolveError::ResolverFailure {
            path: move_src_op_root_relpath.to_string(),
            detail: "move source has no base node".into(),
        });
    };
    let Some(repos_id) = new_info.repos_id else {
        return Err(ResolveError::ResolverFailure {
            path: move_src_op_root_relpath.to_string(),
            detail: "move source base has no repository".into(),
        });
    };
    let (repos_url, repos_uuid) = txn.fetch_repos_info(repos_id)?;

    // Pre-update information from the move destination node.
    let dst_op_depth = relpath_depth(move_dst_op_root_relpath);
    let Some(old_info) = txn.depth_get_info(move_dst_op_root_relpath, dst_op_depth)? else {
        return Err(ResolveError::ResolverFailure {
            path: move_dst_op_root_relpath.to_string(),
            detail: "move destination has no op-root layer".into(),
        });
    };

    let old_repos_path = old_info.repos_path.clone().unwrap_or_default();
    let old_version = ConflictVersion {
        repos_url: repos_url.clone(),
        repos_uuid: repos_uuid.clone(),
        path_in_repos: old_repos_path.clone(),
        peg_rev: old_info.revision.unwrap_or(0),
        node_kind: old_info.kind,
    };
    let new_version = ConflictVersion {
        repos_url,
        repos_uuid,
        path_in_repos: new_info.repos_path.clone().unwrap_or_default(),
        peg_rev: new_info.revision.unwrap_or(0),
        node_kind: new_info.kind,
    };

    let ctx = MarkContext {
        operation: Operation::Update,
        old_version: Some(&old_version),
        new_version: &new_version,
        move_root_dst_relpath: move_dst_op_root_relpath,
    };
    mark_tree_conflict(
        txn,
        &ctx,
        move_src_root_relpath,
        old_info.kind,
        new_info.kind,
        Some(&old_repos_path),
        ConflictReason::MovedAway,
        ConflictAction::Edit,
        Some(move_src_op_root_relpath),
    )
}

// ---------------------------------------------------------------------------
// Breaking moves
// ---------------------------------------------------------------------------

/// Clear the move linkage between `src` and `dst`, leaving content intact.
fn break_move(
    txn: &StoreTxn<'_>,
    src_relpath: &str,
    src_op_depth: i64,
    dst_relpath: &str,
) -> Result<(), ResolveError> {
    txn.set_moved_to(src_relpath, src_op_depth, None)?;
    // The destination is always an op-root, so its depth gives the layer.
    txn.set_moved_here_recursive(dst_relpath, relpath_depth(dst_relpath), false)?;
    debug!(src = src_relpath, dst = dst_relpath, "broke move");
    Ok(())
}

/// Resolve a move conflict by disconnecting source and destination: the
/// destination becomes a plain copy. Content is not touched.
pub fn resolve_break_moved_away(
    db: &Database,
    local_relpath: &str,
    sink: Option<&mut dyn NotifySink>,
) -> Result<(), CoreError> {
    db.with_txn::<_, ResolveError, _>(|txn| {
        // We want to include the passed path's own op-depth in the lookup.
        let Some(moved) = txn.op_depth_moved_to(local_relpath, relpath_depth(local_relpath) - 1)?
        else {
            return Err(ResolveError::NotMovedAway(local_relpath.to_string()));
        };
        break_move(
            txn,
            local_relpath,
            relpath_depth(&moved.src_op_root),
            &moved.dst_op_root,
        )
    })?;

    if let Some(sink) = sink {
        sink.notify(&Notification {
            path: local_relpath.to_string(),
            action: NotifyAction::MoveBroken,
            kind: NodeKind::None,
            content_state: NotifyState::Inapplicable,
            prop_state: NotifyState::Inapplicable,
            old_revision: None,
            new_revision: None,
        });
    }
    Ok(())
}

/// Break every move whose source lies in the subtree at `local_relpath`.
pub fn break_moved_away_children(
    db: &Database,
    local_relpath: &str,
    mut sink: Option<&mut dyn NotifySink>,
) -> Result<(), CoreError> {
    db.with_txn::<_, ResolveError, _>(|txn| {
        txn.create_move_spools()?;
        for (src_relpath, dst_relpath, src_op_depth) in
            txn.moved_descendants(local_relpath, relpath_depth(local_relpath))?
        {
            break_move(txn, &src_relpath, src_op_depth, &dst_relpath)?;
            txn.notify_add(
                &src_relpath,
                NotifyAction::MoveBroken,
                NodeKind::None,
                NotifyState::Inapplicable,
                NotifyState::Inapplicable,
            )?;
        }
        Ok(())
    })?;

    drain_move_notifications(db, None, None, reborrow_sink(&mut sink))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Incoming delete over moved-away subtrees
// ---------------------------------------------------------------------------

/// For an incoming delete on a subtree with moves out of it: raise a
/// moved-away tree conflict on each move source recorded at the subtree's
/// own op-depth.
pub fn resolve_delete_raise_moved_away(
    db: &Database,
    local_relpath: &str,
    mut sink: Option<&mut dyn NotifySink>,
) -> Result<(), CoreError> {
    let tc = db.with_txn::<_, ResolveError, _>(|txn| get_tc_info(txn, local_relpath))?;

    let own_depth = relpath_depth(local_relpath);
    db.with_txn::<_, ResolveError, _>(|txn| {
        txn.create_move_spools()?;

        for pair in txn.moved_pairs(local_relpath, own_depth - 1)? {
            if pair.src_op_depth != own_depth {
                continue;
            }
            let src_repos_path = source_repos_path(txn, &pair.src_relpath, pair.src_op_depth)?;
            let ctx = MarkContext {
                operation: tc.operation,
                old_version: tc.old_version.as_ref(),
                new_version: &tc.new_version,
                move_root_dst_relpath: &pair.dst_relpath,
            };
            mark_tree_conflict(
                txn,
                &ctx,
                &pair.src_relpath,
                pair.kind,
                pair.kind,
                src_repos_path.as_deref(),
                ConflictReason::MovedAway,
                tc.action,
                Some(local_relpath),
            )?;
        }
        Ok(())
    })?;

    let (old_rev, new_rev) = version_revisions(tc.old_version.as_ref(), Some(&tc.new_version));
    drain_move_notifications(db, old_rev, new_rev, reborrow_sink(&mut sink))?;
    Ok(())
}

/// Repository path of a move source, read from the layer its delete
/// shadows.
fn source_repos_path(
    txn: &StoreTxn<'_>,
    src_relpath: &str,
    src_op_depth: i64,
) -> Result<Option<String>, ResolveError> {
    if let Some(below) = txn.highest_op_depth_below(src_relpath, src_op_depth)? {
        if let Some(info) = txn.depth_get_info(src_relpath, below)? {
            return Ok(info.repos_path);
        }
    }
    Ok(None)
}
