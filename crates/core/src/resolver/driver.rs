//! Tree walker driving the edit receiver.
//!
//! Walks the move source subtree (at the source op-depth) and the move
//! destination subtree (at the destination op-depth) in lockstep,
//! depth-first, children in lexicographic order, and calls the receiver for
//! every difference. Each recursion is a single logical edit event.

use tracing::trace;

use crate::db::StoreTxn;
use crate::errors::ResolveError;
use crate::models::{props_match, Checksum, NodeKind, Presence, Props};
use crate::paths::relpath_join;

use super::{receiver, UpdateMoveState};

/// One side of the walk: a node layer with its sorted children.
#[derive(Debug, Clone)]
pub(crate) struct LayerInfo {
    pub kind: NodeKind,
    pub checksum: Option<Checksum>,
    pub props: Option<Props>,
    pub children: Vec<String>,
}

impl LayerInfo {
    fn none() -> Self {
        Self {
            kind: NodeKind::None,
            checksum: None,
            props: None,
            children: Vec::new(),
        }
    }
}

/// Load the layer at `(relpath, op_depth)` for the walk.
///
/// A missing row, or a row that only records the delete of a lower layer,
/// reads as `kind = none`. A not-present row with a repository location is
/// a real node that must be reported as being there, without content.
pub(crate) fn get_info(
    txn: &StoreTxn<'_>,
    relpath: &str,
    op_depth: i64,
) -> Result<LayerInfo, ResolveError> {
    let Some(info) = txn.depth_get_info(relpath, op_depth)? else {
        return Ok(LayerInfo::none());
    };

    if info.presence.is_delete_marker() || info.presence == Presence::NotPresent {
        if info.repos_path.is_some() {
            return Ok(LayerInfo {
                kind: info.kind,
                checksum: None,
                props: None,
                children: Vec::new(),
            });
        }
        return Ok(LayerInfo::none());
    }

    let children = txn.get_children(relpath, op_depth)?;
    Ok(LayerInfo {
        kind: info.kind,
        checksum: info.checksum,
        props: info.props,
        children,
    })
}

/// Compare the source node at `src_relpath` with the destination node at
/// `dst_relpath` and apply the difference, then recurse over the merged
/// child lists.
pub(crate) fn update_moved_away_node(
    txn: &StoreTxn<'_>,
    state: &mut UpdateMoveState<'_>,
    src_relpath: &str,
    dst_relpath: &str,
    src_op_depth: i64,
    shadowed: bool,
) -> Result<(), ResolveError> {
    let src = get_info(txn, src_relpath, src_op_depth)?;
    let dst = get_info(txn, dst_relpath, state.dst_op_depth)?;
    trace!(
        src = src_relpath,
        dst = dst_relpath,
        src_kind = %src.kind,
        dst_kind = %dst.kind,
        shadowed,
        "walking node"
    );

    if src.kind == NodeKind::None || (dst.kind != NodeKind::None && src.kind != dst.kind) {
        receiver::delete(txn, state, dst_relpath, shadowed)?;
        receiver::delete_move_leaf(txn, state, dst_relpath)?;
    }

    if src.kind != NodeKind::None && src.kind != dst.kind {
        if shadowed {
            txn.extend_parent_delete(dst_relpath, src.kind, state.dst_op_depth)?;
        }
        match src.kind {
            NodeKind::File | NodeKind::Symlink => receiver::add_file(
                txn,
                state,
                dst_relpath,
                src.checksum.clone(),
                src.props.clone(),
                shadowed,
            )?,
            NodeKind::Dir => {
                receiver::add_directory(txn, state, dst_relpath, src.props.clone(), shadowed)?
            }
            NodeKind::None => unreachable!("source kind checked above"),
        }
    } else if src.kind != NodeKind::None {
        let props = if props_match(src.props.as_ref(), dst.props.as_ref()) {
            None
        } else {
            Some(src.props.clone().unwrap_or_default())
        };

        if src.kind.is_file_like() {
            let checksum = if src.checksum == dst.checksum {
                None
            } else {
                src.checksum.clone()
            };
            if props.is_some() || checksum.is_some() {
                receiver::alter_file(txn, state, dst_relpath, checksum, props, shadowed)?;
            }
        } else if props.is_some() || src.children != dst.children {
            receiver::alter_directory(txn, state, dst_relpath, props, shadowed)?;
        }
    }

    if src.kind == NodeKind::Dir {
        walk_children(
            txn,
            state,
            src_relpath,
            dst_relpath,
            src_op_depth,
            shadowed,
            &src.children,
            &dst.children,
        )?;
    }

    Ok(())
}

/// Merge-walk the sorted child name lists of both sides.
#[allow(clippy::too_many_arguments)]
fn walk_children(
    txn: &StoreTxn<'_>,
    state: &mut UpdateMoveState<'_>,
    src_relpath: &str,
    dst_relpath: &str,
    src_op_depth: i64,
    shadowed: bool,
    src_children: &[String],
    dst_children: &[String],
) -> Result<(), ResolveError> {
    let mut i = 0;
    let mut j = 0;
    while i < src_children.len() || j < dst_children.len() {
        if let Some(cancel) = state.env.cancel {
            if cancel() {
                return Err(ResolveError::Cancelled);
            }
        }

        let child_name = match (src_children.get(i), dst_children.get(j)) {
            (Some(s), None) => {
                i += 1;
                s
            }
            (None, Some(d)) => {
                j += 1;
                d
            }
            (Some(s), Some(d)) => match s.cmp(d) {
                std::cmp::Ordering::Less => {
                    i += 1;
                    s
                }
                std::cmp::Ordering::Greater => {
                    j += 1;
                    d
                }
                std::cmp::Ordering::Equal => {
                    i += 1;
                    j += 1;
                    s
                }
            },
            (None, None) => break,
        };

        let src_child = relpath_join(src_relpath, child_name);
        let dst_child = relpath_join(dst_relpath, child_name);

        let child_shadowed = shadowed || node_shadowed(txn, state, &dst_child)?;

        update_moved_away_node(txn, state, &src_child, &dst_child, src_op_depth, child_shadowed)?;
    }
    Ok(())
}

/// A destination node is shadowed when its visible presence comes from a
/// layer above the destination's own op-depth.
fn node_shadowed(
    txn: &StoreTxn<'_>,
    state: &UpdateMoveState<'_>,
    dst_relpath: &str,
) -> Result<bool, ResolveError> {
    let highest = txn.highest_working_op_depth(dst_relpath)?;
    Ok(highest.map_or(false, |op_depth| op_depth > state.dst_op_depth))
}
