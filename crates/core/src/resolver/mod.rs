//! Update-move conflict resolution.
//!
//! Reconciles an incoming update (or switch) on a subtree the user has
//! locally moved away, so that the end state is as if the update had been
//! applied before the move. The driver walks the move source and move
//! destination layers in lockstep, the receiver merges each difference into
//! the destination working state, and the layer replacer finally rewrites
//! the destination op-depth layer to mirror the post-update source.
//!
//! The whole drive runs as one store transaction. Notifications and work
//! items spool inside it and become visible only on commit.

pub mod bump;
pub mod conflict;
pub mod driver;
pub mod layer;
pub mod receiver;

use tracing::{debug, info};

use crate::config::ResolverConfig;
use crate::db::{Database, StoreTxn};
use crate::errors::{CoreError, ResolveError};
use crate::merge::{FileMerger, PristineStore};
use crate::models::{
    Checksum, ConflictVersion, NodeKind, Notification, NotifyAction, NotifyState, Operation,
    Props, Revision,
};
use crate::notify::{drain_move_notifications, reborrow_sink, NotifySink};
use crate::paths::{relpath_depth, relpath_join, skip_ancestor};

/// External collaborators and tunables for one resolution.
pub struct ResolveEnv<'a> {
    pub merger: &'a dyn FileMerger,
    pub pristines: &'a dyn PristineStore,
    /// Polled once per walked child; a `true` aborts the transaction.
    pub cancel: Option<&'a dyn Fn() -> bool>,
    pub config: ResolverConfig,
}

impl<'a> ResolveEnv<'a> {
    pub fn new(merger: &'a dyn FileMerger, pristines: &'a dyn PristineStore) -> Self {
        Self {
            merger,
            pristines,
            cancel: None,
            config: ResolverConfig::default(),
        }
    }
}

/// All the info we need about one version of a working node.
#[derive(Debug, Clone)]
pub(crate) struct WorkingVersion {
    pub checksum: Option<Checksum>,
    pub props: Props,
}

/// Walk state threaded through the receiver: the conflict versions of the
/// update, the destination root, and the most recent conflict raised during
/// this drive. The depth-first drive makes the single remembered conflict
/// root sufficient.
pub(crate) struct UpdateMoveState<'a> {
    pub env: &'a ResolveEnv<'a>,
    pub operation: Operation,
    pub old_version: Option<ConflictVersion>,
    pub new_version: ConflictVersion,
    pub move_root_dst_relpath: String,
    pub dst_op_depth: i64,
    pub conflict_root: Option<String>,
}

impl UpdateMoveState<'_> {
    /// True when `relpath` falls under the most recently raised conflict.
    /// Clears the remembered root once the walk has moved past it.
    pub fn under_conflict_root(&mut self, relpath: &str) -> bool {
        match &self.conflict_root {
            Some(root) if skip_ancestor(root, relpath).is_some() => true,
            Some(_) => {
                self.conflict_root = None;
                false
            }
            None => false,
        }
    }
}

/// Tree-conflict info loaded from the victim.
pub(crate) struct TcInfo {
    pub operation: Operation,
    pub old_version: Option<ConflictVersion>,
    pub new_version: ConflictVersion,
    pub action: crate::models::ConflictAction,
    pub move_src_op_root: Option<String>,
}

/// Read and validate the conflict recorded on `victim_relpath`.
pub(crate) fn get_tc_info(
    txn: &StoreTxn<'_>,
    victim_relpath: &str,
) -> Result<TcInfo, ResolveError> {
    let Some(skeleton) = txn.read_conflict(victim_relpath)? else {
        return Err(ResolveError::NotInConflict(victim_relpath.to_string()));
    };
    let Some(tree) = skeleton.tree.clone() else {
        return Err(ResolveError::NotInConflict(victim_relpath.to_string()));
    };
    let operation = skeleton.operation_for(victim_relpath)?;
    let Some(new_version) = skeleton.new_version.clone() else {
        return Err(ResolveError::ResolverFailure {
            path: victim_relpath.to_string(),
            detail: "conflict skeleton has no incoming version".into(),
        });
    };
    Ok(TcInfo {
        operation,
        old_version: skeleton.old_version,
        new_version,
        action: tree.action,
        move_src_op_root: tree.move_src_op_root,
    })
}

/// Reject mixed-revision and switched-subtree move sources before editing
/// begins.
fn suitable_for_move(txn: &StoreTxn<'_>, relpath: &str) -> Result<(), ResolveError> {
    let Some(base) = txn.depth_get_info(relpath, 0)? else {
        return Ok(());
    };
    let revision = base.revision;
    let repos_path = base.repos_path.unwrap_or_default();

    for (row_relpath, row_repos_path, row_revision) in txn.base_subtree_locations(relpath)? {
        if row_revision != revision {
            return Err(ResolveError::MixedRevisionSource(relpath.to_string()));
        }
        let suffix = skip_ancestor(relpath, &row_relpath).unwrap_or("");
        let expected = relpath_join(&repos_path, suffix);
        if row_repos_path.as_deref() != Some(expected.as_str()) {
            return Err(ResolveError::SwitchedSubtree(relpath.to_string()));
        }
    }
    Ok(())
}

/// The transactional body of [`resolve_moved_away`].
fn update_moved_away_conflict_victim(
    txn: &StoreTxn<'_>,
    victim_relpath: &str,
    tc: &TcInfo,
    env: &ResolveEnv<'_>,
) -> Result<(), ResolveError> {
    let Some(move_src_op_root) = tc.move_src_op_root.as_deref() else {
        return Err(ResolveError::NotMovedAway(victim_relpath.to_string()));
    };
    let Some(moved) =
        txn.op_depth_moved_to(victim_relpath, relpath_depth(move_src_op_root) - 1)?
    else {
        return Err(ResolveError::NotMovedAway(victim_relpath.to_string()));
    };
    let move_root_dst_relpath = moved.dst_op_root.clone();

    txn.verify_write_lock(move_src_op_root)?;
    txn.verify_write_lock(&move_root_dst_relpath)?;

    let src_op_root_depth = relpath_depth(move_src_op_root);
    let Some(src_op_depth) = txn.highest_op_depth_below(move_src_op_root, src_op_root_depth)?
    else {
        return Err(ResolveError::ResolverFailure {
            path: move_src_op_root.to_string(),
            detail: "move source is not deleted".into(),
        });
    };

    if src_op_depth == 0 {
        suitable_for_move(txn, victim_relpath)?;
    }

    txn.create_move_spools()?;

    info!(
        victim = victim_relpath,
        dst = %move_root_dst_relpath,
        src_op_depth,
        operation = %tc.operation,
        "resolving update-move conflict"
    );

    let mut state = UpdateMoveState {
        env,
        operation: tc.operation,
        old_version: tc.old_version.clone(),
        new_version: tc.new_version.clone(),
        dst_op_depth: relpath_depth(&move_root_dst_relpath),
        move_root_dst_relpath: move_root_dst_relpath.clone(),
        conflict_root: None,
    };

    driver::update_moved_away_node(
        txn,
        &mut state,
        victim_relpath,
        &move_root_dst_relpath,
        src_op_depth,
        false,
    )?;

    layer::replace_moved_layer(txn, victim_relpath, &move_root_dst_relpath, src_op_depth)?;

    Ok(())
}

/// Resolve the "incoming edit, local move-away" tree conflict on
/// `victim_relpath` by transferring the incoming changes to the move
/// destination.
///
/// The caller must hold write locks covering the move source op-root and
/// the move destination op-root. Spooled notifications are delivered to
/// `sink` after the transaction commits; on any error nothing is emitted
/// and the working copy is unchanged.
pub fn resolve_moved_away(
    db: &Database,
    victim_relpath: &str,
    env: &ResolveEnv<'_>,
    mut sink: Option<&mut dyn NotifySink>,
) -> Result<(), CoreError> {
    let tc = db.with_txn::<_, ResolveError, _>(|txn| get_tc_info(txn, victim_relpath))?;

    db.with_txn::<_, ResolveError, _>(|txn| {
        update_moved_away_conflict_victim(txn, victim_relpath, &tc, env)
    })?;

    let old_rev = tc.old_version.as_ref().map(|v| v.peg_rev);
    let new_rev = Some(tc.new_version.peg_rev);
    drain_move_notifications(db, old_rev, new_rev, reborrow_sink(&mut sink))?;

    if let Some(sink) = sink {
        sink.notify(&Notification {
            path: victim_relpath.to_string(),
            action: NotifyAction::UpdateCompleted,
            kind: NodeKind::None,
            content_state: NotifyState::Inapplicable,
            prop_state: NotifyState::Inapplicable,
            old_revision: old_rev,
            new_revision: new_rev,
        });
    }

    debug!(victim = victim_relpath, "update-move resolution complete");
    Ok(())
}

/// Compute the shallowest path whose write lock covers everything a
/// resolve of `relpath` may touch: the subtree itself and every move
/// destination out of it.
pub fn required_lock_for_resolve(
    db: &Database,
    relpath: &str,
) -> Result<String, CoreError> {
    let required = db.with_txn::<_, ResolveError, _>(|txn| {
        let mut required = relpath.to_string();
        for dst in txn.moved_outside(relpath)? {
            required = crate::paths::longest_ancestor(&required, &dst);
        }
        Ok(required)
    })?;
    Ok(required)
}

/// Revisions carried by a conflict's version pair, for notification
/// stamping.
pub(crate) fn version_revisions(
    old_version: Option<&ConflictVersion>,
    new_version: Option<&ConflictVersion>,
) -> (Option<Revision>, Option<Revision>) {
    (
        old_version.map(|v| v.peg_rev),
        new_version.map(|v| v.peg_rev),
    )
}
