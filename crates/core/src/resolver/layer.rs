//! Layer replacement: the step that makes the destination really equal to
//! the post-update source at its op-depth.
//!
//! After the walk has merged working-state changes and raised conflicts,
//! every row of the source layer is copied into the destination op-depth,
//! path-mapped under the destination root. Higher destination layers
//! (local adds, moves, deletes on top of the move) are preserved, and any
//! base-delete above the destination op-depth is extended over the copied
//! rows so it keeps covering them.

use tracing::{debug, info};

use crate::db::StoreTxn;
use crate::errors::ResolveError;
use crate::paths::{relpath_depth, relpath_dirname, relpath_join, skip_ancestor};

/// Rewrite the single op-depth layer at `dst_relpath` to mirror the source
/// layer rooted at `src_relpath` at `src_op_depth`.
pub(crate) fn replace_moved_layer(
    txn: &StoreTxn<'_>,
    src_relpath: &str,
    dst_relpath: &str,
    src_op_depth: i64,
) -> Result<(), ResolveError> {
    txn.verify_write_lock(dst_relpath)?;
    let dst_op_depth = relpath_depth(dst_relpath);

    let rows = txn.layer_rows(src_relpath, src_op_depth)?;
    info!(
        src = src_relpath,
        dst = dst_relpath,
        src_op_depth,
        rows = rows.len(),
        "replacing moved layer"
    );

    for (src_row_relpath, kind) in rows {
        let suffix = skip_ancestor(src_relpath, &src_row_relpath).unwrap_or("");
        let dst_row_relpath = relpath_join(dst_relpath, suffix);
        let dst_parent = relpath_dirname(&dst_row_relpath);

        txn.copy_node_move(
            &src_row_relpath,
            src_op_depth,
            &dst_row_relpath,
            dst_op_depth,
            dst_parent,
        )?;

        if dst_row_relpath != dst_relpath {
            txn.extend_parent_delete(&dst_row_relpath, kind, dst_op_depth)?;
        }
        debug!(row = %dst_row_relpath, "copied layer row");
    }

    Ok(())
}
