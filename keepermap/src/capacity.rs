//! Best-effort enforcement of a table's keys limit.
//!
//! The count is read from the root node's child count and can be stale by the
//! time a write lands; concurrent writers may overshoot the limit.

use common::Coordination;

use crate::error::{Error, Result};

/// Number of keys currently stored under `root_path`.
///
/// The root always holds the metadata node next to the data nodes, which is
/// not a key.
pub(crate) async fn current_key_count(client: &dyn Coordination, root_path: &str) -> Result<u64> {
    let stat = client.exists(root_path).await?.ok_or_else(|| {
        Error::InvalidTable(format!("root path '{}' does not exist", root_path))
    })?;
    Ok(u64::try_from(stat.num_children).unwrap_or(0).saturating_sub(1))
}

/// Fails if adding `new_keys` to `current` exceeds `limit`. A limit of 0 never
/// fails.
pub(crate) fn check_keys_limit(current: u64, new_keys: u64, limit: u64) -> Result<()> {
    if limit == 0 {
        return Ok(());
    }
    let would_be = current.saturating_add(new_keys);
    if would_be > limit {
        return Err(Error::LimitExceeded {
            new_keys,
            limit,
            would_be,
        });
    }
    Ok(())
}
