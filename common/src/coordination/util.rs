//! Tree utilities built on top of the [`Coordination`] primitives.

use std::sync::Arc;

use bytes::Bytes;

use super::{Coordination, CoordinationResult, CreateMode, ErrorCode, Op};

/// Maximum number of operations sent in one multi request when removing
/// subtrees.
pub const MULTI_BATCH_SIZE: usize = 100;

/// Joins a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Returns the parent of an absolute path; the parent of `/x` is `/`.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Returns the last segment of a path.
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Creates every missing ancestor of `path` (not `path` itself) as an empty
/// persistent node.
pub async fn create_ancestors(client: &dyn Coordination, path: &str) -> CoordinationResult<()> {
    let mut current = String::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((_, ancestors)) = segments.split_last() else {
        return Ok(());
    };
    for segment in ancestors {
        current.push('/');
        current.push_str(segment);
        create_if_not_exists(client, &current, Bytes::new()).await?;
    }
    Ok(())
}

/// Creates a persistent node, treating an already existing node as success.
pub async fn create_if_not_exists(
    client: &dyn Coordination,
    path: &str,
    data: Bytes,
) -> CoordinationResult<()> {
    match client.create(path, data, CreateMode::Persistent).await {
        Ok(()) => Ok(()),
        Err(e) if e.code == ErrorCode::NodeExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// How [`remove_children_recursive`] treats nodes that disappear underneath it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveMode {
    /// Any failure aborts the removal.
    Strict,
    /// Nodes removed concurrently by someone else are skipped.
    TolerateMissing,
}

/// Removes every descendant of `path`, leaving `path` itself in place.
///
/// A direct child named `keep` is left untouched together with its subtree.
/// Removals are sent leaf-first in multi requests of up to
/// [`MULTI_BATCH_SIZE`] operations.
pub async fn remove_children_recursive(
    client: &dyn Coordination,
    path: &str,
    keep: Option<&str>,
    mode: RemoveMode,
) -> CoordinationResult<()> {
    let children = match client.get_children(path).await {
        Ok(children) => children,
        Err(e) if e.code == ErrorCode::NoNode && mode == RemoveMode::TolerateMissing => {
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let mut doomed = Vec::new();
    for child in children {
        if keep == Some(child.as_str()) {
            continue;
        }
        collect_subtree(client, join_path(path, &child), mode, &mut doomed).await?;
    }

    for batch in doomed.chunks(MULTI_BATCH_SIZE) {
        let ops: Vec<Op> = batch.iter().map(|p| Op::remove(p.as_str(), None)).collect();
        match client.multi(ops).await {
            Ok(()) => {}
            Err(e) if e.code == ErrorCode::NoNode && mode == RemoveMode::TolerateMissing => {
                // someone else removed part of the batch; fall back to one by one
                for p in batch {
                    match client.remove(p, None).await {
                        Ok(()) => {}
                        Err(e) if e.code == ErrorCode::NoNode => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Appends `path` and all its descendants to `out`, children before parents.
async fn collect_subtree(
    client: &dyn Coordination,
    path: String,
    mode: RemoveMode,
    out: &mut Vec<String>,
) -> CoordinationResult<()> {
    // iterative post-order walk: async recursion would need boxing
    let mut stack = vec![(path, false)];
    while let Some((current, expanded)) = stack.pop() {
        if expanded {
            out.push(current);
            continue;
        }
        let children = match client.get_children(&current).await {
            Ok(children) => children,
            Err(e) if e.code == ErrorCode::NoNode && mode == RemoveMode::TolerateMissing => {
                continue;
            }
            Err(e) => return Err(e),
        };
        stack.push((current.clone(), true));
        for child in children {
            stack.push((join_path(&current, &child), false));
        }
    }
    Ok(())
}

/// Tracks ownership of an ephemeral node created by this process.
///
/// The node is removed by [`release`](EphemeralNodeHolder::release) unless it
/// was already removed as part of another transaction and marked with
/// [`set_already_removed`](EphemeralNodeHolder::set_already_removed).
pub struct EphemeralNodeHolder {
    path: String,
    client: Arc<dyn Coordination>,
    removed: bool,
}

impl EphemeralNodeHolder {
    /// Takes ownership of an ephemeral node that already exists.
    pub fn existing(path: impl Into<String>, client: Arc<dyn Coordination>) -> Self {
        Self {
            path: path.into(),
            client,
            removed: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_already_removed(&mut self) {
        self.removed = true;
    }

    /// Removes the node if it is still owned. A node that is already gone
    /// (e.g. because the session expired) is not an error.
    pub async fn release(mut self) -> CoordinationResult<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        match self.client.remove(&self.path, None).await {
            Ok(()) => Ok(()),
            Err(e) if e.code == ErrorCode::NoNode || e.is_hardware_error() => {
                tracing::debug!(path = %self.path, error = %e, "ephemeral node already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for EphemeralNodeHolder {
    fn drop(&mut self) {
        if !self.removed {
            // the node disappears with the session at the latest
            tracing::warn!(path = %self.path, "ephemeral node holder dropped without release");
        }
    }
}
