use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use super::util::{base_name, parent_path};
use super::{
    Coordination, CoordinationConnector, CoordinationError, CoordinationResult, CreateMode,
    ErrorCode, Op, Stat,
};

#[derive(Clone, Debug)]
struct Node {
    data: Bytes,
    stat: Stat,
    children: BTreeSet<String>,
}

impl Node {
    fn new(data: Bytes, zxid: i64, ephemeral_owner: i64) -> Self {
        Self {
            stat: Stat {
                czxid: zxid,
                mzxid: zxid,
                data_length: data.len() as i32,
                ephemeral_owner,
                ..Stat::default()
            },
            data,
            children: BTreeSet::new(),
        }
    }
}

/// The replicated state of an ensemble: a flat map from full path to node.
#[derive(Clone, Debug)]
struct Tree {
    nodes: HashMap<String, Node>,
    zxid: i64,
}

fn validate_path(path: &str) -> Result<(), ErrorCode> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(ErrorCode::BadArguments);
    }
    Ok(())
}

fn version_matches(stat: &Stat, version: Option<i32>) -> bool {
    version.is_none_or(|v| v == stat.version)
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(Bytes::new(), 0, 0));
        Self { nodes, zxid: 0 }
    }

    fn create(
        &mut self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
        session_id: i64,
    ) -> Result<(), ErrorCode> {
        validate_path(path)?;
        if path == "/" || self.nodes.contains_key(path) {
            return Err(ErrorCode::NodeExists);
        }
        let parent = parent_path(path);
        let name = base_name(path).to_string();
        self.zxid += 1;
        let zxid = self.zxid;

        let parent_node = self.nodes.get_mut(parent).ok_or(ErrorCode::NoNode)?;
        if parent_node.stat.ephemeral_owner != 0 {
            return Err(ErrorCode::NoChildrenForEphemerals);
        }
        parent_node.children.insert(name);
        parent_node.stat.num_children = parent_node.children.len() as i32;
        parent_node.stat.cversion += 1;

        let owner = match mode {
            CreateMode::Persistent => 0,
            CreateMode::Ephemeral => session_id,
        };
        self.nodes
            .insert(path.to_string(), Node::new(data, zxid, owner));
        Ok(())
    }

    fn set(&mut self, path: &str, data: Bytes, version: Option<i32>) -> Result<Stat, ErrorCode> {
        validate_path(path)?;
        self.zxid += 1;
        let zxid = self.zxid;
        let node = self.nodes.get_mut(path).ok_or(ErrorCode::NoNode)?;
        if !version_matches(&node.stat, version) {
            return Err(ErrorCode::BadVersion);
        }
        node.stat.data_length = data.len() as i32;
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.data = data;
        Ok(node.stat)
    }

    fn remove(&mut self, path: &str, version: Option<i32>) -> Result<(), ErrorCode> {
        validate_path(path)?;
        if path == "/" {
            return Err(ErrorCode::BadArguments);
        }
        let node = self.nodes.get(path).ok_or(ErrorCode::NoNode)?;
        if !version_matches(&node.stat, version) {
            return Err(ErrorCode::BadVersion);
        }
        if !node.children.is_empty() {
            return Err(ErrorCode::NotEmpty);
        }
        self.nodes.remove(path);
        self.zxid += 1;
        if let Some(parent) = self.nodes.get_mut(parent_path(path)) {
            parent.children.remove(base_name(path));
            parent.stat.num_children = parent.children.len() as i32;
            parent.stat.cversion += 1;
        }
        Ok(())
    }

    fn check(&self, path: &str, version: Option<i32>) -> Result<(), ErrorCode> {
        validate_path(path)?;
        let node = self.nodes.get(path).ok_or(ErrorCode::NoNode)?;
        if !version_matches(&node.stat, version) {
            return Err(ErrorCode::BadVersion);
        }
        Ok(())
    }

    fn apply(&mut self, op: Op, session_id: i64) -> Result<(), ErrorCode> {
        match op {
            Op::Create { path, data, mode } => self.create(&path, data, mode, session_id),
            Op::Set {
                path,
                data,
                version,
            } => self.set(&path, data, version).map(|_| ()),
            Op::Remove { path, version } => self.remove(&path, version),
            Op::Check { path, version } => self.check(&path, version),
        }
    }

    /// Removes every ephemeral node owned by `session_id`.
    fn remove_ephemerals(&mut self, session_id: i64) -> usize {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == session_id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            // ephemeral nodes never have children
            let _ = self.remove(path, None);
        }
        owned.len()
    }
}

/// Injected failure that fires either once or on every call.
#[cfg(feature = "test-utils")]
#[derive(Clone)]
enum Failure {
    /// Error is returned once, then automatically cleared.
    Once(ErrorCode),
    /// Error is returned on every subsequent call until explicitly cleared.
    Persistent(ErrorCode),
}

#[cfg(feature = "test-utils")]
type FailSlot = arc_swap::ArcSwap<Option<Failure>>;

/// Checks a [`FailSlot`] and returns an error code if one is set.
///
/// For [`Failure::Once`], the slot is atomically swapped to `None` so the
/// error fires exactly once. For [`Failure::Persistent`], the slot is left
/// unchanged.
#[cfg(feature = "test-utils")]
fn check_failure(slot: &FailSlot) -> Result<(), ErrorCode> {
    let guard = slot.load();
    match guard.as_ref() {
        None => Ok(()),
        Some(Failure::Persistent(code)) => Err(*code),
        Some(Failure::Once(_)) => {
            let prev = slot.swap(Arc::new(None));
            match prev.as_ref() {
                Some(Failure::Once(code)) => Err(*code),
                _ => Ok(()),
            }
        }
    }
}

#[cfg(feature = "test-utils")]
struct Faults {
    fail_connect: FailSlot,
    fail_requests: FailSlot,
    request_latency_ms: std::sync::atomic::AtomicU64,
}

#[cfg(feature = "test-utils")]
impl Default for Faults {
    fn default() -> Self {
        Self {
            fail_connect: arc_swap::ArcSwap::from_pointee(None),
            fail_requests: arc_swap::ArcSwap::from_pointee(None),
            request_latency_ms: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

struct EnsembleState {
    tree: RwLock<Tree>,
    sessions: RwLock<HashMap<i64, Arc<AtomicBool>>>,
    next_session_id: AtomicI64,
    #[cfg(feature = "test-utils")]
    faults: Faults,
}

impl EnsembleState {
    fn read_tree(&self) -> Result<std::sync::RwLockReadGuard<'_, Tree>, ErrorCode> {
        self.tree.read().map_err(|_| ErrorCode::Internal)
    }

    fn write_tree(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tree>, ErrorCode> {
        self.tree.write().map_err(|_| ErrorCode::Internal)
    }
}

/// In-process coordination service holding its whole tree in memory.
///
/// Every session opened through [`CoordinationConnector::connect`] observes the
/// same tree, so several table instances (or simulated servers) can race
/// against each other inside one test. Sessions can be expired explicitly,
/// which removes their ephemeral nodes exactly as a real ensemble would.
///
/// With the `test-utils` feature, connection failures, request failures and
/// request latency can be injected.
#[derive(Clone)]
pub struct InMemoryEnsemble {
    state: Arc<EnsembleState>,
}

impl InMemoryEnsemble {
    /// Creates an ensemble containing only the root node `/`.
    pub fn new() -> Self {
        Self {
            state: Arc::new(EnsembleState {
                tree: RwLock::new(Tree::new()),
                sessions: RwLock::new(HashMap::new()),
                next_session_id: AtomicI64::new(1),
                #[cfg(feature = "test-utils")]
                faults: Faults::default(),
            }),
        }
    }

    /// Opens a session directly, bypassing the connector trait object.
    pub fn open_session(&self) -> CoordinationResult<Arc<InMemorySession>> {
        #[cfg(feature = "test-utils")]
        check_failure(&self.state.faults.fail_connect)
            .map_err(|code| CoordinationError::new(code, ""))?;

        let id = self.state.next_session_id.fetch_add(1, Ordering::SeqCst);
        let expired = Arc::new(AtomicBool::new(false));
        self.state
            .sessions
            .write()
            .map_err(|_| CoordinationError::new(ErrorCode::Internal, ""))?
            .insert(id, Arc::clone(&expired));

        tracing::debug!(session_id = id, "opened in-memory coordination session");
        Ok(Arc::new(InMemorySession {
            id,
            expired,
            state: Arc::clone(&self.state),
        }))
    }

    /// Expires a session: it stops accepting requests and its ephemeral nodes
    /// are removed.
    pub fn expire_session(&self, session_id: i64) -> CoordinationResult<()> {
        let flag = self
            .state
            .sessions
            .write()
            .map_err(|_| CoordinationError::new(ErrorCode::Internal, ""))?
            .remove(&session_id);
        if let Some(flag) = flag {
            flag.store(true, Ordering::SeqCst);
        }
        let removed = self
            .state
            .write_tree()
            .map_err(|code| CoordinationError::new(code, ""))?
            .remove_ephemerals(session_id);
        tracing::debug!(session_id, removed, "expired in-memory coordination session");
        Ok(())
    }

    /// Expires every open session.
    pub fn expire_all_sessions(&self) -> CoordinationResult<()> {
        let ids: Vec<i64> = self
            .state
            .sessions
            .read()
            .map_err(|_| CoordinationError::new(ErrorCode::Internal, ""))?
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.expire_session(id)?;
        }
        Ok(())
    }

    /// Returns the number of nodes in the tree, including the root.
    pub fn node_count(&self) -> usize {
        self.state
            .read_tree()
            .map(|tree| tree.nodes.len())
            .unwrap_or(0)
    }

    /// Makes every subsequent connection attempt fail with `code`.
    #[cfg(feature = "test-utils")]
    pub fn fail_connect(&self, code: ErrorCode) {
        self.state
            .faults
            .fail_connect
            .store(Arc::new(Some(Failure::Persistent(code))));
    }

    /// Makes every subsequent request on any session fail with `code`.
    #[cfg(feature = "test-utils")]
    pub fn fail_requests(&self, code: ErrorCode) {
        self.state
            .faults
            .fail_requests
            .store(Arc::new(Some(Failure::Persistent(code))));
    }

    /// Makes the next request on any session fail with `code`.
    #[cfg(feature = "test-utils")]
    pub fn fail_requests_once(&self, code: ErrorCode) {
        self.state
            .faults
            .fail_requests
            .store(Arc::new(Some(Failure::Once(code))));
    }

    /// Delays every request by `latency` before it is served.
    #[cfg(feature = "test-utils")]
    pub fn set_request_latency(&self, latency: std::time::Duration) {
        self.state
            .faults
            .request_latency_ms
            .store(
                u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                Ordering::SeqCst,
            );
    }

    /// Clears all injected failures and latency.
    #[cfg(feature = "test-utils")]
    pub fn clear_faults(&self) {
        self.state.faults.fail_connect.store(Arc::new(None));
        self.state.faults.fail_requests.store(Arc::new(None));
        self.state
            .faults
            .request_latency_ms
            .store(0, Ordering::SeqCst);
    }
}

impl Default for InMemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationConnector for InMemoryEnsemble {
    async fn connect(&self) -> CoordinationResult<Arc<dyn Coordination>> {
        let session: Arc<dyn Coordination> = self.open_session()?;
        Ok(session)
    }
}

/// A session against an [`InMemoryEnsemble`].
pub struct InMemorySession {
    id: i64,
    expired: Arc<AtomicBool>,
    state: Arc<EnsembleState>,
}

impl InMemorySession {
    async fn begin(&self, path: &str) -> CoordinationResult<()> {
        #[cfg(feature = "test-utils")]
        {
            let latency = self.state.faults.request_latency_ms.load(Ordering::SeqCst);
            if latency > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(latency)).await;
            }
            check_failure(&self.state.faults.fail_requests)
                .map_err(|code| CoordinationError::new(code, path))?;
        }
        if self.is_expired() {
            return Err(CoordinationError::new(ErrorCode::SessionExpired, path));
        }
        Ok(())
    }
}

#[async_trait]
impl Coordination for InMemorySession {
    fn session_id(&self) -> i64 {
        self.id
    }

    fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn exists(&self, path: &str) -> CoordinationResult<Option<Stat>> {
        self.begin(path).await?;
        let tree = self
            .state
            .read_tree()
            .map_err(|code| CoordinationError::new(code, path))?;
        Ok(tree.nodes.get(path).map(|node| node.stat))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, path: &str) -> CoordinationResult<Option<(Bytes, Stat)>> {
        self.begin(path).await?;
        let tree = self
            .state
            .read_tree()
            .map_err(|code| CoordinationError::new(code, path))?;
        Ok(tree
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat)))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn get_children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.begin(path).await?;
        let tree = self
            .state
            .read_tree()
            .map_err(|code| CoordinationError::new(code, path))?;
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| CoordinationError::new(ErrorCode::NoNode, path))?;
        Ok(node.children.iter().cloned().collect())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> CoordinationResult<()> {
        self.begin(path).await?;
        self.state
            .write_tree()
            .and_then(|mut tree| tree.create(path, data, mode, self.id))
            .map_err(|code| CoordinationError::new(code, path))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn set(
        &self,
        path: &str,
        data: Bytes,
        version: Option<i32>,
    ) -> CoordinationResult<Stat> {
        self.begin(path).await?;
        self.state
            .write_tree()
            .and_then(|mut tree| tree.set(path, data, version))
            .map_err(|code| CoordinationError::new(code, path))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn remove(&self, path: &str, version: Option<i32>) -> CoordinationResult<()> {
        self.begin(path).await?;
        self.state
            .write_tree()
            .and_then(|mut tree| tree.remove(path, version))
            .map_err(|code| CoordinationError::new(code, path))
    }

    /// Applies the operations to a copy of the tree and swaps it in only if
    /// all of them succeed.
    #[tracing::instrument(level = "trace", skip_all)]
    async fn multi(&self, ops: Vec<Op>) -> CoordinationResult<()> {
        let first_path = ops.first().map(|op| op.path().to_string()).unwrap_or_default();
        self.begin(&first_path).await?;

        let mut tree = self
            .state
            .write_tree()
            .map_err(|code| CoordinationError::new(code, first_path.as_str()))?;
        let mut staged = tree.clone();
        for op in ops {
            let path = op.path().to_string();
            staged
                .apply(op, self.id)
                .map_err(|code| CoordinationError::new(code, path))?;
        }
        *tree = staged;
        Ok(())
    }

    async fn sync(&self, path: &str) -> CoordinationResult<()> {
        // a single in-process replica is always up to date
        self.begin(path).await
    }
}
