//! Client-side contract of a hierarchical coordination service.
//!
//! The service exposes a tree of path-addressed nodes (ZooKeeper-like) with
//! persistent and ephemeral nodes, version-checked updates and atomic
//! multi-operation transactions. Everything a table engine needs from the
//! service goes through the [`Coordination`] trait, so backends can be swapped
//! without touching the engine.
//!
//! Expected outcomes are part of the ordinary return values: a missing node on
//! [`Coordination::get`] or [`Coordination::exists`] is `None`, and a failed
//! create, remove or multi reports an [`ErrorCode`] the caller can `match` on.

pub mod config;
pub mod in_memory;
pub mod registry;
pub mod util;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// Lifetime of a created node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CreateMode {
    /// The node survives the session that created it.
    #[default]
    Persistent,
    /// The node is removed when the creating session ends.
    Ephemeral,
}

/// Node metadata returned alongside reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    /// Transaction id that created the node.
    pub czxid: i64,
    /// Transaction id of the last data modification.
    pub mzxid: i64,
    /// Number of data modifications.
    pub version: i32,
    /// Number of changes to the node's children.
    pub cversion: i32,
    /// Owning session for ephemeral nodes, 0 otherwise.
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
}

/// A single operation inside a multi-operation transaction.
///
/// `version: None` means "any version".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Create {
        path: String,
        data: Bytes,
        mode: CreateMode,
    },
    Set {
        path: String,
        data: Bytes,
        version: Option<i32>,
    },
    Remove {
        path: String,
        version: Option<i32>,
    },
    Check {
        path: String,
        version: Option<i32>,
    },
}

impl Op {
    pub fn create(path: impl Into<String>, data: Bytes, mode: CreateMode) -> Self {
        Op::Create {
            path: path.into(),
            data,
            mode,
        }
    }

    pub fn set(path: impl Into<String>, data: Bytes, version: Option<i32>) -> Self {
        Op::Set {
            path: path.into(),
            data,
            version,
        }
    }

    pub fn remove(path: impl Into<String>, version: Option<i32>) -> Self {
        Op::Remove {
            path: path.into(),
            version,
        }
    }

    pub fn check(path: impl Into<String>, version: Option<i32>) -> Self {
        Op::Check {
            path: path.into(),
            version,
        }
    }

    /// Returns the path this operation targets.
    pub fn path(&self) -> &str {
        match self {
            Op::Create { path, .. }
            | Op::Set { path, .. }
            | Op::Remove { path, .. }
            | Op::Check { path, .. } => path,
        }
    }
}

/// Result codes reported by the coordination service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The node (or, for creates, its parent) does not exist.
    NoNode,
    NodeExists,
    /// The node has children and cannot be removed.
    NotEmpty,
    BadVersion,
    NoChildrenForEphemerals,
    ConnectionLoss,
    SessionExpired,
    OperationTimeout,
    BadArguments,
    Internal,
}

impl ErrorCode {
    /// Returns true for errors caused by losing contact with the service,
    /// as opposed to errors describing the state of the tree.
    pub fn is_hardware_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionLoss | ErrorCode::SessionExpired | ErrorCode::OperationTimeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::NoNode => "No node",
            ErrorCode::NodeExists => "Node exists",
            ErrorCode::NotEmpty => "Not empty",
            ErrorCode::BadVersion => "Bad version",
            ErrorCode::NoChildrenForEphemerals => "No children for ephemerals",
            ErrorCode::ConnectionLoss => "Connection loss",
            ErrorCode::SessionExpired => "Session expired",
            ErrorCode::OperationTimeout => "Operation timeout",
            ErrorCode::BadArguments => "Bad arguments",
            ErrorCode::Internal => "Internal error",
        };
        write!(f, "{}", name)
    }
}

/// Error type for coordination operations.
///
/// Carries the result code and the path of the operation that produced it.
/// For multi-operation transactions the path is the one of the first failing
/// operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationError {
    pub code: ErrorCode,
    pub path: String,
}

impl CoordinationError {
    pub fn new(code: ErrorCode, path: impl Into<String>) -> Self {
        Self {
            code,
            path: path.into(),
        }
    }

    pub fn is_hardware_error(&self) -> bool {
        self.code.is_hardware_error()
    }
}

impl std::error::Error for CoordinationError {}

impl std::fmt::Display for CoordinationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "Coordination error: {}", self.code)
        } else {
            write!(f, "Coordination error: {}, path: {}", self.code, self.path)
        }
    }
}

/// Result type alias for coordination operations
pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

/// A session with the coordination service.
///
/// All methods take `&self`; once a session is obtained, requests may be
/// issued concurrently from many tasks.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Identifier of this session. Ephemeral nodes record it as their owner.
    fn session_id(&self) -> i64;

    /// Returns true once the session has expired. An expired session never
    /// recovers; a new one must be established.
    fn is_expired(&self) -> bool;

    /// Returns the node's metadata, or `None` if it does not exist.
    async fn exists(&self, path: &str) -> CoordinationResult<Option<Stat>>;

    /// Returns the node's data and metadata, or `None` if it does not exist.
    async fn get(&self, path: &str) -> CoordinationResult<Option<(Bytes, Stat)>>;

    /// Returns the names (not full paths) of the node's children.
    async fn get_children(&self, path: &str) -> CoordinationResult<Vec<String>>;

    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> CoordinationResult<()>;

    async fn set(&self, path: &str, data: Bytes, version: Option<i32>)
    -> CoordinationResult<Stat>;

    async fn remove(&self, path: &str, version: Option<i32>) -> CoordinationResult<()>;

    /// Applies all operations atomically: either every operation succeeds or
    /// none is visible.
    async fn multi(&self, ops: Vec<Op>) -> CoordinationResult<()>;

    /// Waits until this session observes every update to `path` committed
    /// before the call.
    async fn sync(&self, path: &str) -> CoordinationResult<()>;
}

/// Establishes sessions with one coordination service endpoint.
#[async_trait]
pub trait CoordinationConnector: Send + Sync {
    async fn connect(&self) -> CoordinationResult<Arc<dyn Coordination>>;
}

pub use config::CoordinationConfig;
pub use in_memory::{InMemoryEnsemble, InMemorySession};
pub use registry::{ConnectorRegistry, DEFAULT_ENDPOINT};
