pub mod coordination;

pub use coordination::config::CoordinationConfig;
pub use coordination::{
    ConnectorRegistry, Coordination, CoordinationConnector, CoordinationError,
    CoordinationResult, CreateMode, ErrorCode, InMemoryEnsemble, InMemorySession, Op, Stat,
};
