//! Configuration for KeeperMap tables.
//!
//! Two levels of configuration exist: [`EngineSettings`] are set once by the
//! operator for the whole server, [`TableConfig`] comes from a table's engine
//! arguments.

use common::CoordinationConfig;
use common::coordination::DEFAULT_ENDPOINT;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::serde::METADATA_NODE;

/// Default number of rows fetched per batch by a read slice.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 65_409;

/// Server-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Namespace every root path is placed under. The engine refuses to
    /// create tables while this is unset.
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Upper bound for any table's keys limit; 0 means no bound.
    #[serde(default)]
    pub keys_limit: u64,
    /// Identifies this server among all servers sharing the coordination
    /// service.
    #[serde(default = "Uuid::new_v4")]
    pub server_uuid: Uuid,
    #[serde(default)]
    pub coordination: CoordinationConfig,
}

impl EngineSettings {
    pub fn with_path_prefix(path_prefix: impl Into<String>) -> Self {
        Self {
            path_prefix: Some(path_prefix.into()),
            ..Self::default()
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            path_prefix: None,
            keys_limit: 0,
            server_uuid: Uuid::new_v4(),
            coordination: CoordinationConfig::default(),
        }
    }
}

/// A literal engine argument as produced by the DDL layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineArg {
    String(String),
    UInt64(u64),
}

/// Per-table configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Path of the table's data, optionally prefixed with an endpoint name
    /// (`aux:/path`).
    pub root_path: String,
    /// Create the root path when it does not exist instead of failing.
    #[serde(default = "default_create_missing_root_path")]
    pub create_missing_root_path: bool,
    /// Maximum number of keys; 0 means unlimited.
    #[serde(default)]
    pub keys_limit: u64,
}

fn default_create_missing_root_path() -> bool {
    true
}

const ENGINE_USAGE: &str = "KeeperMap requires 1-3 arguments:\n\
    root_path: path in the Keeper where the values will be stored (required)\n\
    create_missing_root_path: 1 if the root path should be created if it's missing, otherwise throw exception (default: 1)\n\
    keys_limit: number of keys allowed to be stored, 0 is no limit (default: 0)";

impl TableConfig {
    pub fn new(root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            create_missing_root_path: default_create_missing_root_path(),
            keys_limit: 0,
        }
    }

    pub fn with_keys_limit(mut self, keys_limit: u64) -> Self {
        self.keys_limit = keys_limit;
        self
    }

    pub fn with_create_missing_root_path(mut self, create: bool) -> Self {
        self.create_missing_root_path = create;
        self
    }

    /// Parses `(root_path[, create_missing_root_path[, keys_limit]])`.
    pub fn from_engine_args(args: &[EngineArg]) -> Result<Self> {
        if args.is_empty() || args.len() > 3 {
            return Err(Error::NumberOfArgumentsDoesntMatch(ENGINE_USAGE.to_string()));
        }
        let root_path = match &args[0] {
            EngineArg::String(s) => s.clone(),
            other => {
                return Err(Error::BadArguments(format!(
                    "root_path must be a string, got {:?}",
                    other
                )));
            }
        };
        let mut config = Self::new(root_path);
        if let Some(arg) = args.get(1) {
            config.create_missing_root_path = uint_arg(arg, "create_missing_root_path")? != 0;
        }
        if let Some(arg) = args.get(2) {
            config.keys_limit = uint_arg(arg, "keys_limit")?;
        }
        Ok(config)
    }
}

fn uint_arg(arg: &EngineArg, name: &str) -> Result<u64> {
    match arg {
        EngineArg::UInt64(v) => Ok(*v),
        other => Err(Error::BadArguments(format!(
            "{} must be an unsigned integer, got {:?}",
            name, other
        ))),
    }
}

/// Options for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Maximum number of keys fetched per batch.
    pub max_block_size: usize,
    /// Requested number of parallel slices.
    pub num_streams: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            num_streams: 1,
        }
    }
}

/// Splits `aux:/path` into the endpoint name and the path. Paths starting with
/// `/` belong to the default endpoint.
pub(crate) fn split_endpoint(root_path: &str) -> Result<(String, String)> {
    if root_path.is_empty() || root_path.starts_with('/') {
        return Ok((DEFAULT_ENDPOINT.to_string(), root_path.to_string()));
    }
    match root_path.split_once(':') {
        Some((name, path)) if !name.is_empty() => Ok((name.to_string(), path.to_string())),
        _ => Ok((DEFAULT_ENDPOINT.to_string(), root_path.to_string())),
    }
}

/// Every node path a table instance uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TablePaths {
    pub endpoint: String,
    pub root: String,
    pub metadata: String,
    pub tables: String,
    pub table: String,
    pub dropped: String,
    pub dropped_lock: String,
}

impl TablePaths {
    /// Resolves the paths of one table instance.
    ///
    /// The marker name combines the table and server UUIDs so that no two
    /// instances collide, even for the same logical table.
    pub(crate) fn resolve(
        root_path: &str,
        path_prefix: &str,
        table_uuid: Uuid,
        server_uuid: Uuid,
    ) -> Result<Self> {
        let (endpoint, path) = split_endpoint(root_path)?;
        let path = trim_trailing_slash(&path);
        if path.is_empty() {
            return Err(Error::BadArguments("root_path should not be empty".to_string()));
        }
        if !path.starts_with('/') {
            return Err(Error::BadArguments("root_path should start with '/'".to_string()));
        }

        let prefix = trim_trailing_slash(path_prefix);
        let root = trim_trailing_slash(&format!("{}/{}", prefix, &path[1..])).to_string();
        let root = if root.is_empty() { "/".to_string() } else { root };

        let metadata = join(&root, METADATA_NODE);
        let tables = join(&metadata, "tables");
        let table = join(&tables, &format!("{}{}", table_uuid, server_uuid));
        let dropped = join(&metadata, "dropped");
        let dropped_lock = join(&dropped, "lock");
        Ok(Self {
            endpoint,
            root,
            metadata,
            tables,
            table,
            dropped,
            dropped_lock,
        })
    }

    /// Full path of the data node for an encoded key.
    pub(crate) fn key_path(&self, encoded_key: &str) -> String {
        join(&self.root, encoded_key)
    }
}

fn join(parent: &str, child: &str) -> String {
    common::coordination::util::join_path(parent, child)
}

fn trim_trailing_slash(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

/// Caps a table's keys limit by the server-wide maximum.
pub(crate) fn effective_keys_limit(table_name: &str, requested: u64, server_max: u64) -> u64 {
    if server_max != 0 && requested > server_max {
        tracing::warn!(
            table = table_name,
            requested,
            server_max,
            "keys limit defined by argument is larger than the server-wide keys limit, using the server-wide value"
        );
        return server_max;
    }
    if requested > 0 {
        tracing::info!(table = table_name, keys_limit = requested, "keys limit set");
    }
    requested
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ids() -> (Uuid, Uuid) {
        (Uuid::nil(), Uuid::from_u128(1))
    }

    #[test]
    fn should_resolve_paths_under_prefix() {
        // given
        let (table, server) = ids();

        // when
        let paths = TablePaths::resolve("/my/table", "/keeper_map", table, server).unwrap();

        // then
        assert_eq!(paths.endpoint, "default");
        assert_eq!(paths.root, "/keeper_map/my/table");
        assert_eq!(paths.metadata, "/keeper_map/my/table/ch_metadata");
        assert_eq!(paths.tables, "/keeper_map/my/table/ch_metadata/tables");
        assert_eq!(
            paths.table,
            format!("/keeper_map/my/table/ch_metadata/tables/{}{}", table, server)
        );
        assert_eq!(paths.dropped, "/keeper_map/my/table/ch_metadata/dropped");
        assert_eq!(
            paths.dropped_lock,
            "/keeper_map/my/table/ch_metadata/dropped/lock"
        );
        assert_eq!(paths.key_path("abc"), "/keeper_map/my/table/abc");
    }

    #[rstest]
    #[case("/t/", "/prefix/", "/prefix/t")]
    #[case("/", "/prefix", "/prefix")]
    #[case("/t", "/", "/t")]
    #[case("aux:/t", "/prefix", "/prefix/t")]
    fn should_normalize_root_path(
        #[case] root_path: &str,
        #[case] prefix: &str,
        #[case] expected: &str,
    ) {
        let (table, server) = ids();
        let paths = TablePaths::resolve(root_path, prefix, table, server).unwrap();
        assert_eq!(paths.root, expected);
    }

    #[rstest]
    #[case("")]
    #[case("relative/path")]
    #[case("aux:relative")]
    fn should_reject_invalid_root_path(#[case] root_path: &str) {
        let (table, server) = ids();
        let result = TablePaths::resolve(root_path, "/prefix", table, server);
        assert!(matches!(result, Err(Error::BadArguments(_))));
    }

    #[test]
    fn should_split_endpoint_name() {
        assert_eq!(
            split_endpoint("aux1:/path").unwrap(),
            ("aux1".to_string(), "/path".to_string())
        );
        assert_eq!(
            split_endpoint("/path").unwrap(),
            ("default".to_string(), "/path".to_string())
        );
    }

    #[test]
    fn should_parse_engine_args_with_defaults() {
        // when
        let config =
            TableConfig::from_engine_args(&[EngineArg::String("/t".to_string())]).unwrap();

        // then
        assert_eq!(config, TableConfig::new("/t"));
        assert!(config.create_missing_root_path);
        assert_eq!(config.keys_limit, 0);
    }

    #[test]
    fn should_parse_all_engine_args() {
        // when
        let config = TableConfig::from_engine_args(&[
            EngineArg::String("/t".to_string()),
            EngineArg::UInt64(0),
            EngineArg::UInt64(10),
        ])
        .unwrap();

        // then
        assert!(!config.create_missing_root_path);
        assert_eq!(config.keys_limit, 10);
    }

    #[rstest]
    #[case(vec![])]
    #[case(vec![
        EngineArg::String("/t".to_string()),
        EngineArg::UInt64(1),
        EngineArg::UInt64(1),
        EngineArg::UInt64(1),
    ])]
    fn should_reject_wrong_argument_count(#[case] args: Vec<EngineArg>) {
        let result = TableConfig::from_engine_args(&args);
        assert!(matches!(result, Err(Error::NumberOfArgumentsDoesntMatch(_))));
    }

    #[test]
    fn should_reject_wrong_argument_type() {
        // when
        let result = TableConfig::from_engine_args(&[
            EngineArg::String("/t".to_string()),
            EngineArg::String("yes".to_string()),
        ]);

        // then
        assert!(matches!(result, Err(Error::BadArguments(_))));
    }

    #[rstest]
    #[case(5, 0, 5)]
    #[case(5, 3, 3)]
    #[case(2, 3, 2)]
    #[case(0, 3, 0)]
    fn should_cap_keys_limit_by_server_maximum(
        #[case] requested: u64,
        #[case] server_max: u64,
        #[case] expected: u64,
    ) {
        assert_eq!(effective_keys_limit("t", requested, server_max), expected);
    }

    #[test]
    fn should_deserialize_engine_settings_with_defaults() {
        // given
        let json = r#"{"path_prefix": "/keeper_map"}"#;

        // when
        let settings: EngineSettings = serde_json::from_str(json).unwrap();

        // then
        assert_eq!(settings.path_prefix.as_deref(), Some("/keeper_map"));
        assert_eq!(settings.keys_limit, 0);
        assert_eq!(settings.coordination, CoordinationConfig::default());
    }
}
