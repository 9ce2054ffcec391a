//! Table lifecycle: creation race, attach validation, drop and reclaim.
//!
//! All table instances sharing a root path share one metadata directory:
//!
//! ```text
//! <root>/ch_metadata/tables/<table uuid><server uuid>   one marker per live instance
//! <root>/ch_metadata/dropped                            drop in progress
//! <root>/ch_metadata/dropped/lock                       ephemeral, held by the reclaimer
//! <root>/<encoded key>                                  one data node per row
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::coordination::util::{
    EphemeralNodeHolder, RemoveMode, create_ancestors, create_if_not_exists,
    remove_children_recursive,
};
use common::{ConnectorRegistry, Coordination, CreateMode, ErrorCode, Op};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::client::ClientHolder;
use crate::config::{EngineSettings, TableConfig, TablePaths, effective_keys_limit};
use crate::error::{Error, Result};
use crate::model::Schema;
use crate::serde::METADATA_NODE;

/// Upper bound on create attempts. Racing creators and droppers can keep
/// removing each other's metadata; the bound turns a livelock into an error.
pub const MAX_CREATE_ATTEMPTS: usize = 1000;

/// Everything the catalog knows about a table when it instantiates the engine.
#[derive(Debug, Clone)]
pub struct TableDefinition {
    pub name: String,
    pub uuid: Uuid,
    pub schema: Schema,
    pub config: TableConfig,
}

impl TableDefinition {
    /// Creates a definition with a fresh table UUID.
    pub fn new(name: impl Into<String>, schema: Schema, config: TableConfig) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            schema,
            config,
        }
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    Create,
    Attach,
}

/// A KeeperMap table instance.
///
/// Cloning is cheap and yields a handle to the same instance.
#[derive(Clone)]
pub struct KeeperMapTable {
    pub(crate) inner: Arc<TableInner>,
}

pub(crate) struct TableInner {
    pub(crate) name: String,
    pub(crate) schema: Schema,
    pub(crate) paths: TablePaths,
    pub(crate) keys_limit: u64,
    pub(crate) operation_timeout: Duration,
    client: ClientHolder,
    /// `None` until the marker was checked once.
    valid: RwLock<Option<bool>>,
}

impl KeeperMapTable {
    /// Creates a new table instance, registering its marker under the root
    /// path. Creates the root path if allowed and missing, and cleans up
    /// leftovers of an interrupted drop first.
    pub async fn create(
        definition: TableDefinition,
        settings: &EngineSettings,
        registry: ConnectorRegistry,
    ) -> Result<Self> {
        Self::open(definition, settings, registry, OpenMode::Create).await
    }

    /// Attaches an existing table instance, e.g. on server startup.
    ///
    /// Missing metadata does not fail the attach; the table is marked invalid
    /// and every later operation on it is rejected.
    pub async fn attach(
        definition: TableDefinition,
        settings: &EngineSettings,
        registry: ConnectorRegistry,
    ) -> Result<Self> {
        Self::open(definition, settings, registry, OpenMode::Attach).await
    }

    async fn open(
        definition: TableDefinition,
        settings: &EngineSettings,
        registry: ConnectorRegistry,
        mode: OpenMode,
    ) -> Result<Self> {
        let TableDefinition {
            name,
            uuid,
            schema,
            config,
        } = definition;

        let prefix = settings
            .path_prefix
            .as_deref()
            .filter(|prefix| !prefix.is_empty())
            .ok_or_else(|| {
                Error::Disabled("'path_prefix' is not configured".to_string())
            })?;
        let paths = TablePaths::resolve(&config.root_path, prefix, uuid, settings.server_uuid)?;
        let keys_limit = effective_keys_limit(&name, config.keys_limit, settings.keys_limit);
        let client = ClientHolder::new(registry, paths.endpoint.clone(), paths.root.clone())?;

        let table = Self {
            inner: Arc::new(TableInner {
                name,
                schema,
                paths,
                keys_limit,
                operation_timeout: settings.coordination.operation_timeout(),
                client,
                valid: RwLock::new(None),
            }),
        };

        match mode {
            OpenMode::Attach => {
                if !table.is_table_valid().await {
                    tracing::warn!(
                        table = %table.inner.name,
                        table_path = %table.inner.paths.table,
                        "attached table has invalid metadata"
                    );
                }
            }
            OpenMode::Create => table.inner.create_metadata(&config).await?,
        }
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Full coordination path all rows are stored under.
    pub fn root_path(&self) -> &str {
        &self.inner.paths.root
    }

    /// Effective keys limit after applying the server-wide maximum; 0 means
    /// unlimited.
    pub fn keys_limit(&self) -> u64 {
        self.inner.keys_limit
    }

    /// Whether this instance's marker exists. Computed once and cached;
    /// connectivity failures are reported as invalid without being cached.
    pub async fn is_table_valid(&self) -> bool {
        self.inner.is_table_valid().await
    }

    /// Fails unless the table is valid.
    pub async fn check_table(&self) -> Result<()> {
        self.inner.check_table().await
    }

    /// Drops this table instance.
    ///
    /// Removes the instance's marker. The last instance using the root path
    /// also removes every row and the shared metadata. Concurrent drops are
    /// safe: at most one of them reclaims the metadata.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn drop_table(&self) -> Result<()> {
        let inner = &self.inner;
        inner.check_table().await?;
        let client = inner.client.get_client().await?;
        let paths = &inner.paths;

        match client.remove(&paths.table, None).await {
            Ok(()) => {}
            Err(e) if e.code == ErrorCode::NoNode => {
                *inner.valid.write().await = Some(false);
                tracing::info!(table_path = %paths.table, "table marker already removed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        *inner.valid.write().await = Some(false);

        match client.get_children(&paths.tables).await {
            Ok(children) if !children.is_empty() => {
                tracing::debug!(
                    tables_path = %paths.tables,
                    remaining = children.len(),
                    "root path still used by other tables"
                );
                return Ok(());
            }
            Ok(_) => {}
            Err(e) if e.code == ErrorCode::NoNode => {
                tracing::info!(metadata_path = %paths.metadata, "metadata is being removed by another table");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let ops = vec![
            Op::remove(paths.tables.as_str(), None),
            Op::create(paths.dropped.as_str(), Bytes::new(), CreateMode::Persistent),
            Op::create(paths.dropped_lock.as_str(), Bytes::new(), CreateMode::Ephemeral),
        ];
        match client.multi(ops).await {
            Ok(()) => {}
            Err(e) if matches!(e.code, ErrorCode::NoNode | ErrorCode::NodeExists) => {
                tracing::info!(metadata_path = %paths.metadata, "metadata is being removed by another table");
                return Ok(());
            }
            Err(e) if e.code == ErrorCode::NotEmpty => {
                tracing::warn!(
                    metadata_path = %paths.metadata,
                    "another table is using the same path, metadata will not be deleted"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let lock = EphemeralNodeHolder::existing(paths.dropped_lock.as_str(), Arc::clone(&client));
        inner.reclaim(client.as_ref(), lock).await?;
        Ok(())
    }

    /// Removes every row while keeping the table and its metadata.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn truncate(&self) -> Result<()> {
        let inner = &self.inner;
        inner.check_table().await?;
        let client = inner.client.get_client().await?;
        remove_children_recursive(
            client.as_ref(),
            &inner.paths.root,
            Some(METADATA_NODE),
            RemoveMode::TolerateMissing,
        )
        .await?;
        tracing::debug!(root_path = %inner.paths.root, "truncated table");
        Ok(())
    }
}

impl TableInner {
    pub(crate) async fn get_client(&self) -> Result<Arc<dyn Coordination>> {
        self.client.get_client().await
    }

    pub(crate) async fn is_table_valid(&self) -> bool {
        self.table_validity().await.unwrap_or(false)
    }

    pub(crate) async fn check_table(&self) -> Result<()> {
        match self.table_validity().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::InvalidTable(format!(
                "failed to activate table '{}' because of invalid metadata in the coordination service, please drop or detach the table",
                self.name
            ))),
            Err(e) => Err(e),
        }
    }

    /// Cached validity. Only connectivity errors are returned, uncached, so a
    /// later call retries after a reconnect.
    async fn table_validity(&self) -> Result<bool> {
        if let Some(valid) = *self.valid.read().await {
            return Ok(valid);
        }
        let mut valid = self.valid.write().await;
        if let Some(valid) = *valid {
            return Ok(valid);
        }

        match self.marker_exists().await {
            Ok(result) => {
                *valid = Some(result);
                Ok(result)
            }
            Err(Error::Coordination(e)) if e.is_hardware_error() => {
                tracing::warn!(table = %self.name, error = %e, "failed to check table metadata");
                Err(Error::Coordination(e))
            }
            Err(e) => {
                tracing::warn!(table = %self.name, error = %e, "failed to check table metadata");
                *valid = Some(false);
                Ok(false)
            }
        }
    }

    async fn marker_exists(&self) -> Result<bool> {
        let client = self.client.get_client().await?;
        match client.multi(vec![Op::check(self.paths.table.as_str(), None)]).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_hardware_error() => Err(e.into()),
            Err(e) => {
                tracing::debug!(table_path = %self.paths.table, error = %e, "table marker check failed");
                Ok(false)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn create_metadata(&self, config: &TableConfig) -> Result<()> {
        let client = self.client.get_client().await?;
        let paths = &self.paths;

        if paths.root != "/" && client.exists(&paths.root).await?.is_none() {
            if !config.create_missing_root_path {
                return Err(Error::BadArguments(format!(
                    "Path '{}' doesn't exist. Please create it or set 'create_missing_root_path' to true",
                    config.root_path
                )));
            }
            tracing::trace!(root_path = %paths.root, "creating root path");
            create_ancestors(client.as_ref(), &paths.root).await?;
            create_if_not_exists(client.as_ref(), &paths.root, Bytes::new()).await?;
        }

        for attempt in 0..MAX_CREATE_ATTEMPTS {
            if client.exists(&paths.dropped).await?.is_some() {
                tracing::info!(metadata_path = %paths.metadata, "removing leftover nodes");
                match client
                    .create(&paths.dropped_lock, Bytes::new(), CreateMode::Ephemeral)
                    .await
                {
                    Ok(()) => {
                        let lock = EphemeralNodeHolder::existing(
                            paths.dropped_lock.as_str(),
                            Arc::clone(&client),
                        );
                        if !self.reclaim(client.as_ref(), lock).await? {
                            continue;
                        }
                    }
                    Err(e) if matches!(e.code, ErrorCode::NoNode | ErrorCode::NodeExists) => {
                        tracing::info!(metadata_path = %paths.metadata, "someone else removed leftover nodes");
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            create_if_not_exists(client.as_ref(), &paths.metadata, Bytes::new()).await?;
            create_if_not_exists(client.as_ref(), &paths.tables, Bytes::new()).await?;

            match client
                .create(&paths.table, Bytes::new(), CreateMode::Persistent)
                .await
            {
                Ok(()) => {
                    *self.valid.write().await = Some(true);
                    tracing::debug!(table_path = %paths.table, attempt, "created table marker");
                    return Ok(());
                }
                Err(e) if e.code == ErrorCode::NoNode => {
                    tracing::info!(
                        metadata_path = %paths.metadata,
                        "metadata nodes were deleted in background, will retry"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::BadArguments(format!(
            "cannot create metadata for table, because it is removed concurrently or because of wrong root_path ({})",
            paths.root
        )))
    }

    /// Removes all rows and the shared metadata while holding the dropped
    /// lock. Returns false if someone added nodes back in the meantime.
    #[tracing::instrument(level = "trace", skip_all)]
    async fn reclaim(&self, client: &dyn Coordination, mut lock: EphemeralNodeHolder) -> Result<bool> {
        let paths = &self.paths;
        if let Err(e) =
            remove_children_recursive(client, &paths.root, Some(METADATA_NODE), RemoveMode::Strict)
                .await
        {
            release_lock(lock).await;
            return Err(e.into());
        }

        let ops = vec![
            Op::remove(lock.path(), None),
            Op::remove(paths.dropped.as_str(), None),
            Op::remove(paths.metadata.as_str(), None),
        ];
        match client.multi(ops).await {
            Ok(()) => {
                lock.set_already_removed();
                tracing::info!(metadata_path = %paths.metadata, "metadata was successfully removed");
                Ok(true)
            }
            Err(e) if e.code == ErrorCode::NoNode => {
                release_lock(lock).await;
                Err(Error::Internal(format!(
                    "race between creation and removal of metadata at {}",
                    e.path
                )))
            }
            Err(e) if e.code == ErrorCode::NotEmpty => {
                tracing::error!(metadata_path = %paths.metadata, "metadata was not completely removed");
                release_lock(lock).await;
                Ok(false)
            }
            Err(e) => {
                release_lock(lock).await;
                Err(e.into())
            }
        }
    }
}

async fn release_lock(lock: EphemeralNodeHolder) {
    let path = lock.path().to_string();
    if let Err(e) = lock.release().await {
        tracing::warn!(path = %path, error = %e, "failed to release drop lock");
    }
}
