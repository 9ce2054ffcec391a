//! Lazily (re)established coordination session for one table.

use std::sync::Arc;

use common::{ConnectorRegistry, Coordination};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Hands out a live session, replacing it once the previous one expired.
///
/// The lock covers acquisition only; requests on the returned session may be
/// issued concurrently.
pub(crate) struct ClientHolder {
    registry: ConnectorRegistry,
    endpoint: String,
    root_path: String,
    current: Mutex<Option<Arc<dyn Coordination>>>,
}

impl ClientHolder {
    pub(crate) fn new(
        registry: ConnectorRegistry,
        endpoint: impl Into<String>,
        root_path: impl Into<String>,
    ) -> Result<Self> {
        let endpoint = endpoint.into();
        if !registry.contains(&endpoint) {
            return Err(Error::BadArguments(format!(
                "unknown coordination endpoint '{}'",
                endpoint
            )));
        }
        Ok(Self {
            registry,
            endpoint,
            root_path: root_path.into(),
            current: Mutex::new(None),
        })
    }

    /// Returns the cached session, or connects a new one and syncs it against
    /// the root path so reads observe at least the latest committed state.
    pub(crate) async fn get_client(&self) -> Result<Arc<dyn Coordination>> {
        let mut current = self.current.lock().await;
        if let Some(client) = current.as_ref() {
            if !client.is_expired() {
                return Ok(Arc::clone(client));
            }
            tracing::info!(
                endpoint = %self.endpoint,
                session_id = client.session_id(),
                "coordination session expired, reconnecting"
            );
        }

        *current = None;
        let client = self.registry.connect_to(&self.endpoint).await?;
        client.sync(&self.root_path).await?;
        tracing::debug!(
            endpoint = %self.endpoint,
            session_id = client.session_id(),
            root_path = %self.root_path,
            "established coordination session"
        );
        *current = Some(Arc::clone(&client));
        Ok(client)
    }
}
