//! Selection of coordination endpoints by logical name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Coordination, CoordinationConnector, CoordinationError, CoordinationResult, ErrorCode};

/// Name of the primary coordination endpoint.
pub const DEFAULT_ENDPOINT: &str = "default";

/// Maps endpoint names to connectors.
///
/// Every registry has a `default` endpoint; auxiliary endpoints are looked up
/// by the name given in a table's root path (`name:/path`).
#[derive(Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn CoordinationConnector>>,
}

impl ConnectorRegistry {
    /// Creates a registry whose `default` endpoint is `connector`.
    pub fn new(connector: Arc<dyn CoordinationConnector>) -> Self {
        let mut connectors = HashMap::new();
        connectors.insert(DEFAULT_ENDPOINT.to_string(), connector);
        Self { connectors }
    }

    /// Registers an auxiliary endpoint.
    pub fn with_auxiliary(
        mut self,
        name: impl Into<String>,
        connector: Arc<dyn CoordinationConnector>,
    ) -> Self {
        self.connectors.insert(name.into(), connector);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connectors.contains_key(name)
    }

    /// Opens a new session against the endpoint registered under `name`.
    pub async fn connect_to(&self, name: &str) -> CoordinationResult<Arc<dyn Coordination>> {
        let connector = self.connectors.get(name).ok_or_else(|| {
            CoordinationError::new(
                ErrorCode::BadArguments,
                format!("unknown coordination endpoint '{}'", name),
            )
        })?;
        connector.connect().await
    }
}

#[async_trait]
impl CoordinationConnector for ConnectorRegistry {
    /// Connects to the default endpoint.
    async fn connect(&self) -> CoordinationResult<Arc<dyn Coordination>> {
        self.connect_to(DEFAULT_ENDPOINT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryEnsemble;

    #[tokio::test]
    async fn should_connect_to_default_endpoint() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let registry = ConnectorRegistry::new(Arc::new(ensemble.clone()));

        // when
        let session = registry.connect_to(DEFAULT_ENDPOINT).await.unwrap();

        // then
        assert!(!session.is_expired());
        assert!(session.exists("/").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn should_route_auxiliary_endpoint_to_its_own_tree() {
        // given
        let primary = InMemoryEnsemble::new();
        let auxiliary = InMemoryEnsemble::new();
        let registry = ConnectorRegistry::new(Arc::new(primary.clone()))
            .with_auxiliary("aux", Arc::new(auxiliary.clone()));

        // when
        let session = registry.connect_to("aux").await.unwrap();
        session
            .create("/only-aux", bytes::Bytes::new(), Default::default())
            .await
            .unwrap();

        // then
        let primary_session = registry.connect_to(DEFAULT_ENDPOINT).await.unwrap();
        assert!(primary_session.exists("/only-aux").await.unwrap().is_none());
        assert!(session.exists("/only-aux").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn should_reject_unknown_endpoint() {
        // given
        let registry = ConnectorRegistry::new(Arc::new(InMemoryEnsemble::new()));

        // when
        let result = registry.connect_to("missing").await;

        // then
        assert_eq!(result.err().unwrap().code, ErrorCode::BadArguments);
    }
}
