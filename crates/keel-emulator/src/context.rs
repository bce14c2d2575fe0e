//! Caller-owned handle to the local clients
//!
//! Clients are built on first use and shared afterwards. A program that
//! never touches a local topic never needs a Pub/Sub emulator endpoint.

use std::sync::Arc;

use keel_common::config::{EmulatorEndpoints, StackConfig};
use tokio::sync::OnceCell;

use crate::error::{EmulatorError, EmulatorResult};
use crate::pubsub::{EmulatorPubSub, PubSubAdmin};
use crate::sql::{LocalSqlServer, SqlAdmin};

/// Lazily initialised local clients
pub struct LocalContext {
    endpoints: EmulatorEndpoints,
    pubsub: OnceCell<Arc<dyn PubSubAdmin>>,
    sql: OnceCell<Arc<dyn SqlAdmin>>,
}

impl LocalContext {
    /// Context reading endpoints from the given configuration
    pub fn new(endpoints: EmulatorEndpoints) -> Self {
        Self {
            endpoints,
            pubsub: OnceCell::new(),
            sql: OnceCell::new(),
        }
    }

    /// Context for a stack's emulator endpoints
    pub fn from_config(config: &StackConfig) -> Self {
        Self::new(config.emulators.clone())
    }

    /// Context with pre-built clients
    pub fn with_clients(pubsub: Arc<dyn PubSubAdmin>, sql: Arc<dyn SqlAdmin>) -> Self {
        Self {
            endpoints: EmulatorEndpoints::default(),
            pubsub: OnceCell::new_with(Some(pubsub)),
            sql: OnceCell::new_with(Some(sql)),
        }
    }

    /// Pub/Sub emulator client, built on first call
    pub async fn pubsub(&self) -> EmulatorResult<Arc<dyn PubSubAdmin>> {
        let client = self
            .pubsub
            .get_or_try_init(|| async {
                let url = self
                    .endpoints
                    .pubsub
                    .as_deref()
                    .ok_or_else(|| EmulatorError::NotConfigured("pubsub".to_string()))?;
                let client: Arc<dyn PubSubAdmin> = Arc::new(EmulatorPubSub::new(url)?);
                Ok::<_, EmulatorError>(client)
            })
            .await?;
        Ok(client.clone())
    }

    /// Local SQL server client, built on first call
    pub async fn sql(&self) -> EmulatorResult<Arc<dyn SqlAdmin>> {
        let client = self
            .sql
            .get_or_init(|| async {
                Arc::new(LocalSqlServer::new(
                    self.endpoints.postgres.clone(),
                    self.endpoints.mysql.clone(),
                )) as Arc<dyn SqlAdmin>
            })
            .await;
        Ok(client.clone())
    }
}

impl std::fmt::Debug for LocalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalContext")
            .field("endpoints", &self.endpoints)
            .field("pubsub_ready", &self.pubsub.initialized())
            .field("sql_ready", &self.sql.initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_pubsub_endpoint_is_reported_on_use() {
        let ctx = LocalContext::new(EmulatorEndpoints::default());
        let err = ctx.pubsub().await.err().unwrap();
        assert!(matches!(err, EmulatorError::NotConfigured(ref s) if s == "pubsub"));
    }

    #[tokio::test]
    async fn clients_are_built_once() {
        let ctx = LocalContext::new(EmulatorEndpoints {
            pubsub: Some("http://localhost:8085".to_string()),
            ..Default::default()
        });
        let a = ctx.pubsub().await.unwrap();
        let b = ctx.pubsub().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let s1 = ctx.sql().await.unwrap();
        let s2 = ctx.sql().await.unwrap();
        assert!(Arc::ptr_eq(&s1, &s2));
    }
}
