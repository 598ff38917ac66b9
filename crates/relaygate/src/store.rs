//! Credential and proxy route storage.
//!
//! The durable store lives outside this crate; the gateway only talks to it
//! through [`CredentialStore`] and [`ProxyRouteSource`]. [`MemoryStore`] is the
//! in-process implementation seeded from the YAML config.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::routing::ProxyRoute;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One upstream API key configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub owner_id: String,
    pub label: String,
    /// Sealed secret, opened by a [`crate::rotation::SecretResolver`].
    pub sealed_secret: String,
    pub base_url: String,
    pub priority: i64,
    pub weight: i64,
    pub enabled: bool,
    pub consecutive_failures: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub successful_requests: u64,
}

impl Credential {
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        sealed_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            owner_id: owner_id.into(),
            sealed_secret: sealed_secret.into(),
            base_url: base_url.into(),
            priority: 0,
            weight: 1,
            enabled: true,
            consecutive_failures: 0,
            last_used_at: None,
            last_failure_at: None,
            total_requests: 0,
            successful_requests: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64, weight: i64) -> Self {
        self.priority = priority;
        self.weight = weight;
        self
    }
}

/// A relative update applied atomically by the store.
///
/// Counters are expressed as increments so concurrent requests on the same
/// credential never overwrite each other with stale snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialUpdate {
    RecordSuccess { at: DateTime<Utc> },
    RecordFailure { at: DateTime<Utc> },
    ResetFailures,
}

impl CredentialUpdate {
    pub fn apply(self, credential: &mut Credential) {
        match self {
            CredentialUpdate::RecordSuccess { at } => {
                credential.last_used_at = Some(at);
                credential.total_requests += 1;
                credential.successful_requests += 1;
                credential.consecutive_failures = 0;
            }
            CredentialUpdate::RecordFailure { at } => {
                credential.last_failure_at = Some(at);
                credential.total_requests += 1;
                credential.consecutive_failures += 1;
            }
            CredentialUpdate::ResetFailures => {
                credential.consecutive_failures = 0;
            }
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Enabled credentials for an owner, in store order.
    async fn list_enabled(&self, owner_id: &str) -> Result<Vec<Credential>, StoreError>;

    /// Every credential for an owner, enabled or not.
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Credential>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Credential>, StoreError>;

    async fn update(&self, id: &str, update: CredentialUpdate) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ProxyRouteSource: Send + Sync {
    /// Enabled routes for a service family, in store order.
    async fn list_enabled(&self, target_service: &str) -> Result<Vec<ProxyRoute>, StoreError>;
}

/// In-memory store. Each update runs under the write lock, which serializes
/// mutations per credential.
#[derive(Debug, Default)]
pub struct MemoryStore {
    credentials: RwLock<Vec<Credential>>,
    routes: RwLock<Vec<ProxyRoute>>,
}

impl MemoryStore {
    pub fn new(credentials: Vec<Credential>, routes: Vec<ProxyRoute>) -> Self {
        Self {
            credentials: RwLock::new(credentials),
            routes: RwLock::new(routes),
        }
    }

    pub fn shared(credentials: Vec<Credential>, routes: Vec<ProxyRoute>) -> Arc<Self> {
        Arc::new(Self::new(credentials, routes))
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn list_enabled(&self, owner_id: &str) -> Result<Vec<Credential>, StoreError> {
        let credentials = self.credentials.read().await;
        Ok(credentials
            .iter()
            .filter(|c| c.owner_id == owner_id && c.enabled)
            .cloned()
            .collect())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Credential>, StoreError> {
        let credentials = self.credentials.read().await;
        Ok(credentials
            .iter()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Credential>, StoreError> {
        let credentials = self.credentials.read().await;
        Ok(credentials.iter().find(|c| c.id == id).cloned())
    }

    async fn update(&self, id: &str, update: CredentialUpdate) -> Result<(), StoreError> {
        let mut credentials = self.credentials.write().await;
        let credential = credentials
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        update.apply(credential);
        Ok(())
    }
}

#[async_trait]
impl ProxyRouteSource for MemoryStore {
    async fn list_enabled(&self, target_service: &str) -> Result<Vec<ProxyRoute>, StoreError> {
        let routes = self.routes.read().await;
        Ok(routes
            .iter()
            .filter(|r| r.target_service == target_service && r.enabled)
            .cloned()
            .collect())
    }
}
