//! Credential rotation and failover.
//!
//! Selection order for an owner:
//! 1. enabled and healthy (`consecutive_failures < UNHEALTHY_THRESHOLD`)
//! 2. highest `priority`, then `weight`
//! 3. least recently used, never-used first
//!
//! When every enabled credential is unhealthy the owner's failure counters are
//! reset once and selection runs again.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::store::{Credential, CredentialStore, CredentialUpdate};

/// Consecutive failures at which a credential stops being selected.
pub const UNHEALTHY_THRESHOLD: u32 = 5;

/// Reset passes allowed per selection when no credential is healthy.
const MAX_RESET_PASSES: usize = 1;

/// Opens sealed credential secrets.
pub trait SecretResolver: Send + Sync {
    fn reveal(&self, sealed: &str) -> Result<String, GatewayError>;
}

/// Resolves `env:NAME` references from the process environment and passes
/// any other value through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecrets;

impl SecretResolver for EnvSecrets {
    fn reveal(&self, sealed: &str) -> Result<String, GatewayError> {
        match sealed.strip_prefix("env:") {
            Some(var) => std::env::var(var).map_err(|_| {
                GatewayError::Secret(format!("environment variable {var} is not set"))
            }),
            None => Ok(sealed.to_string()),
        }
    }
}

/// A selected credential with its opened secret.
#[derive(Clone)]
pub struct SelectedCredential {
    pub credential: Credential,
    pub api_key: String,
}

impl std::fmt::Debug for SelectedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedCredential")
            .field("credential", &self.credential.id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialStats {
    pub id: String,
    pub label: String,
    pub enabled: bool,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Percentage of requests that failed.
    pub failure_rate: f64,
}

pub fn is_healthy(credential: &Credential) -> bool {
    credential.enabled && credential.consecutive_failures < UNHEALTHY_THRESHOLD
}

/// Pick the best credential out of `candidates`, ignoring health.
fn pick(candidates: &mut [Credential]) -> Option<&Credential> {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.weight.cmp(&a.weight)));
    let top = candidates.first()?.priority;
    // `None < Some(_)`, so never-used credentials win; `min_by_key` keeps the
    // first of equal keys.
    candidates
        .iter()
        .take_while(|c| c.priority == top)
        .min_by_key(|c| c.last_used_at)
}

pub struct CredentialRotator {
    store: Arc<dyn CredentialStore>,
    secrets: Arc<dyn SecretResolver>,
}

impl CredentialRotator {
    pub fn new(store: Arc<dyn CredentialStore>, secrets: Arc<dyn SecretResolver>) -> Self {
        Self { store, secrets }
    }

    pub async fn select(&self, owner_id: &str) -> Result<Option<SelectedCredential>, GatewayError> {
        let mut resets = 0;
        loop {
            let enabled = self.store.list_enabled(owner_id).await?;
            if enabled.is_empty() {
                return Ok(None);
            }

            let mut healthy: Vec<Credential> = enabled.into_iter().filter(is_healthy).collect();
            if let Some(chosen) = pick(&mut healthy) {
                debug!(
                    owner_id,
                    credential_id = %chosen.id,
                    label = %chosen.label,
                    "selected credential"
                );
                let api_key = self.secrets.reveal(&chosen.sealed_secret)?;
                return Ok(Some(SelectedCredential {
                    credential: chosen.clone(),
                    api_key,
                }));
            }

            if resets >= MAX_RESET_PASSES {
                warn!(owner_id, "no healthy credential after failure reset");
                return Ok(None);
            }
            resets += 1;
            info!(owner_id, "all credentials unhealthy, resetting failure counts");
            self.reset_failures(owner_id).await?;
        }
    }

    pub async fn record_success(&self, credential_id: &str) -> Result<(), GatewayError> {
        self.store
            .update(credential_id, CredentialUpdate::RecordSuccess { at: Utc::now() })
            .await?;
        Ok(())
    }

    pub async fn record_failure(&self, credential_id: &str) -> Result<(), GatewayError> {
        self.store
            .update(credential_id, CredentialUpdate::RecordFailure { at: Utc::now() })
            .await?;
        Ok(())
    }

    /// Clear failure counters on every credential of an owner.
    pub async fn reset_failures(&self, owner_id: &str) -> Result<(), GatewayError> {
        for credential in self.store.list_by_owner(owner_id).await? {
            self.store
                .update(&credential.id, CredentialUpdate::ResetFailures)
                .await?;
        }
        Ok(())
    }

    pub async fn credential_stats(
        &self,
        owner_id: &str,
    ) -> Result<Vec<CredentialStats>, GatewayError> {
        let credentials = self.store.list_by_owner(owner_id).await?;
        Ok(credentials
            .into_iter()
            .map(|c| {
                let failure_rate = if c.total_requests > 0 {
                    let failed = c.total_requests.saturating_sub(c.successful_requests);
                    failed as f64 / c.total_requests as f64 * 100.0
                } else {
                    0.0
                };
                CredentialStats {
                    healthy: is_healthy(&c),
                    id: c.id,
                    label: c.label,
                    enabled: c.enabled,
                    consecutive_failures: c.consecutive_failures,
                    total_requests: c.total_requests,
                    successful_requests: c.successful_requests,
                    failure_rate,
                }
            })
            .collect())
    }
}
