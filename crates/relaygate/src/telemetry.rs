//! Tracing setup and per-request outcome accounting.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub json_output: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json_output: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_subscriber(config: &TelemetryConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// What happened to one gateway request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub owner_id: String,
    pub request_model: String,
    pub target_model: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub latency_ms: u64,
    pub status_code: u16,
    pub success: bool,
    pub error_message: Option<String>,
    pub credential_id: Option<String>,
    pub stream: bool,
}

/// Sink for request outcomes. Errors are logged by the caller and never fail
/// the request.
#[async_trait]
pub trait Telemetry: Send + Sync {
    async fn record(&self, outcome: RequestOutcome) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: String,
    #[serde(flatten)]
    pub outcome: RequestOutcome,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogStats {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub total_tokens: u64,
    pub average_latency_ms: f64,
}

/// In-memory request log.
#[derive(Debug, Default)]
pub struct GatewayLog {
    entries: RwLock<Vec<LogEntry>>,
}

impl GatewayLog {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn insert(&self, outcome: RequestOutcome, created_at: DateTime<Utc>) -> String {
        let id = Uuid::new_v4().to_string();
        self.entries.write().await.push(LogEntry {
            id: id.clone(),
            outcome,
            created_at,
        });
        id
    }

    /// Entries for an owner, newest first.
    pub async fn owner_logs(&self, owner_id: &str, limit: usize, offset: usize) -> Vec<LogEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .rev()
            .filter(|e| e.outcome.owner_id == owner_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Entries that used a credential, newest first.
    pub async fn credential_logs(&self, credential_id: &str, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .rev()
            .filter(|e| e.outcome.credential_id.as_deref() == Some(credential_id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn owner_stats(&self, owner_id: &str) -> LogStats {
        let entries = self.entries.read().await;
        let mut stats = LogStats::default();
        let mut latency_sum = 0u64;
        for entry in entries.iter().filter(|e| e.outcome.owner_id == owner_id) {
            stats.total_requests += 1;
            if entry.outcome.success {
                stats.successful_requests += 1;
            }
            stats.total_tokens += u64::from(entry.outcome.total_tokens.unwrap_or(0));
            latency_sum += entry.outcome.latency_ms;
        }
        stats.failed_requests = stats.total_requests - stats.successful_requests;
        if stats.total_requests > 0 {
            stats.average_latency_ms = latency_sum as f64 / stats.total_requests as f64;
        }
        stats
    }

    /// Delete entries created before `cutoff`. Returns how many were removed.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.created_at >= cutoff);
        before - entries.len()
    }
}

#[async_trait]
impl Telemetry for GatewayLog {
    async fn record(&self, outcome: RequestOutcome) -> anyhow::Result<()> {
        info!(
            owner_id = %outcome.owner_id,
            request_model = %outcome.request_model,
            target_model = %outcome.target_model,
            status = outcome.status_code,
            success = outcome.success,
            latency_ms = outcome.latency_ms,
            total_tokens = ?outcome.total_tokens,
            credential_id = ?outcome.credential_id,
            stream = outcome.stream,
            error = ?outcome.error_message,
            "request completed"
        );
        self.insert(outcome, Utc::now()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn outcome(owner: &str, success: bool, tokens: Option<u32>, latency_ms: u64) -> RequestOutcome {
        RequestOutcome {
            owner_id: owner.to_string(),
            request_model: "claude-3-5-haiku".to_string(),
            target_model: "gpt-4o-mini".to_string(),
            input_tokens: None,
            output_tokens: None,
            total_tokens: tokens,
            latency_ms,
            status_code: if success { 200 } else { 500 },
            success,
            error_message: (!success).then(|| "boom".to_string()),
            credential_id: Some("key-1".to_string()),
            stream: false,
        }
    }

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.json_output);
    }

    #[tokio::test]
    async fn stats_aggregate_per_owner() {
        let log = GatewayLog::default();
        log.record(outcome("alice", true, Some(10), 100)).await.unwrap();
        log.record(outcome("alice", false, None, 300)).await.unwrap();
        log.record(outcome("bob", true, Some(99), 5)).await.unwrap();

        let stats = log.owner_stats("alice").await;
        assert_eq!(
            stats,
            LogStats {
                total_requests: 2,
                successful_requests: 1,
                failed_requests: 1,
                total_tokens: 10,
                average_latency_ms: 200.0,
            }
        );
        assert_eq!(log.owner_stats("carol").await, LogStats::default());
    }

    #[tokio::test]
    async fn logs_are_newest_first_with_paging() {
        let log = GatewayLog::default();
        for latency in [1, 2, 3] {
            log.record(outcome("alice", true, None, latency)).await.unwrap();
        }

        let page: Vec<_> = log
            .owner_logs("alice", 2, 1)
            .await
            .into_iter()
            .map(|e| e.outcome.latency_ms)
            .collect();
        assert_eq!(page, vec![2, 1]);
        assert_eq!(log.credential_logs("key-1", 10).await.len(), 3);
        assert!(log.credential_logs("key-2", 10).await.is_empty());
    }

    #[tokio::test]
    async fn purge_removes_only_entries_older_than_cutoff() {
        let log = GatewayLog::default();
        let now = Utc::now();
        log.insert(outcome("alice", true, None, 1), now - Duration::days(40)).await;
        log.insert(outcome("alice", true, None, 2), now - Duration::days(31)).await;
        log.insert(outcome("alice", true, None, 3), now - Duration::days(2)).await;

        let removed = log.purge_older_than(now - Duration::days(30)).await;
        assert_eq!(removed, 2);
        let left: Vec<_> = log
            .owner_logs("alice", 10, 0)
            .await
            .into_iter()
            .map(|e| e.outcome.latency_ms)
            .collect();
        assert_eq!(left, vec![3]);
    }
}
