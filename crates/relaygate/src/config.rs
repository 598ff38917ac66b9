//! Configuration from environment variables and a YAML file.
//!
//! ```yaml
//! port: 8787
//! users:
//!   - id: alice
//!     api_key: ak-alice
//!     models:
//!       haiku: gpt-4o-mini
//!       sonnet: gpt-4.1
//!     fallback:
//!       api_key: env:OPENAI_API_KEY
//! credentials:
//!   - id: openai-main
//!     owner: alice
//!     api_key: env:OPENAI_KEY_1
//!     base_url: https://api.openai.com/v1
//!     priority: 10
//! proxy_routes:
//!   - id: cf-gemini
//!     target_service: gemini
//!     proxy_url: https://gemini.example.workers.dev
//!     kind: cloudflare
//!     priority: 100
//! ```
//!
//! **Environment variables:**
//! - `HOST`: bind address (default: 0.0.0.0)
//! - `PORT`: server port (default: 8787)
//! - `REQUEST_TIMEOUT_SECS`: upstream request timeout (default: 120)
//! - `KEEP_ALIVE_SECS`: ping interval on streams (default: 3)
//! - `LOG_RETENTION_DAYS`: request log retention, 0 disables purging (default: 30)

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::routing::{ProxyRoute, RestrictedUpstream};
use crate::store::Credential;
use crate::telemetry::TelemetryConfig;

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub keep_alive_secs: u64,
    pub log_retention_days: u32,
    pub telemetry: TelemetryConfig,
    pub users: Vec<UserConfig>,
    pub credentials: Vec<CredentialConfig>,
    pub proxy_routes: Vec<ProxyRoute>,
    pub restricted_upstreams: Vec<RestrictedUpstream>,
}

/// A gateway caller and its model map.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub id: String,
    pub api_key: String,
    /// Keyword (matched as a substring of the requested model) to upstream model.
    #[serde(default)]
    pub models: BTreeMap<String, String>,
    /// Static credential used when the owner has no enabled rotation credential.
    #[serde(default)]
    pub fallback: Option<FallbackCredential>,
}

impl UserConfig {
    /// Resolve the upstream model for a requested model name. Exact map keys
    /// win over keyword matches.
    pub fn resolve_model(&self, requested: &str) -> Option<&str> {
        if let Some(target) = self.models.get(requested) {
            return Some(target);
        }
        self.models
            .iter()
            .find(|(keyword, _)| requested.contains(keyword.as_str()))
            .map(|(_, target)| target.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackCredential {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    pub id: String,
    pub owner: String,
    #[serde(default)]
    pub label: Option<String>,
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl CredentialConfig {
    pub fn into_credential(self) -> Credential {
        let mut credential = Credential::new(self.id, self.owner, self.api_key, self.base_url)
            .with_priority(self.priority, self.weight);
        if let Some(label) = self.label {
            credential.label = label;
        }
        credential.enabled = self.enabled;
        credential
    }
}

fn default_base_url() -> String {
    DEFAULT_UPSTREAM_BASE_URL.to_string()
}

fn default_weight() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct GatewayYamlConfig {
    host: Option<String>,
    port: Option<u16>,
    request_timeout_secs: Option<u64>,
    keep_alive_secs: Option<u64>,
    log_retention_days: Option<u32>,
    #[serde(default)]
    telemetry: Option<TelemetryConfig>,
    #[serde(default)]
    users: Vec<UserConfig>,
    #[serde(default)]
    credentials: Vec<CredentialConfig>,
    #[serde(default)]
    proxy_routes: Vec<ProxyRoute>,
    #[serde(default)]
    restricted_upstreams: Option<Vec<RestrictedUpstream>>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT").unwrap_or(8787),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS").unwrap_or(120),
            keep_alive_secs: env_parse("KEEP_ALIVE_SECS").unwrap_or(3),
            log_retention_days: env_parse("LOG_RETENTION_DAYS").unwrap_or(30),
            telemetry: TelemetryConfig::default(),
            users: Vec::new(),
            credentials: Vec::new(),
            proxy_routes: Vec::new(),
            restricted_upstreams: RestrictedUpstream::defaults(),
        }
    }
}

impl GatewayConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let yaml: GatewayYamlConfig =
            serde_yaml_ng::from_str(content).context("Failed to parse gateway config")?;
        let defaults = Self::default();

        Ok(Self {
            host: yaml.host.unwrap_or(defaults.host),
            port: yaml.port.unwrap_or(defaults.port),
            request_timeout_secs: yaml
                .request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
            keep_alive_secs: yaml.keep_alive_secs.unwrap_or(defaults.keep_alive_secs),
            log_retention_days: yaml
                .log_retention_days
                .unwrap_or(defaults.log_retention_days),
            telemetry: yaml.telemetry.unwrap_or(defaults.telemetry),
            users: yaml.users,
            credentials: yaml.credentials,
            proxy_routes: yaml.proxy_routes,
            restricted_upstreams: yaml
                .restricted_upstreams
                .unwrap_or(defaults.restricted_upstreams),
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read gateway config from {:?}", path))?;
        Self::from_yaml_str(&content)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn find_user_by_key(&self, api_key: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.api_key == api_key)
    }

    pub fn seed_credentials(&self) -> Vec<Credential> {
        self.credentials
            .iter()
            .cloned()
            .map(CredentialConfig::into_credential)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::ProxyKind;

    const SAMPLE: &str = r#"
port: 9100
keep_alive_secs: 5
users:
  - id: alice
    api_key: ak-alice
    models:
      haiku: gpt-4o-mini
      claude-3-opus-latest: o3
    fallback:
      api_key: sk-fallback
credentials:
  - id: k1
    owner: alice
    api_key: env:K1
    priority: 5
  - id: k2
    owner: alice
    label: backup
    api_key: sk-2
    base_url: https://generativelanguage.googleapis.com/v1beta/openai
    enabled: false
proxy_routes:
  - id: cf
    target_service: gemini
    proxy_url: https://relay.example.workers.dev
    kind: cloudflare
    priority: 100
  - id: odd
    target_service: gemini
    proxy_url: https://odd.example.dev
    kind: socks5
"#;

    #[test]
    fn yaml_overrides_defaults() {
        let config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.keep_alive_secs, 5);
        assert_eq!(config.request_timeout_secs, 120);
        assert_eq!(config.restricted_upstreams, RestrictedUpstream::defaults());

        let user = config.find_user_by_key("ak-alice").unwrap();
        assert_eq!(user.id, "alice");
        assert_eq!(
            user.fallback.as_ref().unwrap().base_url,
            DEFAULT_UPSTREAM_BASE_URL
        );
        assert!(config.find_user_by_key("ak-nobody").is_none());

        assert_eq!(config.proxy_routes[0].kind, ProxyKind::Cloudflare);
        assert_eq!(config.proxy_routes[1].kind, ProxyKind::None);
        assert!(config.proxy_routes[1].enabled);
    }

    #[test]
    fn credentials_seed_with_defaults() {
        let config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        let seeded = config.seed_credentials();

        assert_eq!(seeded[0].label, "k1");
        assert_eq!(seeded[0].priority, 5);
        assert_eq!(seeded[0].weight, 1);
        assert_eq!(seeded[0].base_url, DEFAULT_UPSTREAM_BASE_URL);
        assert_eq!(seeded[0].sealed_secret, "env:K1");
        assert_eq!(seeded[1].label, "backup");
        assert!(!seeded[1].enabled);
        assert_eq!(seeded[1].total_requests, 0);
    }

    #[test]
    fn model_resolution_prefers_exact_then_keyword() {
        let config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        let user = &config.users[0];

        assert_eq!(user.resolve_model("claude-3-opus-latest"), Some("o3"));
        assert_eq!(user.resolve_model("claude-3-5-haiku-20241022"), Some("gpt-4o-mini"));
        assert_eq!(user.resolve_model("claude-sonnet-4"), None);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        assert!(GatewayConfig::from_yaml_str("port: [not a number").is_err());
    }
}
