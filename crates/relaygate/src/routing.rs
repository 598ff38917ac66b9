//! Upstream proxy routing.
//!
//! Some upstream families are unreachable from certain regions. When a
//! credential's base URL belongs to one of those families, the request origin
//! is swapped for a configured proxy while the path and query stay intact.

use std::sync::Arc;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::ProxyRouteSource;

/// Rewrite strategy of a proxy route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum ProxyKind {
    /// Cloudflare Workers relay.
    Cloudflare,
    /// GitHub-hosted relay.
    Github,
    /// Passthrough.
    None,
}

impl ProxyKind {
    /// Parse a kind tag. Unrecognized tags degrade to [`ProxyKind::None`].
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "cloudflare" => Self::Cloudflare,
            "github" => Self::Github,
            "none" | "" => Self::None,
            other => {
                warn!(kind = other, "unknown proxy kind, routing as passthrough");
                Self::None
            }
        }
    }

    fn swaps_origin(self) -> bool {
        match self {
            Self::Cloudflare | Self::Github => true,
            Self::None => false,
        }
    }
}

impl From<String> for ProxyKind {
    fn from(tag: String) -> Self {
        Self::parse(&tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRoute {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub target_service: String,
    pub proxy_url: String,
    pub kind: ProxyKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i64,
}

fn default_true() -> bool {
    true
}

/// Host patterns identifying a regionally restricted upstream family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictedUpstream {
    pub service: String,
    pub host_patterns: Vec<String>,
}

impl RestrictedUpstream {
    pub fn defaults() -> Vec<Self> {
        vec![Self {
            service: "gemini".to_string(),
            host_patterns: vec!["generativelanguage.googleapis.com".to_string()],
        }]
    }

    fn matches(&self, base_url: &str) -> bool {
        self.host_patterns.iter().any(|p| base_url.contains(p.as_str()))
    }
}

/// Result of routing one upstream URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedUrl {
    pub url: String,
    pub route_id: Option<String>,
}

pub struct ProxyRouter {
    routes: Arc<dyn ProxyRouteSource>,
    restricted: Vec<RestrictedUpstream>,
}

impl ProxyRouter {
    pub fn new(routes: Arc<dyn ProxyRouteSource>, restricted: Vec<RestrictedUpstream>) -> Self {
        Self { routes, restricted }
    }

    /// Service family of a restricted base URL, if any.
    pub fn restricted_service(&self, base_url: &str) -> Option<&str> {
        self.restricted
            .iter()
            .find(|r| r.matches(base_url))
            .map(|r| r.service.as_str())
    }

    pub fn needs_routing(&self, base_url: &str) -> bool {
        self.restricted_service(base_url).is_some()
    }

    /// Highest-priority enabled route for a service; the first listed wins ties.
    pub async fn select_route(&self, target_service: &str) -> Option<ProxyRoute> {
        let routes = match self.routes.list_enabled(target_service).await {
            Ok(routes) => routes,
            Err(e) => {
                warn!(error = %e, target_service, "failed to load proxy routes");
                return None;
            }
        };

        let mut best: Option<ProxyRoute> = None;
        for route in routes.into_iter().filter(|r| r.enabled) {
            if best.as_ref().map_or(true, |b| route.priority > b.priority) {
                best = Some(route);
            }
        }
        best
    }

    /// Apply the route selected for `url`'s service family, if any.
    pub async fn route(&self, url: &str) -> RoutedUrl {
        let passthrough = RoutedUrl {
            url: url.to_string(),
            route_id: None,
        };
        let Some(service) = self.restricted_service(url) else {
            return passthrough;
        };
        let Some(route) = self.select_route(service).await else {
            debug!(service, "restricted upstream without an enabled proxy route");
            return passthrough;
        };

        let rewritten = rewrite(url, Some(&route));
        debug!(route = %route.id, from = url, to = %rewritten, "proxy route applied");
        RoutedUrl {
            url: rewritten,
            route_id: Some(route.id),
        }
    }
}

/// Replace the origin of `original_url` with the route's origin.
///
/// Returns the input unchanged when there is no route, the kind is
/// passthrough, or either URL fails to parse.
pub fn rewrite(original_url: &str, route: Option<&ProxyRoute>) -> String {
    let Some(route) = route else {
        return original_url.to_string();
    };
    if !route.kind.swaps_origin() {
        return original_url.to_string();
    }

    let (original, proxy) = match (Url::parse(original_url), Url::parse(&route.proxy_url)) {
        (Ok(original), Ok(proxy)) => (original, proxy),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, route = %route.id, "unparseable URL, skipping proxy rewrite");
            return original_url.to_string();
        }
    };

    let origin = proxy.origin();
    if !origin.is_tuple() {
        warn!(route = %route.id, proxy_url = %route.proxy_url, "proxy URL has no origin");
        return original_url.to_string();
    }

    let mut out = origin.ascii_serialization();
    out.push_str(original.path());
    if let Some(query) = original.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const GEMINI: &str =
        "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions";

    fn route(id: &str, kind: ProxyKind, priority: i64, enabled: bool) -> ProxyRoute {
        ProxyRoute {
            id: id.to_string(),
            name: id.to_string(),
            target_service: "gemini".to_string(),
            proxy_url: format!("https://{id}.example.dev/ignored/path"),
            kind,
            enabled,
            priority,
        }
    }

    fn router(routes: Vec<ProxyRoute>) -> ProxyRouter {
        ProxyRouter::new(
            MemoryStore::shared(Vec::new(), routes),
            RestrictedUpstream::defaults(),
        )
    }

    #[test]
    fn rewrite_swaps_origin_and_keeps_path_and_query() {
        let r = route("cf", ProxyKind::Cloudflare, 1, true);
        let out = rewrite(
            "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions?alt=sse",
            Some(&r),
        );
        assert_eq!(
            out,
            "https://cf.example.dev/v1beta/openai/chat/completions?alt=sse"
        );
    }

    #[test]
    fn rewrite_keeps_explicit_proxy_port() {
        let mut r = route("gh", ProxyKind::Github, 1, true);
        r.proxy_url = "http://127.0.0.1:8443".to_string();
        assert_eq!(
            rewrite(GEMINI, Some(&r)),
            "http://127.0.0.1:8443/v1beta/openai/chat/completions"
        );
    }

    #[test]
    fn passthrough_cases_return_input() {
        assert_eq!(rewrite(GEMINI, None), GEMINI);
        let none = route("none", ProxyKind::None, 1, true);
        assert_eq!(rewrite(GEMINI, Some(&none)), GEMINI);
        let cf = route("cf", ProxyKind::Cloudflare, 1, true);
        assert_eq!(rewrite("not a url", Some(&cf)), "not a url");
    }

    #[test]
    fn unknown_kind_parses_as_passthrough() {
        assert_eq!(ProxyKind::parse("Cloudflare"), ProxyKind::Cloudflare);
        assert_eq!(ProxyKind::parse("custom"), ProxyKind::None);
        let kind: ProxyKind = serde_json::from_str("\"socks5\"").unwrap();
        assert_eq!(kind, ProxyKind::None);
    }

    #[test]
    fn needs_routing_matches_known_hosts_only() {
        let router = router(Vec::new());
        assert!(router.needs_routing(GEMINI));
        assert!(!router.needs_routing("https://api.openai.com/v1/chat/completions"));
    }

    #[tokio::test]
    async fn select_route_prefers_priority_then_first_seen() {
        let router = router(vec![
            route("low", ProxyKind::Github, 90, true),
            route("first", ProxyKind::Cloudflare, 100, true),
            route("second", ProxyKind::Cloudflare, 100, true),
            route("off", ProxyKind::Cloudflare, 500, false),
        ]);
        assert_eq!(router.select_route("gemini").await.unwrap().id, "first");
        assert!(router.select_route("openai").await.is_none());
    }

    #[tokio::test]
    async fn route_only_rewrites_restricted_upstreams() {
        let router = router(vec![route("cf", ProxyKind::Cloudflare, 1, true)]);

        let routed = router.route(GEMINI).await;
        assert_eq!(routed.route_id.as_deref(), Some("cf"));
        assert!(routed.url.starts_with("https://cf.example.dev/v1beta/"));

        let open = "https://api.openai.com/v1/chat/completions";
        assert_eq!(
            router.route(open).await,
            RoutedUrl {
                url: open.to_string(),
                route_id: None
            }
        );
    }
}
