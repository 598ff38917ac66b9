//! Caller authentication against the configured gateway users.

use actix_web::http::header::HeaderMap;

use crate::config::{GatewayConfig, UserConfig};
use crate::error::GatewayError;

/// Gateway key from `x-api-key`, `anthropic-api-key`, or a bearer token.
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header("x-api-key")
        .or_else(|| header("anthropic-api-key"))
        .or_else(|| header("authorization").and_then(|v| v.strip_prefix("Bearer ")))
}

pub fn authenticate<'a>(
    headers: &HeaderMap,
    config: &'a GatewayConfig,
) -> Result<&'a UserConfig, GatewayError> {
    let key = extract_api_key(headers)
        .ok_or_else(|| GatewayError::Authentication("Missing API key.".to_string()))?;
    config
        .find_user_by_key(key)
        .ok_or_else(|| GatewayError::Authentication("Invalid API key".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        map
    }

    fn config() -> GatewayConfig {
        GatewayConfig::from_yaml_str(
            r#"
users:
  - id: alice
    api_key: ak-alice
"#,
        )
        .unwrap()
    }

    #[test]
    fn key_sources_in_precedence_order() {
        assert_eq!(
            extract_api_key(&headers(&[("x-api-key", "a"), ("authorization", "Bearer b")])),
            Some("a")
        );
        assert_eq!(
            extract_api_key(&headers(&[("anthropic-api-key", "c")])),
            Some("c")
        );
        assert_eq!(
            extract_api_key(&headers(&[("authorization", "Bearer d")])),
            Some("d")
        );
        assert_eq!(extract_api_key(&headers(&[("authorization", "Basic e")])), None);
    }

    #[test]
    fn authenticate_distinguishes_missing_and_invalid() {
        let config = config();
        let user = authenticate(&headers(&[("x-api-key", "ak-alice")]), &config).unwrap();
        assert_eq!(user.id, "alice");

        let missing = authenticate(&headers(&[]), &config).unwrap_err();
        assert_eq!(missing.to_string(), "Missing API key.");
        let invalid = authenticate(&headers(&[("x-api-key", "ak-eve")]), &config).unwrap_err();
        assert_eq!(invalid.to_string(), "Invalid API key");
    }
}
