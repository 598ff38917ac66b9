use std::fs;

use actix_web::{test, web, App};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relaygate::server::{configure, AppState};
use relaygate::GatewayConfig;

fn config_for(upstream: &str) -> GatewayConfig {
    GatewayConfig::from_yaml_str(&format!(
        r#"
keep_alive_secs: 30
users:
  - id: alice
    api_key: ak-alice
    models:
      haiku: gpt-4o-mini
credentials:
  - id: k1
    owner: alice
    api_key: sk-one
    base_url: {upstream}/v1
"#
    ))
    .unwrap()
}

async fn mock_upstream() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-9",
            "choices": [{
                "index": 0,
                "finish_reason": "length",
                "message": {"role": "assistant", "content": "truncated"}
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 8, "total_tokens": 13}
        })))
        .mount(&server)
        .await;
    server
}

fn messages_body(model: &str) -> Value {
    json!({
        "model": model,
        "max_tokens": 8,
        "messages": [{"role": "user", "content": "hi"}]
    })
}

#[actix_web::test]
async fn test_health() {
    let state = AppState::from_config(GatewayConfig::default()).unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(configure),
    )
    .await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert!(resp.status().is_success());
    assert_eq!(test::read_body(resp).await, web::Bytes::from_static(b"OK"));
}

#[actix_web::test]
async fn test_messages_require_a_known_key() {
    let state = AppState::from_config(config_for("http://127.0.0.1:9")).unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(configure),
    )
    .await;

    let missing = test::TestRequest::post()
        .uri("/v1/messages")
        .set_json(messages_body("claude-3-5-haiku"))
        .to_request();
    let resp = test::call_service(&app, missing).await;
    assert_eq!(resp.status(), 401);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "authentication_error");
    assert_eq!(body["error"]["message"], "Missing API key.");

    let unmapped = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "ak-alice"))
        .set_json(messages_body("claude-opus-4"))
        .to_request();
    let resp = test::call_service(&app, unmapped).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["message"], "No model mapping found for: claude-opus-4.");
}

#[actix_web::test]
async fn test_malformed_body_is_an_anthropic_error() {
    let state = AppState::from_config(config_for("http://127.0.0.1:9")).unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "ak-alice"))
        .set_json(json!({"model": "claude-3-5-haiku"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[actix_web::test]
async fn test_buffered_round_trip_and_usage_report() {
    let upstream = mock_upstream().await;
    let state = AppState::from_config(config_for(&upstream.uri())).unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("authorization", "Bearer ak-alice"))
        .set_json(messages_body("claude-3-5-haiku-latest"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["type"], "message");
    assert_eq!(body["model"], "claude-3-5-haiku-latest");
    assert_eq!(body["stop_reason"], "max_tokens");
    assert_eq!(body["content"][0]["text"], "truncated");
    assert_eq!(body["usage"]["output_tokens"], 8);

    let usage = test::TestRequest::get()
        .uri("/v1/usage?limit=5")
        .insert_header(("x-api-key", "ak-alice"))
        .to_request();
    let report: Value = test::call_and_read_body_json(&app, usage).await;
    assert_eq!(report["owner_id"], "alice");
    assert_eq!(report["stats"]["total_requests"], 1);
    assert_eq!(report["stats"]["total_tokens"], 13);
    assert_eq!(report["credentials"][0]["id"], "k1");
    assert_eq!(report["credentials"][0]["successful_requests"], 1);
    assert_eq!(report["recent"][0]["target_model"], "gpt-4o-mini");
}

#[actix_web::test]
async fn test_streaming_response_headers() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(concat!(
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ok\"}}]}\n\n",
                    "data: {\"choices\":[{\"index\":0,\"delta\":{},",
                    "\"finish_reason\":\"stop\"}]}\n\n",
                    "data: [DONE]\n\n",
                )),
        )
        .mount(&upstream)
        .await;

    let state = AppState::from_config(config_for(&upstream.uri())).unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(configure),
    )
    .await;

    let mut body = messages_body("claude-3-5-haiku");
    body["stream"] = json!(true);
    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "ak-alice"))
        .set_json(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");

    let text = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
    assert!(text.starts_with("event: message_start\n"));
    assert!(text.contains("event: content_block_delta\n"));
    assert!(text.trim_end().ends_with(r#"data: {"type":"message_stop"}"#));
}

#[::core::prelude::v1::test]
fn test_config_file_loading() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("relaygate.yml");
    fs::write(
        &config_path,
        r#"
port: 9400
log_retention_days: 0
telemetry:
  level: debug
  json_output: true
users:
  - id: bob
    api_key: ak-bob
"#,
    )
    .unwrap();

    let config = GatewayConfig::from_yaml_file(&config_path).unwrap();
    assert_eq!(config.port, 9400);
    assert_eq!(config.log_retention_days, 0);
    assert_eq!(config.telemetry.level, "debug");
    assert!(config.telemetry.json_output);
    assert_eq!(config.find_user_by_key("ak-bob").unwrap().id, "bob");

    assert!(GatewayConfig::from_yaml_file(dir.path().join("missing.yml")).is_err());
}
