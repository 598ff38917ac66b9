//! Actix Web HTTP server.
//!
//! Exposes:
//! - `POST /v1/messages`
//! - `GET /v1/usage`
//! - `GET /health`

use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    auth,
    config::GatewayConfig,
    error::GatewayError,
    gateway::{Gateway, GatewayReply, RequestContext},
    rotation::{CredentialRotator, CredentialStats, EnvSecrets, SecretResolver},
    routing::ProxyRouter,
    store::MemoryStore,
    telemetry::{GatewayLog, LogEntry, LogStats},
    types::MessagesRequest,
};

const RETENTION_SWEEP: Duration = Duration::from_secs(60 * 60);
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub gateway: Arc<Gateway>,
    pub log: Arc<GatewayLog>,
}

impl AppState {
    /// Wire the in-memory store, rotator, router and request log from `config`.
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        let store = MemoryStore::shared(config.seed_credentials(), config.proxy_routes.clone());
        let secrets: Arc<dyn SecretResolver> = Arc::new(EnvSecrets);
        let log = GatewayLog::shared();

        let gateway = Gateway::new(
            CredentialRotator::new(store.clone(), secrets.clone()),
            ProxyRouter::new(store, config.restricted_upstreams.clone()),
            log.clone(),
            secrets,
            client,
        )
        .with_keep_alive(Duration::from_secs(config.keep_alive_secs));

        Ok(Self {
            config: Arc::new(config),
            gateway: Arc::new(gateway),
            log,
        })
    }
}

/// Route table, shared by [`serve`] and the integration tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .limit(MAX_BODY_BYTES)
            .error_handler(|err, _| GatewayError::InvalidRequest(err.to_string()).into()),
    )
    .route("/health", web::get().to(health_check))
    .route("/v1/messages", web::post().to(handle_messages))
    .route("/v1/usage", web::get().to(handle_usage));
}

pub async fn serve(config: GatewayConfig) -> Result<()> {
    let addr = config.bind_addr();
    let retention_days = config.log_retention_days;
    let state = AppState::from_config(config)?;

    if retention_days > 0 {
        spawn_retention(state.log.clone(), retention_days);
    }

    info!(addr = %addr, users = state.config.users.len(), "relaygate listening");
    let state = web::Data::new(state);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Cors::permissive())
            .configure(configure)
    })
    .bind(&addr)
    .with_context(|| format!("failed to bind {}", addr))?
    .run()
    .await
    .context("server error")?;

    Ok(())
}

fn spawn_retention(log: Arc<GatewayLog>, days: u32) {
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(RETENTION_SWEEP);
        loop {
            sweep.tick().await;
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
            let removed = log.purge_older_than(cutoff).await;
            if removed > 0 {
                info!(removed, days, "purged old request logs");
            }
        }
    });
}

async fn health_check() -> &'static str {
    "OK"
}

async fn handle_messages(
    state: web::Data<AppState>,
    req_http: HttpRequest,
    body: web::Json<MessagesRequest>,
) -> Result<HttpResponse, GatewayError> {
    let user = auth::authenticate(req_http.headers(), &state.config)?;
    let req = body.into_inner();
    let ctx = RequestContext::for_user(user, &req.model)?;

    debug!(
        owner_id = %ctx.owner_id,
        requested_model = %req.model,
        target_model = %ctx.target_model,
        stream = req.stream,
        "routing decision"
    );

    match state.gateway.handle(&ctx, req).await {
        Ok(GatewayReply::Buffered(out)) => Ok(HttpResponse::Ok().json(out)),
        Ok(GatewayReply::Streaming(stream)) => Ok(HttpResponse::Ok()
            .content_type("text/event-stream")
            .insert_header(("cache-control", "no-cache"))
            .insert_header(("connection", "keep-alive"))
            .insert_header(("x-accel-buffering", "no"))
            .streaming(stream)),
        Err(e) => {
            warn!(owner_id = %ctx.owner_id, error = %e, "request failed");
            Err(e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    #[serde(default = "default_recent")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_recent() -> usize {
    20
}

#[derive(Debug, Serialize)]
struct UsageReport {
    owner_id: String,
    stats: LogStats,
    credentials: Vec<CredentialStats>,
    recent: Vec<LogEntry>,
}

async fn handle_usage(
    state: web::Data<AppState>,
    req_http: HttpRequest,
    query: web::Query<UsageQuery>,
) -> Result<HttpResponse, GatewayError> {
    let user = auth::authenticate(req_http.headers(), &state.config)?;

    let report = UsageReport {
        owner_id: user.id.clone(),
        stats: state.log.owner_stats(&user.id).await,
        credentials: state.gateway.rotator().credential_stats(&user.id).await?,
        recent: state.log.owner_logs(&user.id, query.limit, query.offset).await,
    };
    Ok(HttpResponse::Ok().json(report))
}
