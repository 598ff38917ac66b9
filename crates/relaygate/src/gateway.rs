//! Per-request orchestration.
//!
//! One inbound request runs: credential selection, proxy routing, the upstream
//! call, then either buffered translation or the streaming relay. Every
//! request that reached an upstream ends with exactly one credential record
//! and one telemetry record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{FallbackCredential, UserConfig};
use crate::error::GatewayError;
use crate::rotation::{CredentialRotator, SecretResolver};
use crate::routing::ProxyRouter;
use crate::streaming::{SseLine, SseLineDecoder, StreamConverter};
use crate::telemetry::{RequestOutcome, Telemetry};
use crate::translation;
use crate::types::{BlockDelta, ErrorDetail, MessagesRequest, MessagesResponse, StreamEvent, Usage};

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(3);

const MIN_KEEP_ALIVE: Duration = Duration::from_millis(10);

/// Status reported for streams the client abandoned.
const CLIENT_CLOSED_STATUS: u16 = 499;

/// Anthropic SSE frames, ready to be written to the client.
pub type SseStream = BoxStream<'static, Result<Bytes, GatewayError>>;

pub enum GatewayReply {
    Buffered(MessagesResponse),
    Streaming(SseStream),
}

impl std::fmt::Debug for GatewayReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayReply::Buffered(response) => f.debug_tuple("Buffered").field(response).finish(),
            GatewayReply::Streaming(_) => f.debug_tuple("Streaming").finish_non_exhaustive(),
        }
    }
}

/// Who is calling and which upstream model they resolved to.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub owner_id: String,
    pub target_model: String,
    pub fallback: Option<FallbackCredential>,
}

impl RequestContext {
    pub fn for_user(user: &UserConfig, requested_model: &str) -> Result<Self, GatewayError> {
        let target_model = user
            .resolve_model(requested_model)
            .ok_or_else(|| GatewayError::ModelNotMapped(requested_model.to_string()))?;
        Ok(Self {
            owner_id: user.id.clone(),
            target_model: target_model.to_string(),
            fallback: user.fallback.clone(),
        })
    }
}

struct Upstream {
    api_key: String,
    base_url: String,
    credential_id: Option<String>,
}

/// Accounting data carried from dispatch to the terminal record.
#[derive(Debug, Clone)]
struct Attempt {
    owner_id: String,
    request_model: String,
    target_model: String,
    credential_id: Option<String>,
    stream: bool,
    input_chars: usize,
    started: Instant,
}

impl Attempt {
    fn outcome(
        &self,
        status_code: u16,
        error_message: Option<String>,
        usage: Option<(u32, u32, u32)>,
    ) -> RequestOutcome {
        RequestOutcome {
            owner_id: self.owner_id.clone(),
            request_model: self.request_model.clone(),
            target_model: self.target_model.clone(),
            input_tokens: usage.map(|u| u.0),
            output_tokens: usage.map(|u| u.1),
            total_tokens: usage.map(|u| u.2),
            latency_ms: self.started.elapsed().as_millis() as u64,
            status_code,
            success: error_message.is_none(),
            error_message,
            credential_id: self.credential_id.clone(),
            stream: self.stream,
        }
    }
}

pub fn chat_completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

pub struct Gateway {
    rotator: CredentialRotator,
    router: ProxyRouter,
    telemetry: Arc<dyn Telemetry>,
    secrets: Arc<dyn SecretResolver>,
    client: reqwest::Client,
    keep_alive: Duration,
}

impl Gateway {
    pub fn new(
        rotator: CredentialRotator,
        router: ProxyRouter,
        telemetry: Arc<dyn Telemetry>,
        secrets: Arc<dyn SecretResolver>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            rotator,
            router,
            telemetry,
            secrets,
            client,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn rotator(&self) -> &CredentialRotator {
        &self.rotator
    }

    pub async fn handle(
        self: &Arc<Self>,
        ctx: &RequestContext,
        req: MessagesRequest,
    ) -> Result<GatewayReply, GatewayError> {
        let started = Instant::now();
        let body = translation::to_upstream_request(&req, &ctx.target_model)?;
        let upstream = self.resolve_upstream(ctx).await?;
        let routed = self
            .router
            .route(&chat_completions_url(&upstream.base_url))
            .await;

        let attempt = Attempt {
            owner_id: ctx.owner_id.clone(),
            request_model: req.model.clone(),
            target_model: ctx.target_model.clone(),
            credential_id: upstream.credential_id,
            stream: req.stream,
            input_chars: req.input_chars(),
            started,
        };
        debug!(
            owner_id = %attempt.owner_id,
            url = %routed.url,
            route = ?routed.route_id,
            credential_id = ?attempt.credential_id,
            stream = attempt.stream,
            "dispatching upstream request"
        );

        let response = match self
            .client
            .post(&routed.url)
            .bearer_auth(&upstream.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, url = %routed.url, "upstream request failed");
                return Err(self.settle_failure(&attempt, GatewayError::from_transport(&e)).await);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, body = %text, "upstream returned an error");
            let err = GatewayError::upstream(
                status.as_u16(),
                format!(
                    "Upstream API request failed: {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or_default()
                ),
            );
            return Err(self.settle_failure(&attempt, err).await);
        }

        if req.stream {
            return Ok(GatewayReply::Streaming(self.relay(response, attempt)));
        }

        let value: Value = match response.json().await {
            Ok(value) => value,
            Err(e) => {
                let err =
                    GatewayError::upstream(502, format!("failed to decode upstream body: {e}"));
                return Err(self.settle_failure(&attempt, err).await);
            }
        };
        let translated = match translation::from_upstream_response(&value, &req.model) {
            Ok(translated) => translated,
            Err(e) => return Err(self.settle_failure(&attempt, e).await),
        };
        self.settle_success(&attempt, translation::upstream_usage(&value))
            .await;
        Ok(GatewayReply::Buffered(translated))
    }

    async fn resolve_upstream(&self, ctx: &RequestContext) -> Result<Upstream, GatewayError> {
        if let Some(selected) = self.rotator.select(&ctx.owner_id).await? {
            info!(
                owner_id = %ctx.owner_id,
                credential_id = %selected.credential.id,
                label = %selected.credential.label,
                "using rotation credential"
            );
            return Ok(Upstream {
                api_key: selected.api_key,
                base_url: selected.credential.base_url,
                credential_id: Some(selected.credential.id),
            });
        }

        let fallback = ctx
            .fallback
            .as_ref()
            .ok_or_else(|| GatewayError::NoCredentialAvailable(ctx.owner_id.clone()))?;
        info!(owner_id = %ctx.owner_id, "using fallback credential");
        Ok(Upstream {
            api_key: self.secrets.reveal(&fallback.api_key)?,
            base_url: fallback.base_url.clone(),
            credential_id: None,
        })
    }

    async fn report(&self, outcome: RequestOutcome) {
        if let Err(e) = self.telemetry.record(outcome).await {
            warn!(error = %e, "failed to record request outcome");
        }
    }

    async fn settle_success(&self, attempt: &Attempt, usage: Option<(u32, u32, u32)>) {
        if let Some(id) = &attempt.credential_id {
            if let Err(e) = self.rotator.record_success(id).await {
                warn!(error = %e, credential_id = %id, "failed to record credential success");
            }
        }
        self.report(attempt.outcome(200, None, usage)).await;
    }

    async fn settle_failure(&self, attempt: &Attempt, err: GatewayError) -> GatewayError {
        if let Some(id) = &attempt.credential_id {
            if let Err(e) = self.rotator.record_failure(id).await {
                warn!(error = %e, credential_id = %id, "failed to record credential failure");
            }
        }
        let status = err.upstream_status().unwrap_or(500);
        self.report(attempt.outcome(status, Some(err.to_string()), None))
            .await;
        err
    }

    /// Pipe the upstream body through a [`StreamConverter`], interleaving
    /// keep-alive pings.
    ///
    /// Dropping the returned stream (client disconnect) drops the ticker and
    /// the upstream body with it.
    fn relay(self: &Arc<Self>, response: reqwest::Response, attempt: Attempt) -> SseStream {
        let period = self.keep_alive.max(MIN_KEEP_ALIVE);
        let mut converter = StreamConverter::new(attempt.request_model.clone());
        let mut settlement = Settlement {
            gateway: Arc::clone(self),
            attempt: Some(attempt),
        };

        let stream = async_stream::stream! {
            let mut upstream = Box::pin(response.bytes_stream());
            let mut decoder = SseLineDecoder::new();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut output_chars = 0usize;
            let mut failure: Option<GatewayError> = None;

            for event in converter.initial_events() {
                yield Ok::<Bytes, GatewayError>(frame(&event));
            }

            'read: loop {
                let step = tokio::select! {
                    chunk = upstream.next() => Step::Chunk(chunk),
                    _ = ticker.tick() => Step::Ping,
                };

                let lines = match step {
                    Step::Ping => {
                        yield Ok(frame(&StreamEvent::Ping));
                        continue;
                    }
                    Step::Chunk(Some(Ok(bytes))) => decoder.push(&bytes),
                    Step::Chunk(Some(Err(e))) => {
                        warn!(error = %e, "upstream stream broke");
                        failure = Some(GatewayError::from_transport(&e));
                        break 'read;
                    }
                    Step::Chunk(None) => {
                        if let Some(SseLine::Data(data)) = decoder.finish() {
                            for event in converter.process_data(&data) {
                                output_chars += text_len(&event);
                                yield Ok(frame(&event));
                            }
                        }
                        break 'read;
                    }
                };

                for line in lines {
                    let data = match line {
                        SseLine::Done => break 'read,
                        SseLine::Data(data) => data,
                    };
                    for event in converter.process_data(&data) {
                        output_chars += text_len(&event);
                        yield Ok(frame(&event));
                    }
                }
            }

            match failure {
                None => {
                    for event in converter.finish_events() {
                        yield Ok(frame(&event));
                    }
                    let usage = converter.usage();
                    info!(
                        message_id = converter.message_id(),
                        input_chars = settlement.input_chars(),
                        output_chars,
                        tokens = usage.total(),
                        "stream finished"
                    );
                    settlement.success(usage).await;
                }
                Some(err) => {
                    yield Ok(frame(&StreamEvent::Error {
                        error: ErrorDetail {
                            kind: err.kind().to_string(),
                            message: err.to_string(),
                        },
                    }));
                    settlement.failure(err).await;
                }
            }
        };

        stream.boxed()
    }
}

enum Step {
    Chunk(Option<Result<Bytes, reqwest::Error>>),
    Ping,
}

fn frame(event: &StreamEvent) -> Bytes {
    Bytes::from(event.to_sse())
}

fn text_len(event: &StreamEvent) -> usize {
    match event {
        StreamEvent::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text },
            ..
        } => text.chars().count(),
        _ => 0,
    }
}

/// Terminal accounting for one stream.
///
/// If the stream is dropped before settling, the request is reported as
/// cancelled. Credential health is left untouched in that case.
struct Settlement {
    gateway: Arc<Gateway>,
    attempt: Option<Attempt>,
}

impl Settlement {
    fn input_chars(&self) -> usize {
        self.attempt.as_ref().map_or(0, |a| a.input_chars)
    }

    async fn success(&mut self, usage: Usage) {
        if let Some(attempt) = self.attempt.take() {
            let counts = (usage.input_tokens, usage.output_tokens, usage.total());
            self.gateway.settle_success(&attempt, Some(counts)).await;
        }
    }

    async fn failure(&mut self, err: GatewayError) {
        if let Some(attempt) = self.attempt.take() {
            self.gateway.settle_failure(&attempt, err).await;
        }
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        info!(owner_id = %attempt.owner_id, "stream cancelled by client");
        let outcome = attempt.outcome(
            CLIENT_CLOSED_STATUS,
            Some("client cancelled".to_string()),
            None,
        );
        let gateway = Arc::clone(&self.gateway);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { gateway.report(outcome).await });
            }
            Err(_) => debug!("no runtime available to record cancelled stream"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_url_joins_without_double_slash() {
        assert_eq!(
            chat_completions_url("https://api.example.com/v1/"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("https://api.example.com/v1"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn context_requires_a_model_mapping() {
        let user: UserConfig = serde_yaml_ng::from_str(
            "id: alice\napi_key: ak\nmodels:\n  sonnet: gpt-4.1\n",
        )
        .unwrap();

        let ctx = RequestContext::for_user(&user, "claude-sonnet-4-5").unwrap();
        assert_eq!(ctx.target_model, "gpt-4.1");
        assert_eq!(ctx.owner_id, "alice");

        let err = RequestContext::for_user(&user, "claude-3-opus").unwrap_err();
        assert_eq!(err.to_string(), "No model mapping found for: claude-3-opus.");
    }
}
