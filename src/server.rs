//! HTTP surface: the completions endpoint plus health and routing stats.
//!
//! One handler serves both inbound dialects; the detected protocol decides
//! both the parse path and the response shape. Streaming responses are
//! written as SSE with the dialect's own framing. Dropping the client
//! connection drops the upstream stream as well, and no degradation fallback
//! runs for a caller that already hung up.

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::conversation::ConversationMetrics;
use crate::detector::detect_format;
use crate::errors::GatewayError;
use crate::models::{
    CanonicalResponse, CanonicalStreamChunk, ClientProtocol, IncomingRequest,
};
use crate::processor::{ProcessedRequest, RequestProcessor};
use crate::providers::ProviderAdapter;
use crate::resilience::{with_retry, ServiceLevel};
use crate::transform::{transform_error, transform_response, StreamRenderer};
use crate::util::{correlation_id, AppState};

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/health", web::get().to(health))
            .route("/routing/stats", web::get().to(routing_stats))
            .route("/v1/completions", web::post().to(completions)),
    );
}

async fn completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> HttpResponse {
    let started = Instant::now();
    let headers = req.headers().iter().filter_map(|(name, value)| {
        value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
    });
    let incoming = IncomingRequest::new(headers, body.into_inner(), req.path());
    let correlation_id = correlation_id(incoming.header("x-correlation-id"));

    // Detected up front so even parse failures answer in the caller's dialect.
    let protocol = detect_format(&incoming);

    let processor = RequestProcessor::new(state.routing.as_ref(), state.conversations.as_ref());
    let processed = match processor.process(&incoming, &correlation_id) {
        Ok(p) => p,
        Err(err) => {
            warn!(%correlation_id, error = %err, "request rejected before provider call");
            return error_http(protocol, &err);
        }
    };

    if processed.canonical.wants_stream() {
        stream_completions(state, processed).await
    } else {
        unary_completions(state, processed, started).await
    }
}

fn adapter_for(state: &AppState, processed: &ProcessedRequest) -> Arc<dyn ProviderAdapter> {
    match processed.routing.provider {
        crate::routing::Provider::Responses => state.responses.clone(),
        crate::routing::Provider::Converse => state.converse.clone(),
    }
}

async fn unary_completions(
    state: web::Data<AppState>,
    processed: ProcessedRequest,
    started: Instant,
) -> HttpResponse {
    let adapter = adapter_for(&state, &processed);
    let key = format!("{}:create_response", adapter.name());
    let breaker = state.circuits.get(&key);

    let result = with_retry(&state.retry_policy, &breaker, &key, || {
        adapter.create_response(&processed.canonical)
    })
    .await;

    state.degradation.auto_adjust(state.circuits.unhealthy_ratio());

    match result {
        Ok(response) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            state.degradation.record_success(&processed.canonical, &response);
            state.conversations.track_conversation(
                &processed.conversation_id,
                &response.id,
                Some(ConversationMetrics {
                    tokens_used: response.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0),
                    response_time_ms: latency_ms,
                    had_error: false,
                    task_complexity: Some(processed.estimated_complexity.score),
                }),
            );
            info!(
                correlation_id = %processed.correlation_id,
                conversation_id = %processed.conversation_id,
                format = %processed.request_format.as_str(),
                provider = %processed.routing.provider.as_str(),
                model = %processed.routing.backend_model,
                latency_ms,
                tokens = response.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0),
                "request completed"
            );
            HttpResponse::Ok().json(transform_response(processed.response_format, &response))
        }
        Err(err) if should_degrade(&err) => {
            state.conversations.update_conversation_metrics(
                &processed.conversation_id,
                ConversationMetrics {
                    had_error: true,
                    response_time_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                },
            );
            match state.degradation.handle_failure(&processed.canonical, &err) {
                Ok(degraded) => {
                    info!(
                        correlation_id = %processed.correlation_id,
                        provider = %processed.routing.provider.as_str(),
                        fallback = degraded.fallback_used,
                        "request served via fallback"
                    );
                    HttpResponse::Ok()
                        .insert_header(("x-fallback-used", degraded.fallback_used))
                        .json(transform_response(processed.response_format, &degraded.response))
                }
                Err(final_err) => error_http(processed.response_format, &final_err),
            }
        }
        Err(err) => error_http(processed.response_format, &err),
    }
}

async fn stream_completions(
    state: web::Data<AppState>,
    processed: ProcessedRequest,
) -> HttpResponse {
    let adapter = adapter_for(&state, &processed);
    let key = format!("{}:create_response_stream", adapter.name());
    let breaker = state.circuits.get(&key);

    let result = with_retry(&state.retry_policy, &breaker, &key, || {
        adapter.create_response_stream(&processed.canonical)
    })
    .await;

    state.degradation.auto_adjust(state.circuits.unhealthy_ratio());

    let mut chunks = match result {
        Ok(chunks) => chunks,
        Err(err) if should_degrade(&err) => {
            return match state.degradation.handle_failure(&processed.canonical, &err) {
                Ok(degraded) => {
                    let body = degraded_sse_body(processed.response_format, &degraded.response);
                    HttpResponse::Ok()
                        .insert_header(("content-type", "text/event-stream"))
                        .insert_header(("cache-control", "no-cache"))
                        .insert_header(("x-fallback-used", degraded.fallback_used))
                        .body(body)
                }
                Err(final_err) => error_http(processed.response_format, &final_err),
            };
        }
        Err(err) => return error_http(processed.response_format, &err),
    };

    let mut renderer = StreamRenderer::new(processed.response_format);
    let conversations = state.conversations.clone();
    let conversation_id = processed.conversation_id.clone();
    let complexity = processed.estimated_complexity.score;
    let correlation = processed.correlation_id.clone();
    let started = Instant::now();

    // Pull-based: the client paces consumption, and dropping this stream
    // drops the upstream connection with it.
    let body = async_stream::stream! {
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    if chunk.is_final() {
                        conversations.track_conversation(
                            &conversation_id,
                            &chunk.id,
                            Some(ConversationMetrics {
                                tokens_used: chunk
                                    .usage
                                    .as_ref()
                                    .map(|u| u.total_tokens)
                                    .unwrap_or(0),
                                response_time_ms: started.elapsed().as_millis() as u64,
                                had_error: false,
                                task_complexity: Some(complexity),
                            }),
                        );
                    }
                    for frame in renderer.render(&chunk) {
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(frame.to_wire()));
                    }
                }
                Err(err) => {
                    warn!(correlation_id = %correlation, error = %err, "stream aborted mid-flight");
                    break;
                }
            }
        }
        for frame in renderer.finish() {
            yield Ok(Bytes::from(frame.to_wire()));
        }
    };

    HttpResponse::Ok()
        .insert_header(("content-type", "text/event-stream"))
        .insert_header(("cache-control", "no-cache"))
        .streaming(body)
}

/// Degradation runs only for failures that exhausted the retry path or hit
/// an open circuit; validation and provider 4xx answers propagate as-is.
fn should_degrade(err: &GatewayError) -> bool {
    err.is_retryable() || matches!(err, GatewayError::CircuitOpen { .. })
}

/// Render a degraded unary response as a complete SSE body so streaming
/// callers still receive well-formed frames.
fn degraded_sse_body(protocol: ClientProtocol, response: &CanonicalResponse) -> String {
    let mut renderer = StreamRenderer::new(protocol);
    let content = CanonicalStreamChunk {
        id: response.id.clone(),
        created: response.created,
        model: response.model.clone(),
        output: response.output.clone(),
        usage: None,
    };
    let terminal = CanonicalStreamChunk {
        id: response.id.clone(),
        created: response.created,
        model: response.model.clone(),
        output: vec![],
        usage: Some(response.usage.clone().unwrap_or_default()),
    };

    let mut body = String::new();
    for frame in renderer.render(&content) {
        body.push_str(&frame.to_wire());
    }
    for frame in renderer.render(&terminal) {
        body.push_str(&frame.to_wire());
    }
    for frame in renderer.finish() {
        body.push_str(&frame.to_wire());
    }
    body
}

fn error_http(protocol: ClientProtocol, err: &GatewayError) -> HttpResponse {
    let status = actix_web::http::StatusCode::from_u16(err.http_status())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = HttpResponse::build(status);
    if let Some(after) = err.retry_after() {
        builder.insert_header(("retry-after", after.as_secs().max(1).to_string()));
    }
    builder.json(transform_error(protocol, err))
}

async fn health(state: web::Data<AppState>) -> impl Responder {
    let level = state.degradation.level();
    let ratio = state.circuits.unhealthy_ratio();
    web::Json(json!({
        "status": health_status(level, ratio),
        "service_level": level,
        "circuit_unhealthy_ratio": ratio,
        "circuits": state.circuits.snapshot(),
        "active_conversations": state.conversations.len(),
    }))
}

fn health_status(level: ServiceLevel, unhealthy_ratio: f64) -> &'static str {
    if level == ServiceLevel::Minimal || unhealthy_ratio >= 0.8 {
        "unhealthy"
    } else if level == ServiceLevel::Degraded || unhealthy_ratio > 0.0 {
        "degraded"
    } else {
        "healthy"
    }
}

async fn routing_stats(state: web::Data<AppState>) -> impl Responder {
    web::Json(state.routing.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalUsage, OutputItem};

    #[test]
    fn health_status_mapping() {
        assert_eq!(health_status(ServiceLevel::Full, 0.0), "healthy");
        assert_eq!(health_status(ServiceLevel::Full, 0.25), "degraded");
        assert_eq!(health_status(ServiceLevel::Degraded, 0.0), "degraded");
        assert_eq!(health_status(ServiceLevel::Minimal, 0.0), "unhealthy");
        assert_eq!(health_status(ServiceLevel::Full, 0.9), "unhealthy");
    }

    #[test]
    fn degrade_gate_matches_error_class() {
        assert!(should_degrade(&GatewayError::transport("reset")));
        assert!(should_degrade(&GatewayError::CircuitOpen {
            key: "responses:create_response".into(),
            retry_after_ms: 500,
        }));
        assert!(!should_degrade(&GatewayError::MalformedRequest("bad".into())));
        assert!(!should_degrade(&GatewayError::provider_call(400, "http", "bad")));
    }

    #[test]
    fn degraded_stream_body_is_complete_sse() {
        let response = CanonicalResponse {
            id: "degraded-1".into(),
            created: 1,
            model: "m".into(),
            output: vec![OutputItem::Text {
                text: "temporarily degraded".into(),
            }],
            usage: Some(CanonicalUsage::default()),
        };

        let body = degraded_sse_body(ClientProtocol::FlatMessage, &response);
        assert!(body.contains("chat.completion.chunk"));
        assert!(body.trim_end().ends_with("data: [DONE]"));

        let body = degraded_sse_body(ClientProtocol::ContentBlock, &response);
        assert!(body.starts_with("event: message_start\n"));
        assert!(body.contains("event: content_block_delta\n"));
        assert!(body.contains("event: message_stop\n"));
    }
}
