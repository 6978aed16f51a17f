#![forbid(unsafe_code)]
#![doc = r#"
Polygate

Multi-provider API translation gateway: accepts chat-completion requests in
either of two client wire dialects, normalizes them into one canonical
representation, routes them to a "Responses"-style or "Converse"-style
backend, and translates the (possibly streamed) result back into the
caller's dialect.

Crate highlights
- Library: the full pipeline is usable without the HTTP server — detect,
  process, invoke an adapter, transform.
- HTTP server (in `server`): `POST /v1/completions` for both dialects,
  `GET /health`, `GET /routing/stats`.
- Resilience: per-operation circuit breakers, retry with exponential
  backoff, and a graceful-degradation fallback chain around every provider
  call.

Modules
- `models`: canonical request/response shapes shared by the whole pipeline.
- `detector`: inbound protocol classification.
- `reasoning`: heuristic reasoning-effort analysis.
- `routing`: model alias to provider/backend-id resolution.
- `conversation`: per-conversation continuity state.
- `processor`: orchestration into one canonical request per call.
- `providers`: the two backend adapters.
- `resilience`: circuit breaker, retry, graceful degradation.
- `transform`: canonical results back into the caller's dialect.
- `server`: actix-web handlers.
- `util`: shared helpers (tracing, env, app state).
"#]

pub mod conversation;
pub mod detector;
pub mod errors;
pub mod models;
pub mod processor;
pub mod providers;
pub mod reasoning;
pub mod resilience;
pub mod routing;
pub mod server;
pub mod transform;
pub mod util;

pub use crate::conversation::{ConversationContext, ConversationManager, ConversationMetrics};
pub use crate::detector::{detect_format, response_format_for};
pub use crate::errors::{GatewayError, GatewayResult};
pub use crate::models::{
    CanonicalInput, CanonicalMessage, CanonicalRequest, CanonicalResponse, CanonicalStreamChunk,
    CanonicalTool, CanonicalToolCall, CanonicalUsage, ClientProtocol, IncomingRequest, OutputItem,
    ReasoningEffort,
};
pub use crate::processor::{ProcessedRequest, RequestProcessor};
pub use crate::providers::{ChunkStream, ConverseAdapter, ProviderAdapter, ResponsesAdapter};
pub use crate::resilience::{
    with_retry, CircuitBreaker, CircuitConfig, CircuitRegistry, CircuitState, DegradationManager,
    DegradationResult, RetryPolicy, ServiceLevel,
};
pub use crate::routing::{Provider, RoutingDecision, RoutingEntry, RoutingTable};
pub use crate::transform::{transform_error, transform_response, SseFrame, StreamRenderer};
