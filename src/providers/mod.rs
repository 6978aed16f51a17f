//! Backend provider adapters.
//!
//! Each adapter owns the bidirectional mapping between the canonical shapes
//! and one provider's wire format, for both unary and streamed calls. The two
//! integrations share no inheritance; they are independent implementations of
//! `ProviderAdapter` selected by the routing decision. Provider errors never
//! leak past the adapter boundary: everything surfaces as
//! `GatewayError::ProviderCall`.

pub mod converse;
pub mod responses;

use crate::errors::GatewayResult;
use crate::models::{CanonicalRequest, CanonicalResponse, CanonicalStreamChunk};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// A finite, non-restartable stream of normalized chunks. A consumer that
/// wants the data twice must re-invoke the call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = GatewayResult<CanonicalStreamChunk>> + Send>>;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider name used for circuit-breaker keys and logging.
    fn name(&self) -> &'static str;

    async fn create_response(&self, request: &CanonicalRequest) -> GatewayResult<CanonicalResponse>;

    async fn create_response_stream(&self, request: &CanonicalRequest)
        -> GatewayResult<ChunkStream>;
}

pub use converse::ConverseAdapter;
pub use responses::ResponsesAdapter;
