//! Resilience layer: circuit breaking, retry with backoff, and graceful
//! degradation.
//!
//! The pieces compose around provider calls in a fixed order: the breaker is
//! consulted before any attempt, retries happen inside a single breaker
//! "attempt window" (each attempt individually recorded), and only when the
//! call ultimately fails does the degradation chain run. Degraded responses
//! are never written back into conversation state.

pub mod circuit;
pub mod degrade;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitRegistry, CircuitState};
pub use degrade::{DegradationManager, DegradationResult, ServiceLevel};
pub use retry::{with_retry, RetryPolicy};
