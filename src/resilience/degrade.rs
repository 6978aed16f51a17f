//! Graceful degradation: fallback strategies and service-level tracking.
//!
//! Runs only after the breaker and retry layers have given up on a call.
//! Strategies are evaluated in a fixed priority order and the first whose
//! condition holds produces the degraded response; `service_unavailable` is
//! the required last resort and terminates by raising a retry-after-bearing
//! error instead of returning success.

use crate::errors::{GatewayError, GatewayResult};
use crate::models::{CanonicalRequest, CanonicalResponse, CanonicalUsage, OutputItem};
use crate::util::now_secs;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const DEFAULT_CACHE_CAPACITY: usize = 256;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

const LEVEL_FULL: u8 = 0;
const LEVEL_DEGRADED: u8 = 1;
const LEVEL_MINIMAL: u8 = 2;

/// Current operating level, ordered `Full > Degraded > Minimal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLevel {
    Full,
    Degraded,
    Minimal,
}

impl ServiceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceLevel::Full => "full",
            ServiceLevel::Degraded => "degraded",
            ServiceLevel::Minimal => "minimal",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            LEVEL_MINIMAL => ServiceLevel::Minimal,
            LEVEL_DEGRADED => ServiceLevel::Degraded,
            _ => ServiceLevel::Full,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServiceLevel::Full => LEVEL_FULL,
            ServiceLevel::Degraded => LEVEL_DEGRADED,
            ServiceLevel::Minimal => LEVEL_MINIMAL,
        }
    }

    pub fn step_down(self) -> Self {
        match self {
            ServiceLevel::Full => ServiceLevel::Degraded,
            _ => ServiceLevel::Minimal,
        }
    }

    pub fn step_up(self) -> Self {
        match self {
            ServiceLevel::Minimal => ServiceLevel::Degraded,
            _ => ServiceLevel::Full,
        }
    }
}

/// Outcome of a successful fallback. `service_unavailable` never produces
/// one of these; it raises instead.
#[derive(Debug, Clone)]
pub struct DegradationResult {
    pub response: CanonicalResponse,
    /// Name of the strategy that matched.
    pub fallback_used: &'static str,
    pub message: Option<String>,
}

struct CachedEntry {
    response: CanonicalResponse,
    stored_at: Instant,
}

#[derive(Default)]
struct ResponseCache {
    entries: HashMap<String, CachedEntry>,
    insertion_order: VecDeque<String>,
}

pub struct DegradationManager {
    level: AtomicU8,
    cache: Mutex<ResponseCache>,
    cache_capacity: usize,
    cache_ttl: Duration,
    retry_after_secs: u64,
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

impl DegradationManager {
    pub fn new(cache_capacity: usize, cache_ttl: Duration) -> Self {
        Self {
            level: AtomicU8::new(LEVEL_FULL),
            cache: Mutex::new(ResponseCache::default()),
            cache_capacity,
            cache_ttl,
            retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
        }
    }

    pub fn level(&self) -> ServiceLevel {
        ServiceLevel::from_u8(self.level.load(Ordering::SeqCst))
    }

    pub fn set_level(&self, level: ServiceLevel) {
        let old = self.level.swap(level.as_u8(), Ordering::SeqCst);
        if old != level.as_u8() {
            info!(from = %ServiceLevel::from_u8(old).as_str(), to = %level.as_str(), "service level changed");
        }
    }

    /// Re-derive the service level from aggregate breaker health. A mostly
    /// open breaker set forces minimal; a majority open degrades one step;
    /// a fully healthy set restores one step.
    pub fn auto_adjust(&self, unhealthy_ratio: f64) -> ServiceLevel {
        let current = self.level();
        let next = if unhealthy_ratio >= 0.8 {
            ServiceLevel::Minimal
        } else if unhealthy_ratio > 0.5 {
            current.step_down()
        } else if unhealthy_ratio == 0.0 {
            current.step_up()
        } else {
            current
        };
        self.set_level(next);
        next
    }

    /// Cache a completed (non-degraded) response for later fallback use.
    pub fn record_success(&self, request: &CanonicalRequest, response: &CanonicalResponse) {
        let key = cache_key(request);
        let mut cache = self.cache.lock().expect("degradation cache lock poisoned");
        if !cache.entries.contains_key(&key) {
            cache.insertion_order.push_back(key.clone());
        }
        cache.entries.insert(
            key,
            CachedEntry {
                response: response.clone(),
                stored_at: Instant::now(),
            },
        );
        while cache.entries.len() > self.cache_capacity {
            if let Some(oldest) = cache.insertion_order.pop_front() {
                cache.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Run the fallback chain for a call whose retries are exhausted.
    ///
    /// `cached_response` matches when a fresh cache entry exists for this
    /// request; `static_response` matches once the gateway is no longer at
    /// full service; `service_unavailable` always matches and raises.
    pub fn handle_failure(
        &self,
        request: &CanonicalRequest,
        cause: &GatewayError,
    ) -> GatewayResult<DegradationResult> {
        warn!(model = %request.model, error = %cause, level = %self.level().as_str(), "provider call exhausted, running fallback chain");

        if let Some(cached) = self.cached_response(request) {
            return Ok(DegradationResult {
                response: cached,
                fallback_used: "cached_response",
                message: Some("served from response cache".to_string()),
            });
        }

        if self.level() != ServiceLevel::Full {
            return Ok(DegradationResult {
                response: static_response(&request.model),
                fallback_used: "static_response",
                message: Some("service degraded, static acknowledgment served".to_string()),
            });
        }

        Err(GatewayError::DegradationExhausted {
            retry_after_secs: self.retry_after_secs,
        })
    }

    fn cached_response(&self, request: &CanonicalRequest) -> Option<CanonicalResponse> {
        let key = cache_key(request);
        let cache = self.cache.lock().expect("degradation cache lock poisoned");
        let entry = cache.entries.get(&key)?;
        if entry.stored_at.elapsed() > self.cache_ttl {
            return None;
        }
        Some(entry.response.clone())
    }

    pub fn cache_len(&self) -> usize {
        self.cache
            .lock()
            .expect("degradation cache lock poisoned")
            .entries
            .len()
    }
}

/// Deterministic cache key over the model and the request's visible text.
fn cache_key(request: &CanonicalRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.model.as_bytes());
    hasher.update(b"\x00");
    hasher.update(request.input.combined_text().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

fn static_response(model: &str) -> CanonicalResponse {
    CanonicalResponse {
        id: format!("degraded-{}", uuid::Uuid::new_v4().simple()),
        created: now_secs(),
        model: model.to_string(),
        output: vec![OutputItem::Text {
            text: "The service is temporarily operating in a degraded mode and could not \
                   complete this request. Please retry shortly."
                .to_string(),
        }],
        usage: Some(CanonicalUsage::default()),
    }
}
