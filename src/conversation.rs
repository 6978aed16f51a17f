//! Conversation continuity tracking.
//!
//! Per-conversation rolling state: previous response id, token and latency
//! rollups, error count. All state is in-process and keyed by conversation
//! id; updates for one id serialize under the store's lock. No operation
//! performs I/O. Eviction is driven by an external cleanup timer calling
//! `evict_stale`.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Header carrying an explicit conversation id.
pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

/// Rolling state for one conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub message_count: u64,
    pub previous_response_id: Option<String>,
    /// Most recent complexity score observed for this conversation.
    pub task_complexity: u32,
    pub total_tokens_used: u64,
    pub average_response_time_ms: f64,
    pub error_count: u64,
    #[serde(skip)]
    last_activity: Instant,
}

impl ConversationContext {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_count: 0,
            previous_response_id: None,
            task_complexity: 0,
            total_tokens_used: 0,
            average_response_time_ms: 0.0,
            error_count: 0,
            last_activity: Instant::now(),
        }
    }
}

/// Metrics merged into a context after a completed call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationMetrics {
    pub tokens_used: u64,
    pub response_time_ms: u64,
    pub had_error: bool,
    pub task_complexity: Option<u32>,
}

/// In-process store of conversation contexts.
///
/// Explicitly constructed and injected into the pipeline rather than held as
/// a module-level global, so tests can run against isolated instances.
#[derive(Debug, Default)]
pub struct ConversationManager {
    contexts: Mutex<HashMap<String, ConversationContext>>,
}

impl ConversationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic conversation id for a request: the dedicated header when
    /// present, else an id derived from the correlation id. Never reuses an
    /// unrelated conversation's id.
    pub fn extract_conversation_id(
        &self,
        headers: &HashMap<String, String>,
        correlation_id: &str,
    ) -> String {
        if let Some(id) = headers.get(CONVERSATION_ID_HEADER) {
            let id = id.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
        let digest = Sha256::digest(correlation_id.as_bytes());
        format!("conv-{}", &hex::encode(digest)[..16])
    }

    pub fn get_context(&self, conversation_id: &str) -> Option<ConversationContext> {
        self.contexts
            .lock()
            .expect("conversation lock poisoned")
            .get(conversation_id)
            .cloned()
    }

    pub fn get_previous_response_id(&self, conversation_id: &str) -> Option<String> {
        self.get_context(conversation_id)
            .and_then(|c| c.previous_response_id)
    }

    /// Record a successfully completed (non-degraded) response. Idempotent
    /// upsert: sets `previous_response_id` and bumps the message count.
    pub fn track_conversation(
        &self,
        conversation_id: &str,
        response_id: &str,
        metrics: Option<ConversationMetrics>,
    ) {
        let mut contexts = self.contexts.lock().expect("conversation lock poisoned");
        let ctx = contexts
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationContext::new(conversation_id));
        ctx.previous_response_id = Some(response_id.to_string());
        ctx.message_count += 1;
        ctx.last_activity = Instant::now();
        if let Some(metrics) = metrics {
            merge_metrics(ctx, metrics);
        }
    }

    /// Merge token/latency counters without touching the response id.
    /// `total_tokens_used` only ever grows.
    pub fn update_conversation_metrics(
        &self,
        conversation_id: &str,
        metrics: ConversationMetrics,
    ) {
        let mut contexts = self.contexts.lock().expect("conversation lock poisoned");
        let ctx = contexts
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationContext::new(conversation_id));
        ctx.last_activity = Instant::now();
        merge_metrics(ctx, metrics);
    }

    /// Drop contexts idle longer than `max_age`, then oldest-first down to
    /// `max_entries`. Called by the external cleanup timer.
    pub fn evict_stale(&self, max_age: Duration, max_entries: usize) -> usize {
        let mut contexts = self.contexts.lock().expect("conversation lock poisoned");
        let before = contexts.len();
        let now = Instant::now();
        contexts.retain(|_, ctx| now.duration_since(ctx.last_activity) <= max_age);

        if contexts.len() > max_entries {
            let mut by_age: Vec<(String, Instant)> = contexts
                .iter()
                .map(|(id, ctx)| (id.clone(), ctx.last_activity))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);
            let excess = contexts.len() - max_entries;
            for (id, _) in by_age.into_iter().take(excess) {
                contexts.remove(&id);
            }
        }
        before - contexts.len()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().expect("conversation lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn merge_metrics(ctx: &mut ConversationContext, metrics: ConversationMetrics) {
    ctx.total_tokens_used = ctx.total_tokens_used.saturating_add(metrics.tokens_used);
    if metrics.had_error {
        ctx.error_count += 1;
    }
    if let Some(complexity) = metrics.task_complexity {
        ctx.task_complexity = complexity;
    }
    if metrics.response_time_ms > 0 {
        // Rolling average over responses observed so far.
        let n = ctx.message_count.max(1) as f64;
        ctx.average_response_time_ms =
            (ctx.average_response_time_ms * (n - 1.0) + metrics.response_time_ms as f64) / n;
    }
}
