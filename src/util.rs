use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::{fmt, EnvFilter};

use crate::conversation::ConversationManager;
use crate::providers::{ConverseAdapter, ResponsesAdapter};
use crate::resilience::{CircuitRegistry, DegradationManager, RetryPolicy};
use crate::routing::RoutingTable;

/// Initialize dotenv and structured tracing based on RUST_LOG.
///
/// Env files are tried in order: an explicit path via ENV_FILE / DOTENV_PATH,
/// then the conventional `.env` in the working directory. Existing process
/// variables are never overwritten.
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }
    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Get the bind address for the HTTP server from env or default to 0.0.0.0:8088.
pub fn env_bind_addr() -> String {
    std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8088".into())
}

/// Seconds since the Unix epoch, for response `created` stamps.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Correlation id for one inbound request: honor the caller's header when
/// present, otherwise mint one.
pub fn correlation_id(header_value: Option<&str>) -> String {
    match header_value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => v.to_string(),
        None => format!("req-{}", uuid::Uuid::new_v4().simple()),
    }
}

/// Build an HTTP client honoring proxy and timeout environment variables.
///
/// Environment:
/// - POLYGATE_NO_PROXY = 1|true|yes|on  -> disable all proxies
/// - POLYGATE_PROXY_URL = <url>         -> proxy for all schemes
/// - HTTP_PROXY / HTTPS_PROXY           -> scheme-specific proxies
/// - POLYGATE_HTTP_TIMEOUT_SECONDS      -> overall request timeout (u64)
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if let Ok(secs) = std::env::var("POLYGATE_HTTP_TIMEOUT_SECONDS") {
        if let Ok(n) = secs.trim().parse::<u64>() {
            builder = builder.timeout(std::time::Duration::from_secs(n));
        }
    }

    let no_proxy = std::env::var("POLYGATE_NO_PROXY")
        .map(|v| v.trim().to_ascii_lowercase())
        .map(|v| v == "1" || v == "true" || v == "yes" || v == "on")
        .unwrap_or(false);

    if no_proxy {
        builder = builder.no_proxy();
    } else {
        if let Ok(url) = std::env::var("POLYGATE_PROXY_URL") {
            let u = url.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::all(u) {
                    builder = builder.proxy(p);
                }
            }
        }
        if let Ok(http_p) = std::env::var("HTTP_PROXY").or_else(|_| std::env::var("http_proxy")) {
            let u = http_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::http(u) {
                    builder = builder.proxy(p);
                }
            }
        }
        if let Ok(https_p) = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("https_proxy"))
        {
            let u = https_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::https(u) {
                    builder = builder.proxy(p);
                }
            }
        }
    }

    builder = builder.user_agent(format!("polygate/{}", env!("CARGO_PKG_VERSION")));
    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub routing: Arc<RoutingTable>,
    pub conversations: Arc<ConversationManager>,
    pub responses: Arc<ResponsesAdapter>,
    pub converse: Arc<ConverseAdapter>,
    pub circuits: Arc<CircuitRegistry>,
    pub degradation: Arc<DegradationManager>,
    pub retry_policy: RetryPolicy,
}

impl AppState {
    /// Assemble the full pipeline from environment configuration, falling
    /// back to the built-in routing table when POLYGATE_ROUTING_FILE is
    /// unset or unreadable.
    pub fn from_env() -> Self {
        let routing = match std::env::var("POLYGATE_ROUTING_FILE") {
            Ok(path) if !path.trim().is_empty() => match RoutingTable::load_from_file(path.trim())
            {
                Ok(table) => table,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load routing file, using built-in table");
                    RoutingTable::builtin()
                }
            },
            _ => RoutingTable::builtin(),
        };

        Self {
            routing: Arc::new(routing),
            conversations: Arc::new(ConversationManager::new()),
            responses: Arc::new(ResponsesAdapter::from_env(build_http_client_from_env())),
            converse: Arc::new(ConverseAdapter::from_env()),
            circuits: Arc::new(CircuitRegistry::default()),
            degradation: Arc::new(DegradationManager::default()),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Build a CORS configuration from environment variables for Actix-web.
///
/// Environment variables:
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins
/// - CORS_ALLOWED_METHODS: "*" or comma-separated methods
/// - CORS_ALLOWED_HEADERS: "*" or comma-separated request header names
/// - CORS_MAX_AGE: max age in seconds
///
/// Defaults are permissive when not configured.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            for part in origins.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_origin(p);
                }
            }
        }
        _ => cors = cors.allow_any_origin(),
    }

    match std::env::var("CORS_ALLOWED_METHODS") {
        Ok(methods) if methods.trim() != "*" => {
            let list: Vec<&str> = methods
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            if !list.is_empty() {
                cors = cors.allowed_methods(list);
            }
        }
        _ => cors = cors.allow_any_method(),
    }

    match std::env::var("CORS_ALLOWED_HEADERS") {
        Ok(headers) if headers.trim() != "*" => {
            for part in headers.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_header(p);
                }
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}
