use actix_web::{web, App, HttpServer};
use clap::Parser;
use std::time::Duration;
use tracing::info;

use polygate::util::{cors_config_from_env, env_bind_addr, init_tracing, AppState};

const CONVERSATION_MAX_AGE: Duration = Duration::from_secs(60 * 60);
const CONVERSATION_MAX_ENTRIES: usize = 10_000;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Multi-provider chat-completion gateway.
#[derive(Debug, Parser)]
#[command(name = "polygate", version, about)]
struct Args {
    /// Bind address, e.g. 0.0.0.0:8088 (defaults to BIND_ADDR or 0.0.0.0:8088)
    #[arg(long)]
    bind: Option<String>,

    /// Path to a JSON routing table (defaults to POLYGATE_ROUTING_FILE or the
    /// built-in table)
    #[arg(long, env = "POLYGATE_ROUTING_FILE")]
    routing_file: Option<String>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_tracing();
    let args = Args::parse();

    if let Some(path) = &args.routing_file {
        std::env::set_var("POLYGATE_ROUTING_FILE", path);
    }

    let state = web::Data::new(AppState::from_env());
    let bind = args.bind.unwrap_or_else(env_bind_addr);

    // Conversation contexts are evicted by age and count on a timer; the
    // request path never blocks on cleanup.
    let conversations = state.conversations.clone();
    actix_web::rt::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = conversations.evict_stale(CONVERSATION_MAX_AGE, CONVERSATION_MAX_ENTRIES);
            if removed > 0 {
                info!(removed, "evicted stale conversation contexts");
            }
        }
    });

    info!(%bind, "starting polygate");
    HttpServer::new({
        let state = state.clone();
        move || {
            App::new()
                .wrap(cors_config_from_env())
                .app_data(state.clone())
                .configure(polygate::server::config_routes)
        }
    })
    .bind(&bind)?
    .run()
    .await
}
