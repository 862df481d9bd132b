use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use tollbooth::{
    build_client, build_https_client, serve, shutdown_signal, spawn_counter_sweeper, Config,
    MemoryCounterStore, RateLimiter, ServerState,
};

const CONFIG_FILE_PATH: &str = "./Config.yml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::load_from_file(CONFIG_FILE_PATH)
        .and_then(|c| c.into_runtime())
        .unwrap_or_else(|e| {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        });
    let config = Arc::new(config);

    let store = Arc::new(MemoryCounterStore::new());
    let limiter = RateLimiter::new(store.clone(), config.policies.clone());
    let _sweeper = spawn_counter_sweeper(store, config.sweep_interval);

    let concurrency_limit = config.max_concurrent_requests;
    let state = ServerState {
        config: Arc::clone(&config),
        limiter,
        semaphore: Arc::new(Semaphore::new(concurrency_limit)),
        concurrency_limit,
    };

    let listener = TcpListener::bind(config.listen)
        .await
        .unwrap_or_else(|e| {
            eprintln!("fatal: failed to bind {}: {e}", config.listen);
            std::process::exit(1);
        });

    info!(listen = %config.listen, upstream = %config.upstream_url, "gateway starting");

    if config.upstream_is_https() {
        let client = build_https_client(&config);
        serve(listener, client, state, shutdown_signal()).await;
    } else {
        let client = build_client(&config);
        serve(listener, client, state, shutdown_signal()).await;
    }
}
