use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use statebridge_backend::api::{self, AppState};
use statebridge_backend::config::Config;
use statebridge_backend::inference::EchoProvider;
use statebridge_backend::metrics;
use statebridge_backend::rate_limit::RateLimiter;
use statebridge_backend::session::{spawn_session_sweeper, SessionStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load();
    metrics::register_metrics();

    let sessions = SessionStore::new();
    let rate_limiter = RateLimiter::per_minute(config.rate_limit_per_minute);

    // Evict sessions whose client went away without closing
    spawn_session_sweeper(
        sessions.clone(),
        rate_limiter.clone(),
        config.session_ttl,
        config.sweep_interval,
    );

    let state = AppState {
        sessions,
        provider: Arc::new(EchoProvider),
        rate_limiter,
        inference_timeout: config.inference_timeout,
    };
    let app = api::router(state);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!(
        inference_timeout_ms = config.inference_timeout.as_millis() as u64,
        session_ttl_secs = config.session_ttl.as_secs(),
        "Statebridge backend listening on {addr}"
    );
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
