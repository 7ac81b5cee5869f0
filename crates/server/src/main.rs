use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{routing::get, Router};
use relay::{generator::HttpResponseGenerator, registry::ConnectionRegistry, RelayContext};
use storage::Storage;
use tracing::{error, info};

mod auth;
mod config;
mod ws;

use auth::JwtVerifier;
use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    relay: RelayContext,
    verifier: Arc<JwtVerifier>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|err| {
        error!(
            %database_url,
            error = %err,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        err
    })?;

    let relay = RelayContext {
        storage,
        registry: ConnectionRegistry::new(),
        generator: Arc::new(HttpResponseGenerator::new(
            settings.generator_endpoint.clone(),
            settings.generator_api_key.clone(),
        )),
        auto_reply_delay: Duration::from_secs(settings.auto_reply_delay_seconds),
    };
    let state = AppState {
        relay,
        verifier: Arc::new(JwtVerifier::new(&settings.jwt_secret)),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
