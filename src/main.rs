use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;

use codearena::api::{self, AppState};
use codearena::config::Config;
use codearena::engine::config::ArenaConfig;
use codearena::engine::loader::LoaderConfig;
use codearena::engine::server::{MatchOptions, MatchServer};
use codearena::metrics;
use codearena::session::{Session, SessionConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::load());
    metrics::register_metrics();

    let session = Session::bind(
        SocketAddr::from(([0, 0, 0, 0], config.session_port)),
        SessionConfig {
            heartbeat: config.heartbeat,
        },
    )
    .await
    .expect("Failed to bind participant listener");
    tracing::info!("Participants connect on {}", session.local_addr());

    let options = MatchOptions {
        arena: ArenaConfig {
            seed: config.match_seed,
            ..ArenaConfig::default()
        },
        loader: LoaderConfig {
            artifact_dir: config.artifact_dir.clone(),
        },
        ..MatchOptions::default()
    };
    let match_server = Arc::new(MatchServer::new(options));

    let state = AppState {
        session,
        match_server,
        config: config.clone(),
    };
    let app = api::router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to port {}: {e}", config.port));

    tracing::info!("Host console listening on port {}", config.port);
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
