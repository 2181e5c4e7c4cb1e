use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_api::config::Config;
use gateway_api::db::kv::{KeyValueStore, MemoryStore, RedisStore};
use gateway_api::db::presence::{MemoryPresence, PresenceStore, RedisPresence};
use gateway_api::gateway::events::CLOSE_GOING_AWAY;
use gateway_api::gateway::fanout::{EventBus, FanoutRelay, LocalBus, RedisBus};
use gateway_api::AppState;

type Stores = (
    Arc<dyn KeyValueStore>,
    Option<Arc<dyn PresenceStore>>,
    Arc<dyn EventBus>,
);

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing, env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let (kv, presence, bus) = connect_stores(&config).await;

    tracing::info!(server_id = %config.server_id, redis = config.redis_url.is_some(), "gateway configured");

    let state = AppState::new(config, kv, presence, bus);
    let hub = state.hub.clone();

    let shutdown = CancellationToken::new();
    let mut tasks = hub.spawn_sweepers(shutdown.clone());
    tasks.push(tokio::spawn(
        FanoutRelay::new(hub.clone()).run(state.bus.clone(), shutdown.clone()),
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(gateway_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(?e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutdown requested");
            hub.close_all(CLOSE_GOING_AWAY, "server shutting down").await;
            signal.cancel();
        })
        .await
        .expect("server error");

    shutdown.cancel();
    futures_util::future::join_all(tasks).await;
    tracing::info!("gateway stopped");
}

/// Redis-backed stores when `REDIS_URL` is set, in-memory otherwise.
async fn connect_stores(config: &Config) -> Stores {
    let Some(url) = config.redis_url.as_deref() else {
        tracing::warn!("REDIS_URL not set, running single-process with in-memory stores");
        return (
            Arc::new(MemoryStore::new()),
            Some(Arc::new(MemoryPresence::new())),
            Arc::new(LocalBus::new()),
        );
    };

    let client = redis::Client::open(url).expect("invalid REDIS_URL");
    let conn = ConnectionManager::new(client.clone())
        .await
        .expect("failed to connect to redis");

    (
        Arc::new(RedisStore::new(conn.clone())),
        Some(Arc::new(RedisPresence::new(
            config.server_id.clone(),
            conn.clone(),
        ))),
        Arc::new(RedisBus::new(client, conn)),
    )
}
