//! meek_server — control plane for the distributed video-analysis fleet.
//!
//! Reads config from env vars (a `.env` file is honoured):
//!   MEEK_DATABASE_URL     — Postgres connection string (required)
//!   MEEK_REDIS_URL        — Redis connection string (required)
//!   MEEK_MQTT_HOST        — broker host (default: localhost)
//!   MEEK_MQTT_PORT        — broker port (default: 1883)
//!   MEEK_MQTT_USERNAME / MEEK_MQTT_PASSWORD — broker credentials
//!   MEEK_TOPIC_PREFIX     — pub/sub prefix (default: meek/)
//!   MEEK_BIND_ADDR        — listen address (default: 0.0.0.0:8000)
//!   MEEK_BATCH_INTERVAL_MS, MEEK_HEALTH_INTERVAL_SECS,
//!   MEEK_NODE_TIMEOUT_MULTIPLIER, MEEK_MONITOR_INTERVAL_SECS,
//!   MEEK_RETRY_BASE_DELAY_SECS, MEEK_RETRY_BACKOFF_FACTOR,
//!   MEEK_RETRY_MAX, MEEK_QUEUE_WORKERS,
//!   MEEK_MQTT_MAX_RECONNECTS — tuning knobs, all optional
//!   MEEK_MARKET_URL / MEEK_MARKET_API_KEY — model marketplace (optional)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;

use meek_core::dispatch::DispatchConfig;
use meek_core::health::HealthConfig;
use meek_core::ports::CommandBus;
use meek_core::monitor::MonitorConfig;
use meek_core::retry::RetryPolicy;
use meek_mqtt::MqttSettings;
use meek_postgres::PgStores;
use meek_redis::RedisStatusCache;
use meek_server::market::ModelMarket;
use meek_server::probe::NetworkStreamProber;
use meek_server::router::build_router;
use meek_server::runtime::{BackgroundServices, RuntimeConfig};
use meek_server::state::{AppState, ControlConfig, StorePorts};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,meek_server=debug".into()),
        )
        .init();

    let database_url =
        std::env::var("MEEK_DATABASE_URL").expect("MEEK_DATABASE_URL must be set");
    let redis_url = std::env::var("MEEK_REDIS_URL").expect("MEEK_REDIS_URL must be set");
    let bind_addr =
        std::env::var("MEEK_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".into());
    let topic_prefix =
        std::env::var("MEEK_TOPIC_PREFIX").unwrap_or_else(|_| "meek/".into());

    // Stores
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to database");
    meek_postgres::apply_schema(&pool).await.expect("failed to apply database schema");
    tracing::info!("connected to database");

    let stores = PgStores::new(pool.clone());
    let cache = RedisStatusCache::connect(&redis_url)
        .await
        .expect("failed to connect to redis");

    // Broker
    let mqtt_settings = MqttSettings {
        host: std::env::var("MEEK_MQTT_HOST").unwrap_or_else(|_| "localhost".into()),
        port: env_or("MEEK_MQTT_PORT", 1883),
        username: std::env::var("MEEK_MQTT_USERNAME").ok(),
        password: std::env::var("MEEK_MQTT_PASSWORD").ok(),
        topic_prefix: topic_prefix.clone(),
        max_reconnect_attempts: env_or("MEEK_MQTT_MAX_RECONNECTS", 20),
        ..MqttSettings::default()
    };

    // Control configuration
    let cfg = ControlConfig {
        dispatch: DispatchConfig { topic_prefix: topic_prefix.clone(), ..Default::default() },
        health: HealthConfig {
            interval: Duration::from_secs(env_or("MEEK_HEALTH_INTERVAL_SECS", 20)),
            timeout_multiplier: env_or("MEEK_NODE_TIMEOUT_MULTIPLIER", 2),
            ..Default::default()
        },
        monitor: MonitorConfig {
            interval: Duration::from_secs(env_or("MEEK_MONITOR_INTERVAL_SECS", 60)),
            ..Default::default()
        },
        retry: RetryPolicy {
            base_delay: Duration::from_secs(env_or("MEEK_RETRY_BASE_DELAY_SECS", 5)),
            backoff_factor: env_or("MEEK_RETRY_BACKOFF_FACTOR", 2.0),
            max_retries: env_or("MEEK_RETRY_MAX", 3),
        },
        ..Default::default()
    };

    let market = match (std::env::var("MEEK_MARKET_URL"), std::env::var("MEEK_MARKET_API_KEY")) {
        (Ok(url), key) => Some(Arc::new(
            ModelMarket::new(url, key.unwrap_or_default())
                .expect("failed to build marketplace client"),
        )),
        _ => None,
    };

    // The queue exists before the bus so inbound messages have somewhere
    // to land from the first packet on.
    let controller_id = mqtt_settings.client_id.clone();
    let message_queue = AppState::message_queue_for(&cfg);
    let (bus, _bus_handle) = meek_mqtt::spawn_bus(mqtt_settings, Arc::clone(&message_queue));

    let state = AppState::build(
        StorePorts {
            tasks: Arc::new(stores.tasks),
            subtasks: Arc::new(stores.subtasks),
            nodes: Arc::new(stores.nodes),
            streams: Arc::new(stores.streams),
            models: Arc::new(stores.models),
            cache: Arc::new(cache),
            results: Arc::new(stores.results),
        },
        bus,
        message_queue,
        Arc::new(NetworkStreamProber::new(Duration::from_secs(10))),
        market,
        cfg,
    );

    let runtime_cfg = RuntimeConfig {
        queue_workers: env_or("MEEK_QUEUE_WORKERS", 4),
        batch_interval: Duration::from_millis(env_or("MEEK_BATCH_INTERVAL_MS", 100)),
        ..Default::default()
    };
    let services = BackgroundServices::start(Arc::clone(&state), runtime_cfg).await;

    let app = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {bind_addr}: {e}"));
    tracing::info!("meek_server listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .expect("server error");

    // Retained offline announcement so peers see a graceful exit; the
    // last will covers the ungraceful case.
    let offline = meek_core::proto::ConnectionMessage::offline(
        &controller_id,
        &controller_id,
        "api",
    );
    if let Ok(payload) = serde_json::to_value(&offline) {
        let topic = meek_core::proto::topics::connection(&topic_prefix);
        if let Err(e) = state
            .bus
            .publish(&topic, payload, meek_core::ports::QosLevel::AtLeastOnce, true)
            .await
        {
            tracing::warn!("could not announce controller offline: {e}");
        }
    }

    services.shutdown().await;
}
