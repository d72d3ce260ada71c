use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use push_gateway::config::GatewayConfig;
use push_gateway::dispatcher::NotificationDispatcher;
use push_gateway::{handlers, health, metrics, middleware, registry::PushkinRegistry, telemetry};

#[derive(Debug, Parser)]
#[command(name = "push-gateway", about = "Dispatches federated-protocol push notifications to APNs, FCM, and Web Push")]
struct Cli {
    /// Path to the gateway's YAML configuration document.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }
        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    #[cfg(debug_assertions)]
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    #[cfg(not(debug_assertions))]
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();

    tracing::info!(config_path = %cli.config, "starting push gateway");

    let config = match GatewayConfig::load_from_path(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let registry = match PushkinRegistry::from_config(&config) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            tracing::error!(error = %e, "failed to build pushkin registry");
            std::process::exit(1);
        }
    };
    tracing::info!(pushkins = registry.len(), "pushkin registry initialized");

    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("metrics recorder initialized");

    let telemetry_sink: Arc<dyn telemetry::TelemetrySink> = Arc::new(telemetry::PrometheusTelemetry);
    let dispatcher = Arc::new(NotificationDispatcher::new(
        registry.clone(),
        telemetry_sink,
        Duration::from_secs(config.http.ingress_timeout_secs),
    ));

    let notify_router = Router::new()
        .route("/_matrix/push/v1/notify", post(handlers::notify))
        .with_state(dispatcher);

    let health_router = Router::new().route("/health", get(health::health));

    let metrics_router = Router::new()
        .route("/_matrix/metrics", get(metrics::metrics_handler))
        .with_state(metrics_handle);

    let app = Router::new()
        .merge(notify_router)
        .merge(health_router)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::logging::log_headers_middleware))
        .layer(axum::middleware::from_fn(metrics::track_request_metrics));

    let port = config.http.port;
    let bind_address = config
        .http
        .bind_addresses
        .first()
        .cloned()
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let addr: SocketAddr = format!("{bind_address}:{port}")
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    Ok(())
}

async fn shutdown_signal(registry: Arc<PushkinRegistry>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining pushkins");
    registry.shutdown_all().await;
}
