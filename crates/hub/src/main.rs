// hub/src/main.rs
mod grpc;
mod health;
mod metrics;
mod streams;

use crate::metrics::Metrics;
use crate::streams::ActiveStreams;
use anyhow::Context;
use graph_store::{memory::InMemoryStore, neo4j::Neo4jStore, GraphStore};
use message_bus::amqp::{AmqpBroker, AmqpBrokerConfig};
use message_bus::memory::InMemoryBroker;
use message_bus::{routing::RoutingBus, Broker};
use registry::AgentRegistry;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

/// Holds all configuration for the hub application, loaded from the
/// environment the way `sim_orchestrator::Config` does.
#[derive(Debug, Clone)]
struct Config {
    grpc_listen_addr: SocketAddr,
    metrics_listen_addr: SocketAddr,
    store_backend: StoreBackend,
    broker_backend: BrokerBackend,
    graph_url: String,
    graph_user: String,
    graph_password: String,
    broker_url: String,
    broker_reconnect_base_delay: Duration,
    broker_reconnect_max_attempts: u32,
    health_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreBackend {
    Neo4j,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrokerBackend {
    Amqp,
    Memory,
}

impl Config {
    /// Parses configuration from environment variables. Everything has a
    /// local/dev-friendly default except credentials for a real Neo4j
    /// instance, which are only required when `STORE_BACKEND=neo4j`.
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            grpc_listen_addr: std::env::var("HUB_GRPC_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:50051".into())
                .parse()
                .context("Failed to parse HUB_GRPC_LISTEN_ADDR")?,
            metrics_listen_addr: std::env::var("HUB_METRICS_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:9090".into())
                .parse()
                .context("Failed to parse HUB_METRICS_LISTEN_ADDR")?,
            store_backend: match std::env::var("STORE_BACKEND")
                .unwrap_or_else(|_| "memory".into())
                .as_str()
            {
                "neo4j" => StoreBackend::Neo4j,
                "memory" => StoreBackend::Memory,
                other => anyhow::bail!("unknown STORE_BACKEND '{other}', expected neo4j|memory"),
            },
            broker_backend: match std::env::var("BROKER_BACKEND")
                .unwrap_or_else(|_| "memory".into())
                .as_str()
            {
                "amqp" => BrokerBackend::Amqp,
                "memory" => BrokerBackend::Memory,
                other => anyhow::bail!("unknown BROKER_BACKEND '{other}', expected amqp|memory"),
            },
            graph_url: std::env::var("GRAPH_URL").unwrap_or_else(|_| "bolt://127.0.0.1:7687".into()),
            graph_user: std::env::var("GRAPH_USER").unwrap_or_else(|_| "neo4j".into()),
            graph_password: std::env::var("GRAPH_PASSWORD").unwrap_or_else(|_| "neo4j".into()),
            broker_url: std::env::var("BROKER_URL")
                .unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".into()),
            broker_reconnect_base_delay: Duration::from_millis(
                std::env::var("BROKER_RECONNECT_BASE_MS")
                    .unwrap_or_else(|_| "5000".into())
                    .parse()
                    .context("Failed to parse BROKER_RECONNECT_BASE_MS")?,
            ),
            broker_reconnect_max_attempts: std::env::var("BROKER_RECONNECT_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "5".into())
                .parse()
                .context("Failed to parse BROKER_RECONNECT_MAX_ATTEMPTS")?,
            health_interval: Duration::from_secs(
                std::env::var("HEALTH_INTERVAL_SECS")
                    .unwrap_or_else(|_| "30".into())
                    .parse()
                    .context("Failed to parse HEALTH_INTERVAL_SECS")?,
            ),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::from_env()?;
    tracing::info!(config = ?config, "Loaded configuration");

    let store: Arc<dyn GraphStore> = match config.store_backend {
        StoreBackend::Neo4j => Arc::new(
            Neo4jStore::connect(&config.graph_url, &config.graph_user, &config.graph_password)
                .await
                .context("Failed to connect to graph store")?,
        ),
        StoreBackend::Memory => Arc::new(InMemoryStore::new()),
    };

    let broker: Arc<dyn Broker> = match config.broker_backend {
        BrokerBackend::Amqp => Arc::new(
            AmqpBroker::connect(AmqpBrokerConfig {
                url: config.broker_url.clone(),
                reconnect_base_delay: config.broker_reconnect_base_delay,
                reconnect_max_attempts: config.broker_reconnect_max_attempts,
                ..Default::default()
            })
            .await
            .context("Failed to connect to message broker")?,
        ),
        BrokerBackend::Memory => Arc::new(InMemoryBroker::new()),
    };

    let registry = Arc::new(AgentRegistry::new(store));
    registry
        .bootstrap_schema()
        .await
        .context("Failed to bootstrap registry schema")?;

    let bus = Arc::new(RoutingBus::new(broker));
    let streams = Arc::new(ActiveStreams::new());
    let metrics = Arc::new(Metrics::new());
    let shutdown = CancellationToken::new();

    let health_handle = health::spawn(
        registry.clone(),
        metrics.clone(),
        config.health_interval,
        shutdown.clone(),
    );

    let grpc_handle = {
        let registry = registry.clone();
        let bus = bus.clone();
        let streams = streams.clone();
        let metrics = metrics.clone();
        let addr = config.grpc_listen_addr;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            grpc::serve_grpc(registry, bus, streams, metrics, addr, shutdown).await
        })
    };

    let metrics_handle = {
        let router = metrics.router();
        let addr = config.metrics_listen_addr;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await?;
            Ok::<(), anyhow::Error>(())
        })
    };

    tracing::info!("All services started. Awaiting shutdown signal...");
    shutdown_signal().await;

    tracing::info!("Shutdown signal received. Terminating services...");
    shutdown.cancel();
    streams.cancel_all();

    let shutdown_result = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(health_handle, grpc_handle, metrics_handle) },
    )
    .await;

    match shutdown_result {
        Ok((health_res, grpc_res, metrics_res)) => {
            if let Err(e) = health_res {
                tracing::error!(error = %e, "Health Monitor task panicked.");
            }
            match grpc_res {
                Ok(Err(e)) => tracing::error!(error = %e, "gRPC server exited with an error."),
                Err(e) => tracing::error!(error = %e, "gRPC server task panicked."),
                Ok(Ok(())) => {}
            }
            match metrics_res {
                Ok(Err(e)) => tracing::error!(error = %e, "Metrics server exited with an error."),
                Err(e) => tracing::error!(error = %e, "Metrics server task panicked."),
                Ok(Ok(())) => {}
            }
        }
        Err(_) => {
            tracing::warn!("Shutdown deadline elapsed before all tasks exited; force-stopping.");
        }
    }

    tracing::info!("Hub shut down gracefully.");
    Ok(())
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
