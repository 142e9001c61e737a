use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// A container for all Prometheus metric collectors for the hub.
///
/// This struct is designed to be wrapped in an `Arc` and shared across
/// all concurrent tasks of the application.
pub struct Metrics {
    pub registry: Registry,
    /// Total number of `RegisterAgent` calls that succeeded, including
    /// idempotent re-registrations.
    pub agents_registered_total: IntCounter,
    /// The number of streams currently in the Stream Server's Active state.
    pub active_streams: IntGauge,
    /// Total number of messages published onto the Routing Bus, across all
    /// three channel kinds (Brain->Agent, Agent->Brain, Agent->Agent).
    pub messages_routed_total: IntCounter,
    /// Total number of Health Monitor scan ticks.
    pub health_scans_total: IntCounter,
    /// Total number of agents demoted to Disconnected by the Health Monitor.
    pub health_demotions_total: IntCounter,
    /// Total number of unary admin RPCs handled.
    pub grpc_requests_total: IntCounter,
}

impl Metrics {
    /// Creates a new `Metrics` struct, initializing and registering all collectors.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("hub".into()), None)
            .expect("Failed to create custom metrics registry");

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry
                    .register(Box::new(collector.clone()))
                    .expect("Failed to register metric");
                collector
            }};
        }

        Self {
            agents_registered_total: reg!(IntCounter::new(
                "agents_registered_total",
                "Total number of successful RegisterAgent calls"
            )
            .unwrap()),
            active_streams: reg!(IntGauge::new(
                "active_streams",
                "Number of currently Active agent streams"
            )
            .unwrap()),
            messages_routed_total: reg!(IntCounter::new(
                "messages_routed_total",
                "Total number of messages published onto the Routing Bus"
            )
            .unwrap()),
            health_scans_total: reg!(IntCounter::new(
                "health_scans_total",
                "Total number of Health Monitor scan ticks"
            )
            .unwrap()),
            health_demotions_total: reg!(IntCounter::new(
                "health_demotions_total",
                "Total number of agents demoted to Disconnected by the Health Monitor"
            )
            .unwrap()),
            grpc_requests_total: reg!(IntCounter::new(
                "grpc_requests_total",
                "Total number of unary admin RPCs handled"
            )
            .unwrap()),
            registry,
        }
    }

    /// Creates an `axum::Router` that serves the metrics on the `/metrics` endpoint.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    let encoder = TextEncoder::new();
                    encoder
                        .encode(&metric_families, &mut buffer)
                        .expect("Failed to encode metrics");
                    String::from_utf8(buffer)
                        .expect("Metrics buffer is not valid UTF-8")
                        .into_response()
                }
            }),
        )
    }

    /// Sets the value of the active streams gauge.
    pub fn update_active_streams(&self, count: i64) {
        self.active_streams.set(count);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
