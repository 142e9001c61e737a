use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};

/// A container for all Prometheus metrics exposed by the agent.
///
/// This struct initializes and registers metrics with a unique `agent_id`
/// label, and provides methods to update them and expose them via an HTTP
/// endpoint.
pub struct AgentMetrics {
    pub registry: Registry,
    pub grpc_connection_status: Gauge,
    pub instructions_processed_total: IntCounter,
    pub heartbeats_sent_total: IntCounter,
}

impl AgentMetrics {
    /// Creates and registers a new set of metrics for a given agent id.
    pub fn new(agent_id: &str) -> Self {
        let registry = Registry::new_custom(Some("demo_agent".into()), None).unwrap();

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry.register(Box::new(collector.clone())).unwrap();
                collector
            }};
        }

        Self {
            grpc_connection_status: reg!(Gauge::with_opts(
                prometheus::Opts::new(
                    "agent_grpc_connection_status",
                    "1 for connected, 0 for disconnected."
                )
                .const_label("agent_id", agent_id)
            )
            .unwrap()),
            instructions_processed_total: reg!(IntCounter::with_opts(
                prometheus::Opts::new(
                    "agent_instructions_processed_total",
                    "Total number of Instruction frames this agent has completed."
                )
                .const_label("agent_id", agent_id)
            )
            .unwrap()),
            heartbeats_sent_total: reg!(IntCounter::with_opts(
                prometheus::Opts::new(
                    "agent_heartbeats_sent_total",
                    "Total number of Heartbeat frames sent on the open stream."
                )
                .const_label("agent_id", agent_id)
            )
            .unwrap()),
            registry,
        }
    }

    /// Creates an Axum router that serves the metrics on the /metrics endpoint.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let reg = registry.clone();
                async move {
                    let metric_families = reg.gather();
                    let mut buffer = Vec::new();
                    let encoder = TextEncoder::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();
                    String::from_utf8(buffer).unwrap().into_response()
                }
            }),
        )
    }

    /// Sets the gRPC connection status metric.
    pub fn set_connection_status(&self, is_connected: bool) {
        self.grpc_connection_status
            .set(if is_connected { 1.0 } else { 0.0 });
    }
}
