use clap::Parser;

/// `demo-agent` — a reference worker process for the orchestration hub.
///
/// Registers a single capability, holds an `OpenConversation` stream open
/// for its process lifetime, and answers every `Instruction` it receives
/// with a trivial `Completion`. Exists to exercise the hub's contract end
/// to end, not as a real capability provider.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// This agent's unique id. Must match `[A-Za-z0-9_-]+`.
    #[arg(long, env = "AGENT_ID")]
    pub agent_id: String,

    /// Human-readable display name.
    #[arg(long, env = "AGENT_NAME", default_value = "demo-agent")]
    pub agent_name: String,

    /// The single capability this agent advertises at registration.
    #[arg(long, env = "AGENT_CAPABILITY", default_value = "word-count")]
    pub capability: String,

    /// The gRPC address of the orchestration hub.
    #[arg(long, env = "HUB_GRPC_ADDR", default_value = "http://127.0.0.1:50051")]
    pub hub_grpc_addr: String,

    /// The listen address for this agent's own Prometheus metrics server.
    #[arg(long, env = "AGENT_METRICS_LISTEN_ADDR", default_value = "0.0.0.0:9091")]
    pub metrics_listen_addr: String,

    /// How often to send a Heartbeat frame on the open stream.
    #[arg(long, env = "AGENT_HEARTBEAT_INTERVAL_SECS", default_value = "10")]
    pub heartbeat_interval_secs: u64,
}
