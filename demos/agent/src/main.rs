mod communication;
mod config;
mod metrics;

use crate::config::Config;
use crate::metrics::AgentMetrics;
use api::gen::api::v1::{ConversationMessage, MessageType};
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::parse();
    tracing::info!(config = ?config, "Agent starting with configuration");

    let mut comm = communication::Comm::connect(&config.hub_grpc_addr).await?;
    let registered_at = comm
        .register(&config.agent_id, &config.agent_name, &config.capability)
        .await?;
    tracing::info!(agent_id = %config.agent_id, registered_at, "Agent registered successfully");

    let metrics = Arc::new(AgentMetrics::new(&config.agent_id));

    let metrics_router = metrics.router();
    let metrics_addr: std::net::SocketAddr = config.metrics_listen_addr.parse()?;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(metrics_addr).await.unwrap();
        tracing::info!(addr = %metrics_addr, "Agent metrics server started");
        axum::serve(listener, metrics_router.into_make_service())
            .await
            .unwrap();
    });

    let (tx_out, rx_out) = mpsc::channel::<ConversationMessage>(16);
    let mut inbound = comm
        .open_conversation(&config.agent_id, &metrics, rx_out)
        .await?;
    tracing::info!("Conversation stream opened.");

    let heartbeat_tx = tx_out.clone();
    let heartbeat_agent_id = config.agent_id.clone();
    let heartbeat_metrics = metrics.clone();
    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(heartbeat_frame(&heartbeat_agent_id)).await.is_err() {
                break;
            }
            heartbeat_metrics.heartbeats_sent_total.inc();
        }
    });

    tracing::info!("Awaiting instructions...");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received.");
                break;
            }
            frame = inbound.message() => {
                match frame {
                    Ok(Some(msg)) => {
                        if msg.r#type == MessageType::Instruction as i32 {
                            let reply = handle_instruction(&config.agent_id, &config.capability, msg);
                            metrics.instructions_processed_total.inc();
                            if tx_out.send(reply).await.is_err() {
                                tracing::warn!("Outbound channel closed; stopping.");
                                break;
                            }
                        } else {
                            tracing::debug!(message_type = msg.r#type, "Ignoring non-Instruction frame.");
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Hub closed the conversation stream.");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Conversation stream error.");
                        break;
                    }
                }
            }
        }
    }

    metrics.set_connection_status(false);
    tracing::info!("Agent shutting down.");
    Ok(())
}

fn heartbeat_frame(agent_id: &str) -> ConversationMessage {
    ConversationMessage {
        message_id: uuid::Uuid::new_v4().to_string(),
        correlation_id: String::new(),
        from_id: agent_id.to_owned(),
        to_id: "brain".to_owned(),
        r#type: MessageType::Heartbeat as i32,
        content: String::new(),
        context: HashMap::new(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}

/// The one piece of "capability" logic this reference agent has: count the
/// whitespace-separated words in the instruction content and report the
/// count back as a typed completion.
fn handle_instruction(
    agent_id: &str,
    capability: &str,
    instruction: ConversationMessage,
) -> ConversationMessage {
    let mut context = HashMap::new();
    let content = if instruction.content.trim().is_empty() {
        context.insert("error".into(), "empty instruction content".into());
        "rejected: instruction content must not be empty".to_owned()
    } else {
        let word_count = instruction.content.split_whitespace().count();
        context.insert("word_count".into(), word_count.to_string());
        context.insert("capability".into(), capability.to_owned());
        format!("{capability} completed")
    };

    ConversationMessage {
        message_id: uuid::Uuid::new_v4().to_string(),
        correlation_id: instruction.correlation_id,
        from_id: agent_id.to_owned(),
        to_id: instruction.from_id,
        r#type: MessageType::Completion as i32,
        content,
        context,
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}
