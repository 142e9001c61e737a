use api::gen::api::v1::{
    agent_hub_client::AgentHubClient, Capability, ConversationMessage, RegisterAgentRequest,
};
use crate::metrics::AgentMetrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{errors::InvalidMetadataValue, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status, Streaming};

#[derive(Error, Debug)]
pub enum Error {
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("gRPC status error: {0}")]
    Status(#[from] Status),
    #[error("invalid agent-id metadata value: {0}")]
    InvalidMetadata(#[from] InvalidMetadataValue),
}

/// Manages the gRPC connection to the orchestration hub.
pub struct Comm {
    client: AgentHubClient<Channel>,
}

impl Comm {
    /// Establishes the initial gRPC connection to the hub.
    pub async fn connect(hub_grpc_addr: &str) -> Result<Self, Error> {
        let endpoint = Endpoint::from_shared(hub_grpc_addr.to_owned())?
            .keep_alive_while_idle(true)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(20))
            .connect_timeout(Duration::from_secs(5));

        let channel = endpoint.connect().await?;
        Ok(Self {
            client: AgentHubClient::new(channel),
        })
    }

    /// Performs the unary `RegisterAgent` RPC call, advertising a single
    /// capability.
    pub async fn register(
        &mut self,
        agent_id: &str,
        name: &str,
        capability: &str,
    ) -> Result<i64, Status> {
        let resp = self
            .client
            .register_agent(Request::new(RegisterAgentRequest {
                agent_id: agent_id.to_owned(),
                name: name.to_owned(),
                r#type: String::new(),
                capabilities: vec![Capability {
                    name: capability.to_owned(),
                    description: String::new(),
                    parameters: HashMap::new(),
                }],
                version: env!("CARGO_PKG_VERSION").to_owned(),
                max_concurrent_work: 1,
                metadata: HashMap::new(),
            }))
            .await?
            .into_inner();
        Ok(resp.registered_at)
    }

    /// Opens the long-lived `OpenConversation` stream, identifying via the
    /// `agent-id` transport metadata header rather than an in-band frame.
    /// Runs for the process lifetime; the hub observes this agent as Active
    /// for as long as the returned stream and `outbound` sender stay alive.
    pub async fn open_conversation(
        &mut self,
        agent_id: &str,
        metrics: &Arc<AgentMetrics>,
        outbound: mpsc::Receiver<ConversationMessage>,
    ) -> Result<Streaming<ConversationMessage>, Error> {
        let mut req = Request::new(ReceiverStream::new(outbound));
        req.metadata_mut()
            .insert("agent-id", MetadataValue::try_from(agent_id)?);

        let response = self.client.open_conversation(req).await?;
        metrics.set_connection_status(true);
        Ok(response.into_inner())
    }
}
