use crate::{
    metrics::Metrics,
    streams::{ActiveStreams, StreamId},
};
use api::gen::api::v1::{
    agent_hub_server::{AgentHub, AgentHubServer},
    *,
};
use chrono::Utc;
use futures::Stream;
use message_bus::routing::RoutingBus;
use message_bus::{BrokerError, MessageKind, RoutedMessage};
use registry::{Agent, AgentRegistry, AgentStatus, Capability, RegistryError};
use std::{pin::Pin, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

/// The implementation of the `AgentHub` gRPC service: the Stream Server
/// (`open_conversation`) and the admin unary RPC surface.
pub struct HubSvc {
    registry: Arc<AgentRegistry>,
    bus: Arc<RoutingBus>,
    streams: Arc<ActiveStreams>,
    metrics: Arc<Metrics>,
}

impl HubSvc {
    pub fn new(
        registry: Arc<AgentRegistry>,
        bus: Arc<RoutingBus>,
        streams: Arc<ActiveStreams>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            bus,
            streams,
            metrics,
        }
    }
}

#[tonic::async_trait]
impl AgentHub for HubSvc {
    /// Validate; Registry.Register; bus.PrepareAgentQueue (best-effort —
    /// registration succeeds even if prepare fails, a warning is logged).
    async fn register_agent(
        &self,
        req: Request<RegisterAgentRequest>,
    ) -> Result<Response<RegisterAgentResponse>, Status> {
        self.metrics.grpc_requests_total.inc();
        let r = req.into_inner();

        let capabilities = r
            .capabilities
            .into_iter()
            .map(|c| Capability {
                name: c.name,
                description: c.description,
                parameters: c.parameters,
            })
            .collect();

        let mut metadata = r.metadata;
        if !r.r#type.is_empty() {
            metadata.insert("type".into(), r.r#type);
        }
        if !r.version.is_empty() {
            metadata.insert("version".into(), r.version);
        }
        if r.max_concurrent_work > 0 {
            metadata.insert(
                "max_concurrent_work".into(),
                r.max_concurrent_work.to_string(),
            );
        }

        let agent = Agent::new(r.agent_id, r.name, String::new(), capabilities, metadata);
        let agent = self
            .registry
            .register_agent(agent)
            .await
            .map_err(map_registry_err)?;
        self.metrics.agents_registered_total.inc();

        if let Err(e) = self.bus.prepare_agent_queue(&agent.id).await {
            tracing::warn!(agent_id = %agent.id, error = %e, "failed to prepare agent queue; registration still succeeds");
        }

        Ok(Response::new(RegisterAgentResponse {
            success: true,
            message: "agent registered".into(),
            registered_at: agent.created_at.timestamp_millis(),
        }))
    }

    /// Cancel active stream for that id under mutex; Registry.Unregister
    /// (-> Offline).
    async fn unregister_agent(
        &self,
        req: Request<UnregisterAgentRequest>,
    ) -> Result<Response<UnregisterAgentResponse>, Status> {
        self.metrics.grpc_requests_total.inc();
        let r = req.into_inner();

        self.streams.cancel(&r.agent_id);
        self.registry
            .unregister_agent(&r.agent_id)
            .await
            .map_err(map_registry_err)?;

        Ok(Response::new(UnregisterAgentResponse {
            success: true,
            message: "agent unregistered".into(),
        }))
    }

    /// Map wire status to domain status; Registry.UpdateAgentStatus;
    /// Registry.UpdateLastSeen (best-effort).
    async fn update_agent_status(
        &self,
        req: Request<UpdateAgentStatusRequest>,
    ) -> Result<Response<UpdateAgentStatusResponse>, Status> {
        self.metrics.grpc_requests_total.inc();
        let r = req.into_inner();
        let status = wire_status_to_domain(r.status)?;

        self.registry
            .update_agent_status(&r.agent_id, status)
            .await
            .map_err(map_registry_err)?;

        if let Err(e) = self.registry.update_agent_last_seen(&r.agent_id).await {
            tracing::warn!(agent_id = %r.agent_id, error = %e, "failed to refresh last_seen after status update");
        }

        Ok(Response::new(UpdateAgentStatusResponse {
            success: true,
            message: "status updated".into(),
            server_time: Utc::now().timestamp_millis(),
        }))
    }

    /// Registry.UpdateAgentLastSeen; returns server_time.
    async fn heartbeat(
        &self,
        req: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        self.metrics.grpc_requests_total.inc();
        let r = req.into_inner();

        self.registry
            .update_agent_last_seen(&r.agent_id)
            .await
            .map_err(map_registry_err)?;

        Ok(Response::new(HeartbeatResponse {
            success: true,
            server_time: Utc::now().timestamp_millis(),
        }))
    }

    /// Wrap and publish to the Brain->Agent channel keyed by target agent.
    async fn send_instruction(
        &self,
        req: Request<SendInstructionRequest>,
    ) -> Result<Response<SendInstructionResponse>, Status> {
        self.metrics.grpc_requests_total.inc();
        let r = req.into_inner();

        let mut context = r.parameters;
        context.insert("capability".into(), r.capability);

        let message = RoutedMessage {
            message_id: r.instruction_id.clone(),
            correlation_id: r.correlation_id.clone(),
            from_id: message_bus::routing::BRAIN_PARTICIPANT.to_owned(),
            to_id: r.agent_id.clone(),
            message_type: MessageKind::Instruction,
            content: r.content,
            context,
            timestamp: Utc::now().timestamp_millis(),
        };

        self.bus
            .send_to_agent(&r.agent_id, message)
            .await
            .map_err(map_broker_err)?;
        self.metrics.messages_routed_total.inc();

        Ok(Response::new(SendInstructionResponse {
            success: true,
            message: "instruction queued".into(),
            instruction_id: r.instruction_id,
            correlation_id: r.correlation_id,
        }))
    }

    /// Wrap and publish to the Agent->Brain channel; if `success=false`,
    /// merge `error_message` into the context mapping under keys `error`
    /// and `success`.
    async fn report_completion(
        &self,
        req: Request<ReportCompletionRequest>,
    ) -> Result<Response<ReportCompletionResponse>, Status> {
        self.metrics.grpc_requests_total.inc();
        let r = req.into_inner();

        let mut context = r.result_data;
        if !r.success {
            context.insert("error".into(), r.error_message);
            context.insert("success".into(), "false".into());
        }

        let message = RoutedMessage {
            message_id: r.completion_id.clone(),
            correlation_id: r.correlation_id.clone(),
            from_id: r.agent_id,
            to_id: message_bus::routing::BRAIN_PARTICIPANT.to_owned(),
            message_type: MessageKind::Completion,
            content: r.content,
            context,
            timestamp: Utc::now().timestamp_millis(),
        };

        self.bus.send_to_ai(message).await.map_err(map_broker_err)?;
        self.metrics.messages_routed_total.inc();

        Ok(Response::new(ReportCompletionResponse {
            success: true,
            message: "completion routed".into(),
            completion_id: r.completion_id,
        }))
    }

    type OpenConversationStream =
        Pin<Box<dyn Stream<Item = Result<ConversationMessage, Status>> + Send + 'static>>;

    /// The Stream Server: one long-lived bidirectional call per agent.
    /// Identity comes from the `agent-id` transport metadata header at
    /// stream open, never from an in-band frame.
    async fn open_conversation(
        &self,
        req: Request<Streaming<ConversationMessage>>,
    ) -> Result<Response<Self::OpenConversationStream>, Status> {
        let agent_id = req
            .metadata()
            .get("agent-id")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| Status::invalid_argument("missing agent-id transport metadata"))?;

        let mut inbound = req.into_inner();

        let mut from_bus = self.bus.subscribe(&agent_id).await.map_err(|e| {
            tracing::error!(agent_id = %agent_id, error = %e, "failed to subscribe stream to routing bus");
            Status::internal(e.to_string())
        })?;

        let token = CancellationToken::new();
        let stream_id = crate::streams::next_stream_id();
        if let Some(previous) = self
            .streams
            .insert(&agent_id, stream_id, token.clone())
        {
            previous.cancel();
        }
        self.metrics.update_active_streams(self.streams.len() as i64);

        let (tx, rx) = mpsc::channel(10);

        let receiver_token = token.clone();
        let receiver_agent_id = agent_id.clone();
        let registry = self.registry.clone();
        let bus = self.bus.clone();
        let streams = self.streams.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = receiver_token.cancelled() => break,
                    frame = inbound.message() => {
                        match frame {
                            Ok(Some(msg)) => {
                                dispatch_incoming(&registry, &bus, &metrics, &receiver_agent_id, msg).await;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(agent_id = %receiver_agent_id, error = %e, "stream receive error");
                                break;
                            }
                        }
                    }
                }
            }
            teardown(&streams, &bus, &metrics, stream_id, &receiver_agent_id).await;
            tracing::info!(agent_id = %receiver_agent_id, "receiver task exited");
        });

        let forwarder_token = token;
        let forwarder_agent_id = agent_id;
        let streams = self.streams.clone();
        let bus = self.bus.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forwarder_token.cancelled() => break,
                    msg = from_bus.recv() => {
                        match msg {
                            Some(routed) => {
                                if tx.send(Ok(to_wire_message(routed))).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            teardown(&streams, &bus, &metrics, stream_id, &forwarder_agent_id).await;
            tracing::info!(agent_id = %forwarder_agent_id, "forwarder task exited");
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::OpenConversationStream
        ))
    }
}

/// Guaranteed cleanup on stream close, run by whichever of Receiver or
/// Forwarder exits first (and harmlessly repeated by the other): drop the
/// `active_streams` entry and let the routing bus tear down its broker
/// consumer, but only if `stream_id` still owns the `agent_id` entry.
///
/// A stream can observe its own token cancelled not because it's closing
/// on its own terms but because a second `open_conversation` call for the
/// same `agent_id` superseded it (spec §4.4 scenario 5): that second
/// stream has already replaced the `active_streams` entry and subscribed
/// its own fresh consumer before cancelling this one. If this teardown
/// then removed the entry and cancelled the bus subscription
/// unconditionally, it would destroy the *new* stream's state instead of
/// its own. `remove_if_current` makes the removal (and the decision to
/// touch the bus) conditional on this stream still being the current
/// owner, so a superseded stream's teardown is a no-op.
async fn teardown(
    streams: &ActiveStreams,
    bus: &RoutingBus,
    metrics: &Metrics,
    stream_id: StreamId,
    agent_id: &str,
) {
    if streams.remove_if_current(agent_id, stream_id) {
        bus.cancel(agent_id).await;
        metrics.update_active_streams(streams.len() as i64);
    }
}

/// Incoming frame dispatch (spec direction: agent -> server). Per-message
/// failures are logged; the stream continues.
async fn dispatch_incoming(
    registry: &AgentRegistry,
    bus: &RoutingBus,
    metrics: &Metrics,
    agent_id: &str,
    frame: ConversationMessage,
) {
    let kind = match wire_message_type_to_kind(frame.r#type) {
        Some(kind) => kind,
        None => {
            tracing::warn!(agent_id, message_id = %frame.message_id, "dropping frame with unrecognized message type");
            return;
        }
    };

    match kind {
        MessageKind::Heartbeat => {
            if let Err(e) = registry.update_agent_last_seen(agent_id).await {
                tracing::warn!(agent_id, error = %e, "failed to refresh last_seen on heartbeat frame");
            }
        }
        MessageKind::Instruction => {
            tracing::warn!(agent_id, message_id = %frame.message_id, "dropping unexpected Instruction frame from agent");
        }
        MessageKind::Completion | MessageKind::StatusUpdate | MessageKind::Error => {
            let routed = RoutedMessage {
                message_id: frame.message_id,
                correlation_id: frame.correlation_id,
                from_id: frame.from_id,
                to_id: frame.to_id,
                message_type: kind,
                content: frame.content,
                context: frame.context,
                timestamp: frame.timestamp,
            };
            if let Err(e) = bus.send_to_ai(routed).await {
                tracing::warn!(agent_id, error = %e, "failed to publish agent frame to brain channel");
            } else {
                metrics.messages_routed_total.inc();
            }
        }
    }
}

fn to_wire_message(routed: RoutedMessage) -> ConversationMessage {
    ConversationMessage {
        message_id: routed.message_id,
        correlation_id: routed.correlation_id,
        from_id: routed.from_id,
        to_id: routed.to_id,
        r#type: kind_to_wire_message_type(routed.message_type) as i32,
        content: routed.content,
        context: routed.context,
        timestamp: routed.timestamp,
    }
}

fn wire_status_to_domain(status: i32) -> Result<AgentStatus, Status> {
    match AgentStatus2::try_from(status).unwrap_or(AgentStatus2::Unknown) {
        AgentStatus2::Healthy => Ok(AgentStatus::Online),
        AgentStatus2::Busy => Ok(AgentStatus::Busy),
        AgentStatus2::Error => Ok(AgentStatus::Error),
        AgentStatus2::ShuttingDown => Ok(AgentStatus::ShuttingDown),
        AgentStatus2::Unknown => Err(Status::invalid_argument("unrecognized agent status")),
    }
}

fn wire_message_type_to_kind(t: i32) -> Option<MessageKind> {
    match MessageType::try_from(t).unwrap_or(MessageType::Unknown) {
        MessageType::Instruction => Some(MessageKind::Instruction),
        MessageType::Completion => Some(MessageKind::Completion),
        MessageType::StatusUpdate => Some(MessageKind::StatusUpdate),
        MessageType::Error => Some(MessageKind::Error),
        MessageType::Heartbeat => Some(MessageKind::Heartbeat),
        MessageType::Unknown => None,
    }
}

fn kind_to_wire_message_type(kind: MessageKind) -> MessageType {
    match kind {
        MessageKind::Instruction => MessageType::Instruction,
        MessageKind::Completion => MessageType::Completion,
        MessageKind::StatusUpdate => MessageType::StatusUpdate,
        MessageKind::Error => MessageType::Error,
        MessageKind::Heartbeat => MessageType::Heartbeat,
    }
}

fn map_registry_err(e: RegistryError) -> Status {
    match e {
        RegistryError::InvalidArgument(msg) => Status::invalid_argument(msg),
        RegistryError::NotFound(id) => Status::not_found(format!("agent '{id}' not found")),
        RegistryError::Store(e) => Status::internal(e.to_string()),
    }
}

fn map_broker_err(e: BrokerError) -> Status {
    Status::internal(e.to_string())
}

/// Configures and runs the main gRPC server.
pub async fn serve_grpc(
    registry: Arc<AgentRegistry>,
    bus: Arc<RoutingBus>,
    streams: Arc<ActiveStreams>,
    metrics: Arc<Metrics>,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let svc = HubSvc::new(registry, bus, streams, metrics);

    tracing::info!(address = %addr, "Starting gRPC server");

    tonic::transport::Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(20)))
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .add_service(AgentHubServer::new(svc))
        .serve_with_shutdown(addr, shutdown.cancelled())
        .await?;

    Ok(())
}

// `AgentStatus` is ambiguous between the wire enum generated from
// `hub.proto` and `registry::AgentStatus`; this alias keeps the match
// arms above readable without a module-qualified path on every line.
use api::gen::api::v1::AgentStatus as AgentStatus2;

#[cfg(test)]
mod tests {
    use super::*;
    use api::gen::api::v1::Capability as Capability2;
    use graph_store::memory::InMemoryStore;
    use message_bus::memory::InMemoryBroker;
    use std::collections::HashMap as Map;

    fn test_svc() -> HubSvc {
        let registry = Arc::new(AgentRegistry::new(Arc::new(InMemoryStore::new())));
        let bus = Arc::new(RoutingBus::new(Arc::new(InMemoryBroker::new())));
        let streams = Arc::new(ActiveStreams::new());
        let metrics = Arc::new(Metrics::new());
        HubSvc::new(registry, bus, streams, metrics)
    }

    fn capability(name: &str) -> Capability2 {
        Capability2 {
            name: name.to_owned(),
            description: String::new(),
            parameters: Map::new(),
        }
    }

    #[tokio::test]
    async fn register_agent_rejects_empty_capabilities() {
        let svc = test_svc();
        let req = Request::new(RegisterAgentRequest {
            agent_id: "a1".into(),
            name: "Agent".into(),
            r#type: String::new(),
            capabilities: vec![],
            version: String::new(),
            max_concurrent_work: 0,
            metadata: Map::new(),
        });
        let err = svc.register_agent(req).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn register_then_send_instruction_reaches_agent_queue() {
        let svc = test_svc();
        svc.register_agent(Request::new(RegisterAgentRequest {
            agent_id: "a1".into(),
            name: "Agent".into(),
            r#type: String::new(),
            capabilities: vec![capability("word-count")],
            version: String::new(),
            max_concurrent_work: 0,
            metadata: Map::new(),
        }))
        .await
        .unwrap();

        let resp = svc
            .send_instruction(Request::new(SendInstructionRequest {
                agent_id: "a1".into(),
                instruction_id: "i1".into(),
                capability: "word-count".into(),
                content: "count this".into(),
                parameters: Map::new(),
                correlation_id: "c1".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.success);

        let mut rx = svc.bus.subscribe("a1").await.unwrap();
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.correlation_id, "c1");
    }

    #[tokio::test]
    async fn heartbeat_unknown_agent_is_not_found() {
        let svc = test_svc();
        let err = svc
            .heartbeat(Request::new(HeartbeatRequest {
                agent_id: "ghost".into(),
                status: AgentStatus2::Healthy as i32,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn update_agent_status_rejects_unknown_wire_status() {
        let svc = test_svc();
        svc.register_agent(Request::new(RegisterAgentRequest {
            agent_id: "a1".into(),
            name: "Agent".into(),
            r#type: String::new(),
            capabilities: vec![capability("word-count")],
            version: String::new(),
            max_concurrent_work: 0,
            metadata: Map::new(),
        }))
        .await
        .unwrap();

        let err = svc
            .update_agent_status(Request::new(UpdateAgentStatusRequest {
                agent_id: "a1".into(),
                status: AgentStatus2::Unknown as i32,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
