//! Per-session agent execution core.
//!
//! One executor serves one session on behalf of one agent at a time. It
//! owns the composed instructions and the live adapter stream, forwards
//! transcripts to the client, intercepts tool-use events (handoff vs.
//! domain), suppresses duplicates, runs domain tools concurrently, and
//! emits handoff requests for the router to consume.
//!
//! Per-session state machine:
//! `Init → ContextLoaded → Streaming ⇄ AwaitingToolResult* →
//! (HandoffRequested | Terminated)`. Several tool calls may be outstanding
//! at once; each resolves independently back to `Streaming`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{InferenceConnector, SessionAdapter};
use crate::client::{ClientMessage, ServerMessage};
use crate::config::RouterConfig;
use crate::context::render_instructions;
use crate::dispatch::{classify, normalize_params, ToolClass, ToolDispatcher};
use crate::error::Result;
use crate::events::{
    blocked_duplicate_payload, failed_tool_payload, SpeakerRole, StreamConfig, StreamEvent,
    StreamInput,
};
use crate::handoff::HandoffRequest;
use crate::memory::{MemoryPatch, SessionMemory, SessionStore, ToolCallRecord};
use crate::registry::{AgentDescriptor, AgentRegistry};
use crate::session::SessionId;
use crate::tool_service::{ToolExecutor, ToolOutcome};

/// Lifecycle of one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Init,
    ContextLoaded,
    Streaming,
    /// At least one tool call is outstanding.
    AwaitingToolResult,
    /// A handoff request was emitted; awaiting router teardown.
    HandoffRequested,
    Terminated,
}

/// Shared services every executor needs, bundled once at startup.
#[derive(Clone)]
pub struct ExecutorContext {
    pub registry: Arc<AgentRegistry>,
    pub store: Arc<dyn SessionStore>,
    pub tools: Arc<dyn ToolExecutor>,
    pub connector: Arc<dyn InferenceConnector>,
    pub dispatcher: ToolDispatcher,
    pub config: Arc<RouterConfig>,
}

impl std::fmt::Debug for ExecutorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorContext")
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Handle the router keeps on a running executor.
#[derive(Debug)]
pub struct ExecutorHandle {
    pub agent_id: String,
    pub role: String,
    input_tx: mpsc::Sender<ClientMessage>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    state: Arc<Mutex<ExecutorState>>,
    task: JoinHandle<()>,
}

impl ExecutorHandle {
    /// Forwards a client message into the executor's loop. Returns false
    /// once the executor has gone away.
    pub async fn forward(&self, message: ClientMessage) -> bool {
        self.input_tx.send(message).await.is_ok()
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.lock().unwrap()
    }

    /// Stops the executor and waits until its adapter stream is closed.
    ///
    /// Completion of this future is the ownership boundary: the caller may
    /// only open a successor stream after it resolves.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

/// Spawns an executor for `descriptor` serving `session_id`.
///
/// Rehydration happens here: the instructions are rendered from `memory`
/// with memory-derived facts ahead of the persona/workflow text, and only
/// then is the stream opened with those instructions.
pub async fn spawn_executor(
    ctx: &ExecutorContext,
    session_id: SessionId,
    descriptor: AgentDescriptor,
    memory: SessionMemory,
    client_tx: mpsc::Sender<ServerMessage>,
    handoff_tx: mpsc::Sender<HandoffRequest>,
) -> Result<ExecutorHandle> {
    let state = Arc::new(Mutex::new(ExecutorState::Init));

    // Facts precede the instruction text that references them.
    let instructions = render_instructions(&descriptor, &memory);
    *state.lock().unwrap() = ExecutorState::ContextLoaded;

    let mut adapter = SessionAdapter::start(
        ctx.connector.as_ref(),
        &descriptor.endpoint,
        StreamConfig {
            system_instructions: instructions,
            voice_profile: descriptor.voice_profile.clone(),
        },
    )
    .await?;
    let events = adapter
        .take_events()
        .expect("freshly started adapter has its event stream");

    let (input_tx, input_rx) = mpsc::channel(ctx.config.channel_buffer);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    info!(session = %session_id, agent = %descriptor.agent_id, "executor starting");

    let worker = ExecutorWorker {
        ctx: ctx.clone(),
        session_id,
        descriptor: descriptor.clone(),
        adapter,
        client_tx,
        handoff_tx,
        state: state.clone(),
        pending: HashMap::new(),
        intent_recorded: memory.original_intent.is_some(),
        handoff_emitted: false,
    };
    let task = tokio::spawn(worker.run(events, input_rx, shutdown_rx));

    Ok(ExecutorHandle {
        agent_id: descriptor.agent_id,
        role: descriptor.role,
        input_tx,
        shutdown_tx: Some(shutdown_tx),
        state,
        task,
    })
}

struct ToolCompletion {
    call_id: String,
    tool_name: String,
    outcome: ToolOutcome,
}

struct ExecutorWorker {
    ctx: ExecutorContext,
    session_id: SessionId,
    descriptor: AgentDescriptor,
    adapter: SessionAdapter,
    client_tx: mpsc::Sender<ServerMessage>,
    handoff_tx: mpsc::Sender<HandoffRequest>,
    state: Arc<Mutex<ExecutorState>>,
    pending: HashMap<String, String>,
    intent_recorded: bool,
    handoff_emitted: bool,
}

impl ExecutorWorker {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<StreamEvent>,
        mut input_rx: mpsc::Receiver<ClientMessage>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        self.set_state(ExecutorState::Streaming);
        let (completion_tx, mut completion_rx) = mpsc::channel::<ToolCompletion>(32);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(session = %self.session_id, "executor shutdown requested");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if self.handle_stream_event(event, &completion_tx).await {
                                break;
                            }
                        }
                        None => {
                            debug!(session = %self.session_id, "event stream closed by service");
                            break;
                        }
                    }
                }
                Some(message) = input_rx.recv() => {
                    self.handle_client_message(message).await;
                }
                Some(completion) = completion_rx.recv() => {
                    self.handle_tool_completion(completion).await;
                }
            }
        }

        self.adapter.stop().await;
        if !self.handoff_emitted {
            self.set_state(ExecutorState::Terminated);
        }
        info!(session = %self.session_id, agent = %self.descriptor.agent_id, "executor stopped");
    }

    fn set_state(&self, state: ExecutorState) {
        *self.state.lock().unwrap() = state;
    }

    fn settle_streaming_state(&self) {
        if self.handoff_emitted {
            return;
        }
        self.set_state(if self.pending.is_empty() {
            ExecutorState::Streaming
        } else {
            ExecutorState::AwaitingToolResult
        });
    }

    /// Returns true when the loop should stop.
    async fn handle_stream_event(
        &mut self,
        event: StreamEvent,
        completion_tx: &mpsc::Sender<ToolCompletion>,
    ) -> bool {
        match event {
            StreamEvent::PartialTranscript { text } => {
                self.send_client(ServerMessage::Transcript {
                    role: SpeakerRole::Assistant,
                    text,
                    is_final: false,
                });
                false
            }
            StreamEvent::FinalTranscript { text, role } => {
                self.record_intent_once(role, &text).await;
                self.send_client(ServerMessage::Transcript {
                    role,
                    text,
                    is_final: true,
                });
                false
            }
            StreamEvent::ToolUseRequested { id, name, params } => {
                self.handle_tool_use(id, name, params, completion_tx).await;
                false
            }
            StreamEvent::StreamEnded => {
                debug!(session = %self.session_id, "inference stream ended");
                true
            }
            StreamEvent::StreamError { message } => {
                warn!(session = %self.session_id, error = %message, "inference stream error");
                self.send_client(ServerMessage::degraded(
                    "stream_error",
                    "Sorry, something went wrong with this call. Please try again.",
                ));
                true
            }
        }
    }

    async fn handle_client_message(&mut self, message: ClientMessage) {
        let input = match message {
            ClientMessage::AudioChunk { bytes } => StreamInput::Audio { bytes },
            ClientMessage::TextInput { text } => {
                self.record_intent_from_text(&text).await;
                StreamInput::Text { text }
            }
            ClientMessage::Connect { .. } => return,
        };
        if let Err(e) = self.adapter.send_input(input).await {
            warn!(session = %self.session_id, error = %e, "dropping client input");
        }
    }

    async fn handle_tool_use(
        &mut self,
        call_id: String,
        name: String,
        params: Value,
        completion_tx: &mpsc::Sender<ToolCompletion>,
    ) {
        if self.handoff_emitted {
            // A handoff is already in flight; this turn is over. Still
            // answer the call so the stream is never left waiting.
            let _ = self
                .adapter
                .send_tool_result(&call_id, blocked_duplicate_payload())
                .await;
            return;
        }

        match classify(&name, &self.ctx.registry) {
            ToolClass::Handoff { target_role } => {
                self.emit_handoff(call_id, target_role, params).await;
            }
            ToolClass::Domain => {
                self.execute_domain_tool(call_id, name, params, completion_tx)
                    .await;
            }
        }
    }

    async fn emit_handoff(&mut self, call_id: String, target_role: String, params: Value) {
        let reason = params
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string);

        // Answer the tool call first so the stream is never left waiting,
        // then stop local turn processing.
        let ack = serde_json::json!({"handoff": target_role, "ack": true});
        if let Err(e) = self.adapter.send_tool_result(&call_id, ack).await {
            debug!(session = %self.session_id, error = %e, "handoff ack not delivered");
        }

        let mut snapshot = snapshot_from_params(&params);
        if !self.intent_recorded {
            // Nothing recorded yet; carry whatever the model distilled.
            if let Some(reason) = &reason {
                snapshot.original_intent = Some(reason.clone());
            }
        }

        let mut request =
            HandoffRequest::new(self.session_id.clone(), &self.descriptor.agent_id, target_role)
                .with_snapshot(snapshot);
        if let Some(reason) = reason {
            request = request.with_reason(reason);
        }

        info!(
            session = %self.session_id,
            from = %self.descriptor.agent_id,
            to_role = %request.target_role,
            "handoff requested"
        );
        self.handoff_emitted = true;
        self.set_state(ExecutorState::HandoffRequested);
        let _ = self.handoff_tx.send(request).await;
    }

    async fn emit_failed_handoff(&mut self, tool_name: &str) {
        let entry_role = self.ctx.registry.entry_role().to_string();
        let request = HandoffRequest::new(
            self.session_id.clone(),
            &self.descriptor.agent_id,
            entry_role,
        )
        .with_reason(format!("verification failed: {} attempts exhausted", tool_name))
        .failed();

        warn!(
            session = %self.session_id,
            tool = tool_name,
            "verification ceiling reached, handing back to entry agent"
        );
        self.handoff_emitted = true;
        self.set_state(ExecutorState::HandoffRequested);
        let _ = self.handoff_tx.send(request).await;
    }

    async fn execute_domain_tool(
        &mut self,
        call_id: String,
        name: String,
        params: Value,
        completion_tx: &mpsc::Sender<ToolCompletion>,
    ) {
        let is_verification = self.descriptor.is_verification_tool(&name);

        // Attempts ceiling short-circuits before anything else: a tool that
        // already burned its attempts never reaches execution again.
        if is_verification && self.ctx.dispatcher.attempts_exhausted(&self.session_id, &name) {
            let _ = self
                .adapter
                .send_tool_result(&call_id, failed_tool_payload("verification attempts exhausted"))
                .await;
            self.emit_failed_handoff(&name).await;
            return;
        }

        if self
            .ctx
            .dispatcher
            .check_duplicate(&self.session_id, &name, &params)
        {
            let _ = self
                .adapter
                .send_tool_result(&call_id, blocked_duplicate_payload())
                .await;
            return;
        }

        self.pending.insert(call_id.clone(), name.clone());
        self.settle_streaming_state();

        let tools = self.ctx.tools.clone();
        let store = self.ctx.store.clone();
        let session_id = self.session_id.clone();
        let ttl = self.ctx.config.memory_ttl;
        let completion_tx = completion_tx.clone();
        let normalized = normalize_params(&params);

        tokio::spawn(async move {
            let outcome = match tools.execute(&name, params).await {
                Ok(outcome) => outcome,
                Err(e) => ToolOutcome::failed(e.to_string()),
            };

            // The result lands in memory even if the executor (or its
            // stream) is gone by now, so a future context render sees it.
            let record = ToolCallRecord {
                tool_name: name.clone(),
                normalized_params: normalized,
                timestamp: chrono::Utc::now(),
                result: Some(outcome.payload.clone()),
            };
            let mut patch = MemoryPatch::default().tool_call(record);
            if outcome.success {
                if let Some(identity) = outcome
                    .payload
                    .get("verified_identity")
                    .and_then(Value::as_str)
                {
                    patch.verified_identity = Some(identity.to_string());
                }
            }
            if let Err(e) = store.merge(&session_id, patch, ttl).await {
                warn!(session = %session_id, error = %e, "tool result not persisted");
            }

            let _ = completion_tx
                .send(ToolCompletion {
                    call_id,
                    tool_name: name,
                    outcome,
                })
                .await;
        });
    }

    async fn handle_tool_completion(&mut self, completion: ToolCompletion) {
        self.pending.remove(&completion.call_id);

        let is_verification = self
            .descriptor
            .is_verification_tool(&completion.tool_name);
        let failed_verification = is_verification && !completion.outcome.success;

        // Feed the result back into the still-open stream; when the stream
        // already closed this is a no-op (memory was written by the task).
        if !self.adapter.is_closed() {
            if let Err(e) = self
                .adapter
                .send_tool_result(&completion.call_id, completion.outcome.payload.clone())
                .await
            {
                debug!(session = %self.session_id, error = %e, "tool result not streamed");
            }
        }

        if failed_verification {
            let attempts = self
                .ctx
                .dispatcher
                .record_failed_attempt(&self.session_id, &completion.tool_name);
            if attempts >= self.ctx.config.max_verification_attempts {
                self.emit_failed_handoff(&completion.tool_name).await;
                return;
            }
        }

        self.settle_streaming_state();
    }

    async fn record_intent_once(&mut self, role: SpeakerRole, text: &str) {
        if role == SpeakerRole::User {
            self.record_intent_from_text(text).await;
        }
    }

    async fn record_intent_from_text(&mut self, text: &str) {
        if self.intent_recorded || text.trim().is_empty() {
            return;
        }
        self.intent_recorded = true;
        let patch = MemoryPatch::default().original_intent(text.trim());
        if let Err(e) = self
            .ctx
            .store
            .merge(&self.session_id, patch, self.ctx.config.memory_ttl)
            .await
        {
            warn!(session = %self.session_id, error = %e, "original intent not persisted");
        }
    }

    /// A client that stops draining its channel loses messages rather than
    /// wedging executor teardown behind a full buffer.
    fn send_client(&self, message: ServerMessage) {
        if let Err(e) = self.client_tx.try_send(message) {
            debug!(session = %self.session_id, error = %e, "client message dropped");
        }
    }
}

/// Lifts handoff-tool params into a memory patch. Recognized shape:
/// `{"context": {"verified_identity": ..., "original_intent": ...}}`.
fn snapshot_from_params(params: &Value) -> MemoryPatch {
    let mut patch = MemoryPatch::default();
    if let Some(context) = params.get("context") {
        if let Some(identity) = context.get("verified_identity").and_then(Value::as_str) {
            patch.verified_identity = Some(identity.to_string());
        }
        if let Some(intent) = context.get("original_intent").and_then(Value::as_str) {
            patch.original_intent = Some(intent.to_string());
        }
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::scripted::{ConnectorLog, ScriptStep, ScriptedConnector, StreamInputKind};
    use crate::memory::InMemorySessionStore;
    use crate::registry::AgentDescriptor;
    use crate::tool_service::FnToolExecutor;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn test_registry() -> Arc<AgentRegistry> {
        Arc::new(
            AgentRegistry::builder()
                .agent(AgentDescriptor::new("triage-1", "triage", "You route calls."))
                .agent(
                    AgentDescriptor::new("verify-1", "verification", "You verify identity.")
                        .with_tools(vec!["verify_identity".to_string()])
                        .with_verification_tools(vec!["verify_identity".to_string()]),
                )
                .agent(
                    AgentDescriptor::new("banking-1", "banking", "You answer account questions.")
                        .with_tools(vec!["lookup_balance".to_string()]),
                )
                .entry_role("triage")
                .build(),
        )
    }

    fn test_ctx(connector: ScriptedConnector, tools: FnToolExecutor) -> ExecutorContext {
        let config = Arc::new(RouterConfig::default());
        ExecutorContext {
            registry: test_registry(),
            store: Arc::new(InMemorySessionStore::new()),
            tools: Arc::new(tools),
            connector: Arc::new(connector),
            dispatcher: ToolDispatcher::new(config.dedup_window, config.max_verification_attempts),
            config,
        }
    }

    async fn spawn_for(
        ctx: &ExecutorContext,
        role: &str,
        session: &str,
    ) -> (
        ExecutorHandle,
        mpsc::Receiver<ServerMessage>,
        mpsc::Receiver<HandoffRequest>,
    ) {
        let (client_tx, client_rx) = mpsc::channel(32);
        let (handoff_tx, handoff_rx) = mpsc::channel(8);
        let descriptor = ctx.registry.resolve_healthy(role).unwrap();
        let handle = spawn_executor(
            ctx,
            SessionId::from(session),
            descriptor,
            SessionMemory::default(),
            client_tx,
            handoff_tx,
        )
        .await
        .unwrap();
        (handle, client_rx, handoff_rx)
    }

    #[tokio::test]
    async fn test_transcripts_forward_with_is_final() {
        let connector = ScriptedConnector::new(vec![vec![
            ScriptStep::Emit(StreamEvent::PartialTranscript {
                text: "work".to_string(),
            }),
            ScriptStep::Emit(StreamEvent::FinalTranscript {
                text: "working on it".to_string(),
                role: SpeakerRole::Assistant,
            }),
        ]]);
        let ctx = test_ctx(connector, FnToolExecutor::new());
        let (handle, mut client_rx, _handoff_rx) = spawn_for(&ctx, "triage", "s-1").await;

        match client_rx.recv().await.unwrap() {
            ServerMessage::Transcript { is_final, text, .. } => {
                assert!(!is_final);
                assert_eq!(text, "work");
            }
            other => panic!("unexpected message {:?}", other),
        }
        match client_rx.recv().await.unwrap() {
            ServerMessage::Transcript { is_final, .. } => assert!(is_final),
            other => panic!("unexpected message {:?}", other),
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_handoff_tool_emits_request_and_ack() {
        let connector = ScriptedConnector::new(vec![vec![ScriptStep::Emit(
            StreamEvent::ToolUseRequested {
                id: "call_1".to_string(),
                name: "transfer_to_banking".to_string(),
                params: json!({"reason": "balance question"}),
            },
        )]]);
        let log_handle = connector.clone();
        let ctx = test_ctx(connector, FnToolExecutor::new());
        let (handle, _client_rx, mut handoff_rx) = spawn_for(&ctx, "triage", "s-1").await;

        let request = handoff_rx.recv().await.unwrap();
        assert_eq!(request.target_role, "banking");
        assert_eq!(request.requested_by, "triage-1");
        assert_eq!(request.reason.as_deref(), Some("balance question"));
        assert_eq!(handle.state(), ExecutorState::HandoffRequested);

        // The handoff call itself was answered on the stream.
        let acked = log_handle.log().iter().any(|entry| {
            matches!(
                entry,
                ConnectorLog::Input {
                    frame: StreamInputKind::ToolResult { id, .. },
                    ..
                } if id == "call_1"
            )
        });
        assert!(acked);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_domain_tool_result_feeds_stream_and_memory() {
        let connector = ScriptedConnector::new(vec![vec![
            ScriptStep::Emit(StreamEvent::ToolUseRequested {
                id: "call_1".to_string(),
                name: "lookup_balance".to_string(),
                params: json!({"account": "123"}),
            }),
            ScriptStep::EchoToolResultAsFinal {
                prefix: "Your balance: ".to_string(),
            },
        ]]);
        let tools = FnToolExecutor::new().register("lookup_balance", |_| {
            Ok(json!({"balance": 1234.56}))
        });
        let ctx = test_ctx(connector, tools);
        let (handle, mut client_rx, _handoff_rx) = spawn_for(&ctx, "banking", "s-1").await;

        match client_rx.recv().await.unwrap() {
            ServerMessage::Transcript { text, is_final, .. } => {
                assert!(is_final);
                assert!(text.contains("1234.56"));
            }
            other => panic!("unexpected message {:?}", other),
        }

        let memory = ctx
            .store
            .get(&SessionId::from("s-1"))
            .await
            .unwrap()
            .unwrap();
        let record = &memory.last_tool_calls["lookup_balance"];
        assert_eq!(record.result.as_ref().unwrap()["balance"], 1234.56);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_call_answered_with_blocked_result() {
        let connector = ScriptedConnector::new(vec![vec![
            ScriptStep::Emit(StreamEvent::ToolUseRequested {
                id: "call_1".to_string(),
                name: "lookup_balance".to_string(),
                params: json!({"account": "123"}),
            }),
            ScriptStep::AwaitToolResult,
            ScriptStep::Emit(StreamEvent::ToolUseRequested {
                id: "call_2".to_string(),
                name: "lookup_balance".to_string(),
                params: json!({"account": "123"}),
            }),
        ]]);
        let log_handle = connector.clone();
        let executed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let executed_in_tool = executed.clone();
        let tools = FnToolExecutor::new().register("lookup_balance", move |_| {
            executed_in_tool.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(json!({"balance": 10}))
        });
        let ctx = test_ctx(connector, tools);
        let (handle, _client_rx, _handoff_rx) = spawn_for(&ctx, "banking", "s-1").await;

        // Wait until the duplicate has been answered on the stream.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let answered = log_handle.log().iter().any(|entry| {
                matches!(
                    entry,
                    ConnectorLog::Input {
                        frame: StreamInputKind::ToolResult { id, payload },
                        ..
                    } if id == "call_2" && payload["blocked"] == true
                )
            });
            if answered {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "duplicate never answered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(executed.load(std::sync::atomic::Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_verification_ceiling_emits_failed_handoff() {
        let connector = ScriptedConnector::new(vec![vec![
            ScriptStep::Emit(StreamEvent::ToolUseRequested {
                id: "call_1".to_string(),
                name: "verify_identity".to_string(),
                params: json!({"code": "1111"}),
            }),
            ScriptStep::AwaitToolResult,
            ScriptStep::Emit(StreamEvent::ToolUseRequested {
                id: "call_2".to_string(),
                name: "verify_identity".to_string(),
                params: json!({"code": "2222"}),
            }),
            ScriptStep::AwaitToolResult,
            ScriptStep::Emit(StreamEvent::ToolUseRequested {
                id: "call_3".to_string(),
                name: "verify_identity".to_string(),
                params: json!({"code": "3333"}),
            }),
            // Keep the stream open until the third failure is answered.
            ScriptStep::AwaitToolResult,
        ]]);
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let attempts_in_tool = attempts.clone();
        let tools = FnToolExecutor::new().register("verify_identity", move |_| {
            attempts_in_tool.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(crate::error::SwitchboardError::ToolExecution {
                message: "incorrect credentials".to_string(),
            })
        });
        let ctx = test_ctx(connector, tools);
        let (handle, _client_rx, mut handoff_rx) = spawn_for(&ctx, "verification", "s-1").await;

        let request = handoff_rx.recv().await.unwrap();
        assert!(request.failed);
        assert_eq!(request.target_role, "triage");
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_adapter_stream() {
        let connector = ScriptedConnector::new(vec![vec![]]);
        let log_handle = connector.clone();
        let ctx = test_ctx(connector, FnToolExecutor::new());
        let (handle, _client_rx, _handoff_rx) = spawn_for(&ctx, "triage", "s-1").await;

        handle.shutdown().await;
        assert_eq!(log_handle.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_first_user_text_becomes_original_intent() {
        let connector = ScriptedConnector::new(vec![vec![ScriptStep::AwaitAnyInput]]);
        let ctx = test_ctx(connector, FnToolExecutor::new());
        let (handle, _client_rx, _handoff_rx) = spawn_for(&ctx, "triage", "s-1").await;

        handle
            .forward(ClientMessage::TextInput {
                text: "check my balance".to_string(),
            })
            .await;

        // Poll until the merge lands; the write happens inside the loop.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(memory) = ctx.store.get(&SessionId::from("s-1")).await.unwrap() {
                if memory.original_intent.as_deref() == Some("check my balance") {
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "intent never recorded");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown().await;
    }
}
