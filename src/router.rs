//! Session router: the single entry point for client connections.
//!
//! The router owns the session-id → current-agent mapping. A handoff is a
//! single transaction per session, guarded by a per-session async lock: the
//! old executor is stopped (closing its stream) strictly before the new one
//! opens, so no session ever has two live streams. The router never
//! auto-retries a failed handoff; its only automatic behavior is enforcing
//! the handoff ceiling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ClientConnection, ClientMessage, ServerMessage};
use crate::error::{Result, SwitchboardError};
use crate::executor::{spawn_executor, ExecutorContext, ExecutorHandle};
use crate::handoff::{HandoffRecord, HandoffRequest};
use crate::memory::SessionMemory;
use crate::session::{Session, SessionId};

struct SessionSlot {
    executor: Option<ExecutorHandle>,
}

struct SessionEntry {
    meta: Mutex<Session>,
    /// Per-session transaction lock: handoffs and input forwarding
    /// serialize on it, sessions never block each other.
    slot: tokio::sync::Mutex<SessionSlot>,
    client_tx: mpsc::Sender<ServerMessage>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Routes client connections to agent executors and processes handoffs.
pub struct SessionRouter {
    ctx: ExecutorContext,
    sessions: Mutex<HashMap<SessionId, Arc<SessionEntry>>>,
    handoff_tx: mpsc::Sender<HandoffRequest>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionRouter {
    /// Builds the router and starts its background tasks (handoff consumer
    /// and idle sweep).
    pub fn new(ctx: ExecutorContext) -> Arc<Self> {
        let (handoff_tx, handoff_rx) = mpsc::channel(ctx.config.channel_buffer);
        let router = Arc::new(Self {
            ctx,
            sessions: Mutex::new(HashMap::new()),
            handoff_tx,
            background: Mutex::new(Vec::new()),
        });

        let consumer = tokio::spawn(consume_handoffs(Arc::downgrade(&router), handoff_rx));
        let sweeper = tokio::spawn(sweep_idle(Arc::downgrade(&router)));
        router.background.lock().unwrap().extend([consumer, sweeper]);

        router
    }

    /// Accepts a client connection: creates a session, assigns the entry
    /// agent (or the client's `select_agent` role when healthy), and
    /// bridges the connection.
    pub async fn accept_connection(self: &Arc<Self>, client: ClientConnection) -> Result<SessionId> {
        let ClientConnection {
            mut inbound,
            outbound,
        } = client;

        // The first inbound message is normally `connect`; anything else is
        // treated as an implicit connect and forwarded once the executor is
        // up.
        let (select_agent, carry_over) = match inbound.recv().await {
            Some(ClientMessage::Connect { select_agent }) => (select_agent, None),
            Some(other) => (None, Some(other)),
            None => {
                return Err(SwitchboardError::Other(
                    "client disconnected before connect".to_string(),
                ))
            }
        };

        let descriptor = match select_agent {
            Some(role) => match self.ctx.registry.resolve_healthy(&role) {
                Ok(descriptor) => descriptor,
                // Unknown or unhealthy selection falls back to the entry role.
                Err(_) => self.ctx.registry.resolve_entry()?,
            },
            None => self.ctx.registry.resolve_entry()?,
        };

        let session_id = SessionId::generate();
        let memory = self
            .ctx
            .store
            .get(&session_id)
            .await?
            .unwrap_or_default();

        // Confirm the connection before the executor can start streaming,
        // so `connected` is always the first frame a client sees.
        let _ = outbound
            .send(ServerMessage::Connected {
                session_id: session_id.clone(),
                agent_id: descriptor.agent_id.clone(),
            })
            .await;

        let executor = spawn_executor(
            &self.ctx,
            session_id.clone(),
            descriptor.clone(),
            memory,
            outbound.clone(),
            self.handoff_tx.clone(),
        )
        .await?;

        let entry = Arc::new(SessionEntry {
            meta: Mutex::new(Session::new(session_id.clone(), &descriptor.agent_id)),
            slot: tokio::sync::Mutex::new(SessionSlot {
                executor: Some(executor),
            }),
            client_tx: outbound.clone(),
            pump: Mutex::new(None),
        });

        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.clone(), entry.clone());

        if let Some(message) = carry_over {
            forward_to_owner(&entry, message).await;
        }

        let pump = tokio::spawn(pump_client(
            Arc::downgrade(self),
            session_id.clone(),
            entry.clone(),
            inbound,
        ));
        *entry.pump.lock().unwrap() = Some(pump);

        info!(session = %session_id, agent = %descriptor.agent_id, "connection accepted");
        Ok(session_id)
    }

    /// Processes one handoff request as a single per-session transaction.
    pub async fn handle_handoff_request(&self, req: HandoffRequest) -> Result<()> {
        let entry = self
            .sessions
            .lock()
            .unwrap()
            .get(&req.session_id)
            .cloned()
            .ok_or_else(|| SwitchboardError::SessionNotFound {
                session_id: req.session_id.clone(),
            })?;

        let mut slot = entry.slot.lock().await;

        // Only the current owner may hand the session off; a request from a
        // superseded executor is stale.
        let owner_ok = slot
            .executor
            .as_ref()
            .map(|e| e.agent_id == req.requested_by)
            .unwrap_or(false);
        if !owner_ok {
            return Err(SwitchboardError::HandoffRejected {
                reason: format!(
                    "agent '{}' does not own session {}",
                    req.requested_by, req.session_id
                ),
            });
        }

        let (count, from_agent_id) = {
            let meta = entry.meta.lock().unwrap();
            (meta.handoff_count, meta.current_agent_id.clone())
        };
        if count >= self.ctx.config.max_handoffs {
            warn!(session = %req.session_id, count, "handoff ceiling reached");
            notify_client(
                &entry,
                ServerMessage::degraded(
                    "handoff_limit",
                    "I can't transfer you again on this call, but I'll do my best to help from here.",
                ),
            );
            return Err(SwitchboardError::CircuitOpen {
                session_id: req.session_id.clone(),
                count,
            });
        }

        // Resolve the target before anything irreversible happens; a failed
        // resolution leaves the session on its current agent with its
        // handoff count unchanged.
        let descriptor = match self.ctx.registry.resolve_healthy(&req.target_role) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                // The snapshot still merges: tool results carried in it
                // must not be lost to an unlucky target outage.
                if !req.context_snapshot.is_empty() {
                    self.ctx
                        .store
                        .merge(
                            &req.session_id,
                            req.context_snapshot.clone(),
                            self.ctx.config.memory_ttl,
                        )
                        .await?;
                }
                notify_client(
                    &entry,
                    ServerMessage::degraded(
                        "no_healthy_agent",
                        "That team isn't available right now. Please try again in a moment.",
                    ),
                );
                return Err(e);
            }
        };

        // Merge the carried context and the transfer breadcrumb before the
        // new agent renders its instructions.
        let record = HandoffRecord::new(&from_agent_id, &descriptor.agent_id)
            .with_reason(req.reason.clone())
            .failed(req.failed);
        let patch = {
            let mut patch = req.context_snapshot.clone();
            patch.handoff_records.push(record);
            patch
        };
        self.ctx
            .store
            .merge(&req.session_id, patch, self.ctx.config.memory_ttl)
            .await?;

        // Ownership transfer: the old stream closes before the new opens.
        if let Some(old) = slot.executor.take() {
            old.shutdown().await;
        }

        let memory: SessionMemory = self
            .ctx
            .store
            .get(&req.session_id)
            .await?
            .unwrap_or_default();

        let executor = match spawn_executor(
            &self.ctx,
            req.session_id.clone(),
            descriptor.clone(),
            memory,
            entry.client_tx.clone(),
            self.handoff_tx.clone(),
        )
        .await
        {
            Ok(executor) => executor,
            Err(e) => {
                notify_client(
                    &entry,
                    ServerMessage::degraded(
                        "no_healthy_agent",
                        "That team isn't available right now. Please try again in a moment.",
                    ),
                );
                return Err(e);
            }
        };
        slot.executor = Some(executor);

        {
            let mut meta = entry.meta.lock().unwrap();
            meta.handoff_count += 1;
            meta.current_agent_id = descriptor.agent_id.clone();
            meta.touch();
        }

        info!(
            session = %req.session_id,
            from = %from_agent_id,
            to = %descriptor.agent_id,
            failed = req.failed,
            "handoff completed"
        );

        notify_client(
            &entry,
            ServerMessage::HandoffNotice {
                from_agent: from_agent_id,
                to_agent: descriptor.agent_id,
            },
        );

        Ok(())
    }

    /// Releases a session on disconnect. Routing state is cleared; session
    /// memory is left to expire via its TTL so a quick reconnect can still
    /// find it.
    pub async fn release_session(&self, session_id: &SessionId) {
        let entry = self.sessions.lock().unwrap().remove(session_id);
        let Some(entry) = entry else { return };

        if let Some(pump) = entry.pump.lock().unwrap().take() {
            pump.abort();
        }
        let mut slot = entry.slot.lock().await;
        if let Some(executor) = slot.executor.take() {
            executor.shutdown().await;
        }
        self.ctx.dispatcher.forget_session(session_id);
        info!(session = %session_id, "session released");
    }

    /// Current routing view of a session, for observability and tests.
    pub fn session_info(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|entry| entry.meta.lock().unwrap().clone())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn idle_sessions(&self) -> Vec<SessionId> {
        let idle_timeout = self.ctx.config.idle_timeout;
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.meta.lock().unwrap().is_idle(idle_timeout))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl Drop for SessionRouter {
    fn drop(&mut self) {
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SessionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRouter")
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

/// Client-bound sends from the shared handoff consumer never block: a
/// client that stopped draining loses the frame instead of wedging every
/// other session's handoffs behind it.
fn notify_client(entry: &SessionEntry, message: ServerMessage) {
    if let Err(e) = entry.client_tx.try_send(message) {
        debug!(error = %e, "client notification dropped");
    }
}

async fn forward_to_owner(entry: &SessionEntry, message: ClientMessage) {
    let slot = entry.slot.lock().await;
    if let Some(executor) = &slot.executor {
        executor.forward(message).await;
    }
}

/// Pumps client inbound messages to whichever executor currently owns the
/// session. Exits (and releases the session) when the client goes away.
async fn pump_client(
    router: Weak<SessionRouter>,
    session_id: SessionId,
    entry: Arc<SessionEntry>,
    mut inbound: mpsc::Receiver<ClientMessage>,
) {
    while let Some(message) = inbound.recv().await {
        entry.meta.lock().unwrap().touch();
        forward_to_owner(&entry, message).await;
    }

    debug!(session = %session_id, "client disconnected");
    if let Some(router) = router.upgrade() {
        router.release_session(&session_id).await;
    }
}

/// Consumes handoff requests from executors. Failures are logged; errors
/// are surfaced to the client inside `handle_handoff_request`, and the
/// router never retries on its own.
async fn consume_handoffs(router: Weak<SessionRouter>, mut rx: mpsc::Receiver<HandoffRequest>) {
    while let Some(req) = rx.recv().await {
        let Some(router) = router.upgrade() else { return };
        if let Err(e) = router.handle_handoff_request(req).await {
            warn!(error = %e, "handoff request failed");
        }
    }
}

/// Background sweep reaping idle sessions off the request path.
async fn sweep_idle(router: Weak<SessionRouter>) {
    let interval = {
        let Some(router) = router.upgrade() else { return };
        router.ctx.config.sweep_interval
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(router) = router.upgrade() else { return };
        for session_id in router.idle_sessions() {
            info!(session = %session_id, "reaping idle session");
            router.release_session(&session_id).await;
        }
    }
}
