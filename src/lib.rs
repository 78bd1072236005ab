//! # Switchboard
//!
//! Session routing and agent handoff orchestration for streaming
//! multi-agent assistants. A [`SessionRouter`] directs each live user
//! session to one of several specialized agents, each backed by a
//! bidirectional stream to an inference service, and moves sessions
//! between agents mid-conversation without ever letting two agents hold a
//! session's stream at once.
//!
//! ## Core Concepts
//!
//! - **Router**: the single entry point for client connections; owns the
//!   session → agent mapping and processes handoff requests as atomic
//!   per-session transactions, under a per-session handoff ceiling.
//! - **Executor**: the per-session agent execution core; composes
//!   instructions (memory facts first), drives the adapter stream,
//!   intercepts tool calls, and suppresses duplicate invocations.
//! - **Adapter**: the per-session wrapper around exactly one inference
//!   stream, with an idempotent `stop()`.
//! - **Session memory**: cross-agent facts (verified identity, original
//!   intent, recent tool calls) merged field-by-field into a TTL'd store
//!   and replayed into whichever agent takes the session over.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use switchboard::{
//!     AgentDescriptor, AgentRegistry, ClientConnection, ClientMessage, ExecutorContext,
//!     FnToolExecutor, InMemorySessionStore, RouterConfig, SessionRouter, ToolDispatcher,
//! };
//!
//! # async fn example(connector: Arc<dyn switchboard::InferenceConnector>) -> switchboard::Result<()> {
//! let registry = AgentRegistry::builder()
//!     .agent(AgentDescriptor::new("triage-1", "triage", "You greet callers and route them."))
//!     .agent(
//!         AgentDescriptor::new("banking-1", "banking", "You answer account questions.")
//!             .with_tools(vec!["lookup_balance".to_string()]),
//!     )
//!     .entry_role("triage")
//!     .build();
//!
//! let config = Arc::new(RouterConfig::default());
//! let router = SessionRouter::new(ExecutorContext {
//!     registry: Arc::new(registry),
//!     store: Arc::new(InMemorySessionStore::new()),
//!     tools: Arc::new(FnToolExecutor::new()),
//!     connector,
//!     dispatcher: ToolDispatcher::new(config.dedup_window, config.max_verification_attempts),
//!     config,
//! });
//!
//! let (conn, mut client) = ClientConnection::channel(64);
//! client.to_router.send(ClientMessage::Connect { select_agent: None }).await.ok();
//! let session_id = router.accept_connection(conn).await?;
//! println!("session {session_id} connected");
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod executor;
pub mod handoff;
pub mod memory;
pub mod registry;
pub mod router;
pub mod session;
pub mod sqlite_store;
pub mod tool_service;

pub use adapter::{InferenceConnector, InferenceSession, InferenceSink, SessionAdapter};
pub use client::{ClientConnection, ClientHandle, ClientMessage, ServerMessage};
pub use config::{ConfigBuilder, RouterConfig};
pub use dispatch::{classify, normalize_params, ToolClass, ToolDispatcher};
pub use error::{Result, SwitchboardError};
pub use events::{SpeakerRole, StreamConfig, StreamEvent, StreamInput};
pub use executor::{spawn_executor, ExecutorContext, ExecutorHandle, ExecutorState};
pub use handoff::{HandoffRecord, HandoffRequest};
pub use memory::{InMemorySessionStore, MemoryPatch, SessionMemory, SessionStore, ToolCallRecord};
pub use registry::{AgentDescriptor, AgentRegistry, RegistryBuilder, HANDOFF_TOOL_PREFIX};
pub use router::SessionRouter;
pub use session::{Session, SessionId};
pub use sqlite_store::SqliteSessionStore;
pub use tool_service::{FnToolExecutor, ToolExecRequest, ToolExecService, ToolExecutor, ToolOutcome};
