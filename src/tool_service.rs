//! Contract of the external tool-execution service.
//!
//! Domain tools run outside the core: the execution core sends
//! `execute(tool_name, params)` and gets back a success-or-error outcome,
//! request/response, no streaming. The trait keeps the core testable; the
//! Tower adapter lets deployments wrap the service in resilience layers
//! (timeouts in particular) without the core knowing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde_json::Value;
use tower::Service;

use crate::error::Result;

/// Result of one tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub payload: Value,
}

impl ToolOutcome {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            payload,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: crate::events::failed_tool_payload(&message.into()),
        }
    }

    /// Wire payload fed back into the inference stream.
    pub fn into_payload(self) -> Value {
        self.payload
    }
}

/// The tool-execution service consumed by the execution core.
#[async_trait]
pub trait ToolExecutor: Send + Sync + std::fmt::Debug {
    async fn execute(&self, tool_name: &str, params: Value) -> Result<ToolOutcome>;
}

type ToolFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// A [`ToolExecutor`] backed by plain functions, one per tool name.
///
/// The production deployment points this trait at a remote service; the
/// function-backed version serves tests and demos.
#[derive(Clone, Default)]
pub struct FnToolExecutor {
    tools: HashMap<String, ToolFn>,
}

impl FnToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.tools.insert(name.into(), Arc::new(function));
        self
    }
}

impl std::fmt::Debug for FnToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnToolExecutor")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl ToolExecutor for FnToolExecutor {
    async fn execute(&self, tool_name: &str, params: Value) -> Result<ToolOutcome> {
        match self.tools.get(tool_name) {
            Some(function) => match function(params) {
                Ok(payload) => Ok(ToolOutcome::ok(payload)),
                Err(e) => Ok(ToolOutcome::failed(e.to_string())),
            },
            None => Ok(ToolOutcome::failed(format!("unknown tool '{}'", tool_name))),
        }
    }
}

/// Typed request for the Tower adapter.
#[derive(Debug, Clone)]
pub struct ToolExecRequest {
    pub tool_name: String,
    pub params: Value,
}

/// Adapter exposing any [`ToolExecutor`] as a Tower [`Service`], so the
/// execution path can be composed with timeout or rate-limit layers.
#[derive(Debug, Clone)]
pub struct ToolExecService {
    executor: Arc<dyn ToolExecutor>,
}

impl ToolExecService {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }
}

impl Service<ToolExecRequest> for ToolExecService {
    type Response = ToolOutcome;
    type Error = tower::BoxError;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolExecRequest) -> Self::Future {
        let executor = self.executor.clone();
        Box::pin(async move {
            executor
                .execute(&req.tool_name, req.params)
                .await
                .map_err(Into::into)
        })
    }
}
