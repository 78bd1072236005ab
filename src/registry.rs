//! Agent descriptors and the registry resolving roles to healthy agents.
//!
//! The registry is an explicit configuration struct built once at startup
//! and shared by `Arc`; there is no ambient global list of agents. Only
//! liveness mutates after construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwitchboardError};

/// Prefix of the fixed handoff-tool namespace: `transfer_to_<role>`.
pub const HANDOFF_TOOL_PREFIX: &str = "transfer_to_";

/// Static description of one agent the router can assign sessions to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    /// Endpoint of the inference service backing this agent.
    pub endpoint: String,
    /// Role this agent serves; handoff targets are resolved by role.
    pub role: String,
    /// Domain tools this agent may execute.
    pub allowed_tool_names: Vec<String>,
    /// Subset of tools whose failed attempts are counted toward the
    /// verification ceiling.
    #[serde(default)]
    pub verification_tool_names: Vec<String>,
    pub voice_profile: String,
    /// Persona text composed into the session instructions.
    pub persona: String,
    /// Workflow text composed into the session instructions, after persona.
    #[serde(default)]
    pub workflow: String,
    /// One-line capability summary other agents see when deciding to hand
    /// off to this role.
    #[serde(default)]
    pub public_description: String,
}

impl AgentDescriptor {
    pub fn new(
        agent_id: impl Into<String>,
        role: impl Into<String>,
        persona: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            endpoint: String::new(),
            role: role.into(),
            allowed_tool_names: vec![],
            verification_tool_names: vec![],
            voice_profile: "neutral".to_string(),
            persona: persona.into(),
            workflow: String::new(),
            public_description: String::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tool_names = tools;
        self
    }

    pub fn with_verification_tools(mut self, tools: Vec<String>) -> Self {
        self.verification_tool_names = tools;
        self
    }

    pub fn with_voice_profile(mut self, profile: impl Into<String>) -> Self {
        self.voice_profile = profile.into();
        self
    }

    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = workflow.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.public_description = description.into();
        self
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        self.allowed_tool_names.iter().any(|t| t == name)
    }

    pub fn is_verification_tool(&self, name: &str) -> bool {
        self.verification_tool_names.iter().any(|t| t == name)
    }

    /// Name of the handoff tool that targets this agent's role.
    pub fn handoff_tool_name(&self) -> String {
        format!("{}{}", HANDOFF_TOOL_PREFIX, self.role)
    }
}

struct RegisteredAgent {
    descriptor: AgentDescriptor,
    healthy: AtomicBool,
}

/// Registry of all agents, keyed by role, with runtime liveness.
pub struct AgentRegistry {
    agents: HashMap<String, Vec<Arc<RegisteredAgent>>>,
    entry_role: String,
}

impl AgentRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Role new sessions start on.
    pub fn entry_role(&self) -> &str {
        &self.entry_role
    }

    /// All roles known to the registry.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.agents.contains_key(role)
    }

    /// Resolves a healthy agent for the role. The first healthy descriptor
    /// wins; registration order is the preference order.
    pub fn resolve_healthy(&self, role: &str) -> Result<AgentDescriptor> {
        self.agents
            .get(role)
            .and_then(|list| {
                list.iter()
                    .find(|a| a.healthy.load(Ordering::Acquire))
                    .map(|a| a.descriptor.clone())
            })
            .ok_or_else(|| SwitchboardError::NoHealthyAgent {
                role: role.to_string(),
            })
    }

    /// Resolves a healthy agent for the entry role.
    pub fn resolve_entry(&self) -> Result<AgentDescriptor> {
        self.resolve_healthy(&self.entry_role)
            .map_err(|_| SwitchboardError::NoEntryAgent)
    }

    /// Finds a descriptor by agent id, regardless of liveness.
    pub fn find_by_id(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.agents
            .values()
            .flatten()
            .find(|a| a.descriptor.agent_id == agent_id)
            .map(|a| a.descriptor.clone())
    }

    /// Marks an agent up or down. Unknown ids are ignored.
    pub fn set_healthy(&self, agent_id: &str, healthy: bool) {
        for agent in self.agents.values().flatten() {
            if agent.descriptor.agent_id == agent_id {
                agent.healthy.store(healthy, Ordering::Release);
            }
        }
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("entry_role", &self.entry_role)
            .field("roles", &self.agents.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder assembling the registry at startup.
#[derive(Default)]
pub struct RegistryBuilder {
    descriptors: Vec<AgentDescriptor>,
    entry_role: Option<String>,
}

impl RegistryBuilder {
    pub fn agent(mut self, descriptor: AgentDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Sets the role new sessions start on. Defaults to the first
    /// registered agent's role.
    pub fn entry_role(mut self, role: impl Into<String>) -> Self {
        self.entry_role = Some(role.into());
        self
    }

    pub fn build(self) -> AgentRegistry {
        let entry_role = self
            .entry_role
            .or_else(|| self.descriptors.first().map(|d| d.role.clone()))
            .unwrap_or_default();

        let mut agents: HashMap<String, Vec<Arc<RegisteredAgent>>> = HashMap::new();
        for descriptor in self.descriptors {
            agents
                .entry(descriptor.role.clone())
                .or_default()
                .push(Arc::new(RegisteredAgent {
                    descriptor,
                    healthy: AtomicBool::new(true),
                }));
        }

        AgentRegistry { agents, entry_role }
    }
}
