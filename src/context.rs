//! Composition of per-session instructions.
//!
//! The rendered text has a load-bearing ordering: memory-derived facts are
//! emitted before any instruction text that references them. Persona and
//! workflow text routinely says "use the context above"; if the context
//! block came after, that sentence would point at nothing.

use crate::memory::SessionMemory;
use crate::registry::AgentDescriptor;

/// Renders the session-memory facts as a plain-text block.
///
/// Empty when the memory holds nothing a model could use; callers skip the
/// block entirely in that case.
pub fn render_memory_block(memory: &SessionMemory) -> String {
    let mut lines = Vec::new();

    if let Some(identity) = &memory.verified_identity {
        lines.push(format!("- Verified identity: {}", identity));
    }
    if let Some(intent) = &memory.original_intent {
        lines.push(format!("- Original request: {}", intent));
    }

    if !memory.last_tool_calls.is_empty() {
        // Stable output: sort by tool name, maps iterate in arbitrary order.
        let mut calls: Vec<_> = memory.last_tool_calls.values().collect();
        calls.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        for call in calls {
            match &call.result {
                Some(result) => lines.push(format!(
                    "- Recent tool call {} -> {}",
                    call.tool_name, result
                )),
                None => lines.push(format!("- Recent tool call {} (pending)", call.tool_name)),
            }
        }
    }

    if let Some(last) = memory.handoff_history.last() {
        lines.push(format!(
            "- Transferred here from {}{}",
            last.from_agent,
            if last.failed { " after a failed verification" } else { "" },
        ));
    }

    lines.join("\n")
}

/// Composes the full system instructions for one agent serving one session.
///
/// Layout: memory facts first, then persona, then workflow. The facts
/// block is prefixed with a header so downstream text can reference "the
/// session context above".
pub fn render_instructions(descriptor: &AgentDescriptor, memory: &SessionMemory) -> String {
    let mut out = String::new();

    let facts = render_memory_block(memory);
    if !facts.is_empty() {
        out.push_str("## Session context\n");
        out.push_str(&facts);
        out.push_str("\n\n");
    }

    out.push_str(&descriptor.persona);

    if !descriptor.workflow.is_empty() {
        out.push_str("\n\n");
        out.push_str(&descriptor.workflow);
    }

    out
}
