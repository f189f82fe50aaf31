//! Matching Service (spec §4.3): a stateless predicate deciding whether a
//! waiting agent and a queued task fit each other, plus the tie-break rules
//! used when several waiters or several tasks fit at once.
use crate::models::{Agent, Task, TaskStatus};

/// `matches(agent, task)`: true iff every applicable constraint holds.
/// `resolved_target_agent_id` is the `to.agentId` *after* alias resolution
/// (the caller resolves aliases through the registry before calling this).
pub fn matches(agent: &Agent, task: &Task, resolved_target_agent_id: Option<&str>) -> bool {
    if task.status != TaskStatus::Queued {
        return false;
    }

    if let Some(target_id) = resolved_target_agent_id {
        if target_id != agent.id {
            return false;
        }
    }

    if let Some(workspace_id) = &task.to.workspace_id {
        let affinity = agent.workspace_context.as_ref().is_some_and(|ctx| {
            &ctx.repo_id == workspace_id || ctx.path.as_deref() == Some(workspace_id.as_str())
        });
        if !affinity {
            return false;
        }
    }

    if !task.to.required_capabilities.is_empty() {
        if !task
            .to
            .required_capabilities
            .is_subset(&agent.capabilities)
        {
            return false;
        }
    } else if let Some(role) = &task.to.role {
        if !agent.capabilities.contains(role) {
            return false;
        }
    }

    true
}

/// FIFO fairness: prefers the waiting agent with the longest `waitingSince`.
pub fn pick_best_agent<'a>(agents: &'a [&'a Agent]) -> Option<&'a Agent> {
    agents
        .iter()
        .filter(|a| a.waiting_since.is_some())
        .min_by_key(|a| a.waiting_since)
        .copied()
}

/// Highest priority first, then oldest `createdAt`.
pub fn pick_best_task<'a>(tasks: &'a [&'a Task]) -> Option<&'a Task> {
    tasks
        .iter()
        .max_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.created_at.cmp(&a.created_at))
        })
        .copied()
}
