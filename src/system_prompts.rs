//! System Prompt Manager (spec §4.7): per-agent and broadcast out-of-band
//! message queue, delivered piggy-back on long-poll responses.
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::db::Db;
use crate::error::WaahError;
use crate::models::{Priority, SystemPrompt};
use crate::registry::Registry;
use crate::Result;

#[derive(Clone)]
pub struct SystemPrompts {
    db: Arc<Db>,
}

impl SystemPrompts {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// `agent_id = None` queues a literal wildcard row (consumed by `pop`
    /// for any agent that hasn't popped it yet). `broadcastSystemPrompt`
    /// (below) does not use this path — it fans out per matched agent.
    pub async fn queue(
        &self,
        agent_id: Option<&str>,
        prompt_type: &str,
        message: &str,
        payload: Option<serde_json::Value>,
        priority: Priority,
    ) -> Result<()> {
        let prompt = SystemPrompt {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.map(|s| s.to_string()),
            prompt_type: prompt_type.to_string(),
            message: message.to_string(),
            payload,
            priority,
            created_at: Utc::now(),
        };
        self.db.queue_system_prompt(&prompt).await
    }

    /// Oldest agent-specific row first; else the oldest broadcast row
    /// created after this agent last popped one. Consumed at most once.
    pub async fn pop(&self, agent_id: &str) -> Result<Option<SystemPrompt>> {
        if let Some(prompt) = self.db.pop_agent_specific_prompt(agent_id).await? {
            return Ok(Some(prompt));
        }
        self.db.pop_broadcast_prompt(agent_id).await
    }

    /// Fans out to one agent-specific row per matched agent — there is no
    /// wildcard consumer for this operation.
    pub async fn broadcast(
        &self,
        registry: &Registry,
        prompt_type: &str,
        message: &str,
        payload: Option<serde_json::Value>,
        priority: Priority,
        target_agent_id: Option<&str>,
        target_capability: Option<&str>,
        broadcast_all: bool,
    ) -> Result<usize> {
        let all_agents = registry.get_all().await?;

        let targets: Vec<String> = if let Some(id) = target_agent_id {
            let resolved = registry
                .resolve(id)
                .await?
                .ok_or_else(|| WaahError::NotFound(format!("agent {id} not found")))?;
            vec![resolved]
        } else if let Some(cap) = target_capability {
            all_agents
                .iter()
                .filter(|a| a.capabilities.contains(cap))
                .map(|a| a.id.clone())
                .collect()
        } else if broadcast_all {
            all_agents.iter().map(|a| a.id.clone()).collect()
        } else {
            Vec::new()
        };

        if targets.is_empty() {
            return Err(WaahError::NoMatches);
        }

        for agent_id in &targets {
            self.queue(Some(agent_id), prompt_type, message, payload.clone(), priority)
                .await?;
        }

        Ok(targets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn setup() -> (SystemPrompts, Registry) {
        let db = Arc::new(Db::connect_in_memory().await.unwrap());
        (SystemPrompts::new(db.clone()), Registry::new(db))
    }

    #[tokio::test]
    async fn broadcast_with_capability_filter_reaches_only_matching_agents() {
        let (prompts, registry) = setup().await;
        let cw: HashSet<String> = ["code-writing".to_string()].into_iter().collect();
        let sw: HashSet<String> = ["spec-writing".to_string()].into_iter().collect();

        registry.register("a1", "a1", cw.clone(), None, vec![], None).await.unwrap();
        registry.register("a2", "a2", sw, None, vec![], None).await.unwrap();
        registry.register("a3", "a3", cw, None, vec![], None).await.unwrap();

        let count = prompts
            .broadcast(&registry, "notice", "x", None, Priority::Normal, None, Some("code-writing"), false)
            .await
            .unwrap();
        assert_eq!(count, 2);

        assert!(prompts.pop("a1").await.unwrap().is_some());
        assert!(prompts.pop("a3").await.unwrap().is_some());
        assert!(prompts.pop("a2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn broadcast_with_no_matches_errors() {
        let (prompts, registry) = setup().await;
        let result = prompts
            .broadcast(&registry, "notice", "x", None, Priority::Normal, None, Some("nothing"), false)
            .await;
        assert!(matches!(result, Err(WaahError::NoMatches)));
    }

    #[tokio::test]
    async fn agent_specific_prompt_is_preferred_over_broadcast() {
        let (prompts, _registry) = setup().await;
        prompts
            .queue(None, "broadcast", "b", None, Priority::Normal)
            .await
            .unwrap();
        prompts
            .queue(Some("agent-1"), "direct", "d", None, Priority::Normal)
            .await
            .unwrap();

        let popped = prompts.pop("agent-1").await.unwrap().unwrap();
        assert_eq!(popped.prompt_type, "direct");
    }
}
