//! Agent Registry (spec §4.1): ownership of the set of known agents,
//! lookup by id/alias/display name, heartbeat debouncing, eviction flags.
use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::constants::HEARTBEAT_DEBOUNCE_SECS;
use crate::db::Db;
use crate::error::WaahError;
use crate::models::{Agent, AgentConnectionStatus, EvictionAction, TaskStatus, WorkspaceContext};
use crate::Result;

#[derive(Clone)]
pub struct Registry {
    db: Arc<Db>,
}

impl Registry {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Idempotent upsert by id: merges aliases, clears `evictionRequested`.
    pub async fn register(
        &self,
        id: &str,
        display_name: &str,
        capabilities: HashSet<String>,
        workspace_context: Option<WorkspaceContext>,
        aliases: Vec<String>,
        color: Option<String>,
    ) -> Result<Agent> {
        if id.trim().is_empty() {
            return Err(WaahError::InvalidIdentity("agent id cannot be empty".to_string()));
        }

        let mut agent = self
            .db
            .get_agent(id)
            .await?
            .unwrap_or_else(|| Agent::new(id.to_string(), display_name.to_string()));

        agent.display_name = display_name.to_string();
        agent.capabilities = capabilities;
        agent.workspace_context = workspace_context;
        agent.color = color;
        for alias in aliases {
            if !agent.aliases.iter().any(|a| a.eq_ignore_ascii_case(&alias)) {
                agent.aliases.push(alias);
            }
        }
        agent.eviction_requested = false;
        agent.eviction_reason = None;
        agent.eviction_action = None;
        agent.last_seen = Some(Utc::now());

        self.db.upsert_agent(&agent).await?;
        Ok(agent)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Agent>> {
        self.db.get_agent(id).await
    }

    /// Resolves an alias, display name, or id to a stable agent id.
    pub async fn resolve(&self, identity: &str) -> Result<Option<String>> {
        if let Some(agent) = self.db.get_agent(identity).await? {
            return Ok(Some(agent.id));
        }
        if let Some(agent_id) = self.db.resolve_alias(identity).await? {
            return Ok(Some(agent_id));
        }
        for agent in self.db.list_agents().await? {
            if agent.display_name == identity {
                return Ok(Some(agent.id));
            }
        }
        Ok(None)
    }

    /// Debounced write: at most once per [`HEARTBEAT_DEBOUNCE_SECS`] per
    /// agent. `lastSeen` is informational only — it never drives status.
    pub async fn heartbeat(&self, id: &str) -> Result<()> {
        let Some(mut agent) = self.db.get_agent(id).await? else {
            return Err(WaahError::NotFound(format!("agent {id} not found")));
        };

        let now = Utc::now();
        let due = agent
            .last_seen
            .map(|last| (now - last).num_seconds() >= HEARTBEAT_DEBOUNCE_SECS)
            .unwrap_or(true);

        if due {
            agent.last_seen = Some(now);
            self.db.upsert_agent(&agent).await?;
        }
        Ok(())
    }

    pub async fn get_all(&self) -> Result<Vec<Agent>> {
        self.db.list_agents().await
    }

    pub async fn request_eviction(&self, id: &str, reason: &str, action: EvictionAction) -> Result<()> {
        let Some(mut agent) = self.db.get_agent(id).await? else {
            return Err(WaahError::NotFound(format!("agent {id} not found")));
        };
        agent.eviction_requested = true;
        agent.eviction_reason = Some(reason.to_string());
        agent.eviction_action = Some(action);
        self.db.upsert_agent(&agent).await?;
        Ok(())
    }

    pub async fn clear_eviction(&self, id: &str) -> Result<()> {
        let Some(mut agent) = self.db.get_agent(id).await? else {
            return Err(WaahError::NotFound(format!("agent {id} not found")));
        };
        agent.eviction_requested = false;
        agent.eviction_reason = None;
        agent.eviction_action = None;
        self.db.upsert_agent(&agent).await?;
        Ok(())
    }

    pub async fn set_waiting(&self, id: &str, waiting: bool) -> Result<()> {
        let Some(mut agent) = self.db.get_agent(id).await? else {
            return Err(WaahError::NotFound(format!("agent {id} not found")));
        };
        agent.waiting_since = if waiting { Some(Utc::now()) } else { None };
        self.db.upsert_agent(&agent).await?;
        Ok(())
    }

    /// `PROCESSING` if the agent has any task in `ASSIGNED`/`IN_PROGRESS`;
    /// else `WAITING` if currently parked; else `OFFLINE`.
    pub async fn connection_status(&self, id: &str) -> Result<AgentConnectionStatus> {
        let agent = self
            .db
            .get_agent(id)
            .await?
            .ok_or_else(|| WaahError::NotFound(format!("agent {id} not found")))?;

        let assigned = self.db.list_tasks_assigned_to(id).await?;
        let processing = assigned
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress));

        if processing {
            Ok(AgentConnectionStatus::Processing)
        } else if agent.waiting_since.is_some() {
            Ok(AgentConnectionStatus::Waiting)
        } else {
            Ok(AgentConnectionStatus::Offline)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_registry() -> Registry {
        let db = Arc::new(crate::db::Db::connect_in_memory().await.unwrap());
        Registry::new(db)
    }

    #[tokio::test]
    async fn register_is_idempotent_modulo_last_seen() {
        let registry = test_registry().await;
        let caps: HashSet<String> = ["code-writing".to_string()].into_iter().collect();

        registry
            .register("agent-1", "Agent One", caps.clone(), None, vec![], None)
            .await
            .unwrap();
        registry
            .register("agent-1", "Agent One", caps.clone(), None, vec![], None)
            .await
            .unwrap();

        let all = registry.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn register_rejects_empty_id() {
        let registry = test_registry().await;
        let result = registry
            .register("", "nobody", HashSet::new(), None, vec![], None)
            .await;
        assert!(matches!(result, Err(WaahError::InvalidIdentity(_))));
    }

    #[tokio::test]
    async fn resolve_finds_by_alias_case_insensitively() {
        let registry = test_registry().await;
        registry
            .register("agent-1", "Agent One", HashSet::new(), None, vec!["Bolt".to_string()], None)
            .await
            .unwrap();

        let resolved = registry.resolve("bolt").await.unwrap();
        assert_eq!(resolved, Some("agent-1".to_string()));
    }

    #[tokio::test]
    async fn request_eviction_fails_for_unknown_agent() {
        let registry = test_registry().await;
        let result = registry.request_eviction("ghost", "bye", EvictionAction::Restart).await;
        assert!(matches!(result, Err(WaahError::NotFound(_))));
    }
}
