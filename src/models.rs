use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A remote worker: stable identity plus the workspace and capabilities it
/// declared at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub aliases: Vec<String>,
    pub display_name: String,
    pub capabilities: HashSet<String>,
    pub workspace_context: Option<WorkspaceContext>,
    pub color: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub waiting_since: Option<DateTime<Utc>>,
    pub eviction_requested: bool,
    pub eviction_reason: Option<String>,
    pub eviction_action: Option<EvictionAction>,
}

impl Agent {
    pub fn new(id: String, display_name: String) -> Self {
        Self {
            id,
            aliases: Vec::new(),
            display_name,
            capabilities: HashSet::new(),
            workspace_context: None,
            color: None,
            last_seen: None,
            waiting_since: None,
            eviction_requested: false,
            eviction_reason: None,
            eviction_action: None,
        }
    }

    /// True if `needle` equals this agent's id or any declared alias
    /// (case-insensitive), or its display name.
    pub fn matches_identity(&self, needle: &str) -> bool {
        if self.id == needle || self.display_name == needle {
            return true;
        }
        self.aliases
            .iter()
            .any(|a| a.eq_ignore_ascii_case(needle))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceKind {
    Local,
    Github,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceContext {
    #[serde(rename = "type")]
    pub kind: WorkspaceKind,
    pub repo_id: String,
    pub path: Option<String>,
    pub branch: Option<String>,
}

/// Read-only derived connection status; never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentConnectionStatus {
    Processing,
    Waiting,
    Offline,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Blocked,
    PendingAck,
    Assigned,
    InProgress,
    InReview,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    User,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "type")]
    pub kind: ActorType,
    pub id: String,
    pub name: String,
}

/// Routing descriptor. Any subset of the fields may be set; the matcher
/// (`crate::matching`) treats an unset field as "no constraint".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingTarget {
    pub agent_id: Option<String>,
    pub role: Option<String>,
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub required_capabilities: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub message: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub status: TaskStatus,
    pub agent_id: Option<String>,
    pub message: Option<String>,
}

impl HistoryEntry {
    pub fn new(status: TaskStatus, agent_id: Option<String>, message: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            status,
            agent_id,
            message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub prompt: String,
    pub priority: Priority,
    pub from: Actor,
    pub to: RoutingTarget,
    pub assigned_to: Option<String>,
    pub context: Option<serde_json::Value>,
    pub response: Option<TaskResponse>,
    pub dependencies: Vec<String>,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_progress_at: DateTime<Utc>,
    pub pending_ack_agent_id: Option<String>,
    pub ack_sent_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(prompt: String, priority: Priority, from: Actor, to: RoutingTarget) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: TaskStatus::Queued,
            prompt,
            priority,
            from,
            to,
            assigned_to: None,
            context: None,
            response: None,
            dependencies: Vec::new(),
            history: vec![HistoryEntry::new(TaskStatus::Queued, None, None)],
            created_at: now,
            completed_at: None,
            last_progress_at: now,
            pending_ack_agent_id: None,
            ack_sent_at: None,
        }
    }

    pub fn push_history(&mut self, status: TaskStatus, agent_id: Option<String>, message: Option<String>) {
        self.status = status;
        self.history.push(HistoryEntry::new(status, agent_id, message));
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub task_id: String,
    pub role: MessageRole,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: String,
    pub task_id: String,
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub content: String,
    pub thread_id: Option<String>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub id: String,
    /// `None` means broadcast (`"*"` on the wire).
    pub agent_id: Option<String>,
    pub prompt_type: String,
    pub message: String,
    pub payload: Option<serde_json::Value>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecurityEventSource {
    Cli,
    Discord,
    Agent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityEventAction {
    Blocked,
    Allowed,
    Warned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: SecurityEventSource,
    pub from_id: Option<String>,
    pub prompt: String,
    pub flags: Vec<String>,
    pub action: SecurityEventAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionAction {
    Restart,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Eviction {
    pub agent_id: String,
    pub reason: String,
    pub action: EvictionAction,
}

/// Returned by `waitForPrompt`: exactly one of task, eviction, or system
/// prompt, or nothing on timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WaitDelivery {
    Task(Task),
    Eviction(Eviction),
    SystemPrompt(SystemPrompt),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_identity_is_case_insensitive_for_aliases() {
        let mut agent = Agent::new("agent-1".to_string(), "Agent One".to_string());
        agent.aliases.push("Bolt".to_string());
        assert!(agent.matches_identity("bolt"));
        assert!(agent.matches_identity("agent-1"));
        assert!(!agent.matches_identity("agent-2"));
    }

    #[test]
    fn new_task_starts_queued_with_one_history_entry() {
        let from = Actor {
            kind: ActorType::User,
            id: "u1".to_string(),
            name: "alice".to_string(),
        };
        let task = Task::new("do the thing".to_string(), Priority::Normal, from, RoutingTarget::default());
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.history.len(), 1);
        assert!(task.assigned_to.is_none());
    }

    #[test]
    fn priority_ordering_is_critical_high_normal() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
    }
}
