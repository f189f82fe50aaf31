//! Task Lifecycle Service (spec §4.2): the state machine and sole writer of
//! task status outside the scheduler's timer-driven transitions (§4.5) and
//! the coordinator's reserve step (§4.4).
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::db::Db;
use crate::error::WaahError;
use crate::events::{EventBus, WaahEvent};
use crate::models::{
    Actor, MessageRole, Priority, RoutingTarget, Task, TaskMessage, TaskResponse, TaskStatus,
};
use crate::waiter::Waiter;
use crate::Result;

#[derive(Clone)]
pub struct Lifecycle {
    db: Arc<Db>,
    events: Arc<dyn EventBus>,
    waiter: Arc<Waiter>,
}

/// Returned by [`Lifecycle::enqueue`].
pub struct EnqueueOutcome {
    pub task_id: String,
    pub reserved_agent_id: Option<String>,
}

impl Lifecycle {
    pub fn new(db: Arc<Db>, events: Arc<dyn EventBus>, waiter: Arc<Waiter>) -> Self {
        Self { db, events, waiter }
    }

    /// `enqueue(task)` (spec §4.2): validates dependencies, inserts, then
    /// synchronously asks the coordinator to try immediate delivery.
    pub async fn enqueue(
        &self,
        prompt: String,
        priority: Priority,
        from: Actor,
        to: RoutingTarget,
        context: Option<serde_json::Value>,
        dependencies: Vec<String>,
    ) -> Result<EnqueueOutcome> {
        if to.agent_id.is_none()
            && to.workspace_id.is_none()
            && to.role.is_none()
            && to.required_capabilities.is_empty()
        {
            return Err(WaahError::InvalidRouting(
                "task must specify at least one routing constraint".to_string(),
            ));
        }

        let mut task = Task::new(prompt, priority, from, to);
        task.context = context;
        task.dependencies = dependencies;

        // I8: the dependency graph must be acyclic at enqueue time. A cycle
        // is structurally impossible here because every dependency names a
        // task that already exists, while `task.id` was freshly generated
        // above and cannot yet appear in any existing task's dependency
        // list — except a direct self-reference, which we reject explicitly.
        if task.dependencies.contains(&task.id) {
            return Err(WaahError::InvalidRouting(
                "task cannot depend on itself".to_string(),
            ));
        }

        if !task.dependencies.is_empty() {
            let satisfied = self.dependencies_satisfied(&task.dependencies).await?;
            if !satisfied {
                task.push_history(
                    TaskStatus::Blocked,
                    None,
                    Some(format!("blocked on {:?}", task.dependencies)),
                );
            }
        }

        self.db.insert_task(&task).await?;
        self.events.publish(WaahEvent::Task(task.clone()));

        let reserved_agent_id = if task.status == TaskStatus::Queued {
            self.waiter.try_deliver_immediate().await?
        } else {
            None
        };

        Ok(EnqueueOutcome {
            task_id: task.id,
            reserved_agent_id,
        })
    }

    async fn dependencies_satisfied(&self, dependencies: &[String]) -> Result<bool> {
        let completed = self.db.list_completed_task_ids().await?;
        Ok(dependencies.iter().all(|d| completed.contains(d)))
    }

    /// `ackTask(taskId, agentId)`.
    pub async fn ack_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let mut task = self.get_or_not_found(task_id).await?;

        if task.status != TaskStatus::PendingAck {
            return Err(WaahError::WrongState(format!(
                "task {task_id} is {:?}, not PENDING_ACK",
                task.status
            )));
        }
        if task.pending_ack_agent_id.as_deref() != Some(agent_id) {
            return Err(WaahError::WrongAgent(format!(
                "task {task_id} is reserved for a different agent"
            )));
        }

        task.pending_ack_agent_id = None;
        task.ack_sent_at = None;
        task.assigned_to = Some(agent_id.to_string());
        task.push_history(TaskStatus::Assigned, Some(agent_id.to_string()), None);
        self.db.update_task(&task).await?;

        self.events.publish(WaahEvent::Delegation {
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
        });
        self.events.publish(WaahEvent::Task(task.clone()));
        Ok(task)
    }

    /// `sendResponse(taskId, status, message, artifacts?, diff?)`.
    pub async fn send_response(
        &self,
        task_id: &str,
        agent_id: &str,
        new_status: TaskStatus,
        message: String,
        artifacts: Vec<String>,
        diff: Option<String>,
    ) -> Result<Task> {
        let mut task = self.get_or_not_found(task_id).await?;
        task.response = Some(TaskResponse {
            message,
            artifacts,
            diff,
        });
        self.update_status(&mut task, new_status, Some(agent_id.to_string()), None)
            .await?;
        Ok(task)
    }

    /// `updateProgress(taskId, agentId, message, percentage?)`: records a
    /// progress message without changing task status.
    pub async fn update_progress(
        &self,
        task_id: &str,
        agent_id: &str,
        message: &str,
        percentage: Option<u8>,
    ) -> Result<()> {
        let mut task = self.get_or_not_found(task_id).await?;
        task.last_progress_at = Utc::now();
        self.db.update_task(&task).await?;

        let metadata = percentage.map(|p| serde_json::json!({ "percentage": p }));
        let msg = TaskMessage {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            role: MessageRole::Agent,
            content: message.to_string(),
            metadata,
            timestamp: Utc::now(),
        };
        self.db.insert_message(&msg).await?;

        self.events.publish(WaahEvent::Activity(crate::models::LogEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            category: "progress".to_string(),
            message: format!("{agent_id}: {message}"),
            metadata: None,
        }));
        Ok(())
    }

    /// `updateStatus(taskId, newStatus, response?)`. Callers hold the task
    /// already loaded; this appends history, persists, unblocks dependents
    /// on `COMPLETED`, and emits `completion` on any terminal state.
    pub async fn update_status(
        &self,
        task: &mut Task,
        new_status: TaskStatus,
        agent_id: Option<String>,
        message: Option<String>,
    ) -> Result<()> {
        task.push_history(new_status, agent_id, message);
        if new_status.is_terminal() {
            task.completed_at = Some(Utc::now());
        }
        self.db.update_task(task).await?;

        if new_status.is_terminal() {
            self.events.publish(WaahEvent::Completion(task.clone()));
        } else {
            self.events.publish(WaahEvent::Task(task.clone()));
        }

        if new_status == TaskStatus::Completed {
            self.unblock_dependents().await?;
        }

        Ok(())
    }

    /// Scans `BLOCKED` tasks and re-queues any whose dependency set is now
    /// fully `COMPLETED`.
    async fn unblock_dependents(&self) -> Result<()> {
        let blocked = self.db.list_tasks_by_status(TaskStatus::Blocked).await?;
        let completed = self.db.list_completed_task_ids().await?;

        for mut task in blocked {
            if task.dependencies.iter().all(|d| completed.contains(d)) {
                task.push_history(TaskStatus::Queued, None, Some("dependencies satisfied".to_string()));
                self.db.update_task(&task).await?;
                self.events.publish(WaahEvent::Task(task.clone()));
            }
        }

        self.waiter.try_deliver_immediate().await?;
        Ok(())
    }

    /// `cancelTask(taskId)`: rejects from a terminal state, clears any
    /// reservation otherwise.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task> {
        let mut task = self.get_or_not_found(task_id).await?;
        if task.status.is_terminal() {
            return Err(WaahError::WrongState(format!(
                "task {task_id} is already {:?}",
                task.status
            )));
        }

        task.pending_ack_agent_id = None;
        task.ack_sent_at = None;
        self.update_status(&mut task, TaskStatus::Cancelled, None, None)
            .await?;
        Ok(task)
    }

    /// `forceRetry(taskId)`: permitted from ASSIGNED, IN_PROGRESS,
    /// PENDING_ACK, CANCELLED, FAILED.
    pub async fn force_retry(&self, task_id: &str) -> Result<Task> {
        let mut task = self.get_or_not_found(task_id).await?;
        let allowed = matches!(
            task.status,
            TaskStatus::Assigned
                | TaskStatus::InProgress
                | TaskStatus::PendingAck
                | TaskStatus::Cancelled
                | TaskStatus::Failed
        );
        if !allowed {
            return Err(WaahError::WrongState(format!(
                "task {task_id} cannot be retried from {:?}",
                task.status
            )));
        }

        task.assigned_to = None;
        task.response = None;
        task.pending_ack_agent_id = None;
        task.ack_sent_at = None;
        task.completed_at = None;
        task.push_history(TaskStatus::Queued, None, Some("force retry".to_string()));
        self.db.update_task(&task).await?;
        self.events.publish(WaahEvent::Task(task.clone()));

        self.waiter.try_deliver_immediate().await?;
        Ok(task)
    }

    /// `block(taskId, reason, question, summary)`.
    pub async fn block(
        &self,
        task_id: &str,
        agent_id: &str,
        reason: &str,
        question: &str,
        summary: &str,
    ) -> Result<Task> {
        let mut task = self.get_or_not_found(task_id).await?;
        task.push_history(TaskStatus::Blocked, Some(agent_id.to_string()), Some(reason.to_string()));
        self.db.update_task(&task).await?;

        let msg = TaskMessage {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            role: MessageRole::Agent,
            content: format!("{question}\n\n{summary}"),
            metadata: None,
            timestamp: Utc::now(),
        };
        self.db.insert_message(&msg).await?;
        self.events.publish(WaahEvent::Task(task.clone()));
        Ok(task)
    }

    /// `answer(taskId, answer)`: only valid when `BLOCKED`.
    pub async fn answer(&self, task_id: &str, answer: &str) -> Result<Task> {
        let mut task = self.get_or_not_found(task_id).await?;
        if task.status != TaskStatus::Blocked {
            return Err(WaahError::WrongState(format!(
                "task {task_id} is not BLOCKED"
            )));
        }

        let msg = TaskMessage {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            role: MessageRole::User,
            content: answer.to_string(),
            metadata: None,
            timestamp: Utc::now(),
        };
        self.db.insert_message(&msg).await?;

        task.push_history(TaskStatus::Queued, None, Some("answered".to_string()));
        self.db.update_task(&task).await?;
        self.events.publish(WaahEvent::Task(task.clone()));

        self.waiter.try_deliver_immediate().await?;
        Ok(task)
    }

    async fn get_or_not_found(&self, task_id: &str) -> Result<Task> {
        self.db
            .get_task(task_id)
            .await?
            .ok_or_else(|| WaahError::NotFound(format!("task {task_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryBus;
    use crate::registry::Registry;
    use crate::system_prompts::SystemPrompts;

    fn actor() -> Actor {
        Actor {
            kind: crate::models::ActorType::User,
            id: "u1".to_string(),
            name: "alice".to_string(),
        }
    }

    async fn setup() -> Lifecycle {
        let db = Arc::new(Db::connect_in_memory().await.unwrap());
        let registry = Arc::new(Registry::new(db.clone()));
        let prompts = Arc::new(SystemPrompts::new(db.clone()));
        let events: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(64));
        let waiter = Arc::new(Waiter::new(db.clone(), registry, prompts, events.clone()));
        Lifecycle::new(db, events, waiter)
    }

    #[tokio::test]
    async fn enqueue_rejects_task_with_no_routing_constraint() {
        let lifecycle = setup().await;
        let result = lifecycle
            .enqueue("do it".to_string(), Priority::Normal, actor(), RoutingTarget::default(), None, vec![])
            .await;
        assert!(matches!(result, Err(WaahError::InvalidRouting(_))));
    }

    #[tokio::test]
    async fn enqueue_with_unmet_dependency_is_blocked() {
        let lifecycle = setup().await;
        let mut to = RoutingTarget::default();
        to.role = Some("reviewer".to_string());

        let outcome = lifecycle
            .enqueue(
                "do it".to_string(),
                Priority::Normal,
                actor(),
                to,
                None,
                vec!["missing-task".to_string()],
            )
            .await
            .unwrap();

        let task = lifecycle.get_or_not_found(&outcome.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn ack_task_fails_for_wrong_agent() {
        let lifecycle = setup().await;
        let mut to = RoutingTarget::default();
        to.agent_id = Some("agent-1".to_string());
        let outcome = lifecycle
            .enqueue("do it".to_string(), Priority::Normal, actor(), to, None, vec![])
            .await
            .unwrap();

        // Not reserved (no waiting agent), so still QUEUED — ack must fail.
        let result = lifecycle.ack_task(&outcome.task_id, "agent-1").await;
        assert!(matches!(result, Err(WaahError::WrongState(_))));
    }

    #[tokio::test]
    async fn cancel_task_is_idempotent_from_terminal_state() {
        let lifecycle = setup().await;
        let mut to = RoutingTarget::default();
        to.role = Some("reviewer".to_string());
        let outcome = lifecycle
            .enqueue("do it".to_string(), Priority::Normal, actor(), to, None, vec![])
            .await
            .unwrap();

        let cancelled = lifecycle.cancel_task(&outcome.task_id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let result = lifecycle.cancel_task(&outcome.task_id).await;
        assert!(matches!(result, Err(WaahError::WrongState(_))));
    }

    #[tokio::test]
    async fn completing_a_dependency_unblocks_the_dependent() {
        let lifecycle = setup().await;
        let mut to1 = RoutingTarget::default();
        to1.role = Some("reviewer".to_string());
        let t1 = lifecycle
            .enqueue("first".to_string(), Priority::Normal, actor(), to1, None, vec![])
            .await
            .unwrap();

        let mut to2 = RoutingTarget::default();
        to2.role = Some("reviewer".to_string());
        let t2 = lifecycle
            .enqueue("second".to_string(), Priority::Normal, actor(), to2, None, vec![t1.task_id.clone()])
            .await
            .unwrap();

        let mut task2 = lifecycle.get_or_not_found(&t2.task_id).await.unwrap();
        assert_eq!(task2.status, TaskStatus::Blocked);

        let mut task1 = lifecycle.get_or_not_found(&t1.task_id).await.unwrap();
        lifecycle
            .update_status(&mut task1, TaskStatus::Completed, None, None)
            .await
            .unwrap();

        task2 = lifecycle.get_or_not_found(&t2.task_id).await.unwrap();
        assert_eq!(task2.status, TaskStatus::Queued);
    }
}
