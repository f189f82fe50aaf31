//! Polling / Wait Coordinator (spec §4.4) — the heart of the core. Parks
//! and wakes waiting agents, implements long-poll with timeout, performs
//! atomic reserve-on-deliver, and delivers evictions and queued system
//! prompts through the same channel.
//!
//! The single logical critical section required by spec §5 is this
//! struct's `reserve_lock: tokio::sync::Mutex<()>`. It is never held across
//! a suspension point — only around the "scan QUEUED tasks, pick best,
//! write PENDING_ACK" step and its siblings (eviction pop, system-prompt
//! pop, agent `waitingSince` mutation).
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::constants::{PENDING_ACK_TIMEOUT_SECS};
use crate::db::Db;
use crate::error::WaahError;
use crate::events::{EventBus, WaahEvent};
use crate::matching;
use crate::models::{
    Agent, Eviction, EvictionAction, TaskStatus, WaitDelivery, WorkspaceContext,
};
use crate::registry::Registry;
use crate::system_prompts::SystemPrompts;
use crate::Result;

pub struct Waiter {
    db: Arc<Db>,
    registry: Arc<Registry>,
    system_prompts: Arc<SystemPrompts>,
    events: Arc<dyn EventBus>,
    reserve_lock: Mutex<()>,
    notify: Notify,
}

impl Waiter {
    pub fn new(
        db: Arc<Db>,
        registry: Arc<Registry>,
        system_prompts: Arc<SystemPrompts>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            db,
            registry,
            system_prompts,
            events,
            reserve_lock: Mutex::new(()),
            notify: Notify::new(),
        }
    }

    /// Wakes every caller currently parked in `wait_for_task` or
    /// `wait_for_task_completion`. Best-effort: spurious wakeups are
    /// expected and benign, because every woken waiter re-runs its full
    /// check under the critical section.
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// `waitForTask` (spec §4.4). Suspends until a matching task, a queued
    /// eviction, a queued system prompt, or the timeout, whichever first.
    pub async fn wait_for_task(
        &self,
        agent_id: &str,
        capabilities: &HashSet<String>,
        workspace_context: Option<&WorkspaceContext>,
        timeout: Duration,
    ) -> Result<Option<WaitDelivery>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(delivery) = self.try_once(agent_id, capabilities, workspace_context).await? {
                return Ok(Some(delivery));
            }

            self.registry.set_waiting(agent_id, true).await?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.registry.set_waiting(agent_id, false).await?;
                return Ok(None);
            }

            tokio::select! {
                _ = self.notify.notified() => {
                    // Spurious or real wakeup: loop back and re-check everything.
                }
                _ = tokio::time::sleep(remaining) => {
                    self.registry.set_waiting(agent_id, false).await?;
                    return Ok(None);
                }
            }
        }
    }

    /// One non-blocking attempt: eviction, then system prompt, then a
    /// matching task. Used both by the parked loop above and by callers
    /// that want immediate (non-waiting) delivery, e.g. `enqueue`.
    async fn try_once(
        &self,
        agent_id: &str,
        capabilities: &HashSet<String>,
        workspace_context: Option<&WorkspaceContext>,
    ) -> Result<Option<WaitDelivery>> {
        let _guard = self.reserve_lock.lock().await;

        let Some(agent) = self.registry.get(agent_id).await? else {
            return Err(WaahError::NotFound(format!("agent {agent_id} not found")));
        };

        if agent.eviction_requested {
            self.registry.clear_eviction(agent_id).await?;
            self.registry.set_waiting(agent_id, false).await?;
            let eviction = Eviction {
                agent_id: agent_id.to_string(),
                reason: agent.eviction_reason.clone().unwrap_or_default(),
                action: agent.eviction_action.unwrap_or(EvictionAction::Restart),
            };
            self.events.publish(WaahEvent::Eviction(eviction.clone()));
            return Ok(Some(WaitDelivery::Eviction(eviction)));
        }

        if let Some(prompt) = self.system_prompts.pop(agent_id).await? {
            self.registry.set_waiting(agent_id, false).await?;
            return Ok(Some(WaitDelivery::SystemPrompt(prompt)));
        }

        let mut probe = agent.clone();
        probe.capabilities = capabilities.clone();
        if let Some(ctx) = workspace_context {
            probe.workspace_context = Some(ctx.clone());
        }

        if let Some(task) = self.reserve_best_match(&probe).await? {
            self.registry.set_waiting(agent_id, false).await?;
            return Ok(Some(WaitDelivery::Task(task)));
        }

        Ok(None)
    }

    /// Scans `QUEUED` tasks for the best one matching `agent`, and if
    /// found, atomically reserves it: transitions to `PENDING_ACK`,
    /// records `pendingAckAgentId`/`ackSentAt`. Caller must already hold
    /// `reserve_lock`.
    async fn reserve_best_match(&self, agent: &Agent) -> Result<Option<crate::models::Task>> {
        let queued = self.db.list_tasks_by_status(TaskStatus::Queued).await?;
        let mut candidates = Vec::new();

        for task in &queued {
            let resolved_target = match &task.to.agent_id {
                Some(id) => self.registry.resolve(id).await?,
                None => None,
            };
            if matching::matches(agent, task, resolved_target.as_deref()) {
                candidates.push(task);
            }
        }

        let Some(best) = matching::pick_best_task(&candidates) else {
            return Ok(None);
        };

        let mut reserved = best.clone();
        reserved.pending_ack_agent_id = Some(agent.id.clone());
        reserved.ack_sent_at = Some(Utc::now());
        reserved.push_history(TaskStatus::PendingAck, Some(agent.id.clone()), None);
        self.db.update_task(&reserved).await?;

        self.events.publish(WaahEvent::Task(reserved.clone()));
        Ok(Some(reserved))
    }

    /// Attempts immediate delivery of the newest/changed state to any
    /// currently-parked agent, without itself suspending. Returns the
    /// reserved agent id, if any. Called by `enqueue`, `answer`,
    /// `forceRetry`, and the scheduler after unblocking/requeueing a task.
    pub async fn try_deliver_immediate(&self) -> Result<Option<String>> {
        let _guard = self.reserve_lock.lock().await;

        let agents = self.registry.get_all().await?;
        let waiting: Vec<&Agent> = agents.iter().filter(|a| a.waiting_since.is_some()).collect();
        if waiting.is_empty() {
            drop(_guard);
            self.wake();
            return Ok(None);
        }

        let queued = self.db.list_tasks_by_status(TaskStatus::Queued).await?;
        if queued.is_empty() {
            drop(_guard);
            self.wake();
            return Ok(None);
        }

        let mut best_pair: Option<(&Agent, crate::models::Task)> = None;
        for agent in &waiting {
            let mut candidates = Vec::new();
            for task in &queued {
                let resolved_target = match &task.to.agent_id {
                    Some(id) => self.registry.resolve(id).await?,
                    None => None,
                };
                if matching::matches(agent, task, resolved_target.as_deref()) {
                    candidates.push(task);
                }
            }
            if let Some(task) = matching::pick_best_task(&candidates) {
                let better = best_pair
                    .as_ref()
                    .map(|(a, _)| agent.waiting_since < a.waiting_since)
                    .unwrap_or(true);
                if better {
                    best_pair = Some((agent, task.clone()));
                }
            }
        }

        let result = if let Some((agent, task)) = best_pair {
            let mut reserved = task.clone();
            reserved.pending_ack_agent_id = Some(agent.id.clone());
            reserved.ack_sent_at = Some(Utc::now());
            reserved.push_history(TaskStatus::PendingAck, Some(agent.id.clone()), None);
            self.db.update_task(&reserved).await?;
            self.registry.set_waiting(&agent.id, false).await?;
            self.events.publish(WaahEvent::Task(reserved));
            Some(agent.id.clone())
        } else {
            None
        };

        drop(_guard);
        self.wake();
        Ok(result)
    }

    /// `waitForTaskCompletion` (spec §4.4). Suspends until the task reaches
    /// a terminal state or timeout.
    pub async fn wait_for_task_completion(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Option<crate::models::Task>> {
        let deadline = Instant::now() + timeout;

        loop {
            let task = self
                .db
                .get_task(task_id)
                .await?
                .ok_or_else(|| WaahError::NotFound(format!("task {task_id} not found")))?;

            if task.status.is_terminal() {
                return Ok(Some(task));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return Ok(None),
            }
        }
    }

    /// Expires stale `PENDING_ACK` reservations. Called by the scheduler
    /// once per tick (spec §4.5).
    pub async fn expire_stale_reservations(&self) -> Result<usize> {
        let _guard = self.reserve_lock.lock().await;
        let pending = self.db.list_tasks_by_status(TaskStatus::PendingAck).await?;
        let now = Utc::now();
        let mut expired = 0;

        for mut task in pending {
            let Some(ack_sent_at) = task.ack_sent_at else {
                continue;
            };
            if (now - ack_sent_at).num_seconds() > PENDING_ACK_TIMEOUT_SECS {
                let agent_id = task.pending_ack_agent_id.clone();
                task.pending_ack_agent_id = None;
                task.ack_sent_at = None;
                task.push_history(
                    TaskStatus::Queued,
                    agent_id.clone(),
                    Some(format!(
                        "ACK timeout from {}",
                        agent_id.as_deref().unwrap_or("unknown agent")
                    )),
                );
                self.db.update_task(&task).await?;
                self.events.publish(WaahEvent::Task(task.clone()));
                expired += 1;
            }
        }

        drop(_guard);
        if expired > 0 {
            self.try_deliver_immediate().await?;
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryBus;
    use crate::models::{Actor, ActorType, Priority, RoutingTarget, Task};
    use std::collections::HashSet;

    async fn setup() -> (Arc<Db>, Arc<Registry>, Waiter) {
        let db = Arc::new(Db::connect_in_memory().await.unwrap());
        let registry = Arc::new(Registry::new(db.clone()));
        let prompts = Arc::new(SystemPrompts::new(db.clone()));
        let events: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(64));
        let waiter = Waiter::new(db.clone(), registry.clone(), prompts, events);
        (db, registry, waiter)
    }

    #[tokio::test]
    async fn immediate_task_is_reserved_without_waiting() {
        let (db, registry, waiter) = setup().await;
        let caps: HashSet<String> = ["code-writing".to_string()].into_iter().collect();
        registry
            .register("a1", "a1", caps.clone(), None, vec![], None)
            .await
            .unwrap();

        let mut to = RoutingTarget::default();
        to.required_capabilities = caps.clone();
        let task = Task::new(
            "do it".to_string(),
            Priority::Normal,
            Actor { kind: ActorType::User, id: "u".to_string(), name: "u".to_string() },
            to,
        );
        db.insert_task(&task).await.unwrap();

        let delivery = waiter
            .wait_for_task("a1", &caps, None, Duration::from_millis(200))
            .await
            .unwrap();

        match delivery {
            Some(WaitDelivery::Task(t)) => assert_eq!(t.status, TaskStatus::PendingAck),
            other => panic!("expected a task delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn times_out_with_no_matching_task() {
        let (_db, registry, waiter) = setup().await;
        let caps: HashSet<String> = ["code-writing".to_string()].into_iter().collect();
        registry.register("a1", "a1", caps.clone(), None, vec![], None).await.unwrap();

        let delivery = waiter
            .wait_for_task("a1", &caps, None, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(delivery.is_none());
    }

    #[tokio::test]
    async fn two_concurrent_waiters_one_task_exactly_one_wins() {
        let (db, registry, waiter) = setup().await;
        let waiter = Arc::new(waiter);
        let caps: HashSet<String> = ["code-writing".to_string()].into_iter().collect();
        registry.register("b", "b", caps.clone(), None, vec![], None).await.unwrap();
        registry.register("c", "c", caps.clone(), None, vec![], None).await.unwrap();

        let mut to = RoutingTarget::default();
        to.required_capabilities = caps.clone();
        let task = Task::new(
            "x".to_string(),
            Priority::Normal,
            Actor { kind: ActorType::User, id: "u".to_string(), name: "u".to_string() },
            to,
        );
        db.insert_task(&task).await.unwrap();

        let w1 = waiter.clone();
        let caps1 = caps.clone();
        let h1 = tokio::spawn(async move {
            w1.wait_for_task("b", &caps1, None, Duration::from_millis(300)).await
        });
        let w2 = waiter.clone();
        let caps2 = caps.clone();
        let h2 = tokio::spawn(async move {
            w2.wait_for_task("c", &caps2, None, Duration::from_millis(300)).await
        });

        let (r1, r2) = tokio::join!(h1, h2);
        let r1 = r1.unwrap().unwrap();
        let r2 = r2.unwrap().unwrap();

        let wins = [&r1, &r2]
            .iter()
            .filter(|r| matches!(r, Some(WaitDelivery::Task(_))))
            .count();
        assert_eq!(wins, 1, "exactly one waiter should receive the task");
    }

    #[tokio::test]
    async fn eviction_is_delivered_before_any_task() {
        let (_db, registry, waiter) = setup().await;
        registry.register("e1", "e1", HashSet::new(), None, vec![], None).await.unwrap();
        registry
            .request_eviction("e1", "restart please", EvictionAction::Restart)
            .await
            .unwrap();

        let delivery = waiter
            .wait_for_task("e1", &HashSet::new(), None, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(matches!(delivery, Some(WaitDelivery::Eviction(_))));
    }
}
