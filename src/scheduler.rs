//! Scheduler (spec §4.5): the sole writer of timer-driven task transitions.
//! Keeps the Lifecycle Service and Polling Coordinator free of timers.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::db::Db;
use crate::events::{EventBus, WaahEvent};
use crate::models::TaskStatus;
use crate::registry::Registry;
use crate::waiter::Waiter;
use crate::Result;

/// Last observed tick duration, shared with the `/metrics` surface
/// (`monitoring::SystemMonitor`). A plain atomic rather than a lock: one
/// writer (the scheduler), many readers, no ordering requirement beyond
/// "eventually visible".
#[derive(Default)]
pub struct TickLatency(AtomicU64);

impl TickLatency {
    pub fn record(&self, elapsed: Duration) {
        self.0.store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn get(&self) -> Duration {
        Duration::from_micros(self.0.load(Ordering::Relaxed))
    }
}

pub struct Scheduler {
    db: Arc<Db>,
    events: Arc<dyn EventBus>,
    registry: Arc<Registry>,
    waiter: Arc<Waiter>,
    config: SchedulerConfig,
    tick_latency: Arc<TickLatency>,
}

impl Scheduler {
    pub fn new(
        db: Arc<Db>,
        events: Arc<dyn EventBus>,
        registry: Arc<Registry>,
        waiter: Arc<Waiter>,
        config: SchedulerConfig,
        tick_latency: Arc<TickLatency>,
    ) -> Self {
        Self {
            db,
            events,
            registry,
            waiter,
            config,
            tick_latency,
        }
    }

    /// Runs the tick loop until the process shuts down. Each tick's errors
    /// are logged and the tick is skipped; the loop itself never exits on
    /// error.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs));
        loop {
            interval.tick().await;
            if let Err(err) = self.tick().await {
                tracing::error!(error = %err, "scheduler tick failed");
            }
        }
    }

    /// One tick: expire stale reservations, unblock dependents, and run
    /// housekeeping. Exposed directly so tests and the HTTP `/health`
    /// surface can drive a tick without waiting on the interval.
    pub async fn tick(&self) -> Result<()> {
        let started = Instant::now();

        let expired = self.waiter.expire_stale_reservations().await?;
        if expired > 0 {
            tracing::info!(count = expired, "expired stale PENDING_ACK reservations");
        }

        let unblocked = self.unblock_by_dependency().await?;
        if unblocked > 0 {
            tracing::info!(count = unblocked, "unblocked dependent tasks");
        }

        self.housekeeping().await?;
        self.tick_latency.record(started.elapsed());
        Ok(())
    }

    async fn unblock_by_dependency(&self) -> Result<usize> {
        let blocked = self.db.list_tasks_by_status(TaskStatus::Blocked).await?;
        let completed = self.db.list_completed_task_ids().await?;
        let mut unblocked = 0;

        for mut task in blocked {
            if task.dependencies.iter().all(|d| completed.contains(d)) {
                task.push_history(TaskStatus::Queued, None, Some("dependencies satisfied".to_string()));
                self.db.update_task(&task).await?;
                self.events.publish(WaahEvent::Task(task.clone()));
                unblocked += 1;
            }
        }

        if unblocked > 0 {
            self.waiter.try_deliver_immediate().await?;
        }
        Ok(unblocked)
    }

    async fn housekeeping(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.log_retention_days);
        let deleted = self.db.truncate_logs_older_than(cutoff).await?;
        if deleted > 0 {
            tracing::debug!(count = deleted, "truncated old log entries");
        }

        let drop_threshold = Utc::now() - chrono::Duration::seconds(self.config.waiting_drop_threshold_secs);
        for agent in self.registry.get_all().await? {
            let stale = agent
                .waiting_since
                .is_some_and(|since| since < drop_threshold);
            if stale {
                self.registry.set_waiting(&agent.id, false).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryBus;
    use crate::models::{Actor, ActorType, Priority, RoutingTarget, Task};
    use crate::system_prompts::SystemPrompts;

    async fn setup() -> (Arc<Db>, Scheduler, Arc<Waiter>) {
        let db = Arc::new(Db::connect_in_memory().await.unwrap());
        let registry = Arc::new(Registry::new(db.clone()));
        let prompts = Arc::new(SystemPrompts::new(db.clone()));
        let events: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(64));
        let waiter = Arc::new(Waiter::new(db.clone(), registry.clone(), prompts, events.clone()));
        let config = SchedulerConfig {
            tick_interval_secs: 1,
            log_retention_days: 7,
            waiting_drop_threshold_secs: 300,
        };
        let scheduler = Scheduler::new(
            db.clone(),
            events,
            registry,
            waiter.clone(),
            config,
            Arc::new(TickLatency::default()),
        );
        (db, scheduler, waiter)
    }

    #[tokio::test]
    async fn tick_expires_stale_pending_ack_reservations() {
        let (db, scheduler, _waiter) = setup().await;
        let mut to = RoutingTarget::default();
        to.role = Some("reviewer".to_string());
        let mut task = Task::new(
            "x".to_string(),
            Priority::Normal,
            Actor { kind: ActorType::User, id: "u".to_string(), name: "u".to_string() },
            to,
        );
        task.push_history(TaskStatus::PendingAck, Some("a1".to_string()), None);
        task.pending_ack_agent_id = Some("a1".to_string());
        task.ack_sent_at = Some(Utc::now() - chrono::Duration::seconds(60));
        db.insert_task(&task).await.unwrap();

        scheduler.tick().await.unwrap();

        let reloaded = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Queued);
        assert!(reloaded.pending_ack_agent_id.is_none());
    }

    #[tokio::test]
    async fn tick_unblocks_task_whose_dependency_completed() {
        let (db, scheduler, _waiter) = setup().await;
        let mut to = RoutingTarget::default();
        to.role = Some("reviewer".to_string());

        let mut dep = Task::new(
            "dep".to_string(),
            Priority::Normal,
            Actor { kind: ActorType::User, id: "u".to_string(), name: "u".to_string() },
            to.clone(),
        );
        dep.push_history(TaskStatus::Completed, None, None);
        db.insert_task(&dep).await.unwrap();

        let mut blocked = Task::new(
            "blocked".to_string(),
            Priority::Normal,
            Actor { kind: ActorType::User, id: "u".to_string(), name: "u".to_string() },
            to,
        );
        blocked.dependencies = vec![dep.id.clone()];
        blocked.push_history(TaskStatus::Blocked, None, None);
        db.insert_task(&blocked).await.unwrap();

        scheduler.tick().await.unwrap();

        let reloaded = db.get_task(&blocked.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Queued);
    }
}
