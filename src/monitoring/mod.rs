//! System monitoring behind the ambient `/health` and `/metrics` endpoints.
//! Reports queue depth by status, the count of agents currently parked in
//! `waitForPrompt`, the count of tasks reserved in `PENDING_ACK`, and the
//! scheduler's last tick latency — not OS resource usage, since this core
//! has no background compute of its own to profile.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::models::TaskStatus;
use crate::registry::Registry;
use crate::scheduler::TickLatency;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: u64,
    pub uptime_seconds: f64,
    pub health_status: HealthStatus,

    pub queue_depth_by_status: HashMap<String, usize>,
    pub waiting_agents: usize,
    pub pending_ack_count: usize,
    pub scheduler_tick_latency_ms: f64,
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub collection_interval: Duration,
    pub metrics_retention_count: usize,
    /// Total queued+blocked+pending-ack depth above which health degrades.
    pub queue_depth_warning_threshold: usize,
    pub queue_depth_critical_threshold: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(30),
            metrics_retention_count: 200,
            queue_depth_warning_threshold: 100,
            queue_depth_critical_threshold: 500,
        }
    }
}

/// Centralized system monitoring: a background collection loop plus
/// on-demand reads of the latest sample and its retention-capped history.
pub struct SystemMonitor {
    config: MonitoringConfig,
    start_time: Instant,
    db: Arc<Db>,
    registry: Arc<Registry>,
    tick_latency: Arc<TickLatency>,
    metrics_history: Arc<RwLock<Vec<SystemMetrics>>>,
    current_metrics: Arc<RwLock<SystemMetrics>>,
    monitor_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown_signal_sender: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl SystemMonitor {
    pub fn new(
        config: MonitoringConfig,
        db: Arc<Db>,
        registry: Arc<Registry>,
        tick_latency: Arc<TickLatency>,
    ) -> Self {
        let initial_metrics = SystemMetrics {
            timestamp: now_unix(),
            uptime_seconds: 0.0,
            health_status: HealthStatus::Healthy,
            queue_depth_by_status: HashMap::new(),
            waiting_agents: 0,
            pending_ack_count: 0,
            scheduler_tick_latency_ms: 0.0,
        };

        Self {
            config,
            start_time: Instant::now(),
            db,
            registry,
            tick_latency,
            metrics_history: Arc::new(RwLock::new(Vec::new())),
            current_metrics: Arc::new(RwLock::new(initial_metrics)),
            monitor_handle: Arc::new(Mutex::new(None)),
            shutdown_signal_sender: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts the background collection loop. Idempotent with `shutdown`:
    /// calling this again after a shutdown starts a fresh loop.
    pub async fn start_monitoring(&self) -> Result<()> {
        info!(
            interval_secs = self.config.collection_interval.as_secs(),
            "starting system monitoring"
        );

        let (tx, mut rx) = mpsc::channel::<()>(1);
        *self.shutdown_signal_sender.lock().await = Some(tx);

        let config = self.config.clone();
        let db = self.db.clone();
        let registry = self.registry.clone();
        let tick_latency = self.tick_latency.clone();
        let start_time = self.start_time;
        let metrics_history = self.metrics_history.clone();
        let current_metrics = self.current_metrics.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.collection_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = collect_metrics(
                            &config, &db, &registry, &tick_latency, start_time,
                            &metrics_history, &current_metrics,
                        ).await {
                            warn!(error = %e, "failed to collect system metrics");
                        }
                    }
                    _ = rx.recv() => {
                        info!("system monitoring shutting down");
                        break;
                    }
                }
            }
        });

        *self.monitor_handle.lock().await = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(sender) = self.shutdown_signal_sender.lock().await.take() {
            let _ = sender.send(()).await;
        }
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "error waiting for monitoring task to finish");
            }
        }
    }

    pub async fn get_current_metrics(&self) -> SystemMetrics {
        self.current_metrics.read().await.clone()
    }

    pub async fn get_metrics_history(&self) -> Vec<SystemMetrics> {
        self.metrics_history.read().await.clone()
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        self.current_metrics.read().await.health_status
    }

    /// Collects one sample immediately, independent of the background
    /// loop. Used directly by the `/health` and `/metrics` handlers so a
    /// request never waits on the next scheduled tick.
    pub async fn sample_now(&self) -> Result<SystemMetrics> {
        collect_metrics(
            &self.config,
            &self.db,
            &self.registry,
            &self.tick_latency,
            self.start_time,
            &self.metrics_history,
            &self.current_metrics,
        )
        .await
    }
}

async fn collect_metrics(
    config: &MonitoringConfig,
    db: &Db,
    registry: &Registry,
    tick_latency: &TickLatency,
    start_time: Instant,
    metrics_history: &RwLock<Vec<SystemMetrics>>,
    current_metrics: &RwLock<SystemMetrics>,
) -> Result<SystemMetrics> {
    debug!("collecting system metrics");

    let statuses = [
        TaskStatus::Queued,
        TaskStatus::Blocked,
        TaskStatus::PendingAck,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::InReview,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    let mut queue_depth_by_status = HashMap::with_capacity(statuses.len());
    let mut pending_ack_count = 0;
    for status in statuses {
        let count = db.list_tasks_by_status(status).await?.len();
        if status == TaskStatus::PendingAck {
            pending_ack_count = count;
        }
        queue_depth_by_status.insert(status_label(status).to_string(), count);
    }

    let waiting_agents = registry
        .get_all()
        .await?
        .iter()
        .filter(|a| a.waiting_since.is_some())
        .count();

    let actionable_depth = queue_depth_by_status.get("queued").copied().unwrap_or(0)
        + queue_depth_by_status.get("blocked").copied().unwrap_or(0)
        + pending_ack_count;

    let health_status = if actionable_depth >= config.queue_depth_critical_threshold {
        HealthStatus::Critical
    } else if actionable_depth >= config.queue_depth_warning_threshold {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    let metrics = SystemMetrics {
        timestamp: now_unix(),
        uptime_seconds: start_time.elapsed().as_secs_f64(),
        health_status,
        queue_depth_by_status,
        waiting_agents,
        pending_ack_count,
        scheduler_tick_latency_ms: tick_latency.get().as_secs_f64() * 1000.0,
    };

    *current_metrics.write().await = metrics.clone();

    {
        let mut history = metrics_history.write().await;
        history.push(metrics.clone());
        while history.len() > config.metrics_retention_count {
            history.remove(0);
        }
    }

    Ok(metrics)
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Queued => "queued",
        TaskStatus::Blocked => "blocked",
        TaskStatus::PendingAck => "pending_ack",
        TaskStatus::Assigned => "assigned",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::InReview => "in_review",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
