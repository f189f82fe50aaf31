//! Wired `Context` (design note §9): every component is constructed once
//! here and handed to whoever needs it, instead of reaching for module-scope
//! singletons. This is what makes each test able to build a fully isolated,
//! in-memory instance of the whole core.
use std::sync::Arc;

use crate::auth::{create_auth_state, AuthState};
use crate::config::Config;
use crate::db::Db;
use crate::events::{EventBus, InMemoryBus};
use crate::lifecycle::Lifecycle;
use crate::rate_limit::RateLimitConfig;
use crate::registry::Registry;
use crate::scheduler::{Scheduler, TickLatency};
use crate::system_prompts::SystemPrompts;
use crate::validation::PromptValidator;
use crate::waiter::Waiter;
use crate::Result;

#[derive(Clone)]
pub struct Context {
    pub config: Config,
    pub db: Arc<Db>,
    pub events: Arc<dyn EventBus>,
    pub registry: Arc<Registry>,
    pub system_prompts: Arc<SystemPrompts>,
    pub waiter: Arc<Waiter>,
    pub lifecycle: Arc<Lifecycle>,
    pub validator: Arc<PromptValidator>,
    pub rate_limits: RateLimitConfig,
    pub auth: Arc<AuthState>,
    pub tick_latency: Arc<TickLatency>,
}

impl Context {
    /// Production constructor: opens the configured SQLite file, seeds
    /// agents if the table is empty, and wires every component.
    pub async fn build(config: Config) -> Result<Self> {
        let db = Arc::new(Db::connect(&config.database.path).await?);
        let context = Self::wire(config, db.clone()).await?;
        crate::seed::seed_if_empty(&context.registry, context.config.seed_path.as_deref()).await?;
        Ok(context)
    }

    /// Test constructor: an isolated in-memory database, no seeding.
    pub async fn build_in_memory(config: Config) -> Result<Self> {
        let db = Arc::new(Db::connect_in_memory().await?);
        Self::wire(config, db).await
    }

    async fn wire(config: Config, db: Arc<Db>) -> Result<Self> {
        let events: Arc<dyn EventBus> = Arc::new(InMemoryBus::default());
        let registry = Arc::new(Registry::new(db.clone()));
        let system_prompts = Arc::new(SystemPrompts::new(db.clone()));
        let waiter = Arc::new(Waiter::new(
            db.clone(),
            registry.clone(),
            system_prompts.clone(),
            events.clone(),
        ));
        let lifecycle = Arc::new(Lifecycle::new(db.clone(), events.clone(), waiter.clone()));
        let validator = Arc::new(PromptValidator::new()?);
        let rate_limits = RateLimitConfig::new();
        let auth = create_auth_state(config.server.clone());
        let tick_latency = Arc::new(TickLatency::default());

        Ok(Self {
            config,
            db,
            events,
            registry,
            system_prompts,
            waiter,
            lifecycle,
            validator,
            rate_limits,
            auth,
            tick_latency,
        })
    }

    /// Builds the scheduler for this context. Kept separate from `wire` so
    /// `main.rs` controls exactly when the tick loop is spawned.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.db.clone(),
            self.events.clone(),
            self.registry.clone(),
            self.waiter.clone(),
            self.config.scheduler.clone(),
            self.tick_latency.clone(),
        )
    }
}
