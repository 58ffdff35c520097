use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use drover_core::{Clock, DroverConfig};
use drover_store::{JobStore, TaskIdentifierCache};

use crate::error::Result;
use crate::events::EventBus;

/// Flags whose jobs this process refuses to claim.
#[derive(Clone)]
pub enum ForbiddenFlags {
    Static(Vec<String>),
    /// Re-evaluated before every claim, e.g. to shed load per tenant.
    Dynamic(Arc<dyn Fn() -> BoxFuture<'static, Vec<String>> + Send + Sync>),
}

impl Default for ForbiddenFlags {
    fn default() -> Self {
        ForbiddenFlags::Static(Vec::new())
    }
}

impl std::fmt::Debug for ForbiddenFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForbiddenFlags::Static(flags) => f.debug_tuple("Static").field(flags).finish(),
            ForbiddenFlags::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Validated settings plus the shared services of one run.
pub struct CompiledOptions {
    pub schema: String,
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub max_contiguous_errors: u32,
    pub min_reset_locked_interval: Duration,
    pub max_reset_locked_interval: Duration,
    pub log_success: bool,
    pub forbidden_flags: ForbiddenFlags,
    pub store: Arc<dyn JobStore>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
    pub task_ids: TaskIdentifierCache,
}

impl CompiledOptions {
    pub fn new(config: &DroverConfig, store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let w = &config.worker;
        Ok(Self {
            schema: w.schema.clone(),
            poll_interval: Duration::from_millis(w.poll_interval_ms),
            concurrency: w.concurrency,
            max_contiguous_errors: w.max_contiguous_errors,
            min_reset_locked_interval: Duration::from_millis(w.min_reset_locked_interval_ms),
            max_reset_locked_interval: Duration::from_millis(w.max_reset_locked_interval_ms),
            log_success: w.log_success,
            forbidden_flags: ForbiddenFlags::Static(w.forbidden_flags.clone()),
            task_ids: TaskIdentifierCache::new(store.clone()),
            store,
            events: EventBus::new(),
            clock,
        })
    }

    pub fn with_forbidden_flags(mut self, flags: ForbiddenFlags) -> Self {
        self.forbidden_flags = flags;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Flags to exclude on the next claim.
    pub async fn excluded_flags(&self) -> Vec<String> {
        match &self.forbidden_flags {
            ForbiddenFlags::Static(flags) => flags.clone(),
            ForbiddenFlags::Dynamic(f) => f().await,
        }
    }
}
