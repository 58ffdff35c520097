use std::future::Future;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::helpers::JobHelpers;

/// One element outcome of a batch job.
pub type BatchOutcome = BoxFuture<'static, anyhow::Result<()>>;

/// What a task handler produced.
pub enum TaskOutput {
    /// Plain success.
    Done,
    /// Success with a value (ignored by the queue, handy for tests).
    Value(Value),
    /// For an array payload: one outcome per element, in order. Failed
    /// elements are retried on their own.
    Batch(Vec<BatchOutcome>),
}

impl std::fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutput::Done => write!(f, "Done"),
            TaskOutput::Value(v) => write!(f, "Value({v})"),
            TaskOutput::Batch(items) => write!(f, "Batch({} outcomes)", items.len()),
        }
    }
}

/// An async job handler.
///
/// Implemented for any `Fn(Value, JobHelpers) -> impl Future<Output =
/// anyhow::Result<TaskOutput>>`, so plain async closures can be registered.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, payload: Value, helpers: JobHelpers) -> anyhow::Result<TaskOutput>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Value, JobHelpers) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<TaskOutput>> + Send + 'static,
{
    async fn run(&self, payload: Value, helpers: JobHelpers) -> anyhow::Result<TaskOutput> {
        (self)(payload, helpers).await
    }
}
