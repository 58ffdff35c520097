use std::sync::Arc;

use thiserror::Error;

use drover_core::CoreError;
use drover_cron::CronError;
use drover_store::StoreError;

/// Errors surfaced by workers, the pool, the cron scheduler and the runner.
///
/// Handler failures are not among them: those are recorded on the job and
/// reported as message strings on `JobError` and `JobFailed` events.
///
/// `Clone` so one outcome can be handed to every awaiter of a shared
/// completion; wrapped errors are reference counted for that reason.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    /// A claim round-trip failed. Retried until the contiguous-error limit.
    #[error("Failed to acquire job: {0}")]
    Claim(Arc<StoreError>),

    /// Unrecoverable for this worker; stops the pool and the scheduler.
    #[error("{0}")]
    Fatal(String),

    #[error("Unsupported task '{0}'")]
    UnsupportedTask(String),

    #[error("Runner is already stopped")]
    AlreadyStopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Cron(Arc<CronError>),

    #[error(transparent)]
    Store(Arc<StoreError>),
}

impl From<StoreError> for WorkerError {
    fn from(e: StoreError) -> Self {
        WorkerError::Store(Arc::new(e))
    }
}

impl From<CronError> for WorkerError {
    fn from(e: CronError) -> Self {
        WorkerError::Cron(Arc::new(e))
    }
}

impl From<CoreError> for WorkerError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Config(msg) => WorkerError::Config(msg),
            other => WorkerError::Config(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_wrapped_store_error() {
        let err = WorkerError::Claim(Arc::new(StoreError::Config("database is locked".into())));
        let copy = err.clone();
        match (&err, &copy) {
            (WorkerError::Claim(a), WorkerError::Claim(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => unreachable!(),
        }
        assert!(copy.to_string().starts_with("Failed to acquire job: "));
        assert!(copy.to_string().contains("database is locked"));
    }

    #[test]
    fn core_config_errors_map_to_config() {
        let err = WorkerError::from(CoreError::Config("concurrency must be at least 1".into()));
        assert_eq!(err.to_string(), "Configuration error: concurrency must be at least 1");
    }
}
