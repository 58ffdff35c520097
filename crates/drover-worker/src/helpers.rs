use std::sync::Arc;

use drover_core::{Job, NewJob};
use drover_store::JobStore;

use crate::error::Result;

/// Passed to every handler invocation.
#[derive(Clone)]
pub struct JobHelpers {
    job: Arc<Job>,
    worker_id: Arc<str>,
    store: Arc<dyn JobStore>,
}

impl JobHelpers {
    pub(crate) fn new(job: Arc<Job>, worker_id: &str, store: Arc<dyn JobStore>) -> Self {
        Self {
            job,
            worker_id: Arc::from(worker_id),
            store,
        }
    }

    /// The job being executed, as claimed (attempts already incremented).
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Enqueue a follow-up job.
    pub async fn add_job(&self, job: NewJob) -> Result<Job> {
        Ok(self.store.add_job(job).await?)
    }
}

impl std::fmt::Debug for JobHelpers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHelpers")
            .field("job_id", &self.job.id)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}
