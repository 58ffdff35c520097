use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::{error::Result, JobStore, TaskDetails};

/// Memoises [`JobStore::intern_task_names`] for the current set of supported
/// task names.
///
/// The lookup is redone only when the set changes. The async mutex is held
/// across the store call, so concurrent callers queue behind one computation
/// instead of each hitting the database.
pub struct TaskIdentifierCache {
    store: Arc<dyn JobStore>,
    last: Mutex<Option<(Vec<String>, TaskDetails)>>,
}

impl TaskIdentifierCache {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            last: Mutex::new(None),
        }
    }

    pub async fn get(&self, names: &[String]) -> Result<TaskDetails> {
        let mut key = names.to_vec();
        key.sort_unstable();
        key.dedup();

        let mut last = self.last.lock().await;
        if let Some((cached_key, details)) = last.as_ref() {
            if *cached_key == key {
                return Ok(details.clone());
            }
        }

        let details = self.store.intern_task_names(&key).await?;
        debug!(tasks = key.len(), "task identifiers interned");
        *last = Some((key, details.clone()));
        Ok(details)
    }
}
