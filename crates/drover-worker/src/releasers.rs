use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::warn;

use crate::error::{Result, WorkerError};

type Releaser = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Shutdown actions, run last-registered-first.
#[derive(Default)]
pub struct Releasers {
    stack: Vec<Releaser>,
}

impl Releasers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&mut self, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.stack.push(Box::new(move || release().boxed()));
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Run every releaser even if some fail; report the first failure.
    pub async fn release_all(&mut self) -> Result<()> {
        let mut first_error: Option<WorkerError> = None;
        while let Some(release) = self.stack.pop() {
            if let Err(e) = release().await {
                warn!(error = %e, "releaser failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn runs_in_reverse_and_reports_first_error() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut releasers = Releasers::new();
        for n in 0..3 {
            let order = order.clone();
            releasers.push(move || async move {
                order.lock().unwrap().push(n);
                match n {
                    0 => Err(WorkerError::Config("zero".into())),
                    1 => Err(WorkerError::Config("one".into())),
                    _ => Ok(()),
                }
            });
        }

        let err = releasers.release_all().await.unwrap_err();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert_eq!(err.to_string(), "Configuration error: one");
        assert!(releasers.is_empty());
        releasers.release_all().await.unwrap();
    }
}
