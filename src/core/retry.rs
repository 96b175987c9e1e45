//! Retry decorator for entity backends.
//!
//! The fan-out collector never retries on its own. Wrapping a client in
//! `RetryingClient` re-issues calls that failed with a transient error,
//! waiting `delay * attempt` (saturating) between attempts.

use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::debug;

use super::{error::RemoteCallError, traits::RemoteEntityClient, types::EntityHandle};
use crate::config::collector::CollectorConfig;

pub struct RetryingClient<C> {
    inner: C,
    attempts: u32,
    delay: Duration,
}

impl<C: RemoteEntityClient> RetryingClient<C> {
    /// `attempts` counts retries after the first call.
    pub fn new(inner: C, attempts: u32, delay: Duration) -> Self {
        Self {
            inner,
            attempts,
            delay,
        }
    }

    pub fn from_config(inner: C, config: &CollectorConfig) -> Self {
        Self::new(inner, config.retry_attempts, config.retry_delay())
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Pause before retry number `attempt`, saturating instead of overflowing.
    fn backoff(&self, attempt: u32) -> Duration {
        self.delay.saturating_mul(attempt)
    }

    async fn retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, RemoteCallError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, RemoteCallError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    attempt += 1;
                    debug!("Retrying {} (attempt {}/{}): {}", what, attempt, self.attempts, err);
                    sleep(self.backoff(attempt)).await;
                }
                outcome => return outcome,
            }
        }
    }
}

#[async_trait::async_trait]
impl<C: RemoteEntityClient> RemoteEntityClient for RetryingClient<C> {
    type Detail = C::Detail;
    type Metrics = C::Metrics;

    async fn list_entities(&self) -> Result<Vec<EntityHandle>, RemoteCallError> {
        self.retry("entity listing", || self.inner.list_entities()).await
    }

    async fn fetch_detail(&self, handle: &EntityHandle) -> Result<Self::Detail, RemoteCallError> {
        self.retry("detail fetch", || self.inner.fetch_detail(handle)).await
    }

    async fn fetch_metrics(
        &self,
        handle: &EntityHandle,
    ) -> Result<Self::Metrics, RemoteCallError> {
        self.retry("metrics fetch", || self.inner.fetch_metrics(handle)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Fails the first `failures` detail calls with the given error.
    struct Flaky {
        failures: u32,
        error: RemoteCallError,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl RemoteEntityClient for Flaky {
        type Detail = ();
        type Metrics = ();

        async fn list_entities(&self) -> Result<Vec<EntityHandle>, RemoteCallError> {
            Ok(vec![EntityHandle::from("a")])
        }

        async fn fetch_detail(&self, _handle: &EntityHandle) -> Result<(), RemoteCallError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }

        async fn fetch_metrics(&self, _handle: &EntityHandle) -> Result<(), RemoteCallError> {
            Ok(())
        }
    }

    fn flaky(failures: u32, error: RemoteCallError) -> Flaky {
        Flaky {
            failures,
            error,
            calls: AtomicU32::new(0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let client = RetryingClient::new(
            flaky(2, RemoteCallError::Transient("busy".into())),
            3,
            Duration::from_millis(10),
        );

        assert!(client.fetch_detail(&"a".into()).await.is_ok());
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_configured_attempts() {
        let client = RetryingClient::new(
            flaky(10, RemoteCallError::Transient("busy".into())),
            2,
            Duration::from_millis(10),
        );

        let err = client.fetch_detail(&"a".into()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let client = RetryingClient::new(
            flaky(1, RemoteCallError::NotFound("a".into())),
            5,
            Duration::from_millis(10),
        );

        let err = client.fetch_detail(&"a".into()).await.unwrap_err();
        assert_eq!(err, RemoteCallError::NotFound("a".into()));
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_linearly_and_saturates() {
        let client = RetryingClient::new(
            flaky(0, RemoteCallError::Transient("busy".into())),
            3,
            Duration::from_millis(40),
        );
        assert_eq!(client.backoff(1), Duration::from_millis(40));
        assert_eq!(client.backoff(3), Duration::from_millis(120));

        let client = RetryingClient::new(
            flaky(0, RemoteCallError::Transient("busy".into())),
            3,
            Duration::MAX,
        );
        assert_eq!(client.backoff(2), Duration::MAX);
    }
}
