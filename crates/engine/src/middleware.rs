//! Handler middleware: bounded retry with backoff, and invocation metrics.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use corral_core::{PassContext, PassOutcome, Result, RetrySettings};
use metrics::{counter, histogram};
use rand::Rng;
use tracing::{error, warn};

use crate::handler::Handler;

/// Configuration for re-invoking a handler after a transient failure.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            ..Default::default()
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self { max_attempts: attempts.max(1), ..Default::default() }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// attempt ceiling is reached. Delays grow exponentially with 0.5x–1.5x jitter.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;
    loop {
        attempt += 1;
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(operation = %operation_name, attempt, error = %e, "giving up after max retries");
                    counter!("corral_retry_exhausted_total", 1u64, "operation" => operation_name.to_string());
                    return Err(e);
                }
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(operation = %operation_name, attempt, error = %e, delay_ms = jittered.as_millis() as u64, "transient failure, retrying");
                counter!("corral_retries_total", 1u64, "operation" => operation_name.to_string());
                tokio::time::sleep(jittered).await;
                delay = Duration::from_secs_f64((delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()));
            }
        }
    }
}

/// Re-invokes the wrapped handler on transient store failures.
///
/// The whole handler is re-run, so the retry re-reads current state. Conflicts
/// and fatal errors pass straight through.
pub struct Retry<H> {
    inner: H,
    config: RetryConfig,
}

impl<H> Retry<H> {
    pub fn new(inner: H, config: RetryConfig) -> Self { Self { inner, config } }
}

#[async_trait]
impl<O, H> Handler<O> for Retry<H>
where
    O: Send + Sync,
    H: Handler<O>,
{
    fn name(&self) -> &str { self.inner.name() }

    async fn ensure_created(&self, pass: &PassContext, obj: &O) -> Result<PassOutcome> {
        retry_with_backoff(&self.config, self.inner.name(), || self.inner.ensure_created(pass, obj)).await
    }

    async fn ensure_deleted(&self, pass: &PassContext, obj: &O) -> Result<PassOutcome> {
        retry_with_backoff(&self.config, self.inner.name(), || self.inner.ensure_deleted(pass, obj)).await
    }
}

/// Records invocation counts and durations; never alters the result.
pub struct Instrumented<H> {
    inner: H,
}

impl<H> Instrumented<H> {
    pub fn new(inner: H) -> Self { Self { inner } }
}

fn record(handler: &str, op: &'static str, started: Instant, res: &Result<PassOutcome>) {
    let result = match res {
        Ok(o) if o.cancel_remainder => "cancelled",
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    counter!("corral_handler_invocations_total", 1u64, "handler" => handler.to_string(), "op" => op, "result" => result);
    histogram!("corral_handler_duration_ms", started.elapsed().as_secs_f64() * 1000.0, "handler" => handler.to_string(), "op" => op);
}

#[async_trait]
impl<O, H> Handler<O> for Instrumented<H>
where
    O: Send + Sync,
    H: Handler<O>,
{
    fn name(&self) -> &str { self.inner.name() }

    async fn ensure_created(&self, pass: &PassContext, obj: &O) -> Result<PassOutcome> {
        let t0 = Instant::now();
        let res = self.inner.ensure_created(pass, obj).await;
        record(self.inner.name(), "ensure_created", t0, &res);
        res
    }

    async fn ensure_deleted(&self, pass: &PassContext, obj: &O) -> Result<PassOutcome> {
        let t0 = Instant::now();
        let res = self.inner.ensure_deleted(pass, obj).await;
        record(self.inner.name(), "ensure_deleted", t0, &res);
        res
    }
}

/// Standard wrapping for a registered handler: metrics outside, retry inside.
pub fn wrap<O, H>(handler: H, retry: &RetryConfig) -> Arc<dyn Handler<O>>
where
    O: Send + Sync + 'static,
    H: Handler<O> + 'static,
{
    Arc::new(Instrumented::new(Retry::new(handler, retry.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{Error, StoreError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig { max_attempts: attempts, initial_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), backoff_multiplier: 2.0 }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let count = AtomicU32::new(0);
        let res: Result<u32> = retry_with_backoff(&fast(3), "op", || {
            let n = count.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 { Err(Error::from(StoreError::Transient("flaky".into()))) } else { Ok(n) }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_ceiling() {
        let count = AtomicU32::new(0);
        let res: Result<()> = retry_with_backoff(&fast(3), "op", || {
            count.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::from(StoreError::Transient("down".into()))) }
        })
        .await;
        assert!(res.unwrap_err().is_retryable());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn conflicts_and_fatal_errors_are_not_retried() {
        for err in [StoreError::Conflict("rv".into()).into(), Error::validation("bad quantity")] {
            let count = AtomicU32::new(0);
            let mut slot = Some(err);
            let res: Result<()> = retry_with_backoff(&fast(3), "op", || {
                count.fetch_add(1, Ordering::SeqCst);
                let e = slot.take();
                async move { Err(e.unwrap_or_else(|| Error::validation("repeat"))) }
            })
            .await;
            assert!(res.is_err());
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }
}
