// Worker Offload
//
// Runs blocking work on tokio's blocking thread pool so that it never stalls
// the cooperative scheduler. Concurrency is bounded per pool segment: the
// general segment carries ordinary work and enter steps, the exit segment
// is reserved for release steps so that a release can always find a worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{trace, warn};

use crate::callable::{Arguments, BlockingFn};
use crate::config::{ConfigError, OffloadConfig, QueuePolicy};
use callgate_error::{CallableError, InvokeError, InvokeResult};

static GLOBAL: OnceCell<Arc<Offloader>> = OnceCell::new();

//-----------------------------------------------------------------------------
// Pool Segments
//-----------------------------------------------------------------------------

enum Admission {
    Reject,
    Queue { slots: Semaphore },
    Wait,
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A bounded set of workers with its own admission policy
pub struct PoolSegment {
    label: &'static str,
    workers: usize,
    permits: Arc<Semaphore>,
    admission: Admission,
    waiting: AtomicUsize,
}

impl PoolSegment {
    fn new(label: &'static str, workers: usize, admission: Admission) -> Self {
        Self {
            label,
            workers,
            permits: Arc::new(Semaphore::new(workers)),
            admission,
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Maximum number of concurrently running workers
    pub fn capacity(&self) -> usize {
        self.workers
    }

    /// Workers currently idle
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Submissions currently waiting for a worker
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    async fn admit(&self) -> InvokeResult<OwnedSemaphorePermit> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(InvokeError::Cancelled),
            Err(TryAcquireError::NoPermits) => {}
        }

        let _slot = match &self.admission {
            Admission::Reject => return Err(self.exhausted()),
            Admission::Queue { slots } => Some(slots.try_acquire().map_err(|_| self.exhausted())?),
            Admission::Wait => None,
        };

        let _waiting = WaitingGuard::new(&self.waiting);
        trace!(segment = self.label, "waiting for a worker");
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| InvokeError::Cancelled)
    }

    fn exhausted(&self) -> InvokeError {
        let queued = self.waiting();
        warn!(
            segment = self.label,
            workers = self.workers,
            queued,
            "offload segment exhausted"
        );
        InvokeError::OffloadExhausted {
            segment: self.label,
            workers: self.workers,
            queued,
        }
    }
}

//-----------------------------------------------------------------------------
// Offloader
//-----------------------------------------------------------------------------

/// Owner of the general and exit pool segments
pub struct Offloader {
    general: PoolSegment,
    exit: PoolSegment,
}

impl Offloader {
    /// Build an offloader from validated configuration
    pub fn new(config: &OffloadConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: &OffloadConfig) -> Self {
        let admission = match config.queue {
            QueuePolicy::Reject => Admission::Reject,
            QueuePolicy::Bounded { depth } => Admission::Queue {
                slots: Semaphore::new(depth),
            },
        };
        Self {
            general: PoolSegment::new("general", config.workers, admission),
            exit: PoolSegment::new("exit", config.exit_workers, Admission::Wait),
        }
    }

    /// The process-wide offloader, created with default sizing on first use
    /// unless [`Offloader::install_global`] ran before.
    pub fn global() -> Arc<Offloader> {
        GLOBAL
            .get_or_init(|| Arc::new(Offloader::default()))
            .clone()
    }

    /// Install the process-wide offloader. Fails once the global offloader
    /// exists, whether installed or created lazily.
    pub fn install_global(config: &OffloadConfig) -> Result<Arc<Offloader>, ConfigError> {
        let offloader = Arc::new(Offloader::new(config)?);
        GLOBAL
            .set(offloader.clone())
            .map_err(|_| ConfigError::AlreadyInitialised)?;
        Ok(offloader)
    }

    pub fn general(&self) -> &PoolSegment {
        &self.general
    }

    pub fn exit_segment(&self) -> &PoolSegment {
        &self.exit
    }

    /// Run `f` on a general worker and wait for its result.
    ///
    /// Dropping the returned future does not stop the worker; it runs to
    /// completion and its result is discarded. A panic in `f` is resumed on
    /// the caller.
    pub async fn run<F, T>(&self, f: F) -> InvokeResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        submit(&self.general, f).await
    }

    /// Run a release step on the exit segment. Never rejected; waits for
    /// the reserved worker instead.
    ///
    /// The wait queue has no fixed depth. It holds at most one release per
    /// resource that was entered and not yet released, so it is bounded by
    /// how many resources callers keep open at once.
    pub async fn run_exit<F, T>(&self, f: F) -> InvokeResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        submit(&self.exit, f).await
    }

    /// Call a blocking function with `args` on a general worker. Its
    /// failure comes back as [`InvokeError::Callable`].
    pub async fn run_offloaded(&self, f: Arc<BlockingFn>, args: Arguments) -> InvokeResult<Value> {
        self.run(move || f(args))
            .await?
            .map_err(InvokeError::callable)
    }
}

impl Default for Offloader {
    fn default() -> Self {
        Self::build(&OffloadConfig::default())
    }
}

async fn submit<F, T>(segment: &PoolSegment, f: F) -> InvokeResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let permit = segment.admit().await?;
    trace!(segment = segment.label(), "submitting to worker");

    let handle = tokio::task::spawn_blocking(move || {
        // The permit is held until the work finishes, even if the caller
        // stopped waiting.
        let _permit = permit;
        f()
    });

    match handle.await {
        Ok(value) => Ok(value),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(_) => Err(InvokeError::Cancelled),
    }
}

/// Run a fallible blocking closure on the global offloader
pub async fn run_offloaded<F, T>(f: F) -> InvokeResult<T>
where
    F: FnOnce() -> Result<T, CallableError> + Send + 'static,
    T: Send + 'static,
{
    Offloader::global().run(f).await?.map_err(InvokeError::callable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn offloader(workers: usize, queue: QueuePolicy) -> Offloader {
        Offloader::new(&OffloadConfig {
            workers,
            queue,
            exit_workers: 1,
        })
        .unwrap()
    }

    async fn wait_until(mut ready: impl FnMut() -> bool) {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_returns_worker_result() {
        let pool = offloader(2, QueuePolicy::Reject);
        let value = pool.run(|| 6 * 7).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.general().available(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reject_fails_fast_when_busy() {
        let pool = Arc::new(offloader(1, QueuePolicy::Reject));
        let (release, gate) = mpsc::channel::<()>();

        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run(move || gate.recv().ok()).await })
        };
        wait_until(|| pool.general().available() == 0).await;

        let err = pool.run(|| ()).await.unwrap_err();
        assert!(matches!(
            err,
            InvokeError::OffloadExhausted { segment: "general", workers: 1, queued: 0 }
        ));

        release.send(()).unwrap();
        assert!(busy.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bounded_queue_overflow() {
        let pool = Arc::new(offloader(1, QueuePolicy::Bounded { depth: 1 }));
        let (release, gate) = mpsc::channel::<()>();

        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run(move || gate.recv().ok()).await })
        };
        wait_until(|| pool.general().available() == 0).await;

        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run(|| "queued").await })
        };
        wait_until(|| pool.general().waiting() == 1).await;

        let err = pool.run(|| ()).await.unwrap_err();
        assert!(matches!(err, InvokeError::OffloadExhausted { queued: 1, .. }));

        release.send(()).unwrap();
        busy.await.unwrap().unwrap();
        assert_eq!(queued.await.unwrap().unwrap(), "queued");
        assert_eq!(pool.general().waiting(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callable_failure_is_unchanged() {
        let pool = offloader(1, QueuePolicy::default());
        let f: Arc<BlockingFn> = Arc::new(|_| Err(anyhow::anyhow!("disk full")));
        let err = pool.run_offloaded(f, Arguments::new()).await.unwrap_err();
        assert!(matches!(err, InvokeError::Callable(_)));
        assert_eq!(err.to_string(), "disk full");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[should_panic(expected = "worker exploded")]
    async fn test_worker_panic_resumes_on_caller() {
        let pool = offloader(1, QueuePolicy::default());
        let _ = pool.run(|| -> u32 { panic!("worker exploded") }).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_waiter_keeps_worker_running() {
        let pool = Arc::new(offloader(1, QueuePolicy::Reject));
        let (done_tx, done_rx) = mpsc::channel::<&'static str>();
        let (release, gate) = mpsc::channel::<()>();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.run(move || {
                    let _ = gate.recv();
                    let _ = done_tx.send("finished");
                })
                .await
            })
        };
        wait_until(|| pool.general().available() == 0).await;
        waiter.abort();
        let _ = waiter.await;

        // The worker still holds its permit until it finishes
        assert_eq!(pool.general().available(), 0);
        release.send(()).unwrap();
        let finished = tokio::task::spawn_blocking(move || done_rx.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(finished, "finished");
        wait_until(|| pool.general().available() == 1).await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Offloader::new(&OffloadConfig {
            workers: 0,
            ..OffloadConfig::default()
        });
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
