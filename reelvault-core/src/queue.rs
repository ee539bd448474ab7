use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueSection;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum SubmitError<E> {
    #[error("admission queue full ({waiting} waiting, {running} running, limit {limit})")]
    QueueFull {
        waiting: usize,
        running: usize,
        limit: usize,
    },
    #[error("job {job_id} timed out after {timeout:?}")]
    Timeout { job_id: JobId, timeout: Duration },
    #[error("queue dropped job {0} before admission")]
    Abandoned(JobId),
    #[error("job failed: {0}")]
    Job(E),
}

impl<E> SubmitError<E> {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SubmitError::Timeout { .. })
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, SubmitError::QueueFull { .. })
    }
}

pub type SubmitResult<T, E> = Result<T, SubmitError<E>>;

type Work<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>;
type TimeoutHook = Box<dyn FnOnce() + Send>;

/// One unit of long-running work together with the hook the queue fires when
/// the work overruns its timeout.
pub struct ProcessingJob<T, E> {
    id: JobId,
    label: String,
    enqueued_at: DateTime<Utc>,
    work: Work<T, E>,
    on_timeout: Option<TimeoutHook>,
}

impl<T, E> ProcessingJob<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new<F, Fut>(label: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::with_id(JobId::new(), label, work)
    }

    pub fn with_id<F, Fut>(id: JobId, label: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            id,
            label: label.into(),
            enqueued_at: Utc::now(),
            work: Box::new(move || work().boxed()),
            on_timeout: None,
        }
    }

    pub fn on_timeout<H>(mut self, hook: H) -> Self
    where
        H: FnOnce() + Send + 'static,
    {
        self.on_timeout = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

impl<T, E> fmt::Debug for ProcessingJob<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingJob")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("enqueued_at", &self.enqueued_at)
            .field("has_timeout_hook", &self.on_timeout.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStatus {
    pub running: usize,
    pub waiting: usize,
    pub max_concurrent: usize,
    pub queue_full: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub job_timeout: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_queue_size: 20,
            job_timeout: Duration::from_millis(600_000),
        }
    }
}

impl From<&QueueSection> for AdmissionConfig {
    fn from(section: &QueueSection) -> Self {
        Self {
            max_concurrent: section.max_concurrent.max(1),
            max_queue_size: section.max_queue_size.max(1),
            job_timeout: section.job_timeout(),
        }
    }
}

struct Waiter {
    job_id: JobId,
    ticket: oneshot::Sender<Slot>,
}

struct QueueState {
    running: usize,
    waiting: VecDeque<Waiter>,
}

struct Shared {
    config: AdmissionConfig,
    state: Mutex<QueueState>,
}

impl QueueState {
    /// Drops waiters whose submitter stopped waiting so they no longer count
    /// toward the queue limit.
    fn prune_abandoned(&mut self) {
        self.waiting.retain(|waiter| {
            let open = !waiter.ticket.is_closed();
            if !open {
                debug!(job_id = %waiter.job_id, "pruning abandoned waiter");
            }
            open
        });
    }
}

impl Shared {
    /// Hands free slots to waiters in FIFO order. Must run with the state
    /// lock held so admission and dequeue stay one critical section.
    fn admit(self: &Arc<Self>, state: &mut QueueState) {
        while state.running < self.config.max_concurrent {
            let Some(waiter) = state.waiting.pop_front() else {
                break;
            };
            state.running += 1;
            let slot = Slot {
                shared: Arc::clone(self),
                armed: true,
            };
            if let Err(mut slot) = waiter.ticket.send(slot) {
                // Submitter went away while waiting; reclaim without re-entering.
                slot.armed = false;
                state.running -= 1;
                debug!(job_id = %waiter.job_id, "discarding abandoned waiter");
            }
        }
    }

    /// Frees a slot immediately; the next waiter is admitted on a later
    /// scheduler tick, outside the caller's drop.
    fn release(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(self);
                handle.spawn(async move {
                    let mut state = shared.state.lock();
                    shared.admit(&mut state);
                });
            }
            Err(_) => {
                let mut state = self.state.lock();
                self.admit(&mut state);
            }
        }
    }
}

/// A running slot. Dropping it frees the slot and admits the next waiter.
struct Slot {
    shared: Arc<Shared>,
    armed: bool,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release();
        }
    }
}

/// Bounds how many long-running jobs execute at once on this host.
#[derive(Clone)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("config", &self.shared.config)
            .field("status", &self.status())
            .finish()
    }
}

impl AdmissionQueue {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(QueueState {
                    running: 0,
                    waiting: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn config(&self) -> AdmissionConfig {
        self.shared.config
    }

    pub fn status(&self) -> AdmissionStatus {
        let mut state = self.shared.state.lock();
        state.prune_abandoned();
        AdmissionStatus {
            running: state.running,
            waiting: state.waiting.len(),
            max_concurrent: self.shared.config.max_concurrent,
            queue_full: state.running + state.waiting.len() >= self.shared.config.max_queue_size,
        }
    }

    /// Queues `job`, waits for a free slot, and runs it under the configured
    /// timeout. The job is never invoked when the queue is already full.
    pub async fn submit<T, E>(&self, job: ProcessingJob<T, E>) -> SubmitResult<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let ProcessingJob {
            id,
            label,
            enqueued_at,
            work,
            on_timeout,
        } = job;

        let (ticket_tx, ticket_rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            state.prune_abandoned();
            let waiting = state.waiting.len();
            let running = state.running;
            let limit = self.shared.config.max_queue_size;
            if waiting + running >= limit {
                warn!(job_id = %id, job = %label, waiting, running, limit, "admission rejected: queue full");
                return Err(SubmitError::QueueFull {
                    waiting,
                    running,
                    limit,
                });
            }
            state.waiting.push_back(Waiter {
                job_id: id,
                ticket: ticket_tx,
            });
            debug!(job_id = %id, job = %label, position = state.waiting.len(), "job queued");
            self.shared.admit(&mut state);
        }

        let slot = ticket_rx.await.map_err(|_| SubmitError::Abandoned(id))?;
        let waited_ms = (Utc::now() - enqueued_at).num_milliseconds().max(0);
        info!(job_id = %id, job = %label, waited_ms, "job admitted");

        let timeout = self.shared.config.job_timeout;
        let outcome = tokio::time::timeout(timeout, work()).await;
        let result = match outcome {
            Ok(Ok(value)) => {
                info!(job_id = %id, job = %label, "job completed");
                Ok(value)
            }
            Ok(Err(err)) => {
                warn!(job_id = %id, job = %label, "job failed");
                Err(SubmitError::Job(err))
            }
            Err(_) => {
                warn!(job_id = %id, job = %label, timeout_ms = timeout.as_millis() as u64, "job timed out");
                if let Some(hook) = on_timeout {
                    hook();
                }
                Err(SubmitError::Timeout {
                    job_id: id,
                    timeout,
                })
            }
        };
        drop(slot);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue(max_concurrent: usize, max_queue_size: usize, timeout_ms: u64) -> AdmissionQueue {
        AdmissionQueue::new(AdmissionConfig {
            max_concurrent,
            max_queue_size,
            job_timeout: Duration::from_millis(timeout_ms),
        })
    }

    #[tokio::test]
    async fn runs_job_and_returns_its_value() {
        let queue = queue(1, 4, 1_000);
        let job = ProcessingJob::<_, String>::new("double", || async { Ok(21 * 2) });
        assert_eq!(queue.submit(job).await.unwrap(), 42);
        let status = queue.status();
        assert_eq!(status.running, 0);
        assert_eq!(status.waiting, 0);
        assert!(!status.queue_full);
    }

    #[tokio::test]
    async fn job_error_is_propagated() {
        let queue = queue(1, 4, 1_000);
        let job = ProcessingJob::<u8, String>::new("fail", || async { Err("boom".to_string()) });
        match queue.submit(job).await {
            Err(SubmitError::Job(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(queue.status().running, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_hook_once_and_frees_slot() {
        let queue = queue(1, 4, 500);
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&hook_calls);
        let job = ProcessingJob::<(), String>::new("stuck", || futures::future::pending())
            .on_timeout(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        let err = queue.submit(job).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.status().running, 0);
    }

    #[tokio::test]
    async fn status_reports_full_queue() {
        let queue = queue(1, 1, 10_000);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let runner = queue.clone();
        let handle = tokio::spawn(async move {
            runner
                .submit(ProcessingJob::<(), String>::new("hold", || async move {
                    let _ = release_rx.await;
                    Ok(())
                }))
                .await
        });
        while queue.status().running == 0 {
            tokio::task::yield_now().await;
        }
        assert!(queue.status().queue_full);
        release_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!queue.status().queue_full);
    }

    #[tokio::test]
    async fn abandoned_waiter_stops_counting_toward_limit() {
        let queue = queue(1, 2, 10_000);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let runner = queue.clone();
        let holder = tokio::spawn(async move {
            runner
                .submit(ProcessingJob::<(), String>::new("hold", || async move {
                    let _ = release_rx.await;
                    Ok(())
                }))
                .await
        });
        while queue.status().running == 0 {
            tokio::task::yield_now().await;
        }

        let impatient = tokio::time::timeout(
            Duration::from_millis(20),
            queue.submit(ProcessingJob::<(), String>::new("impatient", || async { Ok(()) })),
        )
        .await;
        assert!(impatient.is_err());

        let status = queue.status();
        assert_eq!(status.running, 1);
        assert_eq!(status.waiting, 0);
        assert!(!status.queue_full);

        let runner = queue.clone();
        let next = tokio::spawn(async move {
            runner
                .submit(ProcessingJob::<u8, String>::new("next", || async { Ok(7) }))
                .await
        });
        while queue.status().waiting == 0 {
            tokio::task::yield_now().await;
        }
        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(next.await.unwrap().unwrap(), 7);
        assert_eq!(queue.status().running, 0);
    }
}
