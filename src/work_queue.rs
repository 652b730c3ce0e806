//! Single-flight work queue
//!
//! Concurrent requests that resolve to the same cache key share one
//! fetch + transform job. The first caller spawns the job; later callers
//! subscribe to its result until it settles.

use crate::error::{GateError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

type SharedJob<T> = Shared<BoxFuture<'static, Result<T>>>;

/// How a caller was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// This caller started the job
    New,
    /// This caller joined a job already in flight
    Coalesced,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::New => "new",
            JobOutcome::Coalesced => "coalesced",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkQueueStats {
    pub started: u64,
    pub coalesced: u64,
    pub in_flight: usize,
}

/// Job table keyed by cache fingerprint
///
/// At most one job per key is in flight. A job runs on its own task, so a
/// caller that goes away does not cancel it for the others.
pub struct WorkQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    jobs: Arc<DashMap<String, SharedJob<T>>>,
    started: AtomicU64,
    coalesced: AtomicU64,
}

impl<T> WorkQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            started: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Run `factory` for `key` unless a job for `key` is already running
    ///
    /// # Arguments
    /// * `key` - Logical job key
    /// * `factory` - Invoked at most once per in-flight job to produce it
    ///
    /// # Returns
    /// The job's result, shared by every caller that joined it, and whether
    /// this caller started or joined the job
    pub async fn run<F, Fut>(&self, key: &str, factory: F) -> (Result<T>, JobOutcome)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (job, outcome) = match self.jobs.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!("Joining in-flight job for key={}", key);
                (existing.get().clone(), JobOutcome::Coalesced)
            }
            Entry::Vacant(slot) => {
                self.started.fetch_add(1, Ordering::Relaxed);
                debug!("Starting job for key={}", key);

                let job = Self::spawn_job(self.jobs.clone(), key.to_string(), factory());
                slot.insert(job.clone());
                (job, JobOutcome::New)
            }
        };

        (job.await, outcome)
    }

    fn spawn_job<Fut>(jobs: Arc<DashMap<String, SharedJob<T>>>, key: String, work: Fut) -> SharedJob<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = work.await;
            // Deregister before anyone observes the result, so a request
            // arriving after this point starts a fresh job.
            jobs.remove(&task_key);
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Job for key={} did not complete: {}", key, e);
                    Err(GateError::InternalError(format!("Job aborted: {}", e)))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Number of jobs currently in flight
    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    pub fn stats(&self) -> WorkQueueStats {
        WorkQueueStats {
            started: self.started.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            in_flight: self.jobs.len(),
        }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
