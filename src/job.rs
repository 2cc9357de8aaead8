//! Per-category job dispatch.
//!
//! Every connection (or other serialization domain) is a *category*. Jobs
//! enqueued against one category run strictly one at a time in FIFO order;
//! unrelated categories are drained concurrently, each by its own task. A
//! job raising [`JobError::TryAgainLater`] is retried at the head of its
//! queue; a job whose category has already been released is dropped
//! without running.

use std::{
    any::Any,
    error::Error,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Weak handle identifying a job's serialization domain.
pub type CategoryRef = Weak<dyn Any + Send + Sync>;

/// Error raised out of [`Job::perform`].
#[derive(Debug, Error)]
pub enum JobError {
    /// Cooperative signal: re-run this job before anything else in its
    /// category.
    #[error("try again later")]
    TryAgainLater,

    /// The job failed; it is discarded after logging. The job body is
    /// expected to have already forced its resource's shutdown.
    #[error(transparent)]
    Failed(#[from] Box<dyn Error + Send + Sync>),
}

/// A unit of deferred work bound to a category.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// The category whose jobs must be serialized relative to each other.
    ///
    /// If the referent has been released by the time a worker picks the
    /// job up, the job is dropped silently.
    fn category(&self) -> CategoryRef;

    /// Whether [`JobError::TryAgainLater`] re-queues this job instead of
    /// discarding it.
    fn retry_allowed(&self) -> bool { true }

    /// Execute the job.
    async fn perform(&self) -> Result<(), JobError>;
}

/// How often an idle category worker re-checks that its category is still
/// alive.
const LIVENESS_SWEEP: std::time::Duration = std::time::Duration::from_secs(5);

/// Derive the dispatcher key for a category anchor.
///
/// Categories are identified by the address of their `Arc` allocation; two
/// handles to the same connection always land on the same queue.
#[must_use]
pub fn category_key(anchor: &Arc<dyn Any + Send + Sync>) -> usize {
    Arc::as_ptr(anchor).cast::<()>() as usize
}

/// Dispatcher maintaining one FIFO queue and one draining task per live
/// category.
#[derive(Default)]
pub struct JobDispatcher {
    categories: DashMap<usize, mpsc::UnboundedSender<Box<dyn Job>>>,
}

impl JobDispatcher {
    /// A dispatcher with no categories.
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Enqueue a job on its category's queue.
    ///
    /// Jobs whose category has already been released are dropped here;
    /// otherwise the category's draining task is created on demand.
    pub fn enqueue(self: &Arc<Self>, job: Box<dyn Job>) {
        let Some(anchor) = job.category().upgrade() else {
            log::trace!("dropping job for released category");
            return;
        };
        let key = category_key(&anchor);
        let mut job = job;
        loop {
            if let Some(tx) = self.categories.get(&key) {
                match tx.send(job) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(returned)) => {
                        // The worker exited between lookup and send.
                        job = returned;
                        drop(tx);
                        self.categories.remove(&key);
                    }
                }
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            match self.categories.entry(key) {
                dashmap::Entry::Vacant(entry) => {
                    let weak_tx = tx.downgrade();
                    entry.insert(tx);
                    let dispatcher = Arc::clone(self);
                    let category = Arc::downgrade(&anchor);
                    tokio::spawn(async move {
                        run_category(dispatcher, key, rx, weak_tx, category).await;
                    });
                }
                dashmap::Entry::Occupied(_) => {
                    // Lost the race; retry against the winner's sender.
                }
            }
        }
    }

    /// Drop a category's queue.
    ///
    /// Pending jobs are still drained by the worker, which skips them once
    /// the category itself is gone; the queue accepts nothing new.
    pub fn retire(&self, key: usize) { self.categories.remove(&key); }

    /// Number of categories with live queues.
    #[must_use]
    pub fn category_count(&self) -> usize { self.categories.len() }

    /// Drop every queue. Draining tasks exit once their backlog is
    /// processed.
    pub fn stop(&self) { self.categories.clear(); }
}

async fn run_category(
    dispatcher: Arc<JobDispatcher>,
    key: usize,
    mut rx: mpsc::UnboundedReceiver<Box<dyn Job>>,
    // Weak so that `retire`/`stop` dropping the map's sender closes the
    // channel and lets this task exit.
    weak_tx: mpsc::WeakUnboundedSender<Box<dyn Job>>,
    category: Weak<dyn Any + Send + Sync>,
) {
    loop {
        tokio::select! {
            job = rx.recv() => {
                let Some(job) = job else { break };
                // The category reference is weak on purpose: a job for a
                // dead connection must not run, and must not keep it
                // alive either.
                if job.category().upgrade().is_some() {
                    perform_with_retry(job.as_ref()).await;
                }
            }
            // Periodic sweep so a worker whose category died while the
            // queue was idle still exits.
            () = tokio::time::sleep(LIVENESS_SWEEP) => {}
        }
        if category.upgrade().is_none() {
            break;
        }
    }
    dispatcher.categories.remove_if(&key, |_, current| {
        weak_tx
            .upgrade()
            .is_some_and(|tx| current.same_channel(&tx))
    });
}

async fn perform_with_retry(job: &dyn Job) {
    loop {
        match job.perform().await {
            Ok(()) => return,
            Err(JobError::TryAgainLater) => {
                if !job.retry_allowed() {
                    log::debug!("job withdrew without retry");
                    return;
                }
                tokio::task::yield_now().await;
            }
            Err(JobError::Failed(e)) => {
                log::info!("job failed: {e}");
                return;
            }
        }
    }
}
