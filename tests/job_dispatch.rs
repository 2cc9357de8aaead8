//! Scheduling guarantees of the job dispatcher under suspension.

use std::{
    any::Any,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use seawire::{
    job::{Job, JobDispatcher, JobError},
    promise::{yield_until, Promise},
};

type Category = Arc<dyn Any + Send + Sync>;

fn new_category() -> Category { Arc::new(()) }

struct YieldingJob {
    category: Weak<dyn Any + Send + Sync>,
    promise: Arc<Promise>,
    order: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Job for YieldingJob {
    fn category(&self) -> Weak<dyn Any + Send + Sync> { self.category.clone() }

    async fn perform(&self) -> Result<(), JobError> {
        self.order.lock().expect("order lock").push("suspend");
        yield_until(&self.promise, false)
            .await
            .map_err(|e| JobError::Failed(Box::new(e)))?;
        self.order.lock().expect("order lock").push("resume");
        Ok(())
    }
}

struct MarkerJob {
    category: Weak<dyn Any + Send + Sync>,
    order: Arc<Mutex<Vec<&'static str>>>,
    marker: &'static str,
}

#[async_trait]
impl Job for MarkerJob {
    fn category(&self) -> Weak<dyn Any + Send + Sync> { self.category.clone() }

    async fn perform(&self) -> Result<(), JobError> {
        self.order.lock().expect("order lock").push(self.marker);
        Ok(())
    }
}

struct OverlapProbeJob {
    category: Weak<dyn Any + Send + Sync>,
    in_flight: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

#[async_trait]
impl Job for OverlapProbeJob {
    fn category(&self) -> Weak<dyn Any + Send + Sync> { self.category.clone() }

    async fn perform(&self) -> Result<(), JobError> {
        let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(concurrent, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn successor_waits_for_a_suspended_job() {
    let dispatcher = JobDispatcher::new();
    let category = new_category();
    let order = Arc::new(Mutex::new(Vec::new()));
    let promise = Arc::new(Promise::new());

    dispatcher.enqueue(Box::new(YieldingJob {
        category: Arc::downgrade(&category),
        promise: Arc::clone(&promise),
        order: Arc::clone(&order),
    }));
    dispatcher.enqueue(Box::new(MarkerJob {
        category: Arc::downgrade(&category),
        order: Arc::clone(&order),
        marker: "successor",
    }));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(*order.lock().expect("order lock"), vec!["suspend"]);

    promise.set_success();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
        *order.lock().expect("order lock"),
        vec!["suspend", "resume", "successor"]
    );
}

#[tokio::test]
async fn other_categories_progress_while_one_is_suspended() {
    let dispatcher = JobDispatcher::new();
    let blocked = new_category();
    let free = new_category();
    let order = Arc::new(Mutex::new(Vec::new()));
    let promise = Arc::new(Promise::new());

    dispatcher.enqueue(Box::new(YieldingJob {
        category: Arc::downgrade(&blocked),
        promise: Arc::clone(&promise),
        order: Arc::clone(&order),
    }));
    dispatcher.enqueue(Box::new(MarkerJob {
        category: Arc::downgrade(&free),
        order: Arc::clone(&order),
        marker: "free",
    }));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(*order.lock().expect("order lock"), vec!["suspend", "free"]);
    promise.set_success();
}

#[tokio::test]
async fn one_category_never_runs_two_jobs_at_once() {
    let dispatcher = JobDispatcher::new();
    let category = new_category();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    for _ in 0..16 {
        dispatcher.enqueue(Box::new(OverlapProbeJob {
            category: Arc::downgrade(&category),
            in_flight: Arc::clone(&in_flight),
            max_seen: Arc::clone(&max_seen),
        }));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_promise_surfaces_at_the_yield_site() {
    let dispatcher = JobDispatcher::new();
    let category = new_category();
    let order = Arc::new(Mutex::new(Vec::new()));
    let promise = Arc::new(Promise::new());

    dispatcher.enqueue(Box::new(YieldingJob {
        category: Arc::downgrade(&category),
        promise: Arc::clone(&promise),
        order: Arc::clone(&order),
    }));
    tokio::time::sleep(Duration::from_millis(20)).await;

    promise.set_exception(seawire::promise::PromiseFailure::new(std::io::Error::other(
        "upstream gone",
    )));
    tokio::time::sleep(Duration::from_millis(30)).await;
    // The failure propagates out of the job: no "resume" marker.
    assert_eq!(*order.lock().expect("order lock"), vec!["suspend"]);
}
