//! Single-assignment satisfaction cells and the cooperative yield
//! primitive.
//!
//! A [`Promise`] starts pending and is satisfied exactly once, either
//! successfully or with an error payload that every observer can re-raise.
//! A running job suspends on one via [`yield_until`]; while it waits, the
//! worker driving its category is free only in the sense that every other
//! category keeps progressing on its own task.

use std::{
    error::Error,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use tokio::sync::Notify;

const PENDING: u8 = 0;
const FULFILLED: u8 = 1;
const FAILED: u8 = 2;

/// Error payload stored in a failed promise.
///
/// Cheaply cloneable so `check_and_rethrow` can hand the same underlying
/// error to any number of observers.
#[derive(Clone, Debug)]
pub struct PromiseFailure(Arc<dyn Error + Send + Sync>);

impl PromiseFailure {
    /// Wrap an error for storage in a promise.
    pub fn new(err: impl Error + Send + Sync + 'static) -> Self { Self(Arc::new(err)) }

    /// Wrap an already boxed error.
    #[must_use]
    pub fn from_boxed(err: Box<dyn Error + Send + Sync>) -> Self { Self(Arc::from(err)) }
}

impl std::fmt::Display for PromiseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for PromiseFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> { Some(self.0.as_ref()) }
}

/// A single-assignment value-or-error cell.
///
/// Transitions are monotone: exactly one of [`set_success`] /
/// [`set_exception`] takes effect; later attempts are no-ops. Once
/// satisfied, [`is_satisfied`] stays true forever.
///
/// [`set_success`]: Promise::set_success
/// [`set_exception`]: Promise::set_exception
/// [`is_satisfied`]: Promise::is_satisfied
#[derive(Default)]
pub struct Promise {
    state: AtomicU8,
    failure: Mutex<Option<PromiseFailure>>,
    notify: Notify,
}

impl Promise {
    /// A pending promise.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Whether the promise has reached a final state.
    #[must_use]
    pub fn is_satisfied(&self) -> bool { self.state.load(Ordering::Acquire) != PENDING }

    /// Satisfy the promise successfully. No-op if already satisfied.
    pub fn set_success(&self) { self.settle(FULFILLED, None); }

    /// Satisfy the promise with an error. No-op if already satisfied.
    pub fn set_exception(&self, failure: PromiseFailure) {
        self.settle(FAILED, Some(failure));
    }

    fn settle(&self, state: u8, failure: Option<PromiseFailure>) {
        {
            let mut slot = self.failure.lock().expect("promise lock poisoned");
            if self
                .state
                .compare_exchange(PENDING, state, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            *slot = failure;
        }
        self.notify.notify_waiters();
    }

    /// Re-raise the stored error if the promise failed.
    ///
    /// Safe to call any number of times; returns `Ok(())` while pending or
    /// after success.
    ///
    /// # Errors
    ///
    /// Returns the stored [`PromiseFailure`] when the promise was satisfied
    /// with an error.
    pub fn check_and_rethrow(&self) -> Result<(), PromiseFailure> {
        if self.state.load(Ordering::Acquire) != FAILED {
            return Ok(());
        }
        let slot = self.failure.lock().expect("promise lock poisoned");
        Err(slot.clone().expect("failed promise stores a failure"))
    }

    /// Wait until the promise is satisfied.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_satisfied() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            PENDING => "pending",
            FULFILLED => "fulfilled",
            _ => "failed",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

/// A [`Promise`] that additionally carries a value.
#[derive(Debug, Default)]
pub struct TypedPromise<T> {
    inner: Promise,
    value: OnceLock<T>,
}

impl<T> TypedPromise<T> {
    /// A pending typed promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Promise::new(),
            value: OnceLock::new(),
        }
    }

    /// Satisfy with `value`. No-op if already satisfied.
    pub fn set_success(&self, value: T) {
        if self.value.set(value).is_ok() {
            self.inner.set_success();
        }
    }

    /// Satisfy with an error. No-op if already satisfied.
    pub fn set_exception(&self, failure: PromiseFailure) { self.inner.set_exception(failure); }

    /// Rethrow, then borrow the stored value.
    ///
    /// # Errors
    ///
    /// Returns the stored failure, or an internal failure while the promise
    /// is still pending.
    pub fn get(&self) -> Result<&T, PromiseFailure> {
        self.inner.check_and_rethrow()?;
        self.value.get().ok_or_else(|| {
            PromiseFailure::from_boxed("promise value not yet assigned".into())
        })
    }

    /// The untyped promise, for passing to [`yield_until`].
    #[must_use]
    pub fn as_promise(&self) -> &Promise { &self.inner }
}

/// Suspend the current job until `promise` is satisfied, then rethrow its
/// outcome.
///
/// The suspension is an ordinary await: the task draining the job's
/// category parks here, every other category keeps progressing, and resume
/// may happen on any worker thread. `insignificant` marks wakes whose
/// latency does not matter; the current implementation honours it only as
/// documentation of intent.
///
/// # Errors
///
/// Returns the promise's stored failure when it was satisfied with an
/// error.
pub async fn yield_until(promise: &Promise, insignificant: bool) -> Result<(), PromiseFailure> {
    let _ = insignificant;
    promise.wait().await;
    promise.check_and_rethrow()
}
