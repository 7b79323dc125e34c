use crate::{observer::Observer, Error, SharedError, State};
use log::{debug, trace, warn};
use std::{
    fmt::Debug,
    mem,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
};

/// A single-assignment value that is settled once, either fulfilled with a
/// `T` or failed with an `E`, and tells its observers when that happens.
///
/// `Deferred` is a handle: clones share the same state and observers. The
/// producer keeps one clone to resolve it, consumers keep others to observe
/// it.
///
/// # Examples
///
/// ```
/// use deferred_value::Deferred;
/// use std::sync::{Arc, Mutex};
///
/// let seen = Arc::new(Mutex::new(None));
/// let deferred = Deferred::<i32, String>::pending();
/// let slot = seen.clone();
/// deferred
///     .map(|v| v * 2)
///     .on_success(move |v| *slot.lock().unwrap() = Some(v));
///
/// deferred.fulfill(21).unwrap();
/// assert_eq!(*seen.lock().unwrap(), Some(42));
/// ```
pub struct Deferred<T, E = SharedError> {
    shared: Arc<Shared<T, E>>,
}

struct Shared<T, E> {
    inner: Mutex<Inner<T, E>>,
    /// Signalled when a dispatch pass ends.
    dispatched: Condvar,
}

struct Inner<T, E> {
    state: State<T, E>,
    observers: Vec<Observer<T, E>>,
    /// The thread running the dispatch pass, if one is in progress.
    dispatching: Option<ThreadId>,
}

impl<T, E> Shared<T, E> {
    fn lock(&self) -> MutexGuard<'_, Inner<T, E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks the end of a dispatch pass, also when an observer unwinds.
struct DispatchPass<'a, T, E> {
    shared: &'a Shared<T, E>,
}

impl<T, E> Drop for DispatchPass<'_, T, E> {
    fn drop(&mut self) {
        self.shared.lock().dispatching = None;
        self.shared.dispatched.notify_all();
    }
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn with_state(state: State<T, E>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state,
                    observers: vec![],
                    dispatching: None,
                }),
                dispatched: Condvar::new(),
            }),
        }
    }

    /// An empty value waiting for [`fulfill`](Self::fulfill) or
    /// [`fail`](Self::fail).
    pub fn pending() -> Self {
        Self::with_state(State::Pending)
    }

    /// A value that is fulfilled from the start.
    pub fn resolved(value: T) -> Self {
        Self::with_state(State::Fulfilled(value))
    }

    /// A value that has failed from the start.
    pub fn failed(error: E) -> Self {
        Self::with_state(State::Failed(error))
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T, E>> {
        self.shared.lock()
    }

    pub fn value(&self) -> Option<T> {
        self.lock().state.value().cloned()
    }

    pub fn error(&self) -> Option<E> {
        self.lock().state.error().cloned()
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> State<T, E> {
        self.lock().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.lock().state.is_pending()
    }

    pub fn is_settled(&self) -> bool {
        self.lock().state.is_settled()
    }

    /// Calls `callback` with the value once fulfilled. Runs it right away if
    /// the value is already there; never runs it if this fails.
    pub fn on_success<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.register(Observer::Fulfill(Box::new(callback)))
    }

    /// Calls `callback` with the error once failed. Runs it right away if the
    /// error is already there; never runs it if this is fulfilled.
    pub fn on_failure<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(E) + Send + 'static,
    {
        self.register(Observer::Fail(Box::new(callback)))
    }

    /// Calls `callback` with whichever outcome this settles to.
    pub fn on_complete<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(Result<T, E>) + Send + 'static,
    {
        self.register(Observer::Both(Box::new(callback)))
    }

    /// Calls `callback` exactly once when this settles, whatever the outcome.
    pub fn on_settle<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_complete(move |_| callback())
    }

    fn register(&self, observer: Observer<T, E>) -> &Self {
        let outcome = {
            let me = thread::current().id();
            // Another thread's dispatch pass must finish first, so this
            // observer cannot overtake the ones registered before it. The
            // dispatching thread itself goes straight through.
            let mut inner = self
                .shared
                .dispatched
                .wait_while(self.lock(), |inner| {
                    inner.dispatching.is_some_and(|id| id != me)
                })
                .unwrap_or_else(PoisonError::into_inner);
            let settled = inner
                .state
                .as_outcome()
                .map(|outcome| outcome.map(T::clone).map_err(E::clone));
            let Some(outcome) = settled else {
                inner.observers.push(observer);
                return self;
            };
            outcome
        };
        trace!("observer registered on a settled value, notifying now");
        observer.notify(outcome.as_ref());
        self
    }

    /// A new value fulfilled with `transform(value)` once this is fulfilled.
    /// Failures are passed through untouched.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred_value::Deferred;
    ///
    /// let source = Deferred::<i32, String>::pending();
    /// let text = source.map(|v| v.to_string());
    /// source.fulfill(5).unwrap();
    /// assert_eq!(text.value(), Some("5".to_string()));
    /// ```
    ///
    /// # Panics
    ///
    /// A panic in `transform` unwinds out of the `fulfill` call that settled
    /// this value. Observers queued after this one in the same pass are
    /// dropped without being called. Use [`try_map`](Self::try_map) for
    /// transforms that can fail.
    pub fn map<S, F>(&self, transform: F) -> Deferred<S, E>
    where
        S: Clone + Send + 'static,
        F: FnOnce(T) -> S + Send + 'static,
    {
        self.try_map(move |value| Ok(transform(value)))
    }

    /// Like [`map`](Self::map), but an `Err` from `transform` fails the new
    /// value.
    pub fn try_map<S, F>(&self, transform: F) -> Deferred<S, E>
    where
        S: Clone + Send + 'static,
        F: FnOnce(T) -> Result<S, E> + Send + 'static,
    {
        let derived = Deferred::pending();
        let target = derived.clone();
        self.on_complete(move |outcome| forward(&target, outcome.and_then(transform)));
        derived
    }

    /// A new value failed with `transform(error)` once this fails. Values are
    /// passed through untouched.
    pub fn map_err<R, F>(&self, transform: F) -> Deferred<T, R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(E) -> R + Send + 'static,
    {
        let derived = Deferred::pending();
        let target = derived.clone();
        self.on_complete(move |outcome| forward(&target, outcome.map_err(transform)));
        derived
    }

    /// Fulfills a pending value and notifies its observers in the order they
    /// registered, on the calling thread, before returning.
    ///
    /// Until it returns, observers registered from other threads wait, so an
    /// observer must not block on another thread that registers on this
    /// value.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadySettled`] if this was already fulfilled or failed. The
    /// stored outcome is left alone and no observer runs.
    pub fn fulfill(&self, value: T) -> Result<(), Error> {
        self.settle(Ok(value))
    }

    /// Fails a pending value and notifies its observers in the order they
    /// registered, on the calling thread, before returning.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadySettled`] if this was already fulfilled or failed.
    pub fn fail(&self, error: E) -> Result<(), Error> {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T, E>) -> Result<(), Error> {
        // The pending check, the write and the drain are one critical section.
        // Observers run after the lock is released so they can touch this
        // value again. Registrations from this thread then fire at once,
        // registrations from other threads wait for the pass to end.
        let observers = {
            let mut inner = self.lock();
            if inner.state.is_settled() {
                warn!("attempted to settle a deferred value twice");
                return Err(Error::AlreadySettled);
            }
            inner.state = State::from(outcome.clone());
            inner.dispatching = Some(thread::current().id());
            mem::take(&mut inner.observers)
        };
        let _pass = DispatchPass {
            shared: &*self.shared,
        };
        trace!(
            "deferred value {}, notifying {} observers",
            if outcome.is_ok() { "fulfilled" } else { "failed" },
            observers.len()
        );
        for observer in observers {
            observer.notify(outcome.as_ref());
        }
        Ok(())
    }
}

fn forward<T, E>(target: &Deferred<T, E>, outcome: Result<T, E>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    debug!("forwarding outcome to derived value");
    if target.settle(outcome).is_err() {
        warn!("derived value was settled by another holder first, dropping forwarded outcome");
    }
}

impl<T, E> Default for Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::pending()
    }
}

impl<T: Debug, E: Debug> Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Deferred")
            .field("state", &inner.state)
            .field("observers", &inner.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Deferred;
    use crate::{Error, State};
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{Arc, Mutex},
        thread,
    };

    #[test]
    fn test_second_settle_is_rejected() {
        let deferred = Deferred::<&str, String>::pending();
        assert_eq!(deferred.fulfill("ok"), Ok(()));
        assert_eq!(deferred.fulfill("again"), Err(Error::AlreadySettled));
        assert_eq!(deferred.fail("late".into()), Err(Error::AlreadySettled));
        assert_eq!(deferred.state(), State::Fulfilled("ok"));
    }

    #[test]
    fn test_observers_are_drained_after_dispatch() {
        let deferred = Deferred::<i32, String>::pending();
        deferred.on_success(|_| {}).on_failure(|_| {});
        assert_eq!(deferred.shared.inner.lock().unwrap().observers.len(), 2);
        deferred.fulfill(1).unwrap();
        assert!(deferred.shared.inner.lock().unwrap().observers.is_empty());
    }

    #[test]
    fn test_settled_values_store_no_observers() {
        let deferred = Deferred::<i32, String>::failed("boom".into());
        deferred.on_success(|_| {}).on_settle(|| {});
        assert!(deferred.shared.inner.lock().unwrap().observers.is_empty());
    }

    #[test]
    fn test_observer_can_resolve_its_own_value_without_deadlock() {
        let deferred = Deferred::<i32, String>::pending();
        let result = Arc::new(Mutex::new(None));
        let (handle, slot) = (deferred.clone(), result.clone());
        deferred.on_success(move |_| *slot.lock().unwrap() = Some(handle.fulfill(2)));
        deferred.fulfill(1).unwrap();
        assert_eq!(*result.lock().unwrap(), Some(Err(Error::AlreadySettled)));
        assert_eq!(deferred.value(), Some(1));
    }

    #[test]
    fn test_panicking_observer_ends_the_dispatch_pass() {
        let deferred = Deferred::<i32, String>::pending();
        deferred.on_success(|_| panic!("observer failed"));
        let producer = deferred.clone();
        let result = panic::catch_unwind(AssertUnwindSafe(|| producer.fulfill(1)));
        assert!(result.is_err());
        assert_eq!(deferred.shared.inner.lock().unwrap().dispatching, None);

        let seen = Arc::new(Mutex::new(None));
        let (handle, slot) = (deferred.clone(), seen.clone());
        thread::spawn(move || {
            handle.on_success(move |v| *slot.lock().unwrap() = Some(v));
        })
        .join()
        .expect("The registrar thread has panicked");
        assert_eq!(*seen.lock().unwrap(), Some(1));
    }

    #[test]
    fn test_debug_shows_state_and_observer_count() {
        let deferred = Deferred::<i32, String>::pending();
        deferred.on_settle(|| {});
        assert_eq!(
            format!("{deferred:?}"),
            "Deferred { state: Pending, observers: 1 }"
        );
    }
}
