use crate::{Deferred, Error};
use std::{
    future::Future,
    mem,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll, Waker},
};

/// Future returned by [`Deferred::settled`].
///
/// Resolves to the outcome of the deferred value, or to
/// [`Error::Abandoned`] if every handle to it was dropped while it was still
/// pending. It does not keep the deferred value alive.
///
/// # Examples
///
/// ```
/// use deferred_value::Deferred;
/// use futures::executor::block_on;
/// use std::thread;
///
/// let deferred = Deferred::<String, String>::pending();
/// let settled = deferred.settled();
/// let producer = thread::spawn(move || deferred.fulfill("Hi".into()));
/// assert_eq!(block_on(settled), Ok(Ok("Hi".to_string())));
/// producer.join().expect("The producer thread has panicked").unwrap();
/// ```
#[derive(Debug)]
pub struct Settled<T, E> {
    slot: Arc<Mutex<Slot<T, E>>>,
}

#[derive(Debug)]
enum Slot<T, E> {
    Waiting(Option<Waker>),
    Ready(Result<Result<T, E>, Error>),
    Taken,
}

/// The registered end of a [`Settled`]. Dropping it unsettled, which happens
/// when the deferred value and its observers are dropped, abandons the future.
struct Notifier<T, E> {
    slot: Arc<Mutex<Slot<T, E>>>,
}

impl<T, E> Notifier<T, E> {
    fn deliver(&self, outcome: Result<Result<T, E>, Error>) {
        let waker = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            match mem::replace(&mut *slot, Slot::Ready(outcome)) {
                Slot::Waiting(waker) => waker,
                // Already delivered; keep what the consumer has.
                previous => {
                    *slot = previous;
                    None
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake()
        }
    }
}

impl<T, E> Drop for Notifier<T, E> {
    fn drop(&mut self) {
        self.deliver(Err(Error::Abandoned));
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// A future for the outcome of this value.
    pub fn settled(&self) -> Settled<T, E> {
        let slot = Arc::new(Mutex::new(Slot::Waiting(None)));
        let notifier = Notifier { slot: slot.clone() };
        self.on_complete(move |outcome| notifier.deliver(Ok(outcome)));
        Settled { slot }
    }
}

impl<T, E> Future for Settled<T, E> {
    type Output = Result<Result<T, E>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(outcome) => Poll::Ready(outcome),
            Slot::Waiting(_) => {
                *slot = Slot::Waiting(Some(cx.waker().clone()));
                Poll::Pending
            }
            Slot::Taken => panic!("`Settled` polled after completion"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Deferred, Error};
    use futures::executor::block_on;
    use std::thread;

    #[test]
    fn test_settled_on_already_fulfilled() {
        let deferred = Deferred::<i32, String>::resolved(5);
        assert_eq!(block_on(deferred.settled()), Ok(Ok(5)));
    }

    #[test]
    fn test_settled_on_fail_from_other_thread() {
        let deferred = Deferred::<i32, String>::pending();
        let settled = deferred.settled();
        let task = thread::spawn(move || deferred.fail("reject!!".into()));
        assert_eq!(block_on(settled), Ok(Err("reject!!".to_string())));
        task.join().expect("The task thread has panicked").unwrap();
    }

    #[test]
    fn test_settled_abandoned_when_handles_dropped() {
        let deferred = Deferred::<i32, String>::pending();
        let settled = deferred.settled();
        std::mem::drop(deferred);
        assert_eq!(block_on(settled), Err(Error::Abandoned));
    }
}
