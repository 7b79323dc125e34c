/// A registered callback record. Each variant fires at most once.
pub(crate) enum Observer<T, E> {
    Fulfill(Box<dyn FnOnce(T) + Send>),
    Fail(Box<dyn FnOnce(E) + Send>),
    Both(Box<dyn FnOnce(Result<T, E>) + Send>),
}

impl<T, E> Observer<T, E>
where
    T: Clone,
    E: Clone,
{
    /// Hands the outcome to the branch this record listens on. A record for
    /// the other branch is dropped without being called.
    pub(crate) fn notify(self, outcome: Result<&T, &E>) {
        match (self, outcome) {
            (Observer::Fulfill(callback), Ok(value)) => callback(value.clone()),
            (Observer::Fail(callback), Err(error)) => callback(error.clone()),
            (Observer::Both(callback), outcome) => {
                callback(outcome.map(T::clone).map_err(E::clone))
            }
            _ => {}
        }
    }
}
