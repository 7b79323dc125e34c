/// Where a [`Deferred`](crate::Deferred) is in its life.
///
/// `Pending` is the only state that can change; `Fulfilled` and `Failed` are
/// terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<T, E> {
    Pending,
    Fulfilled(T),
    Failed(E),
}

impl<T, E> State<T, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            State::Fulfilled(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            State::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// The terminal outcome, or `None` while pending.
    pub fn as_outcome(&self) -> Option<Result<&T, &E>> {
        match self {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value)),
            State::Failed(error) => Some(Err(error)),
        }
    }
}

impl<T, E> From<Result<T, E>> for State<T, E> {
    fn from(outcome: Result<T, E>) -> Self {
        match outcome {
            Ok(value) => State::Fulfilled(value),
            Err(error) => State::Failed(error),
        }
    }
}
