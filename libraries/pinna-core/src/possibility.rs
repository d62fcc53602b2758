//! Tri-state result container.
//!
//! A [`Possibility`] is how outcomes move across asynchronous boundaries:
//! post-processors consume and produce them, and `when_all` collects one per
//! child promise.

use crate::error::Error;

/// The contents of a possibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PossibilityState {
    Empty,
    Value,
    Error,
}

/// Empty, a value, or an error. Exactly one holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Possibility<T, E = Error> {
    /// Nothing
    Empty,
    /// A value
    Value(T),
    /// An error
    Error(E),
}

impl<T, E> Default for Possibility<T, E> {
    fn default() -> Self {
        Self::Empty
    }
}

impl<T, E> Possibility<T, E> {
    pub fn value(value: T) -> Self {
        Self::Value(value)
    }

    pub fn error(error: E) -> Self {
        Self::Error(error)
    }

    pub fn empty() -> Self {
        Self::Empty
    }

    pub fn state(&self) -> PossibilityState {
        match self {
            Self::Empty => PossibilityState::Empty,
            Self::Value(_) => PossibilityState::Value,
            Self::Error(_) => PossibilityState::Error,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The value, or `None` for the other states.
    pub fn as_value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The error, or `None` for the other states.
    pub fn as_error(&self) -> Option<&E> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_error(self) -> Option<E> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }

    /// Pass a value through `refiner`; errors and empties pass through untouched.
    pub fn refine_value<U>(self, refiner: impl FnOnce(T) -> Possibility<U, E>) -> Possibility<U, E> {
        match self {
            Self::Value(value) => refiner(value),
            Self::Error(error) => Possibility::Error(error),
            Self::Empty => Possibility::Empty,
        }
    }

    /// Pass an error through `refiner`; values and empties pass through untouched.
    pub fn refine_error(self, refiner: impl FnOnce(E) -> Self) -> Self {
        match self {
            Self::Error(error) => refiner(error),
            other => other,
        }
    }

    /// Replace an empty possibility with the result of `refiner`.
    pub fn refine_empty(self, refiner: impl FnOnce() -> Self) -> Self {
        match self {
            Self::Empty => refiner(),
            other => other,
        }
    }

    /// Map the value, keeping the state.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Possibility<U, E> {
        self.refine_value(|value| Possibility::Value(f(value)))
    }

    pub fn when_value(&self, matcher: impl FnOnce(&T)) -> &Self {
        if let Self::Value(value) = self {
            matcher(value);
        }
        self
    }

    pub fn when_error(&self, matcher: impl FnOnce(&E)) -> &Self {
        if let Self::Error(error) = self {
            matcher(error);
        }
        self
    }

    pub fn when_empty(&self, matcher: impl FnOnce()) -> &Self {
        if self.is_empty() {
            matcher();
        }
        self
    }

    /// `None` when empty, otherwise the value or error as a `Result`.
    pub fn into_result(self) -> Option<Result<T, E>> {
        match self {
            Self::Empty => None,
            Self::Value(value) => Some(Ok(value)),
            Self::Error(error) => Some(Err(error)),
        }
    }
}

impl<T, E> Possibility<Option<T>, E> {
    /// Treat a `None` value as empty, the way a promise accepted with nothing reads.
    pub fn flatten(self) -> Possibility<T, E> {
        match self {
            Self::Value(Some(value)) => Possibility::Value(value),
            Self::Value(None) | Self::Empty => Possibility::Empty,
            Self::Error(error) => Possibility::Error(error),
        }
    }
}

impl<T, E> From<Result<T, E>> for Possibility<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Value(value),
            Err(error) => Self::Error(error),
        }
    }
}

impl<T, E> From<Option<T>> for Possibility<T, E> {
    fn from(option: Option<T>) -> Self {
        option.map_or(Self::Empty, Self::Value)
    }
}
