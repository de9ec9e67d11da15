use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by release futures and effect makers.
///
/// `Clone` because a resource's release outcome is shared between every
/// caller that awaited it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A release action failed.
    #[error("release failed: {0}")]
    Release(String),

    /// An effect maker failed.
    #[error("effect failed: {0}")]
    Effect(String),

    /// An effect was cancelled through its abort signal before producing
    /// a value.
    #[error("effect aborted")]
    Aborted,

    /// Several releases failed while being driven together.
    #[error("{} releases failed (first: {})", .0.len(), .0[0])]
    Aggregate(Vec<Error>),
}

impl Error {
    pub fn release(msg: impl Into<String>) -> Self {
        Error::Release(msg.into())
    }

    pub fn effect(msg: impl Into<String>) -> Self {
        Error::Effect(msg.into())
    }

    /// Folds collected failures into a single error: none → `None`, one →
    /// itself, several → `Aggregate`.
    pub fn collect(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Aggregate(errors)),
        }
    }
}
