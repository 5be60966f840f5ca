//! Error types for ce-queue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A caller supplied an argument the operation can never accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation conflicts with the current state of the task.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("compute engine does not currently accept new tasks")]
    SubmitPaused,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// State-conflict errors: the caller may retry once the state changes.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Error::IllegalState(_) | Error::SubmitPaused)
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_paused_is_an_illegal_state() {
        assert!(Error::SubmitPaused.is_illegal_state());
        assert!(Error::IllegalState("x".into()).is_illegal_state());
        assert!(!Error::InvalidArgument("x".into()).is_illegal_state());
    }

    #[test]
    fn submit_paused_message_names_the_engine() {
        assert_eq!(
            Error::SubmitPaused.to_string(),
            "compute engine does not currently accept new tasks"
        );
    }
}
