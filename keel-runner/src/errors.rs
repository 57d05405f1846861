//! Error aggregation
//!
//! Pipeline cleanup keeps going after a failure, so several errors can pile up
//! for one stage. The first one is the cause operators care about, the rest
//! are appended to it rather than replacing it.

use anyhow::{Error, anyhow};

/// Accumulates errors, keeping the first as the primary cause
#[derive(Debug, Default)]
pub struct ErrorChain {
    error: Option<Error>,
}

impl ErrorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an error to the chain
    pub fn push(&mut self, error: Error) {
        self.error = Some(match self.error.take() {
            Some(primary) => Self::append(primary, Err::<(), _>(error)),
            None => error,
        });
    }

    /// Returns `primary` with the error of `next`, if any, appended
    pub fn append<T>(primary: Error, next: anyhow::Result<T>) -> Error {
        match next {
            Ok(_) => primary,
            Err(error) => anyhow!("{:#}: {:#}", primary, error),
        }
    }

    /// Appends the error of a result, if any
    pub fn push_result<T>(&mut self, result: anyhow::Result<T>) {
        if let Err(error) = result {
            self.push(error);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> anyhow::Result<()> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl From<Error> for ErrorChain {
    fn from(error: Error) -> Self {
        Self { error: Some(error) }
    }
}
