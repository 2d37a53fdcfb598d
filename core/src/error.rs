//! Error handling for this crate
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A Result containing a SystemError with its accompanying source
pub type TypedResult<T> = Result<T, TypedError>;

/// Broad classification of a fault somewhere between the serial bus and the
/// scheduler.
///
/// The scheduler keys its recovery policy off this classification alone; the
/// human-readable cause travels in the accompanying [anyhow::Error].
#[derive(Error, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SystemError {
    #[error("Wire read returned too few bytes, timed out or framing was invalid")]
    ReadFailure,
    #[error("Configuration error")]
    Config,
    #[error("Pump or probe overlaps an existing session lease")]
    LeaseConflict,
    #[error("Serial bus open or write failure")]
    Bus,
    #[error("Broker wire protocol violation")]
    Protocol,
}

/// Combination of a SystemError with an anyhow error
#[derive(Error, Debug)]
#[error("{err}: {source:?}")]
pub struct TypedError {
    err: SystemError,
    source: anyhow::Error,
}

impl TypedError {
    /// Creates a new TypedError
    pub fn new(err: SystemError, source: anyhow::Error) -> Self {
        Self { err, source }
    }

    /// Returns the SystemError of this TypedError
    pub fn err(&self) -> SystemError {
        self.err
    }

    /// Returns the anyhow error of this TypedError
    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }
}

/// Converts a Result into one of our own Result types
pub trait ResultExt<T> {
    /// Converts a Result to a TypedResult
    fn typ(self, err: SystemError) -> TypedResult<T>;
}

impl<T, E: Into<anyhow::Error>> ResultExt<T> for Result<T, E> {
    fn typ(self, err: SystemError) -> TypedResult<T> {
        self.map_err(|e| TypedError {
            err,
            source: e.into(),
        })
    }
}

/// Shorthand for returning a new [TypedError]
///
/// Allows expressing
///
/// ```no_run
/// # use anyhow::anyhow;
/// # use phstat_core::error::{TypedError, TypedResult, SystemError};
/// # fn main() -> TypedResult<()> {
/// let port = "COM3";
/// return Err(TypedError::new(
///     SystemError::Bus,
///     anyhow!("could not open {port}"),
/// ));
/// # }
/// ```
///
/// as a more compact
///
/// ```no_run
/// # use phstat_core::error::TypedResult;
/// # use phstat_core::problem;
/// # fn main() -> TypedResult<()> {
/// # let port = "COM3";
/// problem!(Bus, "could not open {port}");
/// # }
/// ```
#[macro_export]
macro_rules! problem {
    ($typed_err: expr, $($tail:tt)*) => {{
        #[allow(unused_imports)]
        use $crate::error::SystemError::*;
        let problem = ::anyhow::anyhow!($($tail)*);
        return $crate::error::TypedResult::Err(
            $crate::error::TypedError::new($typed_err, problem)
        );
    }};
}
