/// Errors produced by the split-tunnel core.
///
/// Each variant maps to exactly one status value on the request interface,
/// see [`Error::status_code`].
#[derive(err_derive::Error, Debug)]
#[error(no_from)]
pub enum Error {
    /// An allocation or identifier space was exhausted.
    #[error(display = "Insufficient resources to complete the operation")]
    ResourceExhausted,

    /// A caller-supplied argument was rejected outright.
    #[error(display = "Invalid argument: {}", _0)]
    InvalidArgument(&'static str),

    /// A caller-supplied buffer failed structural validation.
    #[error(display = "Malformed request buffer: {}", _0)]
    InvalidBuffer(&'static str),

    /// An insertion collided with an existing key.
    #[error(display = "An entry already exists for this key")]
    DuplicateObject,

    /// A lookup found no matching entry.
    #[error(display = "No entry found for this key")]
    NotFound,

    /// The request is not valid given the current driver state.
    #[error(display = "Request is not valid in the current driver state")]
    StateMismatch,

    /// A transaction commit/abort was attempted from a thread that did not open it.
    #[error(display = "Transaction is owned by a different thread")]
    TransactionOwnerMismatch,

    /// The packet-filter framework reported a failure.
    #[error(display = "The packet-filter framework reported a failure")]
    FrameworkFailure(#[error(source)] FrameworkError),

    /// Teardown could not complete; the driver is now in the zombie state.
    #[error(display = "Teardown failed; the driver has entered the zombie state")]
    FatalTeardownFailure,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wraps a failure reported by the host packet-filter framework (e.g. a WFP
/// management call). Kept distinct from [`Error`] so framework call sites can
/// attach a raw status code without inventing new `Error` variants per call.
#[derive(err_derive::Error, Debug)]
#[error(display = "framework call failed (code {:#x}): {}", code, message)]
pub struct FrameworkError {
    pub code: i32,
    pub message: String,
}

impl FrameworkError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        FrameworkError {
            code,
            message: message.into(),
        }
    }
}

/// Status values surfaced on the request interface, see spec §6-7.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success = 0,
    ResourceExhausted,
    InvalidArgument,
    InvalidBuffer,
    DuplicateObject,
    NotFound,
    StateMismatch,
    TransactionOwnerMismatch,
    FrameworkFailure,
    FatalTeardownFailure,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ResourceExhausted => StatusCode::ResourceExhausted,
            Error::InvalidArgument(_) => StatusCode::InvalidArgument,
            Error::InvalidBuffer(_) => StatusCode::InvalidBuffer,
            Error::DuplicateObject => StatusCode::DuplicateObject,
            Error::NotFound => StatusCode::NotFound,
            Error::StateMismatch => StatusCode::StateMismatch,
            Error::TransactionOwnerMismatch => StatusCode::TransactionOwnerMismatch,
            Error::FrameworkFailure(_) => StatusCode::FrameworkFailure,
            Error::FatalTeardownFailure => StatusCode::FatalTeardownFailure,
        }
    }
}
