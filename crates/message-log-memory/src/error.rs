use herald_message_log::MessageLogError;
use thiserror::Error;

/// Errors that can occur when using the in-memory message log.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The log was configured to refuse writes.
    #[error("message log is read-only")]
    ReadOnly,

    /// A page was requested with a zero limit.
    #[error("page limit must be greater than zero")]
    ZeroLimit,
}

impl MessageLogError for Error {}
