//! The possible error types when using the swirl crate.
use thiserror::Error;

/// An enumeration of `swirl` errors.
#[derive(Debug, Error)]
pub enum SwirlError {
    /// A generic error when there is an underlying error with a `TCP`
    /// connection
    #[error("Network error")]
    Network(#[from] std::io::Error),
    /// A message header failed the magic/version/length validation. Framing
    /// is lost at this point, so the connection must be dropped.
    #[error("Invalid message header: {0}")]
    BadHeader(String),
    /// An opcode this party never expects from its peer
    #[error("Unexpected opcode: {0}")]
    UnexpectedOpcode(u8),
    /// An error when a connection is closed unexpectedly
    #[error("Unexpected stream shutdown")]
    StreamClosed,
    /// A task descriptor could not be parsed or admitted
    #[error("Task rejected: {0}")]
    BadTask(String),
    /// The training set could not be loaded
    #[error("Dataset error: {0}")]
    Dataset(String),
    /// A payload length does not agree with what the header and the local
    /// state imply
    #[error("Payload size mismatch: {0}")]
    SizeMismatch(String),
    /// The local replica disagrees with the peer in a way that cannot be
    /// recovered by the catch-up path
    #[error("State mismatch: {0}")]
    StateMismatch(String),
    /// A per-row solve failed, e.g. the normal equations lost positive
    /// definiteness
    #[error("Numerical failure: {0}")]
    Numeric(String),
    /// No workers are attached when a task needs to start
    #[error("No labor connections available")]
    NoLabor,
    /// A listen or connect address that cannot be parsed
    #[error("Invalid address: {0}")]
    BadAddress(String),
    /// The process-wide terminate flag was raised mid-operation
    #[error("Terminated by signal")]
    Terminated,
}
