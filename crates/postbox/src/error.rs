use crate::queue::QueueError;
use postbox_wire::{EnvelopeError, SignerError};
use thiserror::Error;

/// Errors that can occur during bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The named endpoint (or its queue) does not exist.
    #[error("unknown endpoint: {0}")]
    EndpointUnknown(String),
    /// A directory exists at the endpoint's path but was not produced by
    /// a previous open.
    #[error("directory exists but is not an endpoint: {0}")]
    NotAnEndpoint(String),
    /// An endpoint or topic name is structurally unacceptable.
    #[error("invalid name: {0}")]
    InvalidName(String),
    /// A receive elapsed without a message.
    #[error("timed out waiting for a message")]
    Timeout,
    /// Envelope construction, parsing, or validation failed.
    #[error(transparent)]
    Wire(#[from] EnvelopeError),
    /// The signing backend failed.
    #[error(transparent)]
    Signer(#[from] SignerError),
    /// The underlying queue failed.
    #[error("queue error: {0}")]
    Queue(QueueError),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<QueueError> for BusError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Timeout => Self::Timeout,
            other => Self::Queue(other),
        }
    }
}
