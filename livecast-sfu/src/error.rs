use crate::engine::EngineError;
use crate::types::{ProducerId, TransportRole};
use thiserror::Error;

/// Errors returned by relay operations.
///
/// The `Display` output is the message sent back to the client as
/// `{"error": ...}`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SfuError {
    // Resource errors (retryable)
    #[error("no free RTC port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    #[error("transport creation failed: {0}")]
    TransportCreation(String),

    // Protocol errors (caller mistakes)
    #[error("session not found")]
    SessionNotFound,

    #[error("session closed")]
    SessionClosed,

    #[error("{0} transport not found")]
    TransportNotFound(TransportRole),

    #[error("{0} transport not connected")]
    TransportNotConnected(TransportRole),

    #[error("{0} transport already connected")]
    TransportAlreadyConnected(TransportRole),

    #[error("transport closed")]
    TransportClosed,

    #[error("invalid DTLS parameters: {0}")]
    InvalidDtlsParameters(String),

    #[error("producer not found")]
    ProducerNotFound,

    #[error("consumer not found")]
    ConsumerNotFound,

    #[error("unsupported RTP parameters: {0}")]
    UnsupportedRtpParameters(String),

    #[error("cannot consume producer {0}")]
    CannotConsume(ProducerId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Engine errors
    #[error("invalid media codec configuration: {0}")]
    InvalidCodecConfig(String),

    #[error("media engine error: {0}")]
    Engine(String),

    #[error("media engine closed")]
    EngineClosed,
}

impl SfuError {
    /// The caller may retry the same request later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::PortsExhausted { .. } | Self::TransportCreation(_))
    }

    /// The engine behind the relay is gone
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::EngineClosed)
    }
}

impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::WorkerClosed => Self::EngineClosed,
            EngineError::TransportClosed => Self::TransportClosed,
            EngineError::ProducerNotFound => Self::ProducerNotFound,
            EngineError::ConsumerNotFound => Self::ConsumerNotFound,
            EngineError::Rejected(msg) => Self::Engine(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
