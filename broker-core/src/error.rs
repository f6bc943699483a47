//! Shared error taxonomy (spec §7): malformed, unauthorized, unreachable,
//! overloaded, transient. Subsystem-specific errors (codec, registry, ...)
//! wrap into [`BrokerError`] at the boundary where the pipeline needs to
//! decide how to react.

use thiserror::Error;

/// The five error kinds the dispatcher distinguishes when deciding how to
/// react to a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Codec rejected the frame; an originating NAK may be warranted.
    Malformed,
    /// Authorization policy rejected the frame; dropped silently.
    Unauthorized,
    /// No destination or no service could be found for a request.
    Unreachable,
    /// A destination's queue was full.
    Overloaded,
    /// A handler raised an unexpected error; logged and the phase continues.
    Transient,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("overloaded: {0}")]
    Overloaded(String),
    #[error("transient failure: {0}")]
    Transient(String),
}

impl BrokerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::Malformed(_) => ErrorCode::Malformed,
            BrokerError::Unauthorized(_) => ErrorCode::Unauthorized,
            BrokerError::Unreachable(_) => ErrorCode::Unreachable,
            BrokerError::Overloaded(_) => ErrorCode::Overloaded,
            BrokerError::Transient(_) => ErrorCode::Transient,
        }
    }
}

/// Stable error codes emitted within DXL-style error message payloads
/// (spec §6, "Emitted error codes").
pub mod reply_codes {
    pub const SERVICE_UNAVAILABLE: &str = "service-unavailable";
    pub const SERVICE_OVERLOADED: &str = "service-overloaded";
    pub const RESPONSE_TIMEOUT: &str = "response-timeout";
    pub const SERVICE_LIMIT_EXCEEDED: &str = "service-limit-exceeded";
    pub const SUBSCRIPTION_LIMIT_EXCEEDED: &str = "subscription-limit-exceeded";
}
