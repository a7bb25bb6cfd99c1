//! Error taxonomy for the delivery engine
//!
//! Dispatch failures are classified exactly once, at the downstream-client
//! boundary, into a closed set of kinds. The dispatcher only ever inspects
//! the kind: transient errors enter the retry table, unauthorized errors
//! stop the transport, everything else is logged and dropped.

use std::fmt;

/// Result type alias for delivery operations
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Closed classification of delivery failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network faults and gateway/synchronizer-busy responses; eligible for
    /// the dispatcher retry table
    Transient,

    /// Downstream rejected credentials; transport stops until reconfigured
    Unauthorized,

    /// Any other non-2xx response, malformed payload, or unexpected
    /// condition; logged, never retried
    Undecided,

    /// Queue full or payload over the size limit even after compression;
    /// surfaced immediately to the caller
    Capacity,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient error"),
            ErrorKind::Unauthorized => write!(f, "unauthorized"),
            ErrorKind::Undecided => write!(f, "undecided error"),
            ErrorKind::Capacity => write!(f, "capacity error"),
        }
    }
}

/// An error produced while delivering a payload downstream
#[derive(Debug, Clone)]
pub struct DeliveryError {
    kind: ErrorKind,
    message: String,
}

impl DeliveryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn undecided(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Undecided, message)
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Capacity, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for DeliveryError {}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::undecided(err.to_string())
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(err: std::io::Error) -> Self {
        DeliveryError::transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_preserved() {
        let err = DeliveryError::transient("connection reset");
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_transient());

        let err = DeliveryError::unauthorized("401");
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(!err.is_transient());
    }

    #[test]
    fn display_includes_kind() {
        let err = DeliveryError::capacity("queue full");
        assert_eq!(err.to_string(), "capacity error: queue full");
    }
}
