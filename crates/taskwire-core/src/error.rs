//! Error types for the taskwire transport.
//!
//! Transport failures are surfaced to the caller with enough context
//! (address, operation) to be logged once at the point they are handled.
//! Termination of a messaging context is *not* an error; it is reported as a
//! [`MessageStatus::Term`](crate::message::MessageStatus::Term) message instead.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the taskwire transport.
#[derive(Debug, Error)]
pub enum TransportError {
    // Socket errors
    #[error("IO error on {address:?}: {message}")]
    Io {
        message: String,
        address: Option<String>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Socket error on {address:?}: {source}")]
    Socket {
        address: Option<String>,
        #[source]
        source: zmq::Error,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Address already bound: {0}")]
    AddressInUse(String),

    #[error("Receive timed out after {0:?}")]
    Timeout(Duration),

    #[error("Received more bytes than buffer can hold. Received: {received}, capacity {capacity}")]
    Truncated { received: u64, capacity: u64 },

    #[error("Socket {id} used from a thread that did not open it")]
    WrongThread { id: u64 },

    #[error("Socket is closed: {0}")]
    SocketClosed(String),

    // Protocol errors
    #[error("Unsuccessful message to server {label}: {status}")]
    UnexpectedStatus { label: String, status: String },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Coordination errors
    #[error("Latch timed out after {0:?}")]
    LatchTimeout(Duration),

    #[error("Server {0} already started")]
    AlreadyStarted(String),

    #[error("Thread {0} panicked")]
    ThreadPanicked(String),

    // Configuration errors
    #[error("Configuration error for {key}: {message}")]
    Config { key: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io {
            message: err.to_string(),
            address: None,
            source: Some(err),
        }
    }
}

impl From<zmq::Error> for TransportError {
    fn from(err: zmq::Error) -> Self {
        TransportError::Socket {
            address: None,
            source: err,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TransportError {
    /// Create a socket error with address context.
    pub fn socket_at(err: zmq::Error, address: impl Into<String>) -> Self {
        let address = address.into();
        match err {
            zmq::Error::EADDRINUSE => TransportError::AddressInUse(address),
            source => TransportError::Socket {
                address: Some(address),
                source,
            },
        }
    }

    /// Check if the failed operation may succeed when issued again.
    ///
    /// This layer never retries on its own; the flag is for callers that do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::Socket {
                    source: zmq::Error::EAGAIN,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Truncated {
            received: 12,
            capacity: 8,
        };
        assert_eq!(
            err.to_string(),
            "Received more bytes than buffer can hold. Received: 12, capacity 8"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::WouldBlock, "no threads left");
        match TransportError::from(io) {
            TransportError::Io {
                message, address, ..
            } => {
                assert_eq!(message, "no threads left");
                assert!(address.is_none());
            }
            other => panic!("Expected Io, got: {:?}", other),
        }
    }

    #[test]
    fn test_address_in_use_is_mapped() {
        let err = TransportError::socket_at(zmq::Error::EADDRINUSE, "tcp://0.0.0.0:8005");
        assert!(matches!(err, TransportError::AddressInUse(ref a) if a == "tcp://0.0.0.0:8005"));

        let err = TransportError::socket_at(zmq::Error::EFSM, "tcp://127.0.0.1:8006");
        assert!(matches!(
            err,
            TransportError::Socket {
                source: zmq::Error::EFSM,
                ..
            }
        ));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TransportError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(TransportError::from(zmq::Error::EAGAIN).is_retryable());
        assert!(!TransportError::UnexpectedStatus {
            label: "test".into(),
            status: "ERROR".into(),
        }
        .is_retryable());
    }
}
