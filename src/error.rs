// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for SolarMon
//!
//! This module defines all error types used throughout the library.
//! Applying a value to a configuration parameter is not an error: those
//! results are reported as [`crate::param::ApplyOutcome`] values.

use thiserror::Error;

/// Result type alias for SolarMon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for SolarMon operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Parameter schema error
    #[error("Parameter error: {0}")]
    Param(#[from] ParamError),

    /// Persistent storage error
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Broker transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed structured document
    #[error("Malformed document: {0}")]
    Document(String),

    /// Charge controller could not be read
    #[error("Acquisition error: {0}")]
    Acquisition(String),
}

/// Errors in the parameter schema itself
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    /// Two descriptors share an identifier
    #[error("Duplicate parameter id: {0}")]
    DuplicateId(String),

    /// Declared default is outside the declared bounds
    #[error("Default of {id} outside [{min}, {max}]")]
    DefaultOutOfBounds { id: String, min: String, max: String },

    /// Enumeration label table does not cover the declared range
    #[error("Label table of {id} has {labels} entries, range needs {needed}")]
    MissingLabels {
        id: String,
        labels: usize,
        needed: usize,
    },

    /// String default longer than the field
    #[error("Default of {id} is {len} bytes, maximum {max}")]
    DefaultTooLong { id: String, len: usize, max: usize },

    /// Ordinal requested for a kind that has none
    #[error("Parameter {0} has no ordinal")]
    NoOrdinal(String),

    /// Parameter id not present in the registry
    #[error("Unknown parameter: {0}")]
    Unknown(String),

    /// Field value violates its bounds
    #[error("Value of {id} violates its bounds: {value}")]
    Invalid { id: String, value: String },
}

/// Errors raised by the key-value store collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Key not present
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rename target already exists (in-place overwrite is not allowed)
    #[error("Target already exists: {0}")]
    AlreadyExists(String),

    /// Document exceeds the storage budget
    #[error("Document too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Underlying I/O failure
    #[error("I/O error on {key}: {reason}")]
    Io { key: String, reason: String },
}

/// Errors related to the broker connection
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Connection attempt failed
    #[error("Connect to {host}:{port} failed: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    /// Broker rejected the session
    #[error("Connection refused by broker: code {0}")]
    Refused(u8),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Publish failed
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    /// Queue full after the enqueue timeout
    #[error("Queue full after {timeout_ms}ms")]
    QueueFull { timeout_ms: u64 },

    /// Payload rejected before enqueue
    #[error("Payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Malformed packet on the wire
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// TLS setup failed
    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Document(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Store(StoreError::TooLarge {
            size: 2048,
            max: 1800,
        });
        let msg = format!("{}", err);
        assert!(msg.contains("2048"));
        assert!(msg.contains("1800"));
    }

    #[test]
    fn test_error_conversion() {
        let transport_err = TransportError::NotConnected;
        let err: Error = transport_err.into();
        assert!(matches!(err, Error::Transport(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Document(_)));
    }
}
