//! Error types and result definitions for the rustkasa crate.
//! Covers framing, handshake, transport, and device-reported failures.

use thiserror::Error;

/// Represents all possible errors that can occur when communicating with a Kasa device.
#[derive(Error, Debug, Clone)]
pub enum KasaError {
    /// Malformed byte stream: bad length prefix, truncated frame, or an
    /// over-long declared length.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Authentication or session establishment failed. Not retryable without
    /// new credentials, so callers should not loop on this.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// No response within the deadline. The connection is discarded and the
    /// device-side effect of the request is unknown.
    #[error("Timeout waiting for device")]
    Timeout,

    /// Socket-level failure. The next call on the transport reconnects.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol-level error reported by the device itself (`err_code` != 0).
    #[error("Device error code {0}")]
    Device(i64),

    /// The operation belongs to a capability facet this device does not have.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A child-outlet index outside the device's child list. Checked before
    /// any command is sent.
    #[error("Invalid child index {index} (device has {count} children)")]
    InvalidChildIndex { index: usize, count: usize },

    /// An argument rejected before transmission (e.g. brightness outside 0-100).
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// The response document did not mirror the request's module/method keys.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// A specialized Result type for Kasa operations.
pub type Result<T> = std::result::Result<T, KasaError>;

impl From<std::io::Error> for KasaError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => KasaError::Timeout,
            _ => KasaError::Connection(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for KasaError {
    fn from(err: serde_json::Error) -> Self {
        KasaError::Json(err.to_string())
    }
}

impl KasaError {
    /// Whether the failure tore down the underlying connection, meaning the
    /// next call on the same transport will reconnect (and re-handshake).
    /// `Protocol` counts: unparseable bytes leave the stream position unknown,
    /// so the connection cannot carry another exchange.
    pub fn discards_connection(&self) -> bool {
        matches!(
            self,
            KasaError::Timeout
                | KasaError::Connection(_)
                | KasaError::Framing(_)
                | KasaError::Protocol(_)
        )
    }
}
