//! # Forwarder Error Handling
//!
//! This module defines the FwdError enum, which represents the different error
//! types that can occur in the lorafwd crate.

use thiserror::Error;

/// Represents the different error types that can occur in the forwarder.
#[derive(Debug, Error)]
pub enum FwdError {
    /// Indicates a configuration file could not be found or read.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Indicates a socket operation failed.
    #[error("Socket error: {0}")]
    SocketError(#[from] std::io::Error),

    /// Indicates a concentrator HAL operation failed.
    #[error("Concentrator error: {0}")]
    HalError(String),

    /// Indicates a GPS device or NMEA parsing failure.
    #[error("GPS error: {0}")]
    GpsError(String),

    /// Indicates the GPS time reference cannot be used for conversion.
    #[error("Time reference unusable: {0}")]
    TimeRefError(String),

    /// Indicates a downlink request could not be decoded.
    #[error("Invalid downlink: {0}")]
    DownlinkError(String),

    /// Indicates a JSON body could not be parsed.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Indicates a base64 payload could not be decoded.
    #[error("Base64 error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    /// A catch-all error for uncategorized cases.
    #[error("Other error: {0}")]
    Other(String),
}
