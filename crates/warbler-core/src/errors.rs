//! Error types for the Warbler connection core
//!
//! This module contains the error taxonomy used throughout the core: JID and
//! stanza validation failures, correlation-table misuse, missing peer
//! capabilities, and transport failures, unified under [`CoreError`].
//!
//! Expected operational occurrences (request timeouts, rejected inbound
//! stanzas) are surfaced as events rather than errors; see [`crate::events`].

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Errors reported by the transport adapter boundary
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Operation attempted while the underlying stream is down
    #[error("transport is not connected")]
    NotConnected,
    /// The transport accepted the stanza but failed to write it
    #[error("send failed: {reason}")]
    Send { reason: String },
}

// ----------------------------------------------------------------------------
// Core Errors
// ----------------------------------------------------------------------------

/// Core error types for the Warbler connection core
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// Malformed peer identifier
    #[error("invalid JID: {0}")]
    InvalidJid(String),

    /// Structurally invalid stanza (bad top-level name, missing iq type, ...)
    #[error("malformed stanza: {0}")]
    MalformedStanza(String),

    /// A request id was registered twice with the correlation table
    #[error("duplicate request id: {0}")]
    DuplicateRequestId(String),

    /// The peer or server lacks a capability required by the operation
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Transport adapter failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl CoreError {
    /// Create an invalid JID error from the offending text
    pub fn invalid_jid<T: Into<String>>(value: T) -> Self {
        CoreError::InvalidJid(value.into())
    }

    /// Create a malformed stanza error with a detail message
    pub fn malformed<T: Into<String>>(detail: T) -> Self {
        CoreError::MalformedStanza(detail.into())
    }

    /// Create an unsupported feature error naming the missing capability
    pub fn unsupported<T: Into<String>>(feature: T) -> Self {
        CoreError::UnsupportedFeature(feature.into())
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, CoreError>;
