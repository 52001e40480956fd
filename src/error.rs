//! Typed error surfaces for the mesh core.
//!
//! The teacher's ingest handler returns HTTP status codes because it sits
//! at an HTTP edge; nothing here does, so callers get `thiserror` enums
//! they can match on instead.

use thiserror::Error;

/// Failures decoding or validating a packet's wire form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("malformed packet envelope: {0}")]
    MalformedEnvelope(String),
    #[error("field outside its domain: {0}")]
    FieldDomain(String),
}

/// Failures starting, stopping, or driving a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("medium unavailable at startup: {0}")]
    StartupError(String),
    #[error("send failed: {0}")]
    SendError(String),
    #[error("receive failed: {0}")]
    ReceiveError(String),
}

/// Failures uploading a cached packet to the collection server.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("server rejected packet with status {0}")]
    NonOkStatus(u16),
}
