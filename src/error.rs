//! Structured, protocol-facing error types.
//!
//! Internal plumbing (config parsing, socket setup) still propagates with
//! `anyhow::Result` the way the teacher daemon's IPC layer does; these
//! enums exist for the failures spec §4.1 and §6 name explicitly, so
//! callers can match on them instead of string-sniffing.

use thiserror::Error;

/// Failures from [`crate::hub::Hub`] operations (spec §4.1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("invalid id")]
    InvalidId,
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden")]
    Forbidden,
    #[error("session already exists")]
    AlreadyExists,
    #[error("session not found")]
    NotFound,
    #[error("session terminated")]
    SessionTerminated,
    #[error("session id mismatch, canonical is {canonical}")]
    SessionIdMismatch { canonical: String },
    #[error("upgrade failed: {0}")]
    UpgradeFailed(String),
}

/// Failures from the pluggable [`crate::store::Store`] (spec §6).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("diagram not found")]
    NotFound,
    #[error("store backend error: {0}")]
    Backend(String),
}
