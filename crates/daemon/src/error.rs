// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error kinds shared across the tool socket, HTTP adapter, and
/// the cross-node wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    TransientTransport,
    PermanentTransport,
    BridgeUnavailable,
    NotFound,
    PermissionDenied,
    Conflict,
    Truncated,
    InternalInvariant,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientTransport => "TransientTransport",
            Self::PermanentTransport => "PermanentTransport",
            Self::BridgeUnavailable => "BridgeUnavailable",
            Self::NotFound => "NotFound",
            Self::PermissionDenied => "PermissionDenied",
            Self::Conflict => "Conflict",
            Self::Truncated => "Truncated",
            Self::InternalInvariant => "InternalInvariant",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::TransientTransport => 503,
            Self::PermanentTransport => 400,
            Self::BridgeUnavailable => 503,
            Self::NotFound => 404,
            Self::PermissionDenied => 403,
            Self::Conflict => 409,
            Self::Truncated => 410,
            Self::InternalInvariant => 500,
        }
    }

    /// Whether an operation failing with this kind should be retried
    /// with backoff rather than surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientTransport | Self::BridgeUnavailable)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TransientTransport" => Some(Self::TransientTransport),
            "PermanentTransport" => Some(Self::PermanentTransport),
            "BridgeUnavailable" => Some(Self::BridgeUnavailable),
            "NotFound" => Some(Self::NotFound),
            "PermissionDenied" => Some(Self::PermissionDenied),
            "Conflict" => Some(Self::Conflict),
            "Truncated" => Some(Self::Truncated),
            "InternalInvariant" => Some(Self::InternalInvariant),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified daemon failure: an [`ErrorKind`] plus a human-readable
/// message. Expected failures travel as values; only invariant
/// violations reach the task supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub kind: ErrorKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientTransport, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermanentTransport, message)
    }

    pub fn bridge(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BridgeUnavailable, message)
    }

    pub fn truncated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Truncated, message)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalInvariant, message)
    }

    /// Convert into the wire-level error body.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody { kind: self.kind.as_str().to_owned(), message: self.message.clone(), details: None }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

/// Top-level error envelope shared by the tool socket and the HTTP adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body containing a machine-readable kind and human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<Fault> for ErrorResponse {
    fn from(fault: Fault) -> Self {
        Self { error: fault.to_body() }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
