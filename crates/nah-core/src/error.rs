//! Structured error type for NAH: one closed set of kinds, each carrying
//! a human-readable context string and whatever structured detail the
//! kind needs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The error kinds named by the error handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidManifest,
    InvalidReference,
    HashMismatch,
    InsecureScheme,
    ArchiveUnsafe,
    NotInstalled,
    NakNotInstalled,
    NakVersionUnsatisfiable,
    NakPinDrifted,
    AmbiguousLoaders,
    FileConflict,
    EnvCycle,
    UnknownPlaceholder,
    IoError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidManifest => "invalid_manifest",
            ErrorKind::InvalidReference => "invalid_reference",
            ErrorKind::HashMismatch => "hash_mismatch",
            ErrorKind::InsecureScheme => "insecure_scheme",
            ErrorKind::ArchiveUnsafe => "archive_unsafe",
            ErrorKind::NotInstalled => "not_installed",
            ErrorKind::NakNotInstalled => "nak_not_installed",
            ErrorKind::NakVersionUnsatisfiable => "nak_version_unsatisfiable",
            ErrorKind::NakPinDrifted => "nak_pin_drifted",
            ErrorKind::AmbiguousLoaders => "ambiguous_loaders",
            ErrorKind::FileConflict => "file_conflict",
            ErrorKind::EnvCycle => "env_cycle",
            ErrorKind::UnknownPlaceholder => "unknown_placeholder",
            ErrorKind::IoError => "io_error",
        }
    }
}

/// Structured error for all NAH operations outside pure composition
/// (composition reports failure via `ComposeOutcome::critical_error`
/// instead, see `compose`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NahError {
    pub kind: ErrorKind,
    pub operation: String,
    pub context: String,
    pub details: serde_json::Value,
}

impl NahError {
    pub fn new(kind: ErrorKind, operation: impl Into<String>, context: impl Into<String>) -> Self {
        NahError {
            kind,
            operation: operation.into(),
            context: context.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl fmt::Display for NahError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}: {}", self.kind.as_str(), self.operation, self.context)?;
        if !self.details.is_null() {
            write!(f, " ({})", self.details)?;
        }
        Ok(())
    }
}

impl std::error::Error for NahError {}

impl From<std::io::Error> for NahError {
    fn from(e: std::io::Error) -> Self {
        NahError::new(ErrorKind::IoError, "io", e.to_string())
    }
}

impl From<serde_json::Error> for NahError {
    fn from(e: serde_json::Error) -> Self {
        NahError::new(ErrorKind::InvalidManifest, "json_parse", e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NahError>;
