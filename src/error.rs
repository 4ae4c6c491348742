//! Error types for the clinical record vault.

use crate::types::{ContributionId, EhrId, FolderId, StatusId, Timestamp};
use thiserror::Error;

/// Main error type for vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("EHR not found: {0}")]
    EhrNotFound(EhrId),

    #[error("Status not found: {0}")]
    StatusNotFound(StatusId),

    #[error("Folder not found: {0}")]
    FolderNotFound(FolderId),

    #[error("Contribution not found: {0}")]
    ContributionNotFound(ContributionId),

    #[error("No version effective at or before {0}")]
    NoVersionAtTime(Timestamp),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage inconsistency: {0}")]
    Inconsistent(String),

    #[error("Corrupt hierarchy: {0}")]
    CorruptHierarchy(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Vault is locked by another process")]
    Locked,

    #[error("Vault not initialized")]
    NotInitialized,

    #[error("Invalid vault format: {0}")]
    InvalidFormat(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for VaultError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for VaultError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        VaultError::Deserialization(e.to_string())
    }
}

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;
