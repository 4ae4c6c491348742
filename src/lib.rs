//! # Clinical Record Vault
//!
//! A bi-temporal, contribution-audited store for clinical record entities:
//! an EHR's status lineage and its hierarchical folder directory, with
//! point-in-time reconstruction of both.
//!
//! ## Core Concepts
//!
//! - **Contributions**: One audit unit per logical write, recording who
//!   changed what, when, and why
//! - **Append-only versioning**: Updates archive the current row and
//!   install a replacement; history is never edited
//! - **Folder hierarchy**: A tree of versioned folder nodes connected by
//!   versioned parent-child edges, replaced wholesale on update
//! - **Time travel**: Any past instant of a status lineage or folder tree
//!   can be reconstructed from the history relations
//!
//! ## Example
//!
//! ```ignore
//! use clinvault::{EhrCreateRequest, FolderSpec, SubjectRef, Vault, VaultConfig};
//!
//! let vault = Vault::open_or_create(VaultConfig {
//!     path: "./my-vault".into(),
//!     ..Default::default()
//! })?;
//!
//! // Create an EHR for a subject
//! let ehr = vault.create_ehr(EhrCreateRequest::new(
//!     SubjectRef::new("se.region", "patient-889"),
//! ))?;
//!
//! // Build its directory
//! let root = vault.create_directory(
//!     ehr,
//!     &FolderSpec::new("root").with_child(FolderSpec::new("episodes")),
//!     &Default::default(),
//! )?;
//!
//! // Reconstruct it as it was at an earlier instant
//! let before = vault.folder_tree_at(root, earlier)?;
//! ```

pub mod codec;
pub mod contributions;
pub mod error;
pub mod hierarchy;
pub mod status;
pub mod store;
pub mod subjects;
pub mod types;
pub mod versioning;

mod journal;
mod tables;

// Re-exports
pub use codec::{DocumentCodec, JsonCodec};
pub use contributions::ContributionLedger;
pub use error::{Result, VaultError};
pub use hierarchy::FolderHierarchyEngine;
pub use status::StatusStore;
pub use store::{EhrCreateRequest, Vault, VaultConfig, VaultStats};
pub use subjects::{SubjectRef, SubjectResolver};
pub use types::*;
