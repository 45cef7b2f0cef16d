//! Typed views over the property-tree model: package descriptors, files
//! manifests, repository artifacts, and transactions.
//!
//! Each type here is a thin, typed wrapper around a [`crate::plist::Mapping`]
//! rather than an independent struct: the underlying storage is always the
//! tagged property tree (so it serializes with the rest of the database),
//! but callers get named accessors instead of raw key lookups.

pub mod manifest;
pub mod package;
pub mod repo;
pub mod transaction;

pub use manifest::FilesManifest;
pub use package::{Descriptor, State};
pub use repo::RepoArtifact;
pub use transaction::{Transaction, TransactionType};
