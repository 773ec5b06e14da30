//! # bidmesh-storage
//!
//! Resolves job volumes into host paths that can be bind-mounted into a
//! container.
//!
//! - [`StorageProvider`]: one driver per [`StorageSourceType`]
//! - [`ContentStore`]: local content-addressed store (sha256 ids) used for
//!   pinned inline data and published shard results
//! - [`StorageProviders`]: driver registry with parallel volume preparation
//!
//! [`StorageSourceType`]: bidmesh_model::StorageSourceType

mod content;
mod error;
mod inline;
mod local;
mod provider;

pub use content::{ContentPinner, ContentStorage, ContentStore};
pub use error::StorageError;
pub use inline::InlineStorage;
pub use local::LocalDirectoryStorage;
pub use provider::{PreparedStorage, StorageProvider, StorageProviders};
