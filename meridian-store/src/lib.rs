//! Transactional storage for fleet state.
//!
//! The reconciliation core only talks to the [`Store`] trait: a read
//! transaction works on a consistent snapshot and never mutates, a write
//! transaction stages every change and publishes them all at once on
//! [`WriteTransaction::commit`]. Dropping a write transaction without
//! committing discards everything it staged.
//!
//! [`MemoryStore`] is an in-process engine with those guarantees, seeded
//! from a JSON fixture.

use std::io;

use async_trait::async_trait;
use thiserror::Error;

use meridian_util::types::{Id, Uuid};

mod keys;
mod memory;
mod models;

pub use keys::*;
pub use memory::{MemoryStore, Seed, Tables};
pub use models::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} does not exist")]
    NotFound { kind: &'static str, id: Id },

    #[error("{kind} already exists: {key}")]
    Duplicate { kind: &'static str, key: String },

    #[error("invalid seed: {0}")]
    InvalidSeed(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A transactional store
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a read-only transaction on the latest committed state
    async fn read(&self) -> Result<Box<dyn ReadTransaction>>;

    /// Open a write transaction.
    ///
    /// Changes are only visible to other transactions after commit.
    async fn write(&self) -> Result<Box<dyn WriteTransaction>>;
}

/// Batched lookups over a consistent snapshot
#[async_trait]
pub trait ReadTransaction: Send + Sync {
    /// Find the devices with the given uuids that `scope` is allowed to
    /// act upon, with their application expanded
    async fn devices(&self, uuids: &[Uuid], scope: &Scope) -> Result<Vec<DeviceWithApp>>;

    /// Find the images matching any of the given keys
    async fn images(&self, keys: &[ImageKey]) -> Result<Vec<Image>>;

    /// Find the releases of `app` matching any of the given keys
    async fn releases(&self, app: &ApplicationKey, keys: &[ReleaseKey]) -> Result<Vec<Release>>;

    /// Find the installs of any of `images` on any of `devices`
    async fn image_installs(&self, devices: &[Id], images: &[Id]) -> Result<Vec<ImageInstall>>;

    /// Look up an API key
    async fn api_key(&self, key: &str) -> Result<Option<ApiKey>>;
}

/// Staged writes, published atomically on commit.
///
/// Operations take `&self` so independent writes of one transaction can be
/// awaited jointly.
#[async_trait]
pub trait WriteTransaction: Send + Sync {
    /// Set the given fields on a device
    async fn patch_device(&self, device: Id, fields: &DeviceFields) -> Result<()>;

    /// Write the install of an image on a device.
    ///
    /// A row for the same device and image is overwritten in place,
    /// otherwise a new one is created. Returns the id of the row.
    async fn upsert_image_install(&self, install: NewImageInstall) -> Result<Id>;

    /// Update an install row, returning false if it no longer exists
    async fn update_image_install(&self, id: Id, update: &ImageInstallUpdate) -> Result<bool>;

    /// Delete install rows by id, returning how many existed
    async fn delete_image_installs(&self, ids: &[Id]) -> Result<usize>;

    /// Publish every staged change
    async fn commit(self: Box<Self>) -> Result<()>;
}
