//! In-process store engine.
//!
//! Committed state is an immutable [`Tables`] value behind an [`Arc`]. A read
//! transaction holds on to the version that was current when it was opened,
//! so it never observes later commits. Writers are serialized by an async
//! mutex; each one stages its changes on a private copy of the tables which
//! replaces the published version on commit.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

use meridian_util::types::{Id, Uuid};

use crate::keys::*;
use crate::models::*;
use crate::{ReadTransaction, Result, Store, WriteTransaction};

mod tables;

pub use tables::{Seed, Tables};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    published: Arc<RwLock<Arc<Tables>>>,
    writer: Arc<AsyncMutex<()>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given initial contents
    pub fn with_seed(seed: Seed) -> Result<Self> {
        let tables = Tables::try_from(seed)?;
        Ok(Self {
            published: Arc::new(RwLock::new(Arc::new(tables))),
            writer: Arc::default(),
        })
    }

    /// Create a store from a JSON seed file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read(path).await?;
        let seed: Seed = serde_json::from_slice(&contents)?;
        debug!(
            path = %path.display(),
            devices = seed.devices.len(),
            images = seed.images.len(),
            releases = seed.releases.len(),
            "seed loaded"
        );
        Self::with_seed(seed)
    }

    /// Return the latest committed state
    pub fn snapshot(&self) -> Arc<Tables> {
        let published = self.published.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&published)
    }

    fn publish(&self, tables: Tables) {
        let mut published = self.published.write().unwrap_or_else(|e| e.into_inner());
        *published = Arc::new(tables);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self) -> Result<Box<dyn ReadTransaction>> {
        Ok(Box::new(MemoryReadTransaction {
            tables: self.snapshot(),
        }))
    }

    async fn write(&self) -> Result<Box<dyn WriteTransaction>> {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        // the writer lock is held, so nothing is published until this commits
        let staged = Tables::clone(&self.snapshot());
        Ok(Box::new(MemoryWriteTransaction {
            store: self.clone(),
            staged: Mutex::new(staged),
            _guard: guard,
        }))
    }
}

struct MemoryReadTransaction {
    tables: Arc<Tables>,
}

#[async_trait]
impl ReadTransaction for MemoryReadTransaction {
    async fn devices(&self, uuids: &[Uuid], scope: &Scope) -> Result<Vec<DeviceWithApp>> {
        let tables = &self.tables;
        let devices = tables
            .devices
            .values()
            .filter(|device| uuids.contains(&device.uuid))
            .filter_map(|device| {
                let app = tables.applications.get(&device.application)?;
                scope
                    .allows_device(&device.uuid, &app.uuid)
                    .then(|| DeviceWithApp {
                        device: device.clone(),
                        application_uuid: app.uuid.clone(),
                    })
            })
            .collect();
        Ok(devices)
    }

    async fn images(&self, keys: &[ImageKey]) -> Result<Vec<Image>> {
        Ok(self
            .tables
            .images
            .values()
            .filter(|image| keys.iter().any(|key| key.matches(image)))
            .cloned()
            .collect())
    }

    async fn releases(&self, app: &ApplicationKey, keys: &[ReleaseKey]) -> Result<Vec<Release>> {
        let Some(app) = self.tables.applications.values().find(|a| app.matches(a)) else {
            return Ok(Vec::new());
        };
        Ok(self
            .tables
            .releases
            .values()
            .filter(|release| release.application == app.id)
            .filter(|release| keys.iter().any(|key| key.matches(release)))
            .cloned()
            .collect())
    }

    async fn image_installs(&self, devices: &[Id], images: &[Id]) -> Result<Vec<ImageInstall>> {
        Ok(self
            .tables
            .image_installs
            .values()
            .filter(|install| devices.contains(&install.device) && images.contains(&install.image))
            .cloned()
            .collect())
    }

    async fn api_key(&self, key: &str) -> Result<Option<ApiKey>> {
        Ok(self.tables.api_keys.get(key).cloned())
    }
}

struct MemoryWriteTransaction {
    store: MemoryStore,
    staged: Mutex<Tables>,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryWriteTransaction {
    fn staged(&self) -> MutexGuard<'_, Tables> {
        self.staged.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl WriteTransaction for MemoryWriteTransaction {
    async fn patch_device(&self, device: Id, fields: &DeviceFields) -> Result<()> {
        trace!(device, fields = fields.len(), "patch device");
        self.staged().patch_device(device, fields)
    }

    async fn upsert_image_install(&self, install: NewImageInstall) -> Result<Id> {
        trace!(
            device = install.device,
            image = install.image,
            "upsert image install"
        );
        self.staged().upsert_image_install(install, Utc::now())
    }

    async fn update_image_install(&self, id: Id, update: &ImageInstallUpdate) -> Result<bool> {
        trace!(id, "update image install");
        self.staged().update_image_install(id, update)
    }

    async fn delete_image_installs(&self, ids: &[Id]) -> Result<usize> {
        trace!(?ids, "delete image installs");
        Ok(self.staged().delete_image_installs(ids))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { store, staged, .. } = *self;
        let staged = staged.into_inner().unwrap_or_else(|e| e.into_inner());
        store.publish(staged);
        trace!("commit");
        Ok(())
    }
}
