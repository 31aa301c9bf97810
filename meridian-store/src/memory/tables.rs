use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use meridian_util::types::Id;

use crate::models::*;
use crate::{Result, StoreError};

/// Initial contents of a [`super::MemoryStore`]
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Seed {
    #[serde(default)]
    pub applications: Vec<Application>,

    #[serde(default)]
    pub devices: Vec<Device>,

    #[serde(default)]
    pub releases: Vec<Release>,

    #[serde(default)]
    pub images: Vec<Image>,

    #[serde(default)]
    pub image_installs: Vec<ImageInstall>,

    #[serde(default)]
    pub api_keys: Vec<ApiKey>,
}

/// One consistent version of every table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tables {
    pub applications: BTreeMap<Id, Application>,
    pub devices: BTreeMap<Id, Device>,
    pub releases: BTreeMap<Id, Release>,
    pub images: BTreeMap<Id, Image>,
    pub image_installs: BTreeMap<Id, ImageInstall>,
    pub api_keys: BTreeMap<String, ApiKey>,
    next_install_id: Id,
}

fn index<T>(
    kind: &'static str,
    rows: Vec<T>,
    key: impl Fn(&T) -> Id,
) -> Result<BTreeMap<Id, T>> {
    let mut table = BTreeMap::new();
    for row in rows {
        let id = key(&row);
        if table.insert(id, row).is_some() {
            return Err(StoreError::Duplicate {
                kind,
                key: id.to_string(),
            });
        }
    }
    Ok(table)
}

fn unique<K: Ord + ToString>(
    kind: &'static str,
    keys: impl IntoIterator<Item = K>,
) -> Result<()> {
    let mut seen = BTreeSet::new();
    for key in keys {
        let repr = key.to_string();
        if !seen.insert(key) {
            return Err(StoreError::Duplicate { kind, key: repr });
        }
    }
    Ok(())
}

fn invalid(reason: String) -> StoreError {
    StoreError::InvalidSeed(reason)
}

impl TryFrom<Seed> for Tables {
    type Error = StoreError;

    fn try_from(seed: Seed) -> Result<Self> {
        let applications = index("application", seed.applications, |a| a.id)?;
        let devices = index("device", seed.devices, |d| d.id)?;
        let releases = index("release", seed.releases, |r| r.id)?;
        let images = index("image", seed.images, |i| i.id)?;
        let image_installs = index("image install", seed.image_installs, |i| i.id)?;

        unique("application", applications.values().map(|a| a.uuid.clone()))?;
        unique("device", devices.values().map(|d| d.uuid.clone()))?;
        unique("image", images.values().map(|i| i.location.clone()))?;
        unique(
            "release",
            releases
                .values()
                .map(|r| format!("{}/{}", r.application, r.commit)),
        )?;
        unique(
            "image install",
            image_installs
                .values()
                .map(|i| format!("{}/{}", i.device, i.image)),
        )?;

        for device in devices.values() {
            if !applications.contains_key(&device.application) {
                return Err(invalid(format!(
                    "device {} belongs to unknown application {}",
                    device.uuid, device.application
                )));
            }
            for (field, value) in device.fields.iter() {
                if field.kind() != value.kind() {
                    return Err(invalid(format!(
                        "device {} has a value of the wrong type for {field}",
                        device.uuid
                    )));
                }
            }
            if let Some(release) = device.running_release()
                && !releases.contains_key(&release)
            {
                return Err(invalid(format!(
                    "device {} runs unknown release {release}",
                    device.uuid
                )));
            }
        }

        for release in releases.values() {
            if !applications.contains_key(&release.application) {
                return Err(invalid(format!(
                    "release {} belongs to unknown application {}",
                    release.commit, release.application
                )));
            }
        }

        for install in image_installs.values() {
            if !devices.contains_key(&install.device)
                || !images.contains_key(&install.image)
                || !releases.contains_key(&install.release)
            {
                return Err(invalid(format!(
                    "image install {} references a missing row",
                    install.id
                )));
            }
        }

        let mut api_keys = BTreeMap::new();
        for api_key in seed.api_keys {
            if api_keys.contains_key(&api_key.key) {
                return Err(StoreError::Duplicate {
                    kind: "api key",
                    key: api_key.key,
                });
            }
            api_keys.insert(api_key.key.clone(), api_key);
        }

        let next_install_id = image_installs.keys().next_back().map_or(1, |id| id + 1);

        Ok(Self {
            applications,
            devices,
            releases,
            images,
            image_installs,
            api_keys,
            next_install_id,
        })
    }
}

impl Tables {
    pub(super) fn patch_device(&mut self, id: Id, fields: &DeviceFields) -> Result<()> {
        let device = self
            .devices
            .get_mut(&id)
            .ok_or(StoreError::NotFound { kind: "device", id })?;
        device
            .fields
            .extend(fields.iter().map(|(k, v)| (*k, v.clone())));
        Ok(())
    }

    pub(super) fn upsert_image_install(
        &mut self,
        install: NewImageInstall,
        now: DateTime<Utc>,
    ) -> Result<Id> {
        if !self.devices.contains_key(&install.device) {
            return Err(StoreError::NotFound {
                kind: "device",
                id: install.device,
            });
        }
        if !self.images.contains_key(&install.image) {
            return Err(StoreError::NotFound {
                kind: "image",
                id: install.image,
            });
        }
        if !self.releases.contains_key(&install.release) {
            return Err(StoreError::NotFound {
                kind: "release",
                id: install.release,
            });
        }

        if let Some(existing) = self
            .image_installs
            .values_mut()
            .find(|i| i.device == install.device && i.image == install.image)
        {
            existing.release = install.release;
            existing.status = install.status;
            existing.download_progress = install.download_progress;
            return Ok(existing.id);
        }

        let id = self.next_install_id;
        self.next_install_id += 1;
        self.image_installs.insert(
            id,
            ImageInstall {
                id,
                device: install.device,
                image: install.image,
                release: install.release,
                status: install.status,
                download_progress: install.download_progress,
                install_date: now,
            },
        );
        Ok(id)
    }

    pub(super) fn update_image_install(
        &mut self,
        id: Id,
        update: &ImageInstallUpdate,
    ) -> Result<bool> {
        if !self.releases.contains_key(&update.release) {
            return Err(StoreError::NotFound {
                kind: "release",
                id: update.release,
            });
        }
        let Some(install) = self.image_installs.get_mut(&id) else {
            return Ok(false);
        };
        install.release = update.release;
        install.status = update.status.clone();
        install.download_progress = update.download_progress;
        Ok(true)
    }

    pub(super) fn delete_image_installs(&mut self, ids: &[Id]) -> usize {
        let mut deleted = 0;
        for id in ids {
            if self.image_installs.remove(id).is_some() {
                deleted += 1;
            }
        }
        deleted
    }
}
