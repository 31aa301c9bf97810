use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, instrument};

use meridian_store::{
    ApplicationKey, DeviceWithApp, ImageInstall, ImageKey, ReadTransaction, Release, ReleaseKey,
    Scope,
};
use meridian_util::types::{Id, Uuid};

use crate::ReportError;
use crate::report::{AppRef, NormalizedReport};

/// Store rows for every reference of a report.
///
/// This is the only source the write phase trusts for ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedReport {
    pub devices: BTreeMap<Uuid, DeviceWithApp>,
    pub images: BTreeMap<ImageKey, Id>,
    pub releases: BTreeMap<(AppRef, ReleaseKey), Release>,

    /// Existing installs of the resolved images on devices that reported
    /// their apps
    pub installs: Vec<ImageInstall>,
}

fn unauthorized(kind: &str, requested: usize, found: usize) -> ReportError {
    debug!(kind, requested, found, "unresolved report references");
    ReportError::Unauthorized
}

/// Look up every device, image and release of the report.
///
/// Fails with [`ReportError::Unauthorized`] if any of them does not exist or,
/// for devices, is out of `scope`. The failure does not tell which one.
#[instrument(name = "resolve", skip_all)]
pub async fn resolve(
    tx: &dyn ReadTransaction,
    report: &NormalizedReport,
    scope: &Scope,
) -> Result<ResolvedReport, ReportError> {
    let uuids: Vec<Uuid> = report.devices.keys().cloned().collect();
    let rows = tx.devices(&uuids, scope).await?;
    if rows.len() != uuids.len() {
        return Err(unauthorized("device", uuids.len(), rows.len()));
    }
    let devices: BTreeMap<Uuid, DeviceWithApp> = rows
        .into_iter()
        .map(|row| (row.device.uuid.clone(), row))
        .collect();

    let mut images = BTreeMap::new();
    if !report.images.is_empty() {
        let keys: Vec<ImageKey> = report.images.iter().cloned().collect();
        let rows = tx.images(&keys).await?;
        if rows.len() != keys.len() {
            return Err(unauthorized("image", keys.len(), rows.len()));
        }
        for key in keys {
            let image = rows
                .iter()
                .find(|image| key.matches(image))
                .ok_or_else(|| unauthorized("image", 1, 0))?;
            images.insert(key, image.id);
        }
    }

    let mut releases = BTreeMap::new();
    for (app, keys) in report.releases.iter() {
        let app_key = match app {
            AppRef::App(key) => key.clone(),
            AppRef::OwnerOf(uuid) => {
                let device = devices
                    .get(uuid)
                    .ok_or_else(|| unauthorized("device", 1, 0))?;
                ApplicationKey::Id(device.device.application)
            }
        };

        let keys: Vec<ReleaseKey> = keys.iter().cloned().collect();
        let rows = tx.releases(&app_key, &keys).await?;
        if rows.len() != keys.len() {
            return Err(unauthorized("release", keys.len(), rows.len()));
        }
        for key in keys {
            let release = rows
                .iter()
                .find(|release| key.matches(release))
                .ok_or_else(|| unauthorized("release", 1, 0))?;
            releases.insert((app.clone(), key), release.clone());
        }
    }

    let reporting: Vec<Id> = report
        .devices
        .iter()
        .filter(|(_, claim)| claim.installs.is_some())
        .filter_map(|(uuid, _)| devices.get(uuid))
        .map(|row| row.device.id)
        .collect();
    let image_ids: Vec<Id> = images
        .values()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let installs = if reporting.is_empty() || image_ids.is_empty() {
        Vec::new()
    } else {
        tx.image_installs(&reporting, &image_ids).await?
    };

    debug!(
        devices = devices.len(),
        images = images.len(),
        releases = releases.len(),
        installs = installs.len(),
        "report resolved"
    );

    Ok(ResolvedReport {
        devices,
        images,
        releases,
        installs,
    })
}
