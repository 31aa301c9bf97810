use std::collections::{BTreeMap, BTreeSet};

use meridian_store::{ImageInstall, ImageInstallUpdate, NewImageInstall};
use meridian_util::types::Id;

/// An install a device claims, with every reference resolved to an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallCandidate {
    pub device: Id,
    pub image: Id,
    pub release: Id,
    pub status: String,
    pub download_progress: Option<i64>,
}

/// The rows a diff may delete: installs of one of `images` on one of
/// `devices`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallScope {
    pub devices: BTreeSet<Id>,
    pub images: BTreeSet<Id>,
}

impl InstallScope {
    fn contains(&self, device: Id, image: Id) -> bool {
        self.devices.contains(&device) && self.images.contains(&image)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    pub inserts: Vec<NewImageInstall>,
    pub updates: Vec<(Id, ImageInstallUpdate)>,
    pub deletes: Vec<Id>,
}

impl InstallPlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Compute the writes that make the `existing` install rows match the
/// `candidates`.
///
/// If a (device, image) pair is claimed more than once the last claim wins.
/// Rows are only updated when release, status or progress changed, and only
/// rows within `scope` are ever deleted.
pub fn diff(
    candidates: Vec<InstallCandidate>,
    existing: &[ImageInstall],
    scope: &InstallScope,
) -> InstallPlan {
    let claimed: BTreeMap<(Id, Id), InstallCandidate> = candidates
        .into_iter()
        .map(|c| ((c.device, c.image), c))
        .collect();

    let mut plan = InstallPlan::default();

    let mut current: BTreeMap<(Id, Id), &ImageInstall> = BTreeMap::new();
    for row in existing {
        let pair = (row.device, row.image);
        if current.contains_key(&pair) {
            // keep a single row per pair
            if scope.contains(row.device, row.image) {
                plan.deletes.push(row.id);
            }
            continue;
        }
        current.insert(pair, row);
    }

    for (pair, candidate) in claimed.iter() {
        match current.get(pair) {
            Some(row)
                if row.release != candidate.release
                    || row.status != candidate.status
                    || row.download_progress != candidate.download_progress =>
            {
                plan.updates.push((
                    row.id,
                    ImageInstallUpdate {
                        release: candidate.release,
                        status: candidate.status.clone(),
                        download_progress: candidate.download_progress,
                    },
                ));
            }
            Some(_) => {}
            None => plan.inserts.push(NewImageInstall {
                device: candidate.device,
                image: candidate.image,
                release: candidate.release,
                status: candidate.status.clone(),
                download_progress: candidate.download_progress,
            }),
        }
    }

    for (pair, row) in current {
        if scope.contains(row.device, row.image) && !claimed.contains_key(&pair) {
            plan.deletes.push(row.id);
        }
    }
    plan.deletes.sort_unstable();

    plan
}
