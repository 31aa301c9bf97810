use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::{FutureExt, TryFutureExt};
use tracing::{debug, info, instrument};

use meridian_store::{DeviceField, DeviceFields, FieldValue, Store, StoreError};
use meridian_util::types::{Id, Uuid};

use crate::diff::{InstallCandidate, InstallPlan, InstallScope, diff};
use crate::metrics::MetricsThrottle;
use crate::report::NormalizedReport;
use crate::resolve::{ResolvedReport, resolve};
use crate::{ReportError, RequestContext};

/// Number of rows written by a reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub patched_devices: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug)]
struct DevicePatch {
    device: Id,
    uuid: Uuid,
    fields: DeviceFields,
}

#[derive(Debug, Default)]
struct WritePlan {
    patches: Vec<DevicePatch>,
    installs: InstallPlan,
}

impl WritePlan {
    fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.installs.is_empty()
    }
}

/// Applies state reports to the store
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    metrics: MetricsThrottle,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, metrics: MetricsThrottle) -> Self {
        Self { store, metrics }
    }

    /// Validate `report` against the store and write what changed.
    ///
    /// Validation runs on a read snapshot that is released before the write
    /// transaction opens. If anything fails nothing is committed.
    #[instrument(name = "reconcile", skip_all, fields(devices = report.devices.len()))]
    pub async fn reconcile(
        &self,
        report: NormalizedReport,
        ctx: &RequestContext,
    ) -> Result<ReconcileSummary, ReportError> {
        let resolved = {
            let tx = self.store.read().await?;
            resolve(&*tx, &report, &ctx.scope).await?
        };

        let mut plan = self.plan(report, &resolved, ctx)?;
        let metered = self.throttle_metrics(&mut plan).await;
        if plan.is_empty() {
            debug!("nothing to write");
            return Ok(ReconcileSummary::default());
        }

        let summary = match self.apply(plan).await {
            Ok(summary) => summary,
            Err(err) => {
                // metrics of a failed batch were never written
                future::join_all(metered.iter().map(|uuid| self.metrics.release(uuid))).await;
                return Err(err);
            }
        };
        info!(
            patched = summary.patched_devices,
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            "report applied"
        );
        Ok(summary)
    }

    fn plan(
        &self,
        report: NormalizedReport,
        resolved: &ResolvedReport,
        ctx: &RequestContext,
    ) -> Result<WritePlan, ReportError> {
        let mut plan = WritePlan::default();
        let mut candidates = Vec::new();
        let mut reporting = BTreeSet::new();

        for (uuid, claim) in report.devices {
            let row = resolved
                .devices
                .get(&uuid)
                .ok_or_else(|| ReportError::Internal(format!("device {uuid} was not resolved")))?;
            let device = &row.device;

            let mut patch = claim.patch;
            for (app, key) in claim.running {
                let release = resolved
                    .releases
                    .get(&(app, key.clone()))
                    .ok_or_else(|| ReportError::Internal(format!("release {key} was not resolved")))?;
                // releases of other applications are not runnable by the device
                if release.application == device.application {
                    patch.insert(
                        DeviceField::IsRunningRelease,
                        FieldValue::Integer(release.id),
                    );
                }
            }

            if let Some(ip) = ctx.client_ip {
                patch.insert(DeviceField::PublicAddress, FieldValue::Text(ip.to_string()));
            }

            patch.retain(|field, value| device.fields.get(field) != Some(value));
            if !patch.is_empty() {
                plan.patches.push(DevicePatch {
                    device: device.id,
                    uuid: device.uuid.clone(),
                    fields: patch,
                });
            }

            let Some(installs) = claim.installs else {
                continue;
            };
            reporting.insert(device.id);
            for install in installs {
                let image = resolved.images.get(&install.image).ok_or_else(|| {
                    ReportError::Internal(format!("image {} was not resolved", install.image))
                })?;
                let release = resolved
                    .releases
                    .get(&(install.app, install.release.clone()))
                    .ok_or_else(|| {
                        ReportError::Internal(format!(
                            "release {} was not resolved",
                            install.release
                        ))
                    })?;
                candidates.push(InstallCandidate {
                    device: device.id,
                    image: *image,
                    release: release.id,
                    status: install.status,
                    download_progress: install.download_progress,
                });
            }
        }

        let scope = InstallScope {
            devices: reporting,
            images: resolved.images.values().copied().collect(),
        };
        plan.installs = diff(candidates, &resolved.installs, &scope);

        Ok(plan)
    }

    /// Drop changed metrics of devices that wrote theirs within the
    /// throttle interval.
    ///
    /// Returns the devices whose metrics stay in the plan.
    async fn throttle_metrics(&self, plan: &mut WritePlan) -> Vec<Uuid> {
        let mut metered = Vec::new();
        for patch in plan.patches.iter_mut() {
            if !patch.fields.keys().any(DeviceField::is_metric) {
                continue;
            }
            if self.metrics.allow(&patch.uuid).await {
                metered.push(patch.uuid.clone());
            } else {
                patch.fields.retain(|field, _| !field.is_metric());
            }
        }
        plan.patches.retain(|patch| !patch.fields.is_empty());
        metered
    }

    #[instrument(skip_all)]
    async fn apply(&self, plan: WritePlan) -> Result<ReconcileSummary, ReportError> {
        let WritePlan { patches, installs } = plan;
        let InstallPlan {
            inserts,
            updates,
            deletes,
        } = installs;

        let summary = ReconcileSummary {
            patched_devices: patches.len(),
            inserted: inserts.len(),
            updated: updates.len(),
            deleted: 0,
        };

        let tx = self.store.write().await?;

        let mut ops: Vec<BoxFuture<'_, Result<(), StoreError>>> = Vec::new();
        for patch in patches.iter() {
            ops.push(tx.patch_device(patch.device, &patch.fields));
        }
        // a concurrent report may have written the same install since the read
        for install in inserts {
            ops.push(tx.upsert_image_install(install).map_ok(|_| ()).boxed());
        }
        for (id, update) in updates.iter() {
            let id = *id;
            ops.push(
                tx.update_image_install(id, update)
                    .map_ok(move |found| {
                        if !found {
                            debug!(install = id, "install was removed since the read");
                        }
                    })
                    .boxed(),
            );
        }
        future::try_join_all(ops).await?;

        let deleted = if deletes.is_empty() {
            0
        } else {
            tx.delete_image_installs(&deletes).await?
        };

        tx.commit().await?;

        Ok(ReconcileSummary { deleted, ..summary })
    }
}
