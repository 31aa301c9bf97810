//! Single-device report format, addressed by device uuid.
//!
//! Applications and images are referred to by id and the running release by
//! commit, implicitly within the device's own application.
//!
//! ```json
//! {
//!   "local": {
//!     "status": "Idle",
//!     "is_on__commit": "<commit>",
//!     "apps": {
//!       "<app id>": {
//!         "services": {
//!           "<image id>": { "releaseId": 5, "status": "Running" }
//!         }
//!       }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use meridian_store::{ApplicationKey, ImageKey, ReleaseKey};
use meridian_util::types::{Id, Uuid};

use super::{AppRef, DeviceClaim, InstallClaim, NormalizedReport, parse_patch, parse_progress};
use crate::ReportError;

#[derive(Deserialize, Debug)]
struct ServiceState {
    #[serde(rename = "releaseId")]
    release_id: Id,

    status: String,

    #[serde(default)]
    download_progress: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct AppState {
    // keyed by image id
    #[serde(default)]
    services: Option<BTreeMap<String, ServiceState>>,
}

#[derive(Deserialize, Debug)]
struct LocalState {
    #[serde(default, rename = "is_on__commit")]
    commit: Option<String>,

    // keyed by app id
    #[serde(default)]
    apps: Option<BTreeMap<String, AppState>>,

    #[serde(flatten)]
    fields: Map<String, Value>,
}

#[derive(Deserialize, Debug)]
struct StateReport {
    #[serde(default)]
    local: Option<LocalState>,
}

fn parse_id(kind: &str, id: &str) -> Result<Id, ReportError> {
    id.parse()
        .map_err(|_| ReportError::malformed(format!("invalid {kind} id '{id}'")))
}

/// Parse the state report of device `uuid`
pub fn parse(uuid: Uuid, body: &[u8]) -> Result<NormalizedReport, ReportError> {
    let StateReport { local } =
        serde_json::from_slice(body).map_err(|e| ReportError::malformed(e.to_string()))?;

    let mut report = NormalizedReport::default();
    let claim = match local {
        Some(local) => normalize(&uuid, local)?,
        None => DeviceClaim::default(),
    };
    report.insert(uuid, claim);

    Ok(report)
}

fn normalize(uuid: &Uuid, local: LocalState) -> Result<DeviceClaim, ReportError> {
    let LocalState {
        commit,
        apps,
        fields,
    } = local;

    let mut claim = DeviceClaim {
        patch: parse_patch(fields)?,
        ..Default::default()
    };

    if let Some(commit) = commit {
        claim.running.push((
            AppRef::OwnerOf(uuid.clone()),
            ReleaseKey::Commit(commit),
        ));
    }

    let Some(apps) = apps else {
        return Ok(claim);
    };

    let mut installs = Vec::new();
    for (app_id, app) in apps {
        let app_ref = AppRef::App(ApplicationKey::Id(parse_id("app", &app_id)?));

        for (image_id, svc) in app.services.into_iter().flatten() {
            installs.push(InstallClaim {
                service: image_id.clone(),
                image: ImageKey::Id(parse_id("image", &image_id)?),
                app: app_ref.clone(),
                release: ReleaseKey::Id(svc.release_id),
                status: svc.status,
                download_progress: parse_progress(svc.download_progress)?,
            });
        }
    }
    claim.installs = Some(installs);

    Ok(claim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_store::{DeviceField, FieldValue};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse_json(uuid: &str, value: Value) -> Result<NormalizedReport, ReportError> {
        parse(uuid.into(), value.to_string().as_bytes())
    }

    #[test]
    fn it_normalizes_a_device_report() {
        let report = parse_json(
            "d1",
            json!({
                "local": {
                    "status": "Idle",
                    "is_on__commit": "r1",
                    "apps": {
                        "1": {
                            "services": {
                                "9": {
                                    "releaseId": 5,
                                    "status": "Downloading",
                                    "download_progress": 30
                                }
                            }
                        }
                    }
                }
            }),
        )
        .unwrap();

        let claim = &report.devices[&Uuid::from("d1")];
        assert_eq!(
            claim.patch,
            [(DeviceField::Status, FieldValue::Text("Idle".into()))].into()
        );
        assert_eq!(
            claim.running,
            vec![(
                AppRef::OwnerOf("d1".into()),
                ReleaseKey::Commit("r1".into())
            )]
        );
        assert_eq!(
            claim.installs,
            Some(vec![InstallClaim {
                service: "9".into(),
                image: ImageKey::Id(9),
                app: AppRef::App(ApplicationKey::Id(1)),
                release: ReleaseKey::Id(5),
                status: "Downloading".into(),
                download_progress: Some(30),
            }])
        );
        assert_eq!(report.images, [ImageKey::Id(9)].into());
        assert_eq!(report.releases.len(), 2);
    }

    #[test]
    fn a_report_without_local_state_patches_nothing() {
        let report = parse_json("d1", json!({})).unwrap();
        assert_eq!(
            report.devices[&Uuid::from("d1")],
            DeviceClaim::default()
        );
        assert!(report.images.is_empty());
        assert!(report.releases.is_empty());
    }

    #[test]
    fn it_rejects_non_numeric_ids() {
        assert!(matches!(
            parse_json(
                "d1",
                json!({
                    "local": {
                        "apps": {
                            "main": { "services": {} }
                        }
                    }
                })
            ),
            Err(ReportError::Malformed(_))
        ));
        assert!(matches!(
            parse_json(
                "d1",
                json!({
                    "local": {
                        "apps": {
                            "1": {
                                "services": {
                                    "img": { "releaseId": 5, "status": "Running" }
                                }
                            }
                        }
                    }
                })
            ),
            Err(ReportError::Malformed(_))
        ));
    }
}
