//! Multi-device report format.
//!
//! ```json
//! {
//!   "<device uuid>": {
//!     "status": "Idle",
//!     "apps": {
//!       "<app uuid>": {
//!         "release_uuid": "<commit>",
//!         "releases": {
//!           "<commit>": {
//!             "services": {
//!               "main": { "image": "<location>", "status": "Running" }
//!             }
//!           }
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
use meridian_util::types::Uuid;

use super::{AppRef, DeviceClaim, InstallClaim, NormalizedReport, parse_patch, parse_progress};
use crate::ReportError;

#[derive(Deserialize, Debug)]
struct ServiceState {
    image: String,
    status: String,

    #[serde(default)]
    download_progress: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct ReleaseState {
    #[serde(default)]
    services: Option<BTreeMap<String, ServiceState>>,
}

#[derive(Deserialize, Debug)]
struct AppState {
    #[serde(default)]
    release_uuid: Option<String>,

    #[serde(default)]
    releases: Option<BTreeMap<String, ReleaseState>>,
}

#[derive(Deserialize, Debug)]
struct DeviceState {
    #[serde(default)]
    apps: Option<BTreeMap<Uuid, AppState>>,

    #[serde(flatten)]
    fields: Map<String, Value>,
}

/// Parse a multi-device state report.
///
/// Devices with a `null` state are skipped; a report without any device
/// state is malformed.
pub fn parse(body: &[u8]) -> Result<NormalizedReport, ReportError> {
    let devices: BTreeMap<Uuid, Option<DeviceState>> =
        serde_json::from_slice(body).map_err(|e| ReportError::malformed(e.to_string()))?;

    let mut report = NormalizedReport::default();
    for (uuid, state) in devices {
        let Some(state) = state else {
            continue;
        };
        report.insert(uuid, normalize(state)?);
    }

    if report.is_empty() {
        return Err(ReportError::malformed("no device states in report"));
    }

    Ok(report)
}

fn normalize(state: DeviceState) -> Result<DeviceClaim, ReportError> {
    let DeviceState { apps, fields } = state;
    let mut claim = DeviceClaim {
        patch: parse_patch(fields)?,
        ..Default::default()
    };

    let Some(apps) = apps else {
        return Ok(claim);
    };

    let mut installs = Vec::new();
    for (app_uuid, app) in apps {
        let app_ref = AppRef::App(ApplicationKey::Uuid(app_uuid));

        if let Some(commit) = app.release_uuid {
            claim
                .running
                .push((app_ref.clone(), ReleaseKey::Commit(commit)));
        }

        for (commit, release) in app.releases.into_iter().flatten() {
            for (service, svc) in release.services.into_iter().flatten() {
                installs.push(InstallClaim {
                    service,
                    image: ImageKey::Location(svc.image),
                    app: app_ref.clone(),
                    release: ReleaseKey::Commit(commit.clone()),
                    status: svc.status,
                    download_progress: parse_progress(svc.download_progress)?,
                });
            }
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

    fn parse_json(value: Value) -> Result<NormalizedReport, ReportError> {
        parse(value.to_string().as_bytes())
    }

    #[test]
    fn it_normalizes_a_device_report() {
        let report = parse_json(json!({
            "d1": {
                "status": "Idle",
                "apps": {
                    "a1": {
                        "release_uuid": "r1",
                        "releases": {
                            "r1": {
                                "services": {
                                    "main": {
                                        "image": "img-loc-1",
                                        "status": "Running",
                                        "download_progress": null
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }))
        .unwrap();

        let app = AppRef::App(ApplicationKey::Uuid("a1".into()));
        let claim = &report.devices[&Uuid::from("d1")];
        assert_eq!(
            claim.patch,
            [(DeviceField::Status, FieldValue::Text("Idle".into()))].into()
        );
        assert_eq!(
            claim.running,
            vec![(app.clone(), ReleaseKey::Commit("r1".into()))]
        );
        assert_eq!(
            claim.installs,
            Some(vec![InstallClaim {
                service: "main".into(),
                image: ImageKey::Location("img-loc-1".into()),
                app: app.clone(),
                release: ReleaseKey::Commit("r1".into()),
                status: "Running".into(),
                download_progress: None,
            }])
        );
        assert_eq!(
            report.images,
            [ImageKey::Location("img-loc-1".into())].into()
        );
        assert_eq!(
            report.releases,
            [(app, [ReleaseKey::Commit("r1".into())].into())].into()
        );
    }

    #[test]
    fn it_skips_null_devices() {
        let report = parse_json(json!({
            "d1": null,
            "d2": { "is_online": true }
        }))
        .unwrap();

        assert_eq!(
            report.devices.keys().cloned().collect::<Vec<_>>(),
            vec![Uuid::from("d2")]
        );
        assert_eq!(report.devices[&Uuid::from("d2")].installs, None);
    }

    #[test]
    fn it_rejects_reports_without_devices() {
        assert!(matches!(
            parse_json(json!({})),
            Err(ReportError::Malformed(_))
        ));
        assert!(matches!(
            parse_json(json!({"d1": null})),
            Err(ReportError::Malformed(_))
        ));
    }

    #[test]
    fn it_rejects_invalid_shapes() {
        assert!(matches!(
            parse_json(json!([1, 2])),
            Err(ReportError::Malformed(_))
        ));
        assert!(matches!(
            parse(b"{not json"),
            Err(ReportError::Malformed(_))
        ));
        assert!(matches!(
            parse_json(json!({
                "d1": {
                    "apps": {
                        "a1": {
                            "releases": {
                                "r1": { "services": { "main": { "status": "Running" } } }
                            }
                        }
                    }
                }
            })),
            Err(ReportError::Malformed(_))
        ));
    }

    #[test]
    fn an_empty_apps_object_claims_no_installs() {
        let report = parse_json(json!({"d1": {"apps": {}}})).unwrap();
        assert_eq!(
            report.devices[&Uuid::from("d1")].installs,
            Some(Vec::new())
        );
    }
}
