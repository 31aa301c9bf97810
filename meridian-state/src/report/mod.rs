//! State report parsing.
//!
//! Both report formats are reduced to a [`NormalizedReport`]: a patch of
//! allowed device fields per device, the releases a device claims to run and
//! the images it claims to have installed. Every image and release reference
//! in the batch is also collected so the resolver can look them up with one
//! query per kind.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use meridian_store::{
    ApplicationKey, DeviceField, DeviceFields, FieldKind, FieldValue, ImageKey, ReleaseKey,
    SHORT_TEXT_MAX_CHARS,
};
use meridian_util::types::Uuid;

use crate::ReportError;

pub mod v2;
pub mod v3;

/// How a report refers to the application a release belongs to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AppRef {
    App(ApplicationKey),

    /// The application the given device belongs to
    OwnerOf(Uuid),
}

/// An image a device claims to have installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallClaim {
    pub service: String,
    pub image: ImageKey,
    pub app: AppRef,
    pub release: ReleaseKey,
    pub status: String,
    pub download_progress: Option<i64>,
}

/// Everything a report claims about a single device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceClaim {
    /// Reported values of allowed device fields
    pub patch: DeviceFields,

    /// Releases the device claims to be running, per application
    pub running: Vec<(AppRef, ReleaseKey)>,

    /// Installed images, if the report included the apps of the device.
    ///
    /// `None` leaves the device's install rows untouched.
    pub installs: Option<Vec<InstallClaim>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedReport {
    pub devices: BTreeMap<Uuid, DeviceClaim>,

    /// Every image referenced by the batch
    pub images: BTreeSet<ImageKey>,

    /// Every release referenced by the batch, per application
    pub releases: BTreeMap<AppRef, BTreeSet<ReleaseKey>>,
}

impl NormalizedReport {
    /// Add the claim of a device, collecting its references
    pub fn insert(&mut self, uuid: Uuid, claim: DeviceClaim) {
        for (app, release) in claim.running.iter() {
            self.releases
                .entry(app.clone())
                .or_default()
                .insert(release.clone());
        }

        for install in claim.installs.iter().flatten() {
            self.images.insert(install.image.clone());
            self.releases
                .entry(install.app.clone())
                .or_default()
                .insert(install.release.clone());
        }

        self.devices.insert(uuid, claim);
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Keep the allowed device fields of a report, checking their types.
///
/// Unknown fields and null values are ignored.
pub(crate) fn parse_patch(fields: Map<String, Value>) -> Result<DeviceFields, ReportError> {
    let mut patch = DeviceFields::new();
    for (name, value) in fields {
        let Some(field) = DeviceField::from_name(&name).filter(DeviceField::is_reported) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        patch.insert(field, parse_value(field, value)?);
    }
    Ok(patch)
}

fn parse_value(field: DeviceField, value: Value) -> Result<FieldValue, ReportError> {
    let wrong_type = || ReportError::malformed(format!("unexpected value type for '{field}'"));

    match (field.kind(), value) {
        (FieldKind::Text, Value::String(text)) if field.is_short_text() => {
            Ok(FieldValue::Text(truncate(text, SHORT_TEXT_MAX_CHARS)))
        }
        (FieldKind::Text, Value::String(text)) => Ok(FieldValue::Text(text)),
        (FieldKind::Integer, Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|n| n.round() as i64))
            .map(FieldValue::Integer)
            .ok_or_else(wrong_type),
        (FieldKind::Boolean, Value::Bool(flag)) => Ok(FieldValue::Boolean(flag)),
        _ => Err(wrong_type()),
    }
}

/// Parse a download progress percentage, clamped to 0..=100
pub(crate) fn parse_progress(value: Option<Value>) -> Result<Option<i64>, ReportError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_f64()
            .map(|n| Some(n.round().clamp(0.0, 100.0) as i64))
            .ok_or_else(|| ReportError::malformed("invalid download progress")),
        Some(_) => Err(ReportError::malformed("invalid download progress")),
    }
}

fn truncate(mut text: String, max_chars: usize) -> String {
    if let Some((idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(idx);
    }
    text
}
