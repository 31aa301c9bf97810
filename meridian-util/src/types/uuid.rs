use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt::Display;
use std::ops::Deref;

/// A caller-supplied, stable identifier for devices and applications.
///
/// Devices choose their own uuid when provisioning, so this is kept as an
/// opaque string rather than parsed into a RFC 4122 value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Uuid(String);

impl Deref for Uuid {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Borrow<str> for Uuid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Default for Uuid {
    fn default() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Uuid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Uuid {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<Uuid> for String {
    fn from(value: Uuid) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uuids_are_unique_and_simple() {
        let a = Uuid::default();
        let b = Uuid::default();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(!a.contains('-'));
    }

    #[test]
    fn it_serializes_as_a_plain_string() {
        let uuid = Uuid::from("device-123");
        assert_eq!(
            serde_json::to_value(&uuid).unwrap(),
            serde_json::json!("device-123")
        );
    }
}
