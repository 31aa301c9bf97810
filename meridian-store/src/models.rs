use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use meridian_util::types::{Id, Uuid};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub id: Id,
    pub uuid: Uuid,
}

/// The kind of value a device field holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Boolean,
}

/// A mutable device column.
///
/// Every variant but [`DeviceField::IsRunningRelease`] and
/// [`DeviceField::PublicAddress`] can be reported by a device directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum DeviceField {
    Status,
    OsVersion,
    OsVariant,
    SupervisorVersion,
    ProvisioningProgress,
    ProvisioningState,
    IpAddress,
    MacAddress,
    ApiPort,
    ApiSecret,
    LogsChannel,
    MemoryUsage,
    MemoryTotal,
    StorageBlockDevice,
    StorageUsage,
    StorageTotal,
    CpuTemp,
    CpuUsage,
    CpuId,
    IsUndervolted,
    IsOnline,
    Name,
    ParentDevice,
    IsRunningRelease,
    PublicAddress,
}

impl DeviceField {
    pub const ALL: [DeviceField; 25] = [
        DeviceField::Status,
        DeviceField::OsVersion,
        DeviceField::OsVariant,
        DeviceField::SupervisorVersion,
        DeviceField::ProvisioningProgress,
        DeviceField::ProvisioningState,
        DeviceField::IpAddress,
        DeviceField::MacAddress,
        DeviceField::ApiPort,
        DeviceField::ApiSecret,
        DeviceField::LogsChannel,
        DeviceField::MemoryUsage,
        DeviceField::MemoryTotal,
        DeviceField::StorageBlockDevice,
        DeviceField::StorageUsage,
        DeviceField::StorageTotal,
        DeviceField::CpuTemp,
        DeviceField::CpuUsage,
        DeviceField::CpuId,
        DeviceField::IsUndervolted,
        DeviceField::IsOnline,
        DeviceField::Name,
        DeviceField::ParentDevice,
        DeviceField::IsRunningRelease,
        DeviceField::PublicAddress,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DeviceField::Status => "status",
            DeviceField::OsVersion => "os_version",
            DeviceField::OsVariant => "os_variant",
            DeviceField::SupervisorVersion => "supervisor_version",
            DeviceField::ProvisioningProgress => "provisioning_progress",
            DeviceField::ProvisioningState => "provisioning_state",
            DeviceField::IpAddress => "ip_address",
            DeviceField::MacAddress => "mac_address",
            DeviceField::ApiPort => "api_port",
            DeviceField::ApiSecret => "api_secret",
            DeviceField::LogsChannel => "logs_channel",
            DeviceField::MemoryUsage => "memory_usage",
            DeviceField::MemoryTotal => "memory_total",
            DeviceField::StorageBlockDevice => "storage_block_device",
            DeviceField::StorageUsage => "storage_usage",
            DeviceField::StorageTotal => "storage_total",
            DeviceField::CpuTemp => "cpu_temp",
            DeviceField::CpuUsage => "cpu_usage",
            DeviceField::CpuId => "cpu_id",
            DeviceField::IsUndervolted => "is_undervolted",
            DeviceField::IsOnline => "is_online",
            DeviceField::Name => "name",
            DeviceField::ParentDevice => "parent_device",
            DeviceField::IsRunningRelease => "is_running__release",
            DeviceField::PublicAddress => "public_address",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.name() == name)
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            DeviceField::ProvisioningProgress
            | DeviceField::ApiPort
            | DeviceField::MemoryUsage
            | DeviceField::MemoryTotal
            | DeviceField::StorageUsage
            | DeviceField::StorageTotal
            | DeviceField::CpuTemp
            | DeviceField::CpuUsage
            | DeviceField::IsRunningRelease => FieldKind::Integer,
            DeviceField::IsUndervolted | DeviceField::IsOnline => FieldKind::Boolean,
            _ => FieldKind::Text,
        }
    }

    /// Whether a device may set this field from a state report
    pub fn is_reported(&self) -> bool {
        !matches!(
            self,
            DeviceField::IsRunningRelease | DeviceField::PublicAddress
        )
    }

    /// Whether this field is a hardware metric subject to report throttling
    pub fn is_metric(&self) -> bool {
        matches!(
            self,
            DeviceField::MemoryUsage
                | DeviceField::MemoryTotal
                | DeviceField::StorageBlockDevice
                | DeviceField::StorageUsage
                | DeviceField::StorageTotal
                | DeviceField::CpuTemp
                | DeviceField::CpuUsage
                | DeviceField::CpuId
                | DeviceField::IsUndervolted
        )
    }

    /// Whether this field is a short text column, limited to
    /// [`SHORT_TEXT_MAX_CHARS`] characters
    pub fn is_short_text(&self) -> bool {
        self.kind() == FieldKind::Text
            && !matches!(self, DeviceField::ParentDevice | DeviceField::PublicAddress)
    }
}

pub const SHORT_TEXT_MAX_CHARS: usize = 255;

impl fmt::Display for DeviceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

impl From<DeviceField> for &'static str {
    fn from(value: DeviceField) -> Self {
        value.name()
    }
}

impl TryFrom<String> for DeviceField {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DeviceField::from_name(&value).ok_or_else(|| format!("unknown device field '{value}'"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum FieldValue {
    Boolean(bool),
    Integer(i64),
    Text(String),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Boolean(_) => FieldKind::Boolean,
            FieldValue::Integer(_) => FieldKind::Integer,
            FieldValue::Text(_) => FieldKind::Text,
        }
    }
}

/// A set of device column values, used both for stored rows and patches
pub type DeviceFields = BTreeMap<DeviceField, FieldValue>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: Id,
    pub uuid: Uuid,

    #[serde(rename = "belongs_to__application")]
    pub application: Id,

    #[serde(default)]
    pub fields: DeviceFields,
}

impl Device {
    pub fn running_release(&self) -> Option<Id> {
        match self.fields.get(&DeviceField::IsRunningRelease) {
            Some(FieldValue::Integer(id)) => Some(*id),
            _ => None,
        }
    }
}

/// A device with its owning application expanded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceWithApp {
    pub device: Device,
    pub application_uuid: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub id: Id,
    pub commit: String,

    #[serde(rename = "belongs_to__application")]
    pub application: Id,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: Id,

    #[serde(rename = "is_stored_at__image_location")]
    pub location: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ImageInstall {
    pub id: Id,
    pub device: Id,

    #[serde(rename = "installs__image")]
    pub image: Id,

    #[serde(rename = "is_provided_by__release")]
    pub release: Id,

    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<i64>,

    pub install_date: DateTime<Utc>,
}

/// Values for a new image install row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImageInstall {
    pub device: Id,
    pub image: Id,
    pub release: Id,
    pub status: String,
    pub download_progress: Option<i64>,
}

/// The mutable columns of an image install row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInstallUpdate {
    pub release: Id,
    pub status: String,
    pub download_progress: Option<i64>,
}

/// What an API key is allowed to act upon
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    /// Every device
    Admin,

    /// A single device, as used by device API keys
    Device { uuid: Uuid },

    /// Every device of the listed applications
    Applications { uuids: Vec<Uuid> },
}

impl Scope {
    pub fn allows_device(&self, device: &Uuid, application: &Uuid) -> bool {
        match self {
            Scope::Admin => true,
            Scope::Device { uuid } => uuid == device,
            Scope::Applications { uuids } => uuids.contains(application),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub key: String,
    pub scope: Scope,
}
