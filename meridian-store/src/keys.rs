use std::fmt;

use meridian_util::types::{Id, Uuid};

use crate::models::{Application, Image, Release};

/// How a report refers to an image
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImageKey {
    Location(String),
    Id(Id),
}

impl ImageKey {
    pub fn matches(&self, image: &Image) -> bool {
        match self {
            ImageKey::Location(location) => location == &image.location,
            ImageKey::Id(id) => *id == image.id,
        }
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKey::Location(location) => location.fmt(f),
            ImageKey::Id(id) => write!(f, "#{id}"),
        }
    }
}

/// How a report refers to a release within an application
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReleaseKey {
    Commit(String),
    Id(Id),
}

impl ReleaseKey {
    pub fn matches(&self, release: &Release) -> bool {
        match self {
            ReleaseKey::Commit(commit) => commit == &release.commit,
            ReleaseKey::Id(id) => *id == release.id,
        }
    }
}

impl fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseKey::Commit(commit) => commit.fmt(f),
            ReleaseKey::Id(id) => write!(f, "#{id}"),
        }
    }
}

/// How a report refers to an application
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApplicationKey {
    Uuid(Uuid),
    Id(Id),
}

impl ApplicationKey {
    pub fn matches(&self, app: &Application) -> bool {
        match self {
            ApplicationKey::Uuid(uuid) => uuid == &app.uuid,
            ApplicationKey::Id(id) => *id == app.id,
        }
    }
}

impl fmt::Display for ApplicationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationKey::Uuid(uuid) => uuid.fmt(f),
            ApplicationKey::Id(id) => write!(f, "#{id}"),
        }
    }
}
