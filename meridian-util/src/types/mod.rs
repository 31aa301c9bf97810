mod uuid;

pub use uuid::Uuid;

/// Numeric, store-assigned row identifier
pub type Id = i64;
