//! Shared building blocks for the meridian crates.

pub mod cache;
pub mod types;
