//! Device state reconciliation.
//!
//! A state report goes through four steps:
//!
//! 1. [`report`] turns the request body into a [`NormalizedReport`],
//!    without touching the store.
//! 2. [`resolve`] checks every device, image and release the report names
//!    against a read snapshot and the caller's scope.
//! 3. [`diff`] computes the image install rows to insert, update and delete.
//! 4. [`Reconciler`] applies the result in a single write transaction.

use thiserror::Error;

use meridian_store::StoreError;

mod context;
mod diff;
mod metrics;
mod reconcile;
mod resolve;

pub mod report;

pub use context::RequestContext;
pub use diff::{InstallCandidate, InstallPlan, InstallScope, diff};
pub use metrics::MetricsThrottle;
pub use reconcile::{ReconcileSummary, Reconciler};
pub use report::NormalizedReport;
pub use resolve::{ResolvedReport, resolve};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("malformed state report: {0}")]
    Malformed(String),

    /// Some device, image or release of the report is unknown or out of
    /// the caller's scope
    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReportError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}
