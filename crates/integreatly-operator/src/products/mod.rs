//! Per-product reconcilers
//!
//! Every product implements [`ProductReconciler`]. The stage sequencer only
//! depends on this trait; it records whatever phase a reconciler reports
//! together with the product's namespace and version.

mod bootstrap;
pub mod catalog;
mod ladder;

pub use bootstrap::{storage_name, BootstrapReconciler};
pub use ladder::{
    evaluate_readiness, pod_finished, pod_ready, LadderReconciler, ProductDescriptor, Readiness,
};

use crate::client::ResourceClient;
use crate::crd::{Installation, ProductName, StatusPhase};
use crate::error::{ErrorKind, OperatorError, Result};
use async_trait::async_trait;

/// Drives one product from absent to healthy.
///
/// `reconcile` is re-entrant: it is called on every pass until it reports
/// `Completed`, and every step it takes must tolerate having been taken
/// before.
#[async_trait]
pub trait ProductReconciler: Send + Sync {
    fn product(&self) -> ProductName;

    fn version(&self) -> &str;

    /// Namespace the product installs into for `installation`
    fn namespace(&self, installation: &Installation) -> String;

    /// Advance the product by as many steps as currently possible
    async fn reconcile(
        &self,
        installation: &Installation,
        client: &dyn ResourceClient,
    ) -> Result<StatusPhase>;

    /// Remove what `reconcile` created.
    ///
    /// Returns `Completed` once nothing is left, `InProgress` while removal
    /// is still converging.
    async fn teardown(
        &self,
        installation: &Installation,
        client: &dyn ResourceClient,
    ) -> Result<StatusPhase>;
}

/// Phase and status message recorded for a reconcile result.
///
/// Unrecoverable errors fail the product; anything else leaves it in
/// progress for the next pass. Both keep the error text.
pub fn outcome(result: Result<StatusPhase>) -> (StatusPhase, Option<String>) {
    match result {
        Ok(phase) => (phase, None),
        Err(e) => {
            let phase = match e.kind() {
                ErrorKind::Unrecoverable => StatusPhase::Failed,
                _ => StatusPhase::InProgress,
            };
            (phase, Some(e.to_string()))
        }
    }
}

/// Treat an `AlreadyExists` create result as success
pub(crate) fn tolerate_existing(result: Result<()>) -> Result<()> {
    match result {
        Err(OperatorError::AlreadyExists { .. }) => Ok(()),
        other => other,
    }
}

/// Treat a `NotFound` delete result as success
pub(crate) fn tolerate_missing(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(OperatorError::NotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}
