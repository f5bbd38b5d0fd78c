//! Bootstrap product
//!
//! Runs before every other stage. When a cloud provider is configured it
//! provisions the installation's object storage; without one there is
//! nothing to bootstrap and the product completes immediately.

use super::ProductReconciler;
use crate::client::ResourceClient;
use crate::crd::{Installation, ProductName, StatusPhase};
use crate::error::Result;
use crate::providers::{CloudProvider, ProviderError};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Version reported for the bootstrap product
const BOOTSTRAP_VERSION: &str = "1.0";

/// Storage name for an installation
pub fn storage_name(installation: &Installation) -> String {
    format!("integreatly-{}", installation.name_any())
}

/// Provisions installation-wide cloud resources
pub struct BootstrapReconciler {
    provider: Option<Arc<dyn CloudProvider>>,
}

impl BootstrapReconciler {
    pub fn new(provider: Option<Arc<dyn CloudProvider>>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ProductReconciler for BootstrapReconciler {
    fn product(&self) -> ProductName {
        ProductName::Bootstrap
    }

    fn version(&self) -> &str {
        BOOTSTRAP_VERSION
    }

    fn namespace(&self, installation: &Installation) -> String {
        installation.namespace().unwrap_or_default()
    }

    #[instrument(skip(self, installation, _client), fields(installation = %installation.name_any()))]
    async fn reconcile(
        &self,
        installation: &Installation,
        _client: &dyn ResourceClient,
    ) -> Result<StatusPhase> {
        let Some(provider) = &self.provider else {
            debug!("No cloud provider configured, nothing to bootstrap");
            return Ok(StatusPhase::Completed);
        };

        let name = storage_name(installation);
        match provider.create_storage(&name).await {
            Ok(resource) => {
                info!(provider = %provider.name(), storage = %resource.id, "Created installation storage");
            }
            Err(ProviderError::AlreadyExists { .. }) => {
                debug!(storage = %name, "Installation storage already exists");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(StatusPhase::Completed)
    }

    async fn teardown(
        &self,
        installation: &Installation,
        _client: &dyn ResourceClient,
    ) -> Result<StatusPhase> {
        let Some(provider) = &self.provider else {
            return Ok(StatusPhase::Completed);
        };

        let name = storage_name(installation);
        match provider.remove_storage(&name).await {
            Ok(()) => info!(storage = %name, "Removed installation storage"),
            Err(ProviderError::NotFound { .. }) => {
                debug!(storage = %name, "Installation storage already absent")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(StatusPhase::Completed)
    }
}
