//! Operator configuration

use crate::providers::ProviderConfig;
use std::time::Duration;

/// Requeue after a pass that left the installation in progress
pub const DEFAULT_IN_PROGRESS_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue after a pass that left the installation failed
pub const DEFAULT_FAILED_REQUEUE: Duration = Duration::from_secs(60);

/// Ceiling of the per-installation error backoff
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Runtime configuration of the installation controller
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch; all namespaces if unset
    pub namespace: Option<String>,
    /// Cloud provider for installation-wide resources; none if unset
    pub provider: Option<ProviderConfig>,
    pub in_progress_requeue: Duration,
    pub failed_requeue: Duration,
    pub max_backoff: Duration,
    /// OLM catalog source products are subscribed from
    pub catalog_source: String,
    pub catalog_namespace: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            provider: None,
            in_progress_requeue: DEFAULT_IN_PROGRESS_REQUEUE,
            failed_requeue: DEFAULT_FAILED_REQUEUE,
            max_backoff: DEFAULT_MAX_BACKOFF,
            catalog_source: crate::marketplace::DEFAULT_CATALOG_SOURCE.to_string(),
            catalog_namespace: crate::marketplace::DEFAULT_CATALOG_NAMESPACE.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Backoff for the `attempt`th consecutive error, doubling from one
    /// in-progress interval up to the ceiling
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.in_progress_requeue
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert!(config.namespace.is_none());
        assert!(config.provider.is_none());
        assert!(config.in_progress_requeue < config.failed_requeue);
        assert_eq!(config.catalog_namespace, "openshift-marketplace");
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = OperatorConfig::default();
        assert_eq!(config.backoff(0), Duration::from_secs(10));
        assert_eq!(config.backoff(1), Duration::from_secs(20));
        assert_eq!(config.backoff(3), Duration::from_secs(80));
        assert_eq!(config.backoff(10), Duration::from_secs(300));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(300));
    }
}
