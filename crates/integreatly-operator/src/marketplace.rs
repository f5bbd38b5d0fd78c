//! Operator marketplace subscriptions
//!
//! Products are installed by their own packaged controllers. Registering a
//! controller means an OLM `OperatorGroup` targeting the product namespace
//! plus a `Subscription` to the package; both are created if absent and
//! never rewritten. The subscription reports installed once OLM has resolved
//! and installed a ClusterServiceVersion.

use crate::client::{api_resource, claim, ResourceClient};
use crate::crd::Installation;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use std::sync::LazyLock;
use tracing::{debug, info};

/// Catalog source every package is resolved from
pub const DEFAULT_CATALOG_SOURCE: &str = "integreatly-operators";

/// Namespace of the catalog source
pub const DEFAULT_CATALOG_NAMESPACE: &str = "openshift-marketplace";

static SUBSCRIPTION: LazyLock<ApiResource> = LazyLock::new(|| {
    api_resource("operators.coreos.com", "v1alpha1", "Subscription", "subscriptions")
});

static OPERATOR_GROUP: LazyLock<ApiResource> = LazyLock::new(|| {
    api_resource("operators.coreos.com", "v1", "OperatorGroup", "operatorgroups")
});

/// Subscription state as seen by a reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// The packaged controller is installed
    Installed,
    /// Registered, waiting for the marketplace to install it
    Pending,
}

/// Idempotent subscription registrar
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Ensure `package` is subscribed in `namespace`
    async fn ensure_subscription(
        &self,
        client: &dyn ResourceClient,
        installation: &Installation,
        package: &str,
        channel: &str,
        namespace: &str,
    ) -> Result<SubscriptionState>;
}

/// [`Marketplace`] backed by the Operator Lifecycle Manager
#[derive(Debug, Clone)]
pub struct OlmMarketplace {
    catalog_source: String,
    catalog_namespace: String,
}

impl Default for OlmMarketplace {
    fn default() -> Self {
        Self {
            catalog_source: DEFAULT_CATALOG_SOURCE.to_string(),
            catalog_namespace: DEFAULT_CATALOG_NAMESPACE.to_string(),
        }
    }
}

impl OlmMarketplace {
    /// Resolve packages from a different catalog source
    pub fn with_catalog(mut self, source: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.catalog_source = source.into();
        self.catalog_namespace = namespace.into();
        self
    }
}

async fn create_if_absent(
    client: &dyn ResourceClient,
    resource: &ApiResource,
    object: DynamicObject,
) -> Result<()> {
    match client.create_object(resource, &object).await {
        Ok(()) => {
            info!(
                kind = %resource.kind,
                name = object.metadata.name.as_deref().unwrap_or_default(),
                "Created marketplace object"
            );
            Ok(())
        }
        Err(OperatorError::AlreadyExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether a subscription object reports an installed CSV
pub fn subscription_installed(subscription: &DynamicObject) -> bool {
    let status = subscription.data.get("status");
    let installed_csv = status
        .and_then(|s| s.get("installedCSV"))
        .and_then(|v| v.as_str())
        .is_some_and(|csv| !csv.is_empty());
    let state = status
        .and_then(|s| s.get("state"))
        .and_then(|v| v.as_str());
    installed_csv && state == Some("AtLatestKnown")
}

#[async_trait]
impl Marketplace for OlmMarketplace {
    async fn ensure_subscription(
        &self,
        client: &dyn ResourceClient,
        installation: &Installation,
        package: &str,
        channel: &str,
        namespace: &str,
    ) -> Result<SubscriptionState> {
        let mut group = DynamicObject::new(&format!("{}-operators", package), &OPERATOR_GROUP)
            .within(namespace)
            .data(serde_json::json!({
                "spec": { "targetNamespaces": [namespace] }
            }));
        claim(installation, &mut group)?;
        create_if_absent(client, &OPERATOR_GROUP, group).await?;

        if let Some(existing) = client.get_object(&SUBSCRIPTION, namespace, package).await? {
            let state = if subscription_installed(&existing) {
                SubscriptionState::Installed
            } else {
                SubscriptionState::Pending
            };
            debug!(package = %package, namespace = %namespace, ?state, "Subscription present");
            return Ok(state);
        }

        let mut subscription = DynamicObject::new(package, &SUBSCRIPTION)
            .within(namespace)
            .data(serde_json::json!({
                "spec": {
                    "name": package,
                    "channel": channel,
                    "installPlanApproval": "Automatic",
                    "source": self.catalog_source,
                    "sourceNamespace": self.catalog_namespace,
                }
            }));
        claim(installation, &mut subscription)?;
        create_if_absent(client, &SUBSCRIPTION, subscription).await?;

        Ok(SubscriptionState::Pending)
    }
}
