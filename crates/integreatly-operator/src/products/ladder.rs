//! The product phase ladder
//!
//! `EnsureNamespace -> EnsureSubscription -> EnsureCustomResources ->
//! AwaitReady -> Completed`. Each step is idempotent and the ladder only
//! advances past a step that finished; a pending subscription or an
//! unready pod set ends the pass as `InProgress`.

use super::{tolerate_existing, tolerate_missing, ProductReconciler};
use crate::alerts::{MONITORING_LABEL_KEY, MONITORING_LABEL_VALUE};
use crate::client::{claim, ResourceClient};
use crate::crd::{Installation, ProductName, StatusPhase};
use crate::error::Result;
use crate::marketplace::{Marketplace, SubscriptionState};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Builds the objects of a product for a target namespace
pub type ObjectBuilder = fn(&Installation, &str) -> Vec<(ApiResource, DynamicObject)>;

/// Static description of a ladder product
#[derive(Clone)]
pub struct ProductDescriptor {
    pub product: ProductName,
    /// Appended to the installation's namespace prefix
    pub default_namespace: &'static str,
    /// Marketplace package of the product's controller
    pub package: &'static str,
    pub channel: &'static str,
    pub version: &'static str,
    /// Pods the product runs once healthy
    pub expected_pods: usize,
    /// Custom resources, created once and never updated
    pub custom_resources: ObjectBuilder,
    /// Objects created or updated on every pass, deleted on teardown.
    /// They may live outside the product namespace.
    pub managed_objects: Option<ObjectBuilder>,
}

impl fmt::Debug for ProductDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProductDescriptor")
            .field("product", &self.product)
            .field("default_namespace", &self.default_namespace)
            .field("package", &self.package)
            .field("version", &self.version)
            .field("expected_pods", &self.expected_pods)
            .finish()
    }
}

/// Pod readiness of a product namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub expected: usize,
    pub observed: usize,
    pub ready: usize,
}

impl Readiness {
    /// Completed iff enough pods exist and every one of them is ready
    pub fn phase(&self) -> StatusPhase {
        if self.observed >= self.expected && self.ready == self.observed {
            StatusPhase::Completed
        } else {
            StatusPhase::InProgress
        }
    }
}

/// Whether a pod reports `ContainersReady=True`
pub fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "ContainersReady" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Whether a pod has run to completion and will never become ready
pub fn pod_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

/// Count observed and ready pods against an expected count.
///
/// Finished pods (jobs, builds) are left out of both counts.
pub fn evaluate_readiness(pods: &[Pod], expected: usize) -> Readiness {
    let running = pods.iter().filter(|p| !pod_finished(p));
    Readiness {
        expected,
        observed: running.clone().count(),
        ready: running.filter(|p| pod_ready(p)).count(),
    }
}

/// [`ProductReconciler`] running the ladder for one descriptor
pub struct LadderReconciler {
    descriptor: ProductDescriptor,
    marketplace: Arc<dyn Marketplace>,
}

impl LadderReconciler {
    pub fn new(descriptor: ProductDescriptor, marketplace: Arc<dyn Marketplace>) -> Self {
        Self {
            descriptor,
            marketplace,
        }
    }

    pub fn descriptor(&self) -> &ProductDescriptor {
        &self.descriptor
    }

    async fn ensure_namespace(&self, client: &dyn ResourceClient, namespace: &str) -> Result<()> {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([
                    ("integreatly".to_string(), "true".to_string()),
                    (
                        MONITORING_LABEL_KEY.to_string(),
                        MONITORING_LABEL_VALUE.to_string(),
                    ),
                ])),
                ..Default::default()
            },
            ..Default::default()
        };
        tolerate_existing(client.create_namespace(&ns).await)
    }

    async fn ensure_custom_resources(
        &self,
        installation: &Installation,
        client: &dyn ResourceClient,
        namespace: &str,
    ) -> Result<()> {
        for (resource, mut object) in (self.descriptor.custom_resources)(installation, namespace) {
            claim(installation, &mut object)?;
            tolerate_existing(client.create_object(&resource, &object).await)?;
        }

        if let Some(managed) = self.descriptor.managed_objects {
            for (resource, mut object) in managed(installation, namespace) {
                claim(installation, &mut object)?;
                client.apply_object(&resource, &object).await?;
            }
        }
        Ok(())
    }

    async fn await_ready(&self, client: &dyn ResourceClient, namespace: &str) -> Result<StatusPhase> {
        let pods = client.list_pods(namespace).await?;
        let readiness = evaluate_readiness(&pods, self.descriptor.expected_pods);
        debug!(
            product = %self.descriptor.product,
            expected = readiness.expected,
            observed = readiness.observed,
            ready = readiness.ready,
            "Checked product pods"
        );
        Ok(readiness.phase())
    }
}

#[async_trait]
impl ProductReconciler for LadderReconciler {
    fn product(&self) -> ProductName {
        self.descriptor.product
    }

    fn version(&self) -> &str {
        self.descriptor.version
    }

    fn namespace(&self, installation: &Installation) -> String {
        format!(
            "{}{}",
            installation.spec.namespace_prefix, self.descriptor.default_namespace
        )
    }

    #[instrument(skip(self, installation, client), fields(product = %self.descriptor.product, installation = %installation.name_any()))]
    async fn reconcile(
        &self,
        installation: &Installation,
        client: &dyn ResourceClient,
    ) -> Result<StatusPhase> {
        let namespace = self.namespace(installation);

        self.ensure_namespace(client, &namespace).await?;

        let subscription = self
            .marketplace
            .ensure_subscription(
                client,
                installation,
                self.descriptor.package,
                self.descriptor.channel,
                &namespace,
            )
            .await?;
        if subscription == SubscriptionState::Pending {
            debug!(package = %self.descriptor.package, "Waiting for subscription to install");
            return Ok(StatusPhase::InProgress);
        }

        self.ensure_custom_resources(installation, client, &namespace)
            .await?;

        let phase = self.await_ready(client, &namespace).await?;
        if phase.is_completed() {
            info!(namespace = %namespace, "Product reconciled successfully");
        }
        Ok(phase)
    }

    async fn teardown(
        &self,
        installation: &Installation,
        client: &dyn ResourceClient,
    ) -> Result<StatusPhase> {
        let namespace = self.namespace(installation);

        if let Some(managed) = self.descriptor.managed_objects {
            for (resource, object) in managed(installation, &namespace) {
                let object_namespace = object.namespace().unwrap_or_default();
                let name = object.name_any();
                if tolerate_missing(
                    client
                        .delete_object(&resource, &object_namespace, &name)
                        .await,
                )? {
                    debug!(kind = %resource.kind, name = %name, namespace = %object_namespace, "Deleted managed object");
                }
            }
        }

        if tolerate_missing(client.delete_namespace(&namespace).await)? {
            info!(product = %self.descriptor.product, namespace = %namespace, "Deleting product namespace");
            Ok(StatusPhase::InProgress)
        } else {
            Ok(StatusPhase::Completed)
        }
    }
}
