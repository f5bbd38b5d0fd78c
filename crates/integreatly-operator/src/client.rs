//! Control-plane client
//!
//! [`ResourceClient`] is the narrow set of Kubernetes operations the
//! reconcilers need. Create calls surface an existing object as
//! [`OperatorError::AlreadyExists`] and delete calls surface a missing one
//! as [`OperatorError::NotFound`], so callers can branch on idempotency
//! sentinels structurally.

use crate::crd::{Installation, InstallationStatus};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, Resource, ResourceExt};
use tracing::debug;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "integreatly-operator";

/// Label naming the installation an object belongs to
pub const INSTALLATION_LABEL: &str = "integreatly.org/installation";

/// Build an [`ApiResource`] for a custom resource kind
pub fn api_resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), plural)
}

/// Controller owner reference pointing at the installation
pub fn owner_reference(installation: &Installation) -> Result<OwnerReference> {
    installation.controller_owner_ref(&()).ok_or_else(|| {
        OperatorError::InvalidConfig("installation has no uid; cannot own resources".to_string())
    })
}

/// Mark `object` as belonging to the installation.
///
/// Every object is labelled. Only objects in the installation's own
/// namespace get an owner reference; the garbage collector treats a
/// cross-namespace owner as missing and deletes the dependent.
pub fn claim(installation: &Installation, object: &mut DynamicObject) -> Result<()> {
    object
        .labels_mut()
        .insert(INSTALLATION_LABEL.to_string(), installation.name_any());
    if object.metadata.namespace.is_some()
        && object.metadata.namespace == installation.metadata.namespace
    {
        object.metadata.owner_references = Some(vec![owner_reference(installation)?]);
    }
    Ok(())
}

/// Merge patch writing `status`, guarded by the resource version the
/// installation was read at
pub fn status_patch(installation: &Installation, status: &InstallationStatus) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": installation.resource_version(),
        },
        "status": status
    })
}

/// Kubernetes operations used by the reconcilers
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Create a namespace; `AlreadyExists` if present
    async fn create_namespace(&self, namespace: &Namespace) -> Result<()>;

    /// Delete a namespace; `NotFound` if absent
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Fetch a namespaced dynamic object, `None` if absent
    async fn get_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Create a namespaced dynamic object; `AlreadyExists` if present.
    /// An existing object is never modified.
    async fn create_object(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()>;

    /// Create or update a namespaced dynamic object by name
    async fn apply_object(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()>;

    /// Delete a namespaced dynamic object; `NotFound` if absent
    async fn delete_object(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()>;

    /// List the pods of a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    /// Write the installation status.
    ///
    /// The write carries the `resourceVersion` the installation was read at;
    /// a concurrent modification fails with `Conflict` instead of being
    /// overwritten.
    async fn patch_installation_status(
        &self,
        installation: &Installation,
        status: &InstallationStatus,
    ) -> Result<Installation>;
}

/// [`ResourceClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

/// Name and namespace of a dynamic object, or an error if unnamed
fn object_key(resource: &ApiResource, object: &DynamicObject) -> Result<(String, String)> {
    let name = object.metadata.name.clone().ok_or_else(|| {
        OperatorError::InvalidConfig(format!("{} missing metadata.name", resource.kind))
    })?;
    let namespace = object.metadata.namespace.clone().ok_or_else(|| {
        OperatorError::InvalidConfig(format!("{} {} missing metadata.namespace", resource.kind, name))
    })?;
    Ok((name, namespace))
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let name = namespace.name_any();
        debug!(namespace = %name, "Creating Namespace");

        api.create(&PostParams::default(), namespace)
            .await
            .map_err(|e| OperatorError::from_kube(e, "Namespace", &name, ""))?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        debug!(namespace = %name, "Deleting Namespace");

        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| OperatorError::from_kube(e, "Namespace", name, ""))?;
        Ok(())
    }

    async fn get_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let api = self.dynamic_api(resource, namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(OperatorError::from_kube(e, &resource.kind, name, namespace)),
        }
    }

    async fn create_object(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()> {
        let (name, namespace) = object_key(resource, object)?;
        let api = self.dynamic_api(resource, &namespace);
        debug!(kind = %resource.kind, name = %name, namespace = %namespace, "Creating object");

        api.create(&PostParams::default(), object)
            .await
            .map_err(|e| OperatorError::from_kube(e, &resource.kind, &name, &namespace))?;
        Ok(())
    }

    async fn apply_object(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()> {
        let (name, namespace) = object_key(resource, object)?;
        let api = self.dynamic_api(resource, &namespace);
        debug!(kind = %resource.kind, name = %name, namespace = %namespace, "Applying object");

        let patch_params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &patch_params, &Patch::Apply(object))
            .await
            .map_err(|e| OperatorError::from_kube(e, &resource.kind, &name, &namespace))?;
        Ok(())
    }

    async fn delete_object(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        let api = self.dynamic_api(resource, namespace);
        debug!(kind = %resource.kind, name = %name, namespace = %namespace, "Deleting object");

        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| OperatorError::from_kube(e, &resource.kind, name, namespace))?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default())
            .await
            .map_err(|e| OperatorError::from_kube(e, "Pod", "*", namespace))?;
        Ok(pods.items)
    }

    async fn patch_installation_status(
        &self,
        installation: &Installation,
        status: &InstallationStatus,
    ) -> Result<Installation> {
        let name = installation.name_any();
        let namespace = installation.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Installation> = Api::namespaced(self.client.clone(), &namespace);

        debug!(name = %name, phase = %status.phase, "Updating installation status");

        let patch = status_patch(installation, status);
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::from_kube(e, "Installation", &name, &namespace))
    }
}
