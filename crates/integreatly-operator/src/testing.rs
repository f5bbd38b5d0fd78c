//! In-process fakes for reconciler tests

use crate::client::ResourceClient;
use crate::crd::{
    Installation, InstallationSpec, InstallationStatus, InstallationType, ProductName, StatusPhase,
};
use crate::error::{OperatorError, Result};
use crate::marketplace::{Marketplace, SubscriptionState};
use crate::products::ProductReconciler;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Namespace the test installations live in
pub const INSTALLATION_NAMESPACE: &str = "integreatly";

/// A managed installation with a uid and resource version
pub fn installation(name: &str, prefix: &str) -> Installation {
    let mut inst = Installation::new(
        name,
        InstallationSpec {
            installation_type: InstallationType::Managed,
            namespace_prefix: prefix.to_string(),
            routing_subdomain: "apps.example.com".to_string(),
            master_url: "console.apps.example.com".to_string(),
            self_signed_certs: false,
        },
    );
    inst.metadata.namespace = Some(INSTALLATION_NAMESPACE.to_string());
    inst.metadata.uid = Some(format!("{name}-uid"));
    inst.metadata.resource_version = Some("1".to_string());
    inst
}

/// A lightweight workshop installation
pub fn workshop_installation(name: &str) -> Installation {
    let mut inst = installation(name, "workshop-");
    inst.spec.installation_type = InstallationType::Workshop;
    inst
}

/// A pod with a `ContainersReady` condition
pub fn pod(name: &str, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "ContainersReady".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn unavailable() -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: "the server is currently unable to handle the request".to_string(),
        reason: "ServiceUnavailable".to_string(),
        code: 503,
    }))
}

type ObjectKey = (String, String, String);

#[derive(Default)]
struct FakeState {
    namespaces: BTreeSet<String>,
    objects: BTreeMap<ObjectKey, DynamicObject>,
    pods: BTreeMap<String, Vec<Pod>>,
    status_writes: Vec<InstallationStatus>,
    resource_version: u64,
    unavailable: bool,
    install_subscriptions: bool,
    calls: Vec<String>,
    create_calls: usize,
    apply_calls: usize,
    list_pod_calls: usize,
}

/// In-memory [`ResourceClient`]
#[derive(Default)]
pub struct FakeClient {
    state: Mutex<FakeState>,
}

impl FakeClient {
    pub fn new() -> Self {
        let client = Self::default();
        client.state.lock().resource_version = 1;
        client
    }

    /// Mark every subscription installed as soon as it is created
    pub fn installing_subscriptions() -> Self {
        let client = Self::new();
        client.state.lock().install_subscriptions = true;
        client
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Replace the pods of a namespace with `total` pods, `ready` of them ready
    pub fn set_pods(&self, namespace: &str, total: usize, ready: usize) {
        let pods = (0..total)
            .map(|i| pod(&format!("{namespace}-{i}"), i < ready))
            .collect();
        self.state.lock().pods.insert(namespace.to_string(), pods);
    }

    pub fn mark_subscription_installed(&self, namespace: &str, name: &str) {
        self.edit_object("Subscription", namespace, name, install);
    }

    pub fn edit_object(&self, kind: &str, namespace: &str, name: &str, edit: impl FnOnce(&mut DynamicObject)) {
        let mut state = self.state.lock();
        let key = (kind.to_string(), namespace.to_string(), name.to_string());
        if let Some(object) = state.objects.get_mut(&key) {
            edit(object);
        }
    }

    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        let key = (kind.to_string(), namespace.to_string(), name.to_string());
        self.state.lock().objects.get(&key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().namespaces.contains(name)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().namespaces.iter().cloned().collect()
    }

    /// Resource version of the stored installation
    pub fn resource_version(&self) -> String {
        self.state.lock().resource_version.to_string()
    }

    /// Bump the stored resource version as a concurrent writer would
    pub fn touch(&self) {
        self.state.lock().resource_version += 1;
    }

    pub fn status_writes(&self) -> Vec<InstallationStatus> {
        self.state.lock().status_writes.clone()
    }

    pub fn last_status(&self) -> Option<InstallationStatus> {
        self.state.lock().status_writes.last().cloned()
    }

    /// Every call except status writes, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    pub fn apply_calls(&self) -> usize {
        self.state.lock().apply_calls
    }

    pub fn list_pod_calls(&self) -> usize {
        self.state.lock().list_pod_calls
    }

    fn begin(&self, call: String) -> Result<parking_lot::MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.unavailable {
            return Err(unavailable());
        }
        Ok(state)
    }
}

fn install(subscription: &mut DynamicObject) {
    subscription.data["status"] = serde_json::json!({
        "state": "AtLatestKnown",
        "installedCSV": format!("{}.v1.0.0", subscription.name_any()),
    });
}

fn key_of(resource: &ApiResource, object: &DynamicObject) -> ObjectKey {
    (
        resource.kind.clone(),
        object.metadata.namespace.clone().unwrap_or_default(),
        object.name_any(),
    )
}

#[async_trait]
impl ResourceClient for FakeClient {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<()> {
        let name = namespace.name_any();
        let mut state = self.begin(format!("create_namespace {name}"))?;
        if !state.namespaces.insert(name.clone()) {
            return Err(OperatorError::AlreadyExists {
                kind: "Namespace".to_string(),
                name,
            });
        }
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.begin(format!("delete_namespace {name}"))?;
        if !state.namespaces.remove(name) {
            return Err(OperatorError::NotFound {
                kind: "Namespace".to_string(),
                name: name.to_string(),
                namespace: String::new(),
            });
        }
        state.objects.retain(|(_, ns, _), _| ns != name);
        state.pods.remove(name);
        Ok(())
    }

    async fn get_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let state = self.begin(format!("get {} {namespace}/{name}", resource.kind))?;
        let key = (resource.kind.clone(), namespace.to_string(), name.to_string());
        Ok(state.objects.get(&key).cloned())
    }

    async fn create_object(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()> {
        let key = key_of(resource, object);
        let mut state = self.begin(format!("create {} {}/{}", key.0, key.1, key.2))?;
        state.create_calls += 1;
        if state.objects.contains_key(&key) {
            return Err(OperatorError::AlreadyExists {
                kind: key.0,
                name: key.2,
            });
        }
        let mut object = object.clone();
        if state.install_subscriptions && key.0 == "Subscription" {
            install(&mut object);
        }
        state.objects.insert(key, object);
        Ok(())
    }

    async fn apply_object(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()> {
        let key = key_of(resource, object);
        let mut state = self.begin(format!("apply {} {}/{}", key.0, key.1, key.2))?;
        state.apply_calls += 1;
        state.objects.insert(key, object.clone());
        Ok(())
    }

    async fn delete_object(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.begin(format!("delete {} {namespace}/{name}", resource.kind))?;
        let key = (resource.kind.clone(), namespace.to_string(), name.to_string());
        if state.objects.remove(&key).is_none() {
            return Err(OperatorError::NotFound {
                kind: resource.kind.clone(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let mut state = self.begin(format!("list_pods {namespace}"))?;
        state.list_pod_calls += 1;
        Ok(state.pods.get(namespace).cloned().unwrap_or_default())
    }

    async fn patch_installation_status(
        &self,
        installation: &Installation,
        status: &InstallationStatus,
    ) -> Result<Installation> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(unavailable());
        }
        // a write read at an older version than the stored one is stale
        let read_at = installation
            .resource_version()
            .and_then(|rv| rv.parse::<u64>().ok());
        let stale = read_at.is_some_and(|rv| rv < state.resource_version);
        if stale {
            return Err(OperatorError::Conflict {
                kind: "Installation".to_string(),
                name: installation.name_any(),
            });
        }
        state.resource_version += 1;
        state.status_writes.push(status.clone());

        let mut updated = installation.clone();
        updated.metadata.resource_version = Some(state.resource_version.to_string());
        updated.status = Some(status.clone());
        Ok(updated)
    }
}

/// [`Marketplace`] answering with a fixed state
pub struct FakeMarketplace {
    state: SubscriptionState,
    calls: AtomicUsize,
}

impl FakeMarketplace {
    pub fn installed() -> Self {
        Self {
            state: SubscriptionState::Installed,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn pending() -> Self {
        Self {
            state: SubscriptionState::Pending,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Marketplace for FakeMarketplace {
    async fn ensure_subscription(
        &self,
        _client: &dyn ResourceClient,
        _installation: &Installation,
        _package: &str,
        _channel: &str,
        _namespace: &str,
    ) -> Result<SubscriptionState> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state)
    }
}

/// Shared log of reconciler invocations, in order
pub type InvocationLog = Arc<Mutex<Vec<String>>>;

/// [`ProductReconciler`] replaying scripted phases
pub struct RecordingReconciler {
    product: ProductName,
    script: Mutex<VecDeque<Result<StatusPhase>>>,
    teardown_phase: StatusPhase,
    log: InvocationLog,
}

impl RecordingReconciler {
    /// Reports the scripted results in order, then `Completed` forever
    pub fn new(product: ProductName, log: InvocationLog, script: Vec<Result<StatusPhase>>) -> Self {
        Self {
            product,
            script: Mutex::new(script.into()),
            teardown_phase: StatusPhase::Completed,
            log,
        }
    }

    pub fn completing(product: ProductName, log: InvocationLog) -> Self {
        Self::new(product, log, Vec::new())
    }

    pub fn with_teardown(mut self, phase: StatusPhase) -> Self {
        self.teardown_phase = phase;
        self
    }
}

#[async_trait]
impl ProductReconciler for RecordingReconciler {
    fn product(&self) -> ProductName {
        self.product
    }

    fn version(&self) -> &str {
        "0.0.1"
    }

    fn namespace(&self, installation: &Installation) -> String {
        format!("{}{}", installation.spec.namespace_prefix, self.product)
    }

    async fn reconcile(
        &self,
        _installation: &Installation,
        _client: &dyn ResourceClient,
    ) -> Result<StatusPhase> {
        self.log.lock().push(format!("reconcile {}", self.product));
        self.script
            .lock()
            .pop_front()
            .unwrap_or(Ok(StatusPhase::Completed))
    }

    async fn teardown(
        &self,
        _installation: &Installation,
        _client: &dyn ResourceClient,
    ) -> Result<StatusPhase> {
        self.log.lock().push(format!("teardown {}", self.product));
        Ok(self.teardown_phase)
    }
}
