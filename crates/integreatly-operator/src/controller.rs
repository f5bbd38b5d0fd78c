//! Installation Controller
//!
//! This module implements the Kubernetes controller pattern for managing
//! Installation custom resources. Every event runs one pass of the stage
//! sequencer and persists the resulting status; progress is driven by
//! requeues, never by blocking inside a pass.

use crate::client::{KubeResourceClient, ResourceClient};
use crate::config::OperatorConfig;
use crate::crd::{Installation, InstallationStatus, StatusPhase};
use crate::error::{OperatorError, Result};
use crate::marketplace::OlmMarketplace;
use crate::providers::{CloudProvider, ProviderFactory};
use crate::stages::StageSequencer;
use chrono::Utc;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{self, finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Finalizer name for cleanup operations
pub const FINALIZER_NAME: &str = "integreatly.org/installation-finalizer";

/// What the controller runtime should do after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryInstruction {
    /// Nothing left to do until the installation changes
    AwaitChange,
    /// Run another pass after the delay
    After(Duration),
}

impl From<RetryInstruction> for Action {
    fn from(retry: RetryInstruction) -> Self {
        match retry {
            RetryInstruction::AwaitChange => Action::await_change(),
            RetryInstruction::After(delay) => Action::requeue(delay),
        }
    }
}

/// Runs one reconciliation pass over an installation
pub struct InstallationController {
    sequencer: StageSequencer,
    config: OperatorConfig,
}

impl InstallationController {
    pub fn new(sequencer: StageSequencer, config: OperatorConfig) -> Self {
        Self { sequencer, config }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Run one pass and persist the resulting status.
    ///
    /// The status is written whatever the outcome of the pass; only a
    /// failed write surfaces as an error.
    pub async fn reconcile(
        &self,
        installation: &Installation,
        client: &dyn ResourceClient,
    ) -> Result<RetryInstruction> {
        let previous = installation.status.clone().unwrap_or_default();
        let mut status = previous.clone();

        if installation.spec.installation_type.is_lightweight() {
            debug!(name = %installation.name_any(), "Lightweight installation, skipping stages");
            status.phase = StatusPhase::Completed;
            status.last_error = None;
        } else if let Err(message) = validate(installation) {
            warn!(name = %installation.name_any(), errors = %message, "Installation spec validation failed");
            status.phase = StatusPhase::Failed;
            status.last_error = Some(message);
        } else {
            let phase = self
                .sequencer
                .advance(installation, client, &mut status)
                .await;
            status.phase = phase;
            status.last_error = first_error(&status);
        }

        stamp(&previous, &mut status);
        client
            .patch_installation_status(installation, &status)
            .await?;

        info!(
            name = %installation.name_any(),
            phase = %status.phase,
            "Installation reconciled"
        );
        Ok(self.retry_for(status.phase))
    }

    /// Tear the installation down, last stage first
    pub async fn cleanup(
        &self,
        installation: &Installation,
        client: &dyn ResourceClient,
    ) -> Result<()> {
        if installation.spec.installation_type.is_lightweight() {
            return Ok(());
        }
        match self.sequencer.teardown(installation, client).await? {
            StatusPhase::Completed => Ok(()),
            phase => Err(OperatorError::ReconcileFailed(format!(
                "teardown of {} is {}",
                installation.name_any(),
                phase
            ))),
        }
    }

    fn retry_for(&self, phase: StatusPhase) -> RetryInstruction {
        match phase {
            StatusPhase::Completed => RetryInstruction::AwaitChange,
            StatusPhase::Failed => RetryInstruction::After(self.config.failed_requeue),
            StatusPhase::NotStarted | StatusPhase::InProgress => {
                RetryInstruction::After(self.config.in_progress_requeue)
            }
        }
    }
}

fn validate(installation: &Installation) -> std::result::Result<(), String> {
    installation.spec.validate().map_err(|errors| {
        errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| match &e.message {
                    Some(message) => format!("{}: {}", field, message),
                    None => format!("{}: {}", field, e.code),
                })
            })
            .collect::<Vec<_>>()
            .join("; ")
    })
}

/// First product error in stage order
fn first_error(status: &InstallationStatus) -> Option<String> {
    status
        .stages
        .values()
        .flat_map(|stage| stage.products.values())
        .find_map(|product| product.message.clone())
}

/// Refresh `last_updated` only when the status content changed, so that an
/// unchanged pass writes an identical status
fn stamp(previous: &InstallationStatus, status: &mut InstallationStatus) {
    status.last_updated = previous.last_updated.clone();
    if status != previous || status.last_updated.is_none() {
        status.last_updated = Some(Utc::now().to_rfc3339());
    }
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Control-plane operations used by the reconcilers
    pub resources: KubeResourceClient,
    pub controller: InstallationController,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-installation error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Counter for completed teardowns
    pub teardowns: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("integreatly_operator_reconciliations_total"),
            errors: metrics::counter!("integreatly_operator_reconciliation_errors_total"),
            teardowns: metrics::counter!("integreatly_operator_teardowns_total"),
            duration: metrics::histogram!("integreatly_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the Installation controller
pub async fn run_controller(client: Client, config: OperatorConfig) -> Result<()> {
    let installations: Api<Installation> = match &config.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let provider: Option<Arc<dyn CloudProvider>> = match &config.provider {
        Some(provider_config) => Some(ProviderFactory::create(provider_config).await?),
        None => None,
    };
    let marketplace = OlmMarketplace::default()
        .with_catalog(config.catalog_source.clone(), config.catalog_namespace.clone());
    let sequencer = StageSequencer::managed(Arc::new(marketplace), provider);

    info!(
        namespace = config.namespace.as_deref().unwrap_or("all"),
        stages = ?sequencer.stage_names(),
        "Starting Installation controller"
    );

    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        resources: KubeResourceClient::new(client),
        controller: InstallationController::new(sequencer, config),
        metrics: Some(ControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
    });

    Controller::new(installations, Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(installation, ctx), fields(name = %installation.name_any(), namespace = installation.namespace()))]
async fn reconcile(installation: Arc<Installation>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = installation
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    let key = format!("{}/{}", namespace, installation.name_any());
    let installations: Api<Installation> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&installations, FINALIZER_NAME, installation, |event| async {
        match event {
            FinalizerEvent::Apply(installation) => {
                apply_installation(installation, ctx.clone()).await
            }
            FinalizerEvent::Cleanup(installation) => {
                cleanup_installation(installation, ctx.clone()).await
            }
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    // Reset error backoff counter on success
    if result.is_ok() {
        ctx.error_counts.remove(&key);
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        match e {
            finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
            other => OperatorError::ReconcileFailed(other.to_string()),
        }
    })
}

/// Run one pass of the stage sequencer
async fn apply_installation(
    installation: Arc<Installation>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let retry = ctx
        .controller
        .reconcile(&installation, &ctx.resources)
        .await?;
    Ok(retry.into())
}

/// Tear down every product before the finalizer is released
async fn cleanup_installation(
    installation: Arc<Installation>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    info!(name = %installation.name_any(), "Tearing down Installation");

    ctx.controller
        .cleanup(&installation, &ctx.resources)
        .await?;

    if let Some(ref metrics) = ctx.metrics {
        metrics.teardowns.increment(1);
    }
    info!(name = %installation.name_any(), "Installation torn down");
    Ok(Action::await_change())
}

/// Error policy for the controller: exponential backoff per installation.
fn error_policy(
    installation: Arc<Installation>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = format!(
        "{}/{}",
        installation
            .namespace()
            .unwrap_or_else(|| "default".to_string()),
        installation.name_any()
    );
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = backoff_delay(error, retries, ctx.controller.config());

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

/// Stale writes retry almost immediately; everything else backs off
fn backoff_delay(error: &OperatorError, retries: u32, config: &OperatorConfig) -> Duration {
    match error {
        OperatorError::Conflict { .. } => error
            .requeue_delay()
            .unwrap_or(config.in_progress_requeue),
        _ => config.backoff(retries.saturating_sub(1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ProductName, StageName};
    use crate::stages::Stage;
    use crate::testing::{
        installation, workshop_installation, FakeClient, RecordingReconciler,
    };
    use parking_lot::Mutex;

    fn managed_controller() -> InstallationController {
        InstallationController::new(
            StageSequencer::managed(Arc::new(OlmMarketplace::default()), None),
            OperatorConfig::default(),
        )
    }

    /// Run a pass and re-read the installation as the next watch event would
    async fn pass(
        controller: &InstallationController,
        inst: &mut Installation,
        client: &FakeClient,
    ) -> RetryInstruction {
        let retry = controller.reconcile(inst, client).await.unwrap();
        inst.status = client.last_status();
        inst.metadata.resource_version = Some(client.resource_version());
        retry
    }

    #[tokio::test]
    async fn test_workshop_short_circuits() {
        let controller = managed_controller();
        let client = FakeClient::new();
        let inst = workshop_installation("workshop");

        let retry = controller.reconcile(&inst, &client).await.unwrap();
        assert_eq!(retry, RetryInstruction::AwaitChange);
        assert!(client.calls().is_empty());

        let status = client.last_status().unwrap();
        assert_eq!(status.phase, StatusPhase::Completed);
        assert!(status.stages.is_empty());
        assert!(status.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_invalid_spec_is_recorded() {
        let controller = managed_controller();
        let client = FakeClient::new();
        let mut inst = installation("bad", "intly-");
        inst.spec.namespace_prefix = "Not_Valid".to_string();

        let retry = controller.reconcile(&inst, &client).await.unwrap();
        assert_eq!(retry, RetryInstruction::After(Duration::from_secs(60)));
        assert!(client.calls().is_empty());

        let status = client.last_status().unwrap();
        assert_eq!(status.phase, StatusPhase::Failed);
        assert!(status.last_error.unwrap().contains("namespace prefix"));
    }

    #[tokio::test]
    async fn test_managed_installation_progresses_in_order() {
        let controller = managed_controller();
        let client = FakeClient::installing_subscriptions();
        let mut inst = installation("managed", "intly-");

        let retry = pass(&controller, &mut inst, &client).await;
        assert_eq!(retry, RetryInstruction::After(Duration::from_secs(10)));
        let status = inst.status.clone().unwrap();
        assert_eq!(status.stage_phase(StageName::Bootstrap), StatusPhase::Completed);
        assert_eq!(status.stage_phase(StageName::Monitoring), StatusPhase::InProgress);
        assert_eq!(status.stage_phase(StageName::Authentication), StatusPhase::NotStarted);
        assert!(client.has_namespace("intly-middleware-monitoring"));
        assert!(!client.has_namespace("intly-rhsso"));

        client.set_pods("intly-middleware-monitoring", 8, 5);
        pass(&controller, &mut inst, &client).await;
        assert!(!client.has_namespace("intly-rhsso"));
        assert_eq!(
            inst.status.as_ref().unwrap().stage_phase(StageName::Monitoring),
            StatusPhase::InProgress
        );

        // monitoring completes; authentication starts in the same pass
        client.set_pods("intly-middleware-monitoring", 8, 8);
        pass(&controller, &mut inst, &client).await;
        let status = inst.status.clone().unwrap();
        assert_eq!(status.stage_phase(StageName::Monitoring), StatusPhase::Completed);
        assert_eq!(status.stage_phase(StageName::Authentication), StatusPhase::InProgress);
        assert!(client.has_namespace("intly-rhsso"));
        assert!(!client.has_namespace("intly-amq-streams"));

        client.set_pods("intly-rhsso", 3, 3);
        pass(&controller, &mut inst, &client).await;
        assert!(client.has_namespace("intly-amq-streams"));
        assert!(client.has_namespace("intly-codeready-workspaces"));
        assert!(client.has_namespace("intly-fuse"));
        assert!(!client.has_namespace("intly-solution-explorer"));

        client.set_pods("intly-amq-streams", 8, 8);
        client.set_pods("intly-codeready-workspaces", 3, 3);
        client.set_pods("intly-fuse", 6, 6);
        pass(&controller, &mut inst, &client).await;
        assert!(client.has_namespace("intly-solution-explorer"));

        client.set_pods("intly-solution-explorer", 2, 2);
        let retry = pass(&controller, &mut inst, &client).await;
        assert_eq!(retry, RetryInstruction::AwaitChange);

        let status = inst.status.unwrap();
        assert_eq!(status.phase, StatusPhase::Completed);
        assert!(status.last_error.is_none());
        let amq = status
            .product(StageName::Products, ProductName::AmqStreams)
            .unwrap();
        assert_eq!(amq.namespace, "intly-amq-streams");
        assert_eq!(amq.version, "1.1.0");
        assert!(client
            .object("Kafka", "intly-amq-streams", "integreatly-cluster")
            .is_some());
    }

    #[tokio::test]
    async fn test_unchanged_pass_writes_identical_status() {
        let controller = managed_controller();
        let client = FakeClient::installing_subscriptions();
        let mut inst = installation("managed", "intly-");

        pass(&controller, &mut inst, &client).await;
        pass(&controller, &mut inst, &client).await;

        let writes = client.status_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], writes[1]);
    }

    #[tokio::test]
    async fn test_failed_pass_is_persisted() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sequencer = StageSequencer::new(vec![Stage::new(
            StageName::Products,
            vec![Arc::new(RecordingReconciler::new(
                ProductName::Fuse,
                log,
                vec![Err(OperatorError::InvalidConfig("no route".to_string()))],
            ))],
        )])
        .unwrap();
        let controller = InstallationController::new(sequencer, OperatorConfig::default());
        let client = FakeClient::new();
        let inst = installation("inst", "intly-");

        let retry = controller.reconcile(&inst, &client).await.unwrap();
        assert_eq!(retry, RetryInstruction::After(Duration::from_secs(60)));

        let status = client.last_status().unwrap();
        assert_eq!(status.phase, StatusPhase::Failed);
        assert!(status.last_error.unwrap().contains("no route"));
    }

    #[tokio::test]
    async fn test_transient_errors_keep_installation_in_progress() {
        let controller = managed_controller();
        let client = FakeClient::new();
        let inst = installation("inst", "intly-");

        // bootstrap completes without touching the cluster, monitoring hits the outage
        client.set_unavailable(true);
        let err = controller.reconcile(&inst, &client).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(client.status_writes().is_empty());

        client.set_unavailable(false);
        let retry = controller.reconcile(&inst, &client).await.unwrap();
        assert_eq!(retry, RetryInstruction::After(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let controller = managed_controller();
        let client = FakeClient::new();
        let stale = workshop_installation("workshop");
        let mut current = stale.clone();

        pass(&controller, &mut current, &client).await;
        assert_eq!(current.resource_version().as_deref(), Some("2"));

        // a copy read before the last write must not overwrite it
        let err = controller.reconcile(&stale, &client).await.unwrap_err();
        assert!(matches!(err, OperatorError::Conflict { .. }));
        assert_eq!(client.status_writes().len(), 1);
        assert_eq!(
            backoff_delay(&err, 1, controller.config()),
            Duration::from_secs(1)
        );

        // a concurrent writer makes the fresh copy stale as well
        client.touch();
        assert!(matches!(
            controller.reconcile(&current, &client).await,
            Err(OperatorError::Conflict { .. })
        ));
        assert_eq!(client.status_writes().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_tears_down_products() {
        let controller = managed_controller();
        let client = FakeClient::installing_subscriptions();
        let mut inst = installation("managed", "intly-");

        pass(&controller, &mut inst, &client).await;
        assert!(client.has_namespace("intly-middleware-monitoring"));

        // namespace deletion is still converging on the first attempt
        assert!(controller.cleanup(&inst, &client).await.is_err());
        assert!(client.namespaces().is_empty());
        assert!(controller.cleanup(&inst, &client).await.is_ok());
    }

    #[test]
    fn test_backoff_delay() {
        let config = OperatorConfig::default();
        let err = OperatorError::InvalidConfig("x".to_string());
        assert_eq!(backoff_delay(&err, 1, &config), Duration::from_secs(10));
        assert_eq!(backoff_delay(&err, 2, &config), Duration::from_secs(20));
        assert_eq!(backoff_delay(&err, 30, &config), Duration::from_secs(300));
    }

    #[test]
    fn test_retry_instruction_into_action() {
        assert_eq!(
            Action::from(RetryInstruction::AwaitChange),
            Action::await_change()
        );
        assert_eq!(
            Action::from(RetryInstruction::After(Duration::from_secs(5))),
            Action::requeue(Duration::from_secs(5))
        );
    }
}
