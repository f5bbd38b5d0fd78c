//! Stage sequencing
//!
//! An installation runs as a fixed sequence of stages. Products within a
//! stage are reconciled concurrently; the stage gates the next one, so no
//! product of stage N+1 is invoked before every product of stage N reports
//! `Completed`.

use crate::client::ResourceClient;
use crate::crd::{Installation, InstallationStatus, ProductStatus, StageName, StatusPhase};
use crate::error::{OperatorError, Result};
use crate::marketplace::Marketplace;
use crate::products::{catalog, outcome, BootstrapReconciler, LadderReconciler, ProductReconciler};
use crate::providers::CloudProvider;
use futures::future::join_all;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A named group of products
pub struct Stage {
    pub name: StageName,
    pub members: Vec<Arc<dyn ProductReconciler>>,
}

impl Stage {
    pub fn new(name: StageName, members: Vec<Arc<dyn ProductReconciler>>) -> Self {
        Self { name, members }
    }
}

/// Aggregate member phases: Failed if any failed, Completed if all
/// completed, otherwise InProgress
pub fn aggregate<I>(phases: I) -> StatusPhase
where
    I: IntoIterator<Item = StatusPhase>,
{
    let mut all_completed = true;
    for phase in phases {
        match phase {
            StatusPhase::Failed => return StatusPhase::Failed,
            StatusPhase::Completed => {}
            _ => all_completed = false,
        }
    }
    if all_completed {
        StatusPhase::Completed
    } else {
        StatusPhase::InProgress
    }
}

/// Drives the stages of an installation in order
pub struct StageSequencer {
    stages: Vec<Stage>,
}

impl StageSequencer {
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        if stages.windows(2).any(|pair| pair[0].name >= pair[1].name) {
            return Err(OperatorError::InvalidConfig(
                "stages must be unique and in execution order".to_string(),
            ));
        }
        Ok(Self { stages })
    }

    /// The standard managed installation: bootstrap, monitoring,
    /// authentication, products, solution explorer
    pub fn managed(
        marketplace: Arc<dyn Marketplace>,
        provider: Option<Arc<dyn CloudProvider>>,
    ) -> Self {
        let ladder = |descriptor| -> Arc<dyn ProductReconciler> {
            Arc::new(LadderReconciler::new(descriptor, marketplace.clone()))
        };
        Self {
            stages: vec![
                Stage::new(
                    StageName::Bootstrap,
                    vec![Arc::new(BootstrapReconciler::new(provider))],
                ),
                Stage::new(
                    StageName::Monitoring,
                    vec![ladder(catalog::middleware_monitoring())],
                ),
                Stage::new(StageName::Authentication, vec![ladder(catalog::rhsso())]),
                Stage::new(
                    StageName::Products,
                    vec![
                        ladder(catalog::amq_streams()),
                        ladder(catalog::codeready_workspaces()),
                        ladder(catalog::fuse()),
                    ],
                ),
                Stage::new(
                    StageName::SolutionExplorer,
                    vec![ladder(catalog::solution_explorer())],
                ),
            ],
        }
    }

    pub fn stage_names(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name).collect()
    }

    /// Advance the installation as far as currently possible.
    ///
    /// Completed stages are skipped. The first incomplete stage has its
    /// not-yet-completed members reconciled; if that completes the stage,
    /// the walk continues with the next one, otherwise it stops. The
    /// returned phase is the installation's aggregate phase.
    pub async fn advance(
        &self,
        installation: &Installation,
        client: &dyn ResourceClient,
        status: &mut InstallationStatus,
    ) -> StatusPhase {
        for stage in &self.stages {
            if status.stage_phase(stage.name).is_completed() {
                continue;
            }

            let phase = self.run_stage(stage, installation, client, status).await;
            if !phase.is_completed() {
                debug!(
                    installation = %installation.name_any(),
                    stage = %stage.name,
                    phase = %phase,
                    "Stage not complete"
                );
                return phase;
            }
            info!(installation = %installation.name_any(), stage = %stage.name, "Stage completed");
        }
        StatusPhase::Completed
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        installation: &Installation,
        client: &dyn ResourceClient,
        status: &mut InstallationStatus,
    ) -> StatusPhase {
        let stage_status = status.stages.entry(stage.name).or_default();

        let pending: Vec<_> = stage
            .members
            .iter()
            .filter(|m| {
                !stage_status
                    .products
                    .get(&m.product())
                    .is_some_and(|p| p.phase.is_completed())
            })
            .collect();

        let results = join_all(
            pending
                .iter()
                .map(|member| member.reconcile(installation, client)),
        )
        .await;

        for (member, result) in pending.iter().zip(results) {
            let (phase, message) = outcome(result);
            if let Some(message) = &message {
                warn!(
                    installation = %installation.name_any(),
                    product = %member.product(),
                    phase = %phase,
                    error = %message,
                    "Product reconcile failed"
                );
            }
            stage_status.products.insert(
                member.product(),
                ProductStatus {
                    namespace: member.namespace(installation),
                    version: member.version().to_string(),
                    phase,
                    message,
                },
            );
        }

        stage_status.phase = aggregate(stage.members.iter().map(|m| {
            stage_status
                .products
                .get(&m.product())
                .map(|p| p.phase)
                .unwrap_or_default()
        }));
        stage_status.phase
    }

    /// Tear down every product, last stage first.
    ///
    /// A stage is only torn down once every later stage has finished
    /// tearing down.
    pub async fn teardown(
        &self,
        installation: &Installation,
        client: &dyn ResourceClient,
    ) -> Result<StatusPhase> {
        for stage in self.stages.iter().rev() {
            let results = join_all(
                stage
                    .members
                    .iter()
                    .map(|member| member.teardown(installation, client)),
            )
            .await;

            let mut phases = Vec::with_capacity(results.len());
            for result in results {
                phases.push(result?);
            }
            let phase = aggregate(phases);
            if !phase.is_completed() {
                debug!(installation = %installation.name_any(), stage = %stage.name, "Stage teardown in progress");
                return Ok(phase);
            }
        }
        Ok(StatusPhase::Completed)
    }
}
