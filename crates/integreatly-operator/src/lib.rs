//! # Integreatly Kubernetes Operator
//!
//! Installs and continuously reconciles a multi-product middleware platform
//! described by a single `Installation` custom resource.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use integreatly_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, OperatorConfig::default()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! Every reconcile event runs one pass:
//!
//! 1. **Validate**: check the `Installation` spec
//! 2. **Advance**: walk the stages in order and reconcile the products of
//!    the first incomplete stage
//! 3. **Persist**: write the status back, guarded by the resource version
//! 4. **Requeue**: completed installations wait for a change, everything
//!    else is polled again
//!
//! Stages run in a fixed order:
//!
//! | Stage               | Products                                  |
//! |---------------------|-------------------------------------------|
//! | `bootstrap`         | cloud storage for the installation        |
//! | `monitoring`        | middleware monitoring and alerting rules  |
//! | `authentication`    | RH-SSO                                    |
//! | `products`          | AMQ Streams, CodeReady Workspaces, Fuse   |
//! | `solution-explorer` | Solution Explorer                         |
//!
//! Each product walks the same ladder: namespace, marketplace
//! subscription, custom resources, then waiting for its pods to become
//! ready. A `workshop` installation completes without running any stage.
//!
//! ## Modules
//!
//! - [`crd`] - `Installation` CRD types with validation
//! - [`controller`] - controller setup, finalizer and error policy
//! - [`stages`] - stage sequencing
//! - [`products`] - per-product reconcilers and the product catalogue
//! - [`marketplace`] - OLM subscriptions
//! - [`alerts`] - Prometheus alerting rules
//! - [`client`] - control-plane client trait and its kube implementation
//! - [`providers`] - cloud resource providers (AWS, in-memory)
//! - [`error`] - error types and classification
//!
//! ## Custom Resource
//!
//! ```yaml
//! apiVersion: integreatly.org/v1alpha1
//! kind: Installation
//! metadata:
//!   name: rhmi
//!   namespace: integreatly
//! spec:
//!   type: managed
//!   namespacePrefix: intly-
//!   routingSubdomain: apps.example.com
//!   masterUrl: console.apps.example.com
//!   selfSignedCerts: false
//! ```

pub mod alerts;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod marketplace;
pub mod products;
pub mod providers;
pub mod stages;

#[cfg(test)]
pub(crate) mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::client::{KubeResourceClient, ResourceClient};
    pub use crate::config::OperatorConfig;
    pub use crate::controller::{run_controller, InstallationController, RetryInstruction};
    pub use crate::crd::{
        Installation, InstallationSpec, InstallationStatus, InstallationType, StatusPhase,
    };
    pub use crate::error::{ErrorKind, OperatorError, Result};
    pub use crate::providers::{CloudProvider, ProviderConfig, ProviderFactory};
    pub use crate::stages::StageSequencer;
}
