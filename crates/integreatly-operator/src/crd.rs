//! Custom Resource Definitions for the Integreatly operator
//!
//! This module defines the `Installation` CRD: the desired multi-product
//! deployment together with its per-stage, per-product progress.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of the Installation CRD
pub const API_GROUP: &str = "integreatly.org";

/// Regex for a DNS-1123 label prefix (may be empty, may end with `-`)
static NAMESPACE_PREFIX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z0-9][-a-z0-9]*)?$").unwrap());

/// Validate a namespace prefix
fn validate_namespace_prefix(value: &str) -> Result<(), ValidationError> {
    if value.len() > 40 {
        return Err(ValidationError::new("prefix_too_long")
            .with_message("namespace prefix exceeds 40 characters".into()));
    }
    if !NAMESPACE_PREFIX_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_prefix").with_message(
            format!("'{}' is not a valid namespace prefix (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Installation custom resource definition
///
/// Describes a desired multi-product deployment. The operator drives every
/// product of every stage to Completed and records progress in the status.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "integreatly.org",
    version = "v1alpha1",
    kind = "Installation",
    plural = "installations",
    shortname = "inst",
    namespaced,
    status = "InstallationStatus",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstallationSpec {
    /// Deployment type
    #[serde(rename = "type")]
    pub installation_type: InstallationType,

    /// Prefix prepended to every product namespace
    #[serde(default)]
    #[validate(custom(function = "validate_namespace_prefix"))]
    pub namespace_prefix: String,

    /// Wildcard routing subdomain of the cluster
    #[serde(default)]
    #[validate(length(max = 253, message = "routingSubdomain exceeds 253 characters"))]
    pub routing_subdomain: String,

    /// URL of the cluster master / console
    #[serde(default)]
    #[validate(length(max = 253, message = "masterUrl exceeds 253 characters"))]
    pub master_url: String,

    /// Whether product routes use self-signed certificates
    #[serde(default)]
    pub self_signed_certs: bool,
}

/// Deployment type of an installation
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstallationType {
    /// Full managed platform, every stage
    #[default]
    Managed,
    /// Lightweight workshop install; completes without running any stage
    Workshop,
}

impl InstallationType {
    /// Whether this type skips all stage logic
    pub fn is_lightweight(&self) -> bool {
        matches!(self, InstallationType::Workshop)
    }
}

/// Phase of a product, a stage, or the whole installation
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "camelCase")]
pub enum StatusPhase {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl StatusPhase {
    pub fn is_completed(&self) -> bool {
        matches!(self, StatusPhase::Completed)
    }
}

impl fmt::Display for StatusPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusPhase::NotStarted => "notStarted",
            StatusPhase::InProgress => "inProgress",
            StatusPhase::Completed => "completed",
            StatusPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Named installation stage, in execution order
#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    Bootstrap,
    Monitoring,
    Authentication,
    Products,
    SolutionExplorer,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Bootstrap => "bootstrap",
            StageName::Monitoring => "monitoring",
            StageName::Authentication => "authentication",
            StageName::Products => "products",
            StageName::SolutionExplorer => "solution-explorer",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Installable product
#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum ProductName {
    Bootstrap,
    MiddlewareMonitoring,
    Rhsso,
    AmqStreams,
    CodereadyWorkspaces,
    Fuse,
    SolutionExplorer,
}

impl ProductName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductName::Bootstrap => "bootstrap",
            ProductName::MiddlewareMonitoring => "middleware-monitoring",
            ProductName::Rhsso => "rhsso",
            ProductName::AmqStreams => "amq-streams",
            ProductName::CodereadyWorkspaces => "codeready-workspaces",
            ProductName::Fuse => "fuse",
            ProductName::SolutionExplorer => "solution-explorer",
        }
    }
}

impl fmt::Display for ProductName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an Installation resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStatus {
    /// Aggregate phase of the whole installation
    #[serde(default)]
    pub phase: StatusPhase,

    /// Per-stage progress
    #[serde(default)]
    pub stages: BTreeMap<StageName, InstallationStageStatus>,

    /// Last error that blocked progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Last time the status was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl InstallationStatus {
    /// Phase recorded for a stage, `NotStarted` if the stage never ran
    pub fn stage_phase(&self, stage: StageName) -> StatusPhase {
        self.stages
            .get(&stage)
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    /// Status recorded for a product, if any
    pub fn product(&self, stage: StageName, product: ProductName) -> Option<&ProductStatus> {
        self.stages.get(&stage).and_then(|s| s.products.get(&product))
    }
}

/// Progress of one stage
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStageStatus {
    /// Aggregate phase of the stage's products
    #[serde(default)]
    pub phase: StatusPhase,

    /// Per-product progress
    #[serde(default)]
    pub products: BTreeMap<ProductName, ProductStatus>,
}

/// Progress and configuration of one product
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductStatus {
    /// Namespace the product is installed into
    #[serde(default)]
    pub namespace: String,

    /// Product version
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub phase: StatusPhase,

    /// Last error, kept for operator inspection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn spec() -> InstallationSpec {
        InstallationSpec {
            installation_type: InstallationType::Managed,
            namespace_prefix: "intly-".to_string(),
            routing_subdomain: "apps.example.com".to_string(),
            master_url: "console.apps.example.com".to_string(),
            self_signed_certs: true,
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(spec().validate().is_ok());

        let mut empty_prefix = spec();
        empty_prefix.namespace_prefix = String::new();
        assert!(empty_prefix.validate().is_ok());
    }

    #[test]
    fn test_invalid_namespace_prefix() {
        let mut upper = spec();
        upper.namespace_prefix = "Intly-".to_string();
        assert!(upper.validate().is_err());

        let mut long = spec();
        long.namespace_prefix = "a".repeat(41);
        assert!(long.validate().is_err());
    }

    #[test]
    fn test_spec_wire_format() {
        let json = serde_json::json!({
            "type": "workshop",
            "namespacePrefix": "intly-",
            "routingSubdomain": "apps.example.com",
            "masterUrl": "console.example.com",
            "selfSignedCerts": true
        });
        let spec: InstallationSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.installation_type, InstallationType::Workshop);
        assert!(spec.installation_type.is_lightweight());
        assert!(!InstallationType::Managed.is_lightweight());
    }

    #[test]
    fn test_status_wire_format() {
        let mut status = InstallationStatus::default();
        let mut stage = InstallationStageStatus {
            phase: StatusPhase::InProgress,
            ..Default::default()
        };
        stage.products.insert(
            ProductName::AmqStreams,
            ProductStatus {
                namespace: "intly-amq-streams".to_string(),
                version: "1.1.0".to_string(),
                phase: StatusPhase::InProgress,
                message: None,
            },
        );
        status.stages.insert(StageName::SolutionExplorer, stage);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["stages"]["solution-explorer"]["phase"], "inProgress");
        assert_eq!(
            json["stages"]["solution-explorer"]["products"]["amq-streams"]["namespace"],
            "intly-amq-streams"
        );

        let back: InstallationStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_stage_phase_defaults_to_not_started() {
        let status = InstallationStatus::default();
        assert_eq!(status.stage_phase(StageName::Bootstrap), StatusPhase::NotStarted);
        assert!(status.product(StageName::Bootstrap, ProductName::Bootstrap).is_none());
    }

    #[test]
    fn test_stage_order() {
        assert!(StageName::Bootstrap < StageName::Monitoring);
        assert!(StageName::Products < StageName::SolutionExplorer);
    }

    #[test]
    fn test_crd_generation() {
        let crd = Installation::crd();
        assert_eq!(crd.spec.group, API_GROUP);
        assert_eq!(crd.spec.names.kind, "Installation");
    }
}
