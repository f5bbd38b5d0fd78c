//! Product catalogue
//!
//! Descriptors and custom resource templates of every ladder product. The
//! expected pod counts are what each product runs once its custom resources
//! have been fully rolled out.

use super::ladder::ProductDescriptor;
use crate::alerts;
use crate::client::api_resource;
use crate::crd::{Installation, ProductName};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde_json::json;

/// Subscription channel every product package is published on
pub const DEFAULT_CHANNEL: &str = "integreatly";

/// Custom resource name shared by single-instance products
pub const CLUSTER_RESOURCE_NAME: &str = "integreatly-cluster";

const MONITORING_EXPECTED_PODS: usize = 8;

fn one(resource: ApiResource, name: &str, namespace: &str, spec: serde_json::Value) -> Vec<(ApiResource, DynamicObject)> {
    let object = DynamicObject::new(name, &resource)
        .within(namespace)
        .data(json!({ "spec": spec }));
    vec![(resource, object)]
}

pub fn middleware_monitoring() -> ProductDescriptor {
    ProductDescriptor {
        product: ProductName::MiddlewareMonitoring,
        default_namespace: "middleware-monitoring",
        package: "integreatly-monitoring",
        channel: DEFAULT_CHANNEL,
        version: "0.0.19",
        expected_pods: MONITORING_EXPECTED_PODS,
        custom_resources: application_monitoring,
        managed_objects: Some(monitoring_rules),
    }
}

fn application_monitoring(_: &Installation, namespace: &str) -> Vec<(ApiResource, DynamicObject)> {
    one(
        api_resource(
            "applicationmonitoring.integreatly.org",
            "v1alpha1",
            "ApplicationMonitoring",
            "applicationmonitorings",
        ),
        "middleware-monitoring",
        namespace,
        json!({
            "labelSelector": alerts::MONITORING_LABEL_VALUE,
            "additionalScrapeConfigSecretName": "integreatly-additional-scrape-configs",
            "prometheusRetention": "15d",
            "prometheusStorageRequest": "10Gi",
        }),
    )
}

/// Alerting rules live next to the installation, not in the product namespace
fn monitoring_rules(installation: &Installation, namespace: &str) -> Vec<(ApiResource, DynamicObject)> {
    let target = installation
        .namespace()
        .unwrap_or_else(|| namespace.to_string());
    alerts::middleware_rules(namespace, MONITORING_EXPECTED_PODS)
        .iter()
        .map(|doc| (alerts::PROMETHEUS_RULE.clone(), doc.to_object(&target)))
        .collect()
}

pub fn rhsso() -> ProductDescriptor {
    ProductDescriptor {
        product: ProductName::Rhsso,
        default_namespace: "rhsso",
        package: "integreatly-rhsso",
        channel: DEFAULT_CHANNEL,
        version: "7.3",
        expected_pods: 3,
        custom_resources: keycloak,
        managed_objects: None,
    }
}

fn keycloak(_: &Installation, namespace: &str) -> Vec<(ApiResource, DynamicObject)> {
    one(
        api_resource("aerogear.org", "v1alpha1", "Keycloak", "keycloaks"),
        "rhsso",
        namespace,
        json!({
            "adminCredentials": "credential-rhsso",
            "plugins": ["keycloak-metrics-spi"],
            "backups": [{
                "name": "rhsso-backup",
                "schedule": "0 * * * *",
                "awsCredentialsSecretName": "s3-credentials",
            }],
            "provision": true,
        }),
    )
}

pub fn amq_streams() -> ProductDescriptor {
    ProductDescriptor {
        product: ProductName::AmqStreams,
        default_namespace: "amq-streams",
        package: "amq-streams",
        channel: DEFAULT_CHANNEL,
        version: "1.1.0",
        expected_pods: 8,
        custom_resources: kafka,
        managed_objects: None,
    }
}

/// Three brokers, three zookeepers, the entity operator and the cluster
/// operator make up the expected eight pods
fn kafka(_: &Installation, namespace: &str) -> Vec<(ApiResource, DynamicObject)> {
    let storage = json!({
        "type": "persistent-claim",
        "size": "10Gi",
        "deleteClaim": false,
    });
    one(
        api_resource("kafka.strimzi.io", "v1alpha1", "Kafka", "kafkas"),
        CLUSTER_RESOURCE_NAME,
        namespace,
        json!({
            "kafka": {
                "version": "2.1.1",
                "replicas": 3,
                "listeners": { "plain": {}, "tls": {} },
                "config": {
                    "offsets.topic.replication.factor": "3",
                    "transaction.state.log.replication.factor": "3",
                    "transaction.state.log.min.isr": "2",
                    "log.message.format.version": "2.1",
                },
                "storage": storage,
            },
            "zookeeper": {
                "replicas": 3,
                "storage": storage,
            },
            "entityOperator": {
                "topicOperator": {},
                "userOperator": {},
            },
        }),
    )
}

pub fn codeready_workspaces() -> ProductDescriptor {
    ProductDescriptor {
        product: ProductName::CodereadyWorkspaces,
        default_namespace: "codeready-workspaces",
        package: "codeready-workspaces",
        channel: DEFAULT_CHANNEL,
        version: "1.2.0",
        expected_pods: 3,
        custom_resources: che_cluster,
        managed_objects: None,
    }
}

fn che_cluster(installation: &Installation, namespace: &str) -> Vec<(ApiResource, DynamicObject)> {
    one(
        api_resource("org.eclipse.che", "v1", "CheCluster", "checlusters"),
        CLUSTER_RESOURCE_NAME,
        namespace,
        json!({
            "server": {
                "cheFlavor": "codeready",
                "tlsSupport": true,
                "selfSignedCert": installation.spec.self_signed_certs,
            },
            "database": { "externalDb": false },
            "auth": {
                "openShiftoAuth": false,
                "externalKeycloak": true,
            },
            "storage": {
                "pvcStrategy": "per-workspace",
                "pvcClaimSize": "1Gi",
            },
        }),
    )
}

pub fn fuse() -> ProductDescriptor {
    ProductDescriptor {
        product: ProductName::Fuse,
        default_namespace: "fuse",
        package: "integreatly-syndesis",
        channel: DEFAULT_CHANNEL,
        version: "7.3",
        expected_pods: 6,
        custom_resources: syndesis,
        managed_objects: None,
    }
}

fn syndesis(installation: &Installation, namespace: &str) -> Vec<(ApiResource, DynamicObject)> {
    one(
        api_resource("syndesis.io", "v1alpha1", "Syndesis", "syndesises"),
        "integreatly",
        namespace,
        json!({
            "routeHostname": format!("{}.{}", namespace, installation.spec.routing_subdomain),
            "imageStreamNamespace": namespace,
            "integration": { "limit": 0 },
            "components": {
                "server": { "features": { "exposeVia3Scale": false } },
            },
        }),
    )
}

pub fn solution_explorer() -> ProductDescriptor {
    ProductDescriptor {
        product: ProductName::SolutionExplorer,
        default_namespace: "solution-explorer",
        package: "integreatly-solution-explorer",
        channel: DEFAULT_CHANNEL,
        version: "2.10.0",
        expected_pods: 2,
        custom_resources: web_app,
        managed_objects: None,
    }
}

fn web_app(installation: &Installation, namespace: &str) -> Vec<(ApiResource, DynamicObject)> {
    one(
        api_resource("integreatly.org", "v1alpha1", "WebApp", "webapps"),
        "solution-explorer",
        namespace,
        json!({
            "app_label": "tutorial-web-app",
            "template": {
                "path": "deploy/template/tutorial-web-app.yml",
                "parameters": {
                    "OPENSHIFT_HOST": installation.spec.master_url,
                    "OPENSHIFT_OAUTHCLIENT_ID": namespace,
                    "ROUTING_SUBDOMAIN": installation.spec.routing_subdomain,
                    "INSTALLED_SERVICES": "",
                },
            },
        }),
    )
}
