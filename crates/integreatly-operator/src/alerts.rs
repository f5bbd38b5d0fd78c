//! Alerting rules for middleware monitoring
//!
//! Rule documents are `PrometheusRule` objects in the installation's
//! namespace, created or updated by name on every monitoring reconcile. The
//! expressions select namespaces labelled `monitoring-key=middleware`, which
//! every product namespace carries.

use crate::client::api_resource;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// API resource of the prometheus-operator rule documents
pub static PROMETHEUS_RULE: LazyLock<ApiResource> = LazyLock::new(|| {
    api_resource("monitoring.coreos.com", "v1", "PrometheusRule", "prometheusrules")
});

/// Label key the monitoring stack selects rule documents by
pub const MONITORING_LABEL_KEY: &str = "monitoring-key";

/// Label value the monitoring stack selects rule documents by
pub const MONITORING_LABEL_VALUE: &str = "middleware";

const RULE_GROUP: &str = "general.rules";

const SOP_TROUBLESHOOTING: &str =
    "https://github.com/RHCloudServices/integreatly-help/blob/master/sops/alerts_and_troubleshooting.md";
const SOP_SCHEDULABLE: &str =
    "https://github.com/RHCloudServices/integreatly-help/blob/master/sops/alerts/Cluster_Schedulable_Resources_Low.asciidoc";
const SOP_PVC: &str =
    "https://github.com/RHCloudServices/integreatly-help/blob/master/sops/2.x/alerts/pvc_storage.asciidoc";

/// Suffix joining a pod metric to middleware-labelled namespaces
const MIDDLEWARE_NAMESPACES: &str =
    "on (namespace, namespace) group_left(label_monitoring_key) kube_namespace_labels{label_monitoring_key='middleware'}";

/// A single alerting rule
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AlertRule {
    pub alert: String,
    pub expr: String,
    #[serde(rename = "for", skip_serializing_if = "Option::is_none")]
    pub for_duration: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl AlertRule {
    fn new(alert: &str, severity: &str, expr: impl Into<String>) -> Self {
        Self {
            alert: alert.to_string(),
            expr: expr.into(),
            for_duration: None,
            labels: BTreeMap::from([("severity".to_string(), severity.to_string())]),
            annotations: BTreeMap::new(),
        }
    }

    fn pending_for(mut self, duration: &str) -> Self {
        self.for_duration = Some(duration.to_string());
        self
    }

    fn describe(mut self, sop_url: &str, message: impl Into<String>) -> Self {
        self.annotations
            .insert("sop_url".to_string(), sop_url.to_string());
        self.annotations.insert("message".to_string(), message.into());
        self
    }

    pub fn severity(&self) -> Option<&str> {
        self.labels.get("severity").map(String::as_str)
    }
}

/// A named group of rules
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RuleGroup {
    pub name: String,
    pub rules: Vec<AlertRule>,
}

/// A named rule document
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDocument {
    pub name: &'static str,
    pub groups: Vec<RuleGroup>,
}

impl RuleDocument {
    fn single_group(name: &'static str, rules: Vec<AlertRule>) -> Self {
        Self {
            name,
            groups: vec![RuleGroup {
                name: RULE_GROUP.to_string(),
                rules,
            }],
        }
    }

    /// Render as a `PrometheusRule` object in `namespace`
    pub fn to_object(&self, namespace: &str) -> DynamicObject {
        let mut object = DynamicObject::new(self.name, &PROMETHEUS_RULE)
            .within(namespace)
            .data(serde_json::json!({
                "spec": { "groups": self.groups }
            }));
        object.metadata.labels = Some(BTreeMap::from([
            ("integreatly".to_string(), "yes".to_string()),
            (
                MONITORING_LABEL_KEY.to_string(),
                MONITORING_LABEL_VALUE.to_string(),
            ),
        ]));
        object
    }
}

fn job_expr(body: &str) -> String {
    body.replace(
        "JOBS",
        "kube_job_labels{label_monitoring_key='middleware'}",
    )
}

/// Alerts on middleware backup jobs
pub fn backup_alerts() -> RuleDocument {
    let running = |threshold: u32| {
        job_expr(&format!(
            "time() - (max(kube_job_status_active * ON(job_name) GROUP_RIGHT() JOBS) BY (job_name) \
             * ON(job_name) GROUP_RIGHT() max(kube_job_status_start_time * ON(job_name) GROUP_RIGHT() JOBS) \
             BY (job_name, namespace, label_cronjob_name) > 0) > {threshold}"
        ))
    };

    RuleDocument::single_group(
        "backup-monitoring-alerts",
        vec![
            AlertRule::new("JobRunningTimeExceeded", "warning", running(300)).describe(
                SOP_TROUBLESHOOTING,
                "Job {{ $labels.namespace }} / {{ $labels.job }} has been running for longer than 300 seconds",
            ),
            AlertRule::new("JobRunningTimeExceeded", "critical", running(600))
                .pending_for("5m")
                .describe(
                    SOP_TROUBLESHOOTING,
                    "Job {{ $labels.namespace }} / {{ $labels.job }} has been running for longer than 600 seconds",
                ),
            AlertRule::new(
                "CronJobSuspended",
                "critical",
                "kube_cronjob_labels{ label_monitoring_key='middleware' } * ON (cronjob) GROUP_RIGHT() kube_cronjob_spec_suspend > 0",
            )
            .pending_for("60s")
            .describe(
                SOP_TROUBLESHOOTING,
                "CronJob {{ $labels.namespace }} / {{ $labels.cronjob }} is suspended",
            ),
            AlertRule::new(
                "CronJobNotRunInThreshold",
                "critical",
                job_expr(
                    "(time() - (max( kube_job_status_start_time * ON(job_name) GROUP_RIGHT() JOBS ) \
                     BY (job_name, label_cronjob_name) == ON(label_cronjob_name) GROUP_LEFT() \
                     max( kube_job_status_start_time * ON(job_name) GROUP_RIGHT() JOBS ) \
                     BY (label_cronjob_name))) > 60*60*25",
                ),
            )
            .describe(
                SOP_TROUBLESHOOTING,
                "CronJob {{ $labels.namespace }} / {{ $labels.label_cronjob_name }} has not started a Job in 25 hours",
            ),
            AlertRule::new(
                "CronJobsFailed",
                "critical",
                job_expr(
                    "clamp_max(max(kube_job_status_start_time * ON(job_name) GROUP_RIGHT() JOBS ) \
                     BY (job_name, label_cronjob_name, namespace) == ON(label_cronjob_name) GROUP_LEFT() \
                     max(kube_job_status_start_time * ON(job_name) GROUP_RIGHT() JOBS) \
                     BY (label_cronjob_name), 1) * ON(job_name) GROUP_LEFT() kube_job_status_failed > 0",
                ),
            )
            .pending_for("5m")
            .describe(
                SOP_TROUBLESHOOTING,
                "Job {{ $labels.namespace }} / {{ $labels.job }} has failed",
            ),
        ],
    )
}

/// Alerts derived from kube-state-metrics for middleware namespaces
pub fn kube_state_metrics_alerts() -> RuleDocument {
    let waiting = |reason: &str| {
        format!(
            "(kube_pod_container_status_waiting_reason{{reason='{reason}'}} * {MIDDLEWARE_NAMESPACES}) > 0"
        )
    };
    let schedulable = |request: &str, allocatable: &str| {
        format!(
            "((sum(sum by(node) (sum by(pod, node) ({request} * on(node) group_left() \
             (sum by(node) (kube_node_labels{{label_node_role_kubernetes_io_compute='true'}} == 1))) \
             * on(pod) group_left() (sum by(pod) (kube_pod_status_phase{{phase='Running'}}) == 1)))) \
             / ((sum((kube_node_labels{{label_node_role_kubernetes_io_compute='true'}} == 1) \
             * on(node) group_left() (sum by(node) ({allocatable})))))) * 100 > 85"
        )
    };
    let fill_prediction = |window: &str, horizon: &str| {
        format!(
            "(predict_linear(kubelet_volume_stats_available_bytes{{job='kubelet'}}[{window}], {horizon}) <= 0 \
             AND kubelet_volume_stats_available_bytes{{job='kubelet'}} / kubelet_volume_stats_capacity_bytes{{job='kubelet'}} < 0.25) \
             * on(namespace) group_left(label_monitoring_key) kube_namespace_labels{{label_monitoring_key='middleware'}}"
        )
    };

    RuleDocument::single_group(
        "ksm-alerts",
        vec![
            AlertRule::new(
                "KubePodCrashLooping",
                "critical",
                format!(
                    "rate(kube_pod_container_status_restarts_total{{job='kube-state-metrics'}}[15m]) * {MIDDLEWARE_NAMESPACES} * 60 * 5 > 0"
                ),
            )
            .pending_for("15m")
            .describe(
                SOP_TROUBLESHOOTING,
                "Pod {{ $labels.namespace }} / {{ $labels.pod }} ({{ $labels.container }}) is restarting {{ $value }} times every 5 minutes; for the last 15 minutes.",
            ),
            AlertRule::new(
                "KubePodNotReady",
                "critical",
                format!(
                    "sum by(pod, namespace) (kube_pod_status_phase{{phase=~'Pending|Unknown'}} * {MIDDLEWARE_NAMESPACES}) > 0"
                ),
            )
            .pending_for("15m")
            .describe(
                SOP_TROUBLESHOOTING,
                "Pod {{ $labels.namespace }} / {{ $labels.pod }} has been in a non-ready state for longer than 15 minutes.",
            ),
            AlertRule::new("KubePodImagePullBackOff", "critical", waiting("ImagePullBackOff"))
                .pending_for("5m")
                .describe(
                    SOP_TROUBLESHOOTING,
                    "Pod {{ $labels.namespace }} / {{ $labels.pod }} has been unable to pull its image for longer than 5 minutes.",
                ),
            AlertRule::new("KubePodBadConfig", "critical", waiting("CreateContainerConfigError"))
                .pending_for("5m")
                .describe(
                    SOP_TROUBLESHOOTING,
                    "Pod {{ $labels.namespace }} / {{ $labels.pod }} has been unable to start due to a bad configuration for longer than 5 minutes",
                ),
            AlertRule::new("KubePodStuckCreating", "critical", waiting("ContainerCreating"))
                .pending_for("15m")
                .describe(
                    SOP_TROUBLESHOOTING,
                    "Pod {{ $labels.namespace }} / {{ $labels.pod }} has been trying to start for longer than 15 minutes - this could indicate a configuration error.",
                ),
            AlertRule::new(
                "ClusterSchedulableMemoryLow",
                "warning",
                schedulable(
                    "kube_pod_container_resource_requests_memory_bytes",
                    "kube_node_status_allocatable_memory_bytes",
                ),
            )
            .pending_for("15m")
            .describe(
                SOP_SCHEDULABLE,
                "The cluster has {{ $value }} percent of memory requested and unavailable for scheduling for longer than 15 minutes",
            ),
            AlertRule::new(
                "ClusterSchedulableCPULow",
                "warning",
                schedulable(
                    "kube_pod_container_resource_requests_cpu_cores",
                    "kube_node_status_allocatable_cpu_cores",
                ),
            )
            .pending_for("15m")
            .describe(
                SOP_SCHEDULABLE,
                "The cluster has {{ $value }} percent of CPU cores requested and unavailable for scheduling for longer than 15 minutes",
            ),
            AlertRule::new(
                "PVCStorageAvailable",
                "warning",
                "((sum by(persistentvolumeclaim, namespace) (kubelet_volume_stats_used_bytes) \
                 * on ( namespace) group_left(label_monitoring_key) kube_namespace_labels{label_monitoring_key='middleware'}) \
                 / (sum by(persistentvolumeclaim, namespace) (kube_persistentvolumeclaim_resource_requests_storage_bytes) \
                 * on ( namespace) group_left(label_monitoring_key) kube_namespace_labels{label_monitoring_key='middleware'})) * 100 > 85",
            )
            .pending_for("15m")
            .describe(
                SOP_SCHEDULABLE,
                "The {{ $labels.persistentvolumeclaim }} PVC has been {{ $value }} percent full for longer than 15 minutes",
            ),
            AlertRule::new(
                "PVCStorageMetricsAvailable",
                "warning",
                "absent(kubelet_volume_stats_available_bytes) == 1 or absent(kubelet_volume_stats_capacity_bytes) == 1 \
                 or absent(kubelet_volume_stats_used_bytes) == 1 \
                 or absent(kube_persistentvolumeclaim_resource_requests_storage_bytes) == 1",
            )
            .pending_for("15m")
            .describe(SOP_SCHEDULABLE, "PVC storage metrics are not available"),
            AlertRule::new(
                "PVCStorageWillFillIn4Days",
                "warning",
                fill_prediction("6h", "4 * 24 * 3600"),
            )
            .pending_for("15m")
            .describe(
                SOP_PVC,
                "The {{ $labels.persistentvolumeclaim }} PVC will run out of disk space in the next 4 days",
            ),
            AlertRule::new(
                "PVCStorageWillFillIn4Hours",
                "critical",
                fill_prediction("1h", "4 * 3600"),
            )
            .pending_for("15m")
            .describe(
                SOP_PVC,
                "The {{ $labels.persistentvolumeclaim }} PVC will run out of disk space in the next 4 hours",
            ),
            AlertRule::new(
                "PersistentVolumeErrors",
                "critical",
                "(sum by(persistentvolumeclaim, namespace, phase) \
                 (kube_persistentvolumeclaim_status_phase{phase=~'Failed|Pending|Lost'}) \
                 * on ( namespace) group_left(label_monitoring_key) kube_namespace_labels{label_monitoring_key='middleware'}) > 0",
            )
            .pending_for("15m")
            .describe(
                SOP_PVC,
                "The PVC {{ $labels.persistentvolumeclaim }} is in status {{ $labels.phase }} in namespace {{ $labels.namespace }}",
            ),
        ],
    )
}

/// Alert when the monitoring namespace does not run the expected pod count
pub fn monitoring_pod_count_alerts(monitoring_namespace: &str, expected_pods: usize) -> RuleDocument {
    let ready = format!("kube_pod_status_ready{{condition='true',namespace='{monitoring_namespace}'}}");
    RuleDocument::single_group(
        "ksm-monitoring-alerts",
        vec![AlertRule::new(
            "MiddlewareMonitoringPodCount",
            "critical",
            format!("(1 - absent({ready})) or sum({ready}) != {expected_pods}"),
        )
        .pending_for("5m")
        .describe(
            SOP_TROUBLESHOOTING,
            format!(
                "Pod count for namespace {{{{ $labels.namespace }}}} is {{{{ $value }}}}. Expected exactly {expected_pods} pods"
            ),
        )],
    )
}

/// Every rule document the monitoring product maintains
pub fn middleware_rules(monitoring_namespace: &str, expected_pods: usize) -> Vec<RuleDocument> {
    vec![
        backup_alerts(),
        kube_state_metrics_alerts(),
        monitoring_pod_count_alerts(monitoring_namespace, expected_pods),
    ]
}
