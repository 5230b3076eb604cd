use std::collections::HashMap;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::{metrics::Resource, object_reference::ObjectReference, Labels, Metadata, Object};

/// Annotation switching the resource utilization denominator
/// from container requests to container limits.
pub const COMPUTE_BY_LIMITS_KEY: &str = "compute-by-limits";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GeneralPodAutoscaler {
    pub metadata: Metadata,
    pub spec: GpaSpec,
    #[serde(default)]
    pub status: GpaStatus,
}

impl Object for GeneralPodAutoscaler {
    fn kind(&self) -> &'static str {
        "GeneralPodAutoscaler"
    }

    fn resource() -> &'static str {
        "generalpodautoscalers"
    }

    fn name(&self) -> &String {
        &self.metadata.name
    }

    fn namespace(&self) -> &String {
        &self.metadata.namespace
    }
}

impl GeneralPodAutoscaler {
    /// Whether utilization should be computed against limits instead of requests.
    pub fn compute_by_limits(&self) -> bool {
        self.metadata
            .annotations
            .get(COMPUTE_BY_LIMITS_KEY)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpaSpec {
    /// Points to the target resource to scale,
    /// and is used to the pods for which metrics should be collected,
    /// as well as to actually change the replica count.
    pub scale_target_ref: ObjectReference,
    /// The lower limit for the number of replicas
    /// to which the autoscaler can scale down.
    /// It defaults to 1 pod.
    #[serde(default)]
    pub min_replicas: Option<u32>,
    /// The upper limit for the number of replicas
    /// to which the autoscaler can scale up.
    /// It cannot be less that minReplicas.
    pub max_replicas: u32,
    /// Scale based on a set of metric specifications,
    /// taking the maximum replica count across all of them.
    #[serde(default)]
    pub metric: Option<MetricMode>,
    /// Scale based on metric specifications that only apply
    /// within cron schedule windows.
    #[serde(default)]
    pub cron_metric: Option<CronMetricMode>,
    /// Scale to a fixed size within simple time ranges.
    #[serde(default)]
    pub time: Option<TimeMode>,
    /// Ask an external webhook for the desired size.
    #[serde(default)]
    pub webhook: Option<WebhookMode>,
    /// Scale on external event triggers, processed outside this controller.
    #[serde(default)]
    pub event: Option<EventMode>,
    /// Configures the scaling behavior of the target
    /// in both Up and Down directions
    /// (scaleUp and scaleDown fields respectively).
    /// If not set, replica counts are normalized with the
    /// controller-wide downscale stabilisation window.
    #[serde(default)]
    pub behavior: Option<GpaBehavior>,
}

impl GpaSpec {
    /// Whether no driving mode is configured at all.
    pub fn modes_empty(&self) -> bool {
        self.metric.is_none()
            && self.cron_metric.is_none()
            && self.time.is_none()
            && self.webhook.is_none()
            && self.event.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MetricMode {
    pub metrics: Vec<MetricSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronMetricMode {
    pub cron_metrics: Vec<CronMetricSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeMode {
    pub time_ranges: Vec<TimeRange>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMode {
    /// URL of the webhook. Exactly one of `url` and `service` must be set.
    #[serde(default)]
    pub url: Option<String>,
    /// In-cluster service backing the webhook.
    #[serde(default)]
    pub service: Option<ServiceRef>,
    /// Opaque parameters forwarded with every request.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EventMode {
    pub triggers: Vec<ScaleTrigger>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTrigger {
    /// Type of the event source, e.g. a message queue.
    #[serde(rename = "type")]
    pub trigger_type: String,
    /// Source specific connection and threshold settings.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub name: String,
}

/// A fixed replica count applied while the cron schedule fires.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    /// Standard 5-field cron expression, optionally suffixed with a year.
    pub schedule: String,
    pub desired_replicas: u32,
}

/// A metric specification that only applies within a cron window.
/// The literal schedule "default" marks the fallback entry used
/// when no other schedule is active.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronMetricSpec {
    /// "default" or a cron expression of 5 fields,
    /// optionally followed by a 4-digit year.
    pub schedule: String,
    #[serde(default)]
    pub min_replicas: Option<u32>,
    pub max_replicas: u32,
    /// Ranking between schedules active at the same instant, higher wins.
    #[serde(default)]
    pub priority: i32,
    /// Metric evaluated while this schedule is active.
    /// The "default" entries may omit it.
    #[serde(default)]
    pub metric: Option<MetricSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum MetricSpec {
    Resource(ResourceMetricSource),
    ContainerResource(ContainerResourceMetricSource),
    Pods(PodsMetricSource),
    Object(ObjectMetricSource),
    External(ExternalMetricSource),
}

/// ResourceMetricSource indicates how to scale on a resource metric,
/// as specified in requests and limits,
/// describing each pod in the current scale target (e.g. CPU or memory).
/// The values will be averaged together before being compared to the target.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceMetricSource {
    /// Name of the resource.
    pub name: Resource,
    /// Target value for the given metric
    pub target: MetricTarget,
}

/// Like [`ResourceMetricSource`], but scoped to a single named container
/// across all pods of the target.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerResourceMetricSource {
    pub name: Resource,
    pub container: String,
    pub target: MetricTarget,
}

/// PodsMetricSource indicates how to scale on a metric describing each pod
/// in the current scale target. The values will be averaged together
/// before being compared to the target value.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodsMetricSource {
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

/// ObjectMetricSource indicates how to scale on a metric describing a
/// single object (for example, an Ingress object).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetricSource {
    pub described_object: ObjectReference,
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

/// ExternalMetricSource indicates how to scale on a metric not associated
/// with any object in the cluster.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExternalMetricSource {
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MetricIdentifier {
    /// Name of the given metric.
    pub name: String,
    /// Restricts the set of time series the metric applies to.
    #[serde(default)]
    pub selector: Option<Labels>,
}

/// MetricTarget defines the target value, average value,
/// or average utilization of a specific metric.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum MetricTarget {
    /// Target value of the average of the resource metric
    /// across all relevant pods,
    /// represented as a percentage of the requested value
    /// of the resource for the pods.
    Utilization(u32),
    /// Target value of the metric as a whole, in milli-units.
    Value(u64),
    /// Target value of the average of the metric
    /// across all relevant pods, in milli-units.
    AverageValue(u64),
}

/// GpaBehavior configures the scaling behavior of the target
/// in both Up and Down directions
/// (scaleUp and scaleDown fields respectively).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GpaBehavior {
    /// Scaling policy for scaling Up.
    /// If not set, the default value is the higher of:
    /// - increase no more than 4 pods per 60 seconds
    /// - double the number of pods per 60 seconds
    /// No stabilization is used.
    #[serde(default)]
    pub scale_up: Option<GpaScalingRules>,
    /// Scaling policy for scaling Down.
    /// If not set, the default value is to allow to scale down
    /// to minReplicas pods, with the controller-wide downscale
    /// stabilisation window (i.e., the highest recommendation
    /// over that window is used).
    #[serde(default)]
    pub scale_down: Option<GpaScalingRules>,
}

/// GpaScalingRules configures the scaling behavior for one direction.
/// These rules are applied after calculating the desired replicas
/// from metrics for the GPA.
/// They can limit the scaling velocity by specifying scaling policies.
/// They can prevent flapping by specifying the stabilization window,
/// so that the number of replicas is not set instantly,
/// instead, the safest value from the stabilization window is chosen.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpaScalingRules {
    /// Number of seconds for which past recommendations should be considered
    /// while scaling up or scaling down.
    /// Must be greater than or equal to zero and less than or equal to 3600.
    #[serde(default)]
    pub stabilization_window_seconds: Option<u32>,
    /// Specify which policy should be used.
    /// If not set, the default value Max is used.
    #[serde(default)]
    pub select_policy: PolicySelection,
    /// A list of potential scaling polices which can be used during scaling.
    /// At least one policy must be specified,
    /// otherwise the GpaScalingRules will be discarded as invalid.
    pub policies: Vec<GpaScalingPolicy>,
}

impl GpaScalingRules {
    pub fn longest_period(&self) -> u32 {
        self.policies
            .iter()
            .map(|policy| policy.period_seconds)
            .max()
            .unwrap_or(0)
    }

    /// Default scale up rules: the higher of adding 4 pods or doubling,
    /// per 60 seconds, without stabilization.
    pub fn default_scale_up() -> Self {
        GpaScalingRules {
            policies: vec![
                GpaScalingPolicy {
                    type_: ScalingPolicyType::Pods,
                    value: 4,
                    period_seconds: 60,
                },
                GpaScalingPolicy {
                    type_: ScalingPolicyType::Percent,
                    value: 100,
                    period_seconds: 60,
                },
            ],
            select_policy: PolicySelection::Max,
            stabilization_window_seconds: Some(0),
        }
    }

    /// Default scale down rules: allow removing all pods per 60 seconds.
    /// The stabilization window is left unset so that the controller-wide
    /// downscale stabilisation window applies.
    pub fn default_scale_down() -> Self {
        GpaScalingRules {
            policies: vec![GpaScalingPolicy {
                type_: ScalingPolicyType::Percent,
                value: 100,
                period_seconds: 60,
            }],
            select_policy: PolicySelection::Max,
            stabilization_window_seconds: None,
        }
    }
}

/// PolicySelection describes how to choose a policy from multiple ones
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum PolicySelection {
    /// Select the policy with the lowest recommendation value.
    Min,
    /// Select the policy with the highest recommendation value.
    Max,
    /// Disable scaling in this direction.
    Disabled,
}

impl Default for PolicySelection {
    fn default() -> Self {
        PolicySelection::Max
    }
}

/// GpaScalingPolicy is a single policy
/// which must hold true for a specified past interval.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpaScalingPolicy {
    /// Specify the scaling policy.
    #[serde(rename = "type")]
    pub type_: ScalingPolicyType,
    /// Contains the amount of change which is permitted by the policy.
    /// It must be greater than zero.
    pub value: u32,
    /// Specifies the window of time for which the policy should hold true.
    /// PeriodSeconds must be greater than zero
    /// and less than or equal to 1800 (30 min).
    pub period_seconds: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ScalingPolicyType {
    Pods,
    Percent,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GpaStatus {
    /// Current number of replicas of pods managed by this autoscaler,
    /// as last seen by the autoscaler.
    #[serde(default)]
    pub current_replicas: u32,
    /// Desired number of replicas of pods managed by this autoscaler,
    /// as last calculated by the autoscaler.
    #[serde(default)]
    pub desired_replicas: u32,
    /// Last time the autoscaler scaled the number of pods,
    /// used to control how often the number of pods is changed.
    #[serde(default)]
    pub last_scale_time: Option<NaiveDateTime>,
    /// Last time a cron driven mode scaled the number of pods.
    #[serde(default)]
    pub last_cron_schedule_time: Option<NaiveDateTime>,
    /// The last read state of the metrics used by this autoscaler.
    #[serde(default)]
    pub current_metrics: Vec<MetricStatus>,
    #[serde(default)]
    pub conditions: Vec<GpaCondition>,
}

impl GpaStatus {
    /// Sets the condition of the given type, adding it if absent.
    /// The transition time only moves when the boolean status flips.
    pub fn set_condition(
        &mut self,
        type_: GpaConditionType,
        status: bool,
        reason: &str,
        message: String,
    ) {
        let now = Local::now().naive_utc();
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(condition) => {
                if condition.status != status {
                    condition.last_transition_time = now;
                }
                condition.status = status;
                condition.reason = reason.to_string();
                condition.message = message;
            },
            None => self.conditions.push(GpaCondition {
                type_,
                status,
                reason: reason.to_string(),
                message,
                last_transition_time: now,
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpaCondition {
    #[serde(rename = "type")]
    pub type_: GpaConditionType,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: NaiveDateTime,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum GpaConditionType {
    /// Whether the autoscaler can fetch and update the target scale.
    AbleToScale,
    /// Whether the autoscaler can compute a replica count from its modes.
    ScalingActive,
    /// Whether the computed replica count was capped by a bound or rate.
    ScalingLimited,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum MetricStatus {
    Resource(ResourceMetricStatus),
    ContainerResource(ContainerResourceMetricStatus),
    Pods(PodsMetricStatus),
    Object(ObjectMetricStatus),
    External(ExternalMetricStatus),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceMetricStatus {
    pub name: Resource,
    pub current: MetricValueStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerResourceMetricStatus {
    pub name: Resource,
    pub container: String,
    pub current: MetricValueStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodsMetricStatus {
    pub metric: MetricIdentifier,
    pub current: MetricValueStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetricStatus {
    #[serde(default)]
    pub described_object: Option<ObjectReference>,
    pub metric: MetricIdentifier,
    pub current: MetricValueStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExternalMetricStatus {
    pub metric: MetricIdentifier,
    pub current: MetricValueStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricValueStatus {
    /// Value of the metric as a whole, in milli-units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    /// Average value of the metric across relevant pods, in milli-units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_value: Option<i64>,
    /// Average utilization across relevant pods,
    /// as a percentage of the requested (or limited) value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_utilization: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(status: &GpaStatus, type_: GpaConditionType) -> &GpaCondition {
        status
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
            .expect("condition should be present")
    }

    #[test]
    fn condition_transition_time_moves_only_on_status_flip() {
        let mut status = GpaStatus::default();
        status.set_condition(
            GpaConditionType::AbleToScale,
            true,
            "SucceededGetScale",
            "got the scale".to_string(),
        );
        let first = condition(&status, GpaConditionType::AbleToScale).last_transition_time;

        status.set_condition(
            GpaConditionType::AbleToScale,
            true,
            "ReadyForNewScale",
            "recommended size matches current size".to_string(),
        );
        let unchanged = condition(&status, GpaConditionType::AbleToScale);
        assert_eq!(unchanged.last_transition_time, first);
        assert_eq!(unchanged.reason, "ReadyForNewScale");

        std::thread::sleep(std::time::Duration::from_millis(5));
        status.set_condition(
            GpaConditionType::AbleToScale,
            false,
            "FailedGetScale",
            "no scale".to_string(),
        );
        let flipped = condition(&status, GpaConditionType::AbleToScale);
        assert!(flipped.last_transition_time > first);
        assert!(!flipped.status);
    }

    #[test]
    fn conditions_never_duplicate() {
        let mut status = GpaStatus::default();
        for _ in 0..3 {
            status.set_condition(
                GpaConditionType::ScalingActive,
                true,
                "ValidMetricFound",
                String::new(),
            );
            status.set_condition(
                GpaConditionType::ScalingLimited,
                false,
                "DesiredWithinRange",
                String::new(),
            );
        }
        assert_eq!(status.conditions.len(), 2);
    }

    #[test]
    fn min_replicas_defaults_to_unset() {
        let spec: GpaSpec = serde_json::from_str(
            r#"{
                "scaleTargetRef": {"kind": "ReplicaSet", "name": "squad"},
                "maxReplicas": 10,
                "metric": {"metrics": [
                    {"type": "Resource", "name": "CPU", "target": {"utilization": 80}}
                ]}
            }"#,
        )
        .unwrap();
        assert_eq!(spec.min_replicas, None);
        assert!(!spec.modes_empty());
    }

    #[test]
    fn cron_metric_spec_metric_is_optional() {
        let spec: CronMetricSpec = serde_json::from_str(
            r#"{
                "schedule": "0-4 9-10 * * *",
                "minReplicas": 6,
                "maxReplicas": 8,
                "priority": 10,
                "metric": {"type": "Resource", "name": "CPU", "target": {"utilization": 60}}
            }"#,
        )
        .unwrap();
        assert_eq!(spec.max_replicas, 8);
        assert!(matches!(spec.metric, Some(MetricSpec::Resource(_))));

        let default: CronMetricSpec = serde_json::from_str(
            r#"{"schedule": "default", "minReplicas": 9, "maxReplicas": 10}"#,
        )
        .unwrap();
        assert!(default.metric.is_none());
    }
}
