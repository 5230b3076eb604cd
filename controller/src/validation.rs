use std::{
    collections::HashSet,
    fmt::{self, Display},
};

use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone};
use cron::Schedule;
use resources::objects::gpa::{
    CronMetricMode, CronMetricSpec, EventMode, GeneralPodAutoscaler, GpaBehavior, GpaScalingPolicy,
    GpaScalingRules, GpaSpec, MetricIdentifier, MetricSpec, MetricTarget, ScaleTrigger, TimeMode,
    TimeRange, WebhookMode,
};

use crate::scalercore::parse_standard_with_year;

/// The largest allowed scaling policy period (in seconds)
pub const MAX_PERIOD_SECONDS: u32 = 1800;
/// The largest allowed stabilization window (in seconds)
pub const MAX_STABILIZATION_WINDOW_SECONDS: u32 = 3600;

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validates a whole autoscaler object, returning every violation found.
/// `min_replicas_lower_bound` is 0 when scale-to-zero is enabled.
pub fn validate_gpa(
    gpa: &GeneralPodAutoscaler,
    min_replicas_lower_bound: u32,
) -> Vec<ValidationError> {
    let mut errs = Vec::new();
    if gpa.metadata.name.is_empty() {
        errs.push(ValidationError::new("metadata.name", "name is required"));
    }
    validate_spec(&gpa.spec, "spec", min_replicas_lower_bound, &mut errs);
    errs
}

fn validate_spec(
    spec: &GpaSpec,
    field: &str,
    min_replicas_lower_bound: u32,
    errs: &mut Vec<ValidationError>,
) {
    if let Some(cron_metric) = &spec.cron_metric {
        validate_cron_metrics(
            cron_metric,
            &format!("{}.cronMetric", field),
            min_replicas_lower_bound,
            errs,
            Local::now(),
        );
    } else {
        validate_replica_bounds(
            spec.min_replicas,
            spec.max_replicas,
            field,
            min_replicas_lower_bound,
            errs,
        );
    }

    let ref_field = format!("{}.scaleTargetRef", field);
    if spec.scale_target_ref.kind.is_empty() {
        errs.push(ValidationError::new(
            &format!("{}.kind", ref_field),
            "kind is required",
        ));
    }
    if spec.scale_target_ref.name.is_empty() {
        errs.push(ValidationError::new(
            &format!("{}.name", ref_field),
            "name is required",
        ));
    }

    if let Some(metric) = &spec.metric {
        validate_metrics(
            &metric.metrics,
            &format!("{}.metric.metrics", field),
            spec.min_replicas,
            errs,
        );
    }
    if let Some(webhook) = &spec.webhook {
        validate_webhook(webhook, &format!("{}.webhook", field), errs);
    }
    if let Some(time) = &spec.time {
        validate_time(time, &format!("{}.time", field), errs);
    }
    if let Some(event) = &spec.event {
        validate_event(event, &format!("{}.event", field), errs);
    }
    if let Some(behavior) = &spec.behavior {
        validate_behavior(behavior, &format!("{}.behavior", field), errs);
    }
}

fn validate_replica_bounds(
    min_replicas: Option<u32>,
    max_replicas: u32,
    field: &str,
    lower_bound: u32,
    errs: &mut Vec<ValidationError>,
) {
    if let Some(min) = min_replicas {
        if min < lower_bound {
            errs.push(ValidationError::new(
                &format!("{}.minReplicas", field),
                format!("must be greater than or equal to {}", lower_bound),
            ));
        }
        if max_replicas < min {
            errs.push(ValidationError::new(
                &format!("{}.maxReplicas", field),
                "must be greater than or equal to `minReplicas`",
            ));
        }
    }
    if max_replicas < 1 {
        errs.push(ValidationError::new(
            &format!("{}.maxReplicas", field),
            "must be greater than 0",
        ));
    }
}

fn validate_metrics(
    metrics: &[MetricSpec],
    field: &str,
    min_replicas: Option<u32>,
    errs: &mut Vec<ValidationError>,
) {
    if metrics.is_empty() {
        errs.push(ValidationError::new(field, "at least one metric should set"));
    }
    let mut has_object_or_external = false;
    for (i, spec) in metrics.iter().enumerate() {
        validate_metric_spec(spec, &format!("{}[{}]", field, i), errs);
        if matches!(spec, MetricSpec::Object(_) | MetricSpec::External(_)) {
            has_object_or_external = true;
        }
    }
    if min_replicas == Some(0) && !has_object_or_external {
        errs.push(ValidationError::new(
            field,
            "must specify at least one Object or External metric to support scaling to zero replicas",
        ));
    }
}

fn validate_metric_spec(spec: &MetricSpec, field: &str, errs: &mut Vec<ValidationError>) {
    match spec {
        MetricSpec::Resource(resource) => {
            validate_resource_target(&resource.target, field, errs);
        },
        MetricSpec::ContainerResource(resource) => {
            if resource.container.is_empty() {
                errs.push(ValidationError::new(
                    &format!("{}.container", field),
                    "must specify a container name",
                ));
            }
            validate_resource_target(&resource.target, field, errs);
        },
        MetricSpec::Pods(pods) => {
            validate_metric_identifier(&pods.metric, field, errs);
            match pods.target {
                MetricTarget::AverageValue(value) => {
                    if value == 0 {
                        errs.push(ValidationError::new(
                            &format!("{}.target.averageValue", field),
                            "must be positive",
                        ));
                    }
                },
                _ => errs.push(ValidationError::new(
                    &format!("{}.target.averageValue", field),
                    "must specify a positive target averageValue",
                )),
            }
        },
        MetricSpec::Object(object) => {
            if object.described_object.kind.is_empty() {
                errs.push(ValidationError::new(
                    &format!("{}.describedObject.kind", field),
                    "kind is required",
                ));
            }
            if object.described_object.name.is_empty() {
                errs.push(ValidationError::new(
                    &format!("{}.describedObject.name", field),
                    "name is required",
                ));
            }
            validate_metric_identifier(&object.metric, field, errs);
            validate_value_target(&object.target, field, errs);
        },
        MetricSpec::External(external) => {
            validate_metric_identifier(&external.metric, field, errs);
            validate_value_target(&external.target, field, errs);
        },
    }
}

fn validate_resource_target(target: &MetricTarget, field: &str, errs: &mut Vec<ValidationError>) {
    match target {
        MetricTarget::Utilization(utilization) => {
            if *utilization < 1 {
                errs.push(ValidationError::new(
                    &format!("{}.target.utilization", field),
                    "must be greater than 0",
                ));
            }
        },
        MetricTarget::AverageValue(value) => {
            if *value == 0 {
                errs.push(ValidationError::new(
                    &format!("{}.target.averageValue", field),
                    "must be positive",
                ));
            }
        },
        MetricTarget::Value(_) => errs.push(ValidationError::new(
            &format!("{}.target", field),
            "must set either a target utilization or a target average value",
        )),
    }
}

fn validate_value_target(target: &MetricTarget, field: &str, errs: &mut Vec<ValidationError>) {
    match target {
        MetricTarget::Value(value) | MetricTarget::AverageValue(value) => {
            if *value == 0 {
                errs.push(ValidationError::new(
                    &format!("{}.target", field),
                    "must be positive",
                ));
            }
        },
        MetricTarget::Utilization(_) => errs.push(ValidationError::new(
            &format!("{}.target", field),
            "must set either a target value or averageValue",
        )),
    }
}

fn validate_metric_identifier(
    identifier: &MetricIdentifier,
    field: &str,
    errs: &mut Vec<ValidationError>,
) {
    if identifier.name.is_empty() {
        errs.push(ValidationError::new(
            &format!("{}.metric.name", field),
            "must specify a metric name",
        ));
    }
}

fn validate_webhook(webhook: &WebhookMode, field: &str, errs: &mut Vec<ValidationError>) {
    match (&webhook.url, &webhook.service) {
        (None, None) => errs.push(ValidationError::new(
            field,
            "must specify at least one service or url",
        )),
        (Some(url), _) => {
            if reqwest::Url::parse(url).is_err() {
                errs.push(ValidationError::new(
                    &format!("{}.url", field),
                    format!("invalid url: {}", url),
                ));
            }
        },
        (None, Some(service)) => {
            if service.name.is_empty() {
                errs.push(ValidationError::new(
                    &format!("{}.service.name", field),
                    "name is required",
                ));
            }
            if service.namespace.is_empty() {
                errs.push(ValidationError::new(
                    &format!("{}.service.namespace", field),
                    "namespace is required",
                ));
            }
        },
    }
}

fn validate_time(time: &TimeMode, field: &str, errs: &mut Vec<ValidationError>) {
    if time.time_ranges.is_empty() {
        errs.push(ValidationError::new(
            &format!("{}.timeRanges", field),
            "at least one timeRanges should set",
        ));
    }
    for (i, range) in time.time_ranges.iter().enumerate() {
        validate_time_range(range, &format!("{}.timeRanges[{}]", field, i), errs);
    }
}

fn validate_time_range(range: &TimeRange, field: &str, errs: &mut Vec<ValidationError>) {
    if range.desired_replicas == 0 {
        errs.push(ValidationError::new(
            &format!("{}.desiredReplicas", field),
            "should not be 0",
        ));
    }
    if range.schedule.is_empty() {
        errs.push(ValidationError::new(
            &format!("{}.schedule", field),
            "should not be empty",
        ));
    } else if let Err(e) = parse_standard_with_year(&range.schedule) {
        errs.push(ValidationError::new(&format!("{}.schedule", field), e.to_string()));
    }
}

fn validate_event(event: &EventMode, field: &str, errs: &mut Vec<ValidationError>) {
    if event.triggers.is_empty() {
        errs.push(ValidationError::new(
            &format!("{}.triggers", field),
            "at least one trigger should set",
        ));
    }
    for (i, trigger) in event.triggers.iter().enumerate() {
        validate_trigger(trigger, &format!("{}.triggers[{}]", field, i), errs);
    }
}

fn validate_trigger(trigger: &ScaleTrigger, field: &str, errs: &mut Vec<ValidationError>) {
    if trigger.trigger_type.is_empty() {
        errs.push(ValidationError::new(
            &format!("{}.type", field),
            "trigger type must set",
        ));
    }
    if trigger.metadata.is_empty() {
        errs.push(ValidationError::new(
            &format!("{}.metadata", field),
            "trigger metadata must set",
        ));
    }
}

fn validate_behavior(behavior: &GpaBehavior, field: &str, errs: &mut Vec<ValidationError>) {
    if let Some(scale_up) = &behavior.scale_up {
        validate_scaling_rules(scale_up, &format!("{}.scaleUp", field), errs);
    }
    if let Some(scale_down) = &behavior.scale_down {
        validate_scaling_rules(scale_down, &format!("{}.scaleDown", field), errs);
    }
}

fn validate_scaling_rules(rules: &GpaScalingRules, field: &str, errs: &mut Vec<ValidationError>) {
    if let Some(window) = rules.stabilization_window_seconds {
        if window > MAX_STABILIZATION_WINDOW_SECONDS {
            errs.push(ValidationError::new(
                &format!("{}.stabilizationWindowSeconds", field),
                format!(
                    "must be less than or equal to {}",
                    MAX_STABILIZATION_WINDOW_SECONDS
                ),
            ));
        }
    }
    if rules.policies.is_empty() {
        errs.push(ValidationError::new(
            &format!("{}.policies", field),
            "must specify at least one Policy",
        ));
    }
    for (i, policy) in rules.policies.iter().enumerate() {
        validate_scaling_policy(policy, &format!("{}.policies[{}]", field, i), errs);
    }
}

fn validate_scaling_policy(policy: &GpaScalingPolicy, field: &str, errs: &mut Vec<ValidationError>) {
    if policy.value == 0 {
        errs.push(ValidationError::new(
            &format!("{}.value", field),
            "must be greater than zero",
        ));
    }
    if policy.period_seconds == 0 {
        errs.push(ValidationError::new(
            &format!("{}.periodSeconds", field),
            "must be greater than zero",
        ));
    }
    if policy.period_seconds > MAX_PERIOD_SECONDS {
        errs.push(ValidationError::new(
            &format!("{}.periodSeconds", field),
            format!("must be less than or equal to {}", MAX_PERIOD_SECONDS),
        ));
    }
}

/// The firing instants of one schedule over its canonical cycle,
/// together with what it scales on and its priority.
struct CronSet {
    schedule: String,
    kind: String,
    priority: i32,
    instants: HashSet<NaiveDateTime>,
}

fn validate_cron_metrics(
    mode: &CronMetricMode,
    field: &str,
    min_replicas_lower_bound: u32,
    errs: &mut Vec<ValidationError>,
    now: DateTime<Local>,
) {
    if mode.cron_metrics.is_empty() {
        errs.push(ValidationError::new(
            &format!("{}.cronMetrics", field),
            "at least one cronMetrics should set",
        ));
    }

    let mut cycle_sets = Vec::new();
    let mut custom_sets = Vec::new();
    let mut defaults = Vec::new();
    for (i, cron_range) in mode.cron_metrics.iter().enumerate() {
        let idx_field = format!("{}.cronMetrics[{}]", field, i);
        validate_replica_bounds(
            cron_range.min_replicas,
            cron_range.max_replicas,
            &idx_field,
            min_replicas_lower_bound,
            errs,
        );
        if cron_range.schedule.is_empty() {
            errs.push(ValidationError::new(
                &format!("{}.schedule", idx_field),
                "should not be empty",
            ));
            continue;
        }
        if cron_range.schedule == "default" {
            defaults.push(cron_range);
            continue;
        }
        match parse_standard_with_year(&cron_range.schedule) {
            Err(e) => errs.push(ValidationError::new(
                &format!("{}.schedule", idx_field),
                e.to_string(),
            )),
            Ok((year, schedule)) => {
                let set = CronSet {
                    schedule: cron_range.schedule.clone(),
                    kind: metric_kind(cron_range),
                    priority: cron_range.priority,
                    instants: match year {
                        Some(year) => enumerate_year(&schedule, year),
                        None => enumerate_month(&schedule, now),
                    },
                };
                // yearly schedules are only compared with other yearly ones
                if year.is_some() {
                    cycle_sets.push(set);
                } else {
                    custom_sets.push(set);
                }
            },
        }
    }

    // the fallback is mandatory, and a cpu/mem pair may duplicate it
    if defaults.is_empty() || defaults.len() > 2 {
        errs.push(ValidationError::new(
            &format!("{}.cronMetrics", field),
            "only two or one `default` schedule cronMetrics should set",
        ));
    }
    if defaults.len() == 2
        && (defaults[0].max_replicas != defaults[1].max_replicas
            || defaults[0].min_replicas != defaults[1].min_replicas)
    {
        errs.push(ValidationError::new(
            &format!("{}.cronMetrics", field),
            "two `default` schedule cronMetrics must set the same minReplicas and maxReplicas",
        ));
    }

    check_conflicts(&cycle_sets, field, errs);
    check_conflicts(&custom_sets, field, errs);
}

/// What the cron entry scales on, used to allow a cpu/mem pair
/// sharing one schedule.
fn metric_kind(spec: &CronMetricSpec) -> String {
    match &spec.metric {
        Some(MetricSpec::Resource(resource)) => resource.name.to_string(),
        Some(MetricSpec::ContainerResource(resource)) => resource.name.to_string(),
        Some(MetricSpec::Pods(pods)) => pods.metric.name.clone(),
        Some(MetricSpec::Object(object)) => object.metric.name.clone(),
        Some(MetricSpec::External(external)) => external.metric.name.clone(),
        None => String::new(),
    }
}

/// All firing instants of a year-bound schedule within its year.
fn enumerate_year(schedule: &Schedule, year: i32) -> HashSet<NaiveDateTime> {
    let mut instants = HashSet::new();
    let Some(start) = Local.with_ymd_and_hms(year, 1, 1, 0, 0, 0).earliest() else {
        return instants;
    };
    for t in schedule.after(&start) {
        if t.year() != year {
            break;
        }
        instants.insert(t.naive_local());
    }
    instants
}

/// The firing instants of a recurring schedule over the rest of the
/// current calendar month, normalized to year 0 so that only the
/// recurring shape is compared.
fn enumerate_month(schedule: &Schedule, now: DateTime<Local>) -> HashSet<NaiveDateTime> {
    let mut instants = HashSet::new();
    let month = now.month();
    for t in schedule.after(&now) {
        instants.insert(normalize_year(t.naive_local()));
        if t.month() != month {
            break;
        }
    }
    instants
}

fn normalize_year(t: NaiveDateTime) -> NaiveDateTime {
    t.with_year(0).unwrap_or(t)
}

fn check_conflicts(sets: &[CronSet], field: &str, errs: &mut Vec<ValidationError>) {
    for i in 0..sets.len() {
        for j in i + 1..sets.len() {
            if sets[i].kind != sets[j].kind && sets[i].schedule == sets[j].schedule {
                // a cpu and a mem entry may share one schedule
                continue;
            }
            if sets[i].priority == sets[j].priority
                && !sets[i].instants.is_disjoint(&sets[j].instants)
            {
                errs.push(ValidationError::new(
                    &format!("{}.cronMetrics.schedule", field),
                    format!(
                        "schedule time conflict, schedule: {} conflicts with {}, priority: {}, priority: {}",
                        sets[i].schedule, sets[j].schedule, sets[i].priority, sets[j].priority
                    ),
                ));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use resources::objects::{
        gpa::{
            ContainerResourceMetricSource, ExternalMetricSource, MetricMode, ObjectMetricSource,
            PodsMetricSource, PolicySelection, ResourceMetricSource, ScalingPolicyType,
        },
        metrics::Resource,
        object_reference::ObjectReference,
        Metadata,
    };

    use super::*;

    fn base_gpa() -> GeneralPodAutoscaler {
        GeneralPodAutoscaler {
            metadata: Metadata {
                name: "squad".to_string(),
                namespace: "default".to_string(),
                uid: None,
                labels: Default::default(),
                annotations: Default::default(),
                owner_references: Vec::new(),
            },
            spec: GpaSpec {
                scale_target_ref: ObjectReference {
                    api_version: None,
                    kind: "ReplicaSet".to_string(),
                    name: "squad".to_string(),
                },
                min_replicas: Some(1),
                max_replicas: 10,
                metric: None,
                cron_metric: None,
                time: None,
                webhook: None,
                event: None,
                behavior: None,
            },
            status: Default::default(),
        }
    }

    fn cron_spec(schedule: &str, priority: i32, resource: Resource) -> CronMetricSpec {
        CronMetricSpec {
            schedule: schedule.to_string(),
            min_replicas: Some(1),
            max_replicas: 5,
            priority,
            metric: Some(MetricSpec::Resource(ResourceMetricSource {
                name: resource,
                target: MetricTarget::Utilization(60),
            })),
        }
    }

    fn default_spec(min: u32, max: u32) -> CronMetricSpec {
        CronMetricSpec {
            schedule: "default".to_string(),
            min_replicas: Some(min),
            max_replicas: max,
            priority: 0,
            metric: None,
        }
    }

    fn gpa_with_cron(specs: Vec<CronMetricSpec>) -> GeneralPodAutoscaler {
        let mut gpa = base_gpa();
        gpa.spec.cron_metric = Some(CronMetricMode {
            cron_metrics: specs,
        });
        gpa
    }

    /// Validates the cron block at a fixed mid-month instant, so the
    /// month-cycle enumeration does not depend on the wall clock.
    fn cron_errs(specs: Vec<CronMetricSpec>) -> Vec<ValidationError> {
        let mode = CronMetricMode {
            cron_metrics: specs,
        };
        let mut errs = Vec::new();
        validate_cron_metrics(
            &mode,
            "spec.cronMetric",
            0,
            &mut errs,
            Local.with_ymd_and_hms(2023, 5, 10, 12, 0, 0).unwrap(),
        );
        errs
    }

    #[test]
    fn valid_gpa_passes() {
        assert!(validate_gpa(&base_gpa(), 0).is_empty());
    }

    #[test]
    fn min_above_max_is_rejected() {
        let mut gpa = base_gpa();
        gpa.spec.min_replicas = Some(20);
        let errs = validate_gpa(&gpa, 0);
        assert!(errs.iter().any(|e| e.field == "spec.maxReplicas"));
    }

    #[test]
    fn min_below_lower_bound_is_rejected() {
        let mut gpa = base_gpa();
        gpa.spec.min_replicas = Some(0);
        assert!(validate_gpa(&gpa, 0).is_empty());
        let errs = validate_gpa(&gpa, 1);
        assert!(errs.iter().any(|e| e.field == "spec.minReplicas"));
    }

    #[test]
    fn equal_priority_overlap_conflicts() {
        let errs = cron_errs(vec![
            cron_spec("0-4 9-10 * * *", 0, Resource::CPU),
            cron_spec("2-6 9 * * *", 0, Resource::CPU),
            default_spec(1, 5),
        ]);
        assert!(errs.iter().any(|e| e.message.contains("conflict")));
    }

    #[test]
    fn different_priorities_do_not_conflict() {
        let errs = cron_errs(vec![
            cron_spec("0-4 9-10 * * *", 100, Resource::CPU),
            cron_spec("2-6 9 * * *", 200, Resource::CPU),
            default_spec(1, 5),
        ]);
        assert!(errs.is_empty());
    }

    #[test]
    fn cpu_and_memory_may_share_a_schedule() {
        let errs = cron_errs(vec![
            cron_spec("0-4 9-10 * * *", 0, Resource::CPU),
            cron_spec("0-4 9-10 * * *", 0, Resource::Memory),
            default_spec(1, 5),
        ]);
        assert!(errs.is_empty());
    }

    #[test]
    fn same_schedule_and_kind_conflicts() {
        let errs = cron_errs(vec![
            cron_spec("0-4 9-10 * * *", 0, Resource::CPU),
            cron_spec("0-4 9-10 * * *", 0, Resource::CPU),
            default_spec(1, 5),
        ]);
        assert!(errs.iter().any(|e| e.message.contains("conflict")));
    }

    #[test]
    fn yearly_and_recurring_schedules_are_not_compared() {
        let errs = cron_errs(vec![
            cron_spec("* 20-22 1 10 * 2023", 0, Resource::CPU),
            cron_spec("* 20-22 1 10 *", 0, Resource::CPU),
            default_spec(1, 5),
        ]);
        assert!(errs.is_empty());
    }

    #[test]
    fn missing_default_is_rejected() {
        let errs = cron_errs(vec![cron_spec("0-4 9-10 * * *", 0, Resource::CPU)]);
        assert!(errs
            .iter()
            .any(|e| e.message.contains("`default` schedule")));
    }

    #[test]
    fn two_defaults_must_agree_on_bounds() {
        let errs = cron_errs(vec![
            default_spec(1, 5),
            default_spec(2, 5),
            cron_spec("0-4 9-10 * * *", 0, Resource::CPU),
        ]);
        assert!(errs.iter().any(|e| e.message.contains("same minReplicas")));

        let errs = cron_errs(vec![
            default_spec(1, 5),
            default_spec(1, 5),
            cron_spec("0-4 9-10 * * *", 0, Resource::CPU),
        ]);
        assert!(errs.is_empty());
    }

    #[test]
    fn unparseable_cron_schedule_is_rejected() {
        let gpa = gpa_with_cron(vec![
            cron_spec("not a schedule", 0, Resource::CPU),
            default_spec(1, 5),
        ]);
        let errs = validate_gpa(&gpa, 0);
        assert!(errs.iter().any(|e| e.field.contains("schedule")));
    }

    #[test]
    fn behavior_bounds_are_enforced() {
        let mut gpa = base_gpa();
        gpa.spec.behavior = Some(GpaBehavior {
            scale_up: Some(GpaScalingRules {
                stabilization_window_seconds: Some(4000),
                select_policy: PolicySelection::Max,
                policies: vec![GpaScalingPolicy {
                    type_: ScalingPolicyType::Pods,
                    value: 0,
                    period_seconds: 2000,
                }],
            }),
            scale_down: Some(GpaScalingRules {
                stabilization_window_seconds: None,
                select_policy: PolicySelection::Min,
                policies: Vec::new(),
            }),
        });
        let errs = validate_gpa(&gpa, 0);
        assert!(errs
            .iter()
            .any(|e| e.field == "spec.behavior.scaleUp.stabilizationWindowSeconds"));
        assert!(errs
            .iter()
            .any(|e| e.field == "spec.behavior.scaleUp.policies[0].value"));
        assert!(errs
            .iter()
            .any(|e| e.field == "spec.behavior.scaleUp.policies[0].periodSeconds"));
        assert!(errs
            .iter()
            .any(|e| e.field == "spec.behavior.scaleDown.policies"));
    }

    #[test]
    fn metric_target_types_must_match_the_source() {
        let mut gpa = base_gpa();
        gpa.spec.metric = Some(MetricMode {
            metrics: vec![
                MetricSpec::Resource(ResourceMetricSource {
                    name: Resource::CPU,
                    target: MetricTarget::Value(100),
                }),
                MetricSpec::Pods(PodsMetricSource {
                    metric: MetricIdentifier {
                        name: "qps".to_string(),
                        selector: None,
                    },
                    target: MetricTarget::Utilization(80),
                }),
                MetricSpec::ContainerResource(ContainerResourceMetricSource {
                    name: Resource::CPU,
                    container: String::new(),
                    target: MetricTarget::Utilization(80),
                }),
            ],
        });
        let errs = validate_gpa(&gpa, 0);
        assert_eq!(errs.len(), 3);
    }

    #[test]
    fn scaling_to_zero_needs_object_or_external_metric() {
        let mut gpa = base_gpa();
        gpa.spec.min_replicas = Some(0);
        gpa.spec.metric = Some(MetricMode {
            metrics: vec![MetricSpec::Resource(ResourceMetricSource {
                name: Resource::CPU,
                target: MetricTarget::Utilization(80),
            })],
        });
        let errs = validate_gpa(&gpa, 0);
        assert!(errs
            .iter()
            .any(|e| e.message.contains("scaling to zero")));

        gpa.spec.metric = Some(MetricMode {
            metrics: vec![MetricSpec::External(ExternalMetricSource {
                metric: MetricIdentifier {
                    name: "queue-depth".to_string(),
                    selector: None,
                },
                target: MetricTarget::Value(1000),
            })],
        });
        assert!(validate_gpa(&gpa, 0).is_empty());
    }

    #[test]
    fn object_metric_requires_described_object() {
        let mut gpa = base_gpa();
        gpa.spec.metric = Some(MetricMode {
            metrics: vec![MetricSpec::Object(ObjectMetricSource {
                described_object: ObjectReference {
                    api_version: None,
                    kind: String::new(),
                    name: String::new(),
                },
                metric: MetricIdentifier {
                    name: "hits".to_string(),
                    selector: None,
                },
                target: MetricTarget::Value(100),
            })],
        });
        let errs = validate_gpa(&gpa, 0);
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn time_mode_rejects_zero_replicas_and_bad_schedules() {
        let mut gpa = base_gpa();
        gpa.spec.time = Some(TimeMode {
            time_ranges: vec![
                TimeRange {
                    schedule: "0-4 9-10 * * *".to_string(),
                    desired_replicas: 0,
                },
                TimeRange {
                    schedule: "61 25 * * *".to_string(),
                    desired_replicas: 3,
                },
            ],
        });
        let errs = validate_gpa(&gpa, 0);
        assert!(errs
            .iter()
            .any(|e| e.field == "spec.time.timeRanges[0].desiredReplicas"));
        assert!(errs
            .iter()
            .any(|e| e.field == "spec.time.timeRanges[1].schedule"));
    }

    #[test]
    fn webhook_and_event_modes_are_validated() {
        let mut gpa = base_gpa();
        gpa.spec.webhook = Some(WebhookMode {
            url: None,
            service: None,
            parameters: Default::default(),
        });
        gpa.spec.event = Some(EventMode {
            triggers: vec![ScaleTrigger {
                trigger_type: String::new(),
                metadata: Default::default(),
                name: "burst".to_string(),
            }],
        });
        let errs = validate_gpa(&gpa, 0);
        assert!(errs.iter().any(|e| e.field == "spec.webhook"));
        assert!(errs.iter().any(|e| e.field == "spec.event.triggers[0].type"));
        assert!(errs
            .iter()
            .any(|e| e.field == "spec.event.triggers[0].metadata"));
    }
}
