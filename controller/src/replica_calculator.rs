use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDateTime};
use resources::{
    informer::Store,
    objects::{
        metrics::{PodMetric, PodMetricsInfo, Resource},
        object_reference::ObjectReference,
        pod::{Pod, PodConditionType, PodPhase},
        Labels,
    },
};

use crate::metrics::MetricsClient;

/// Turns metric samples into replica proposals.
/// Ratios within `tolerance` of 1.0 keep the current count.
pub struct ReplicaCalculator {
    client: MetricsClient,
    pod_store: Store<Pod>,
    tolerance: f64,
}

impl ReplicaCalculator {
    pub fn new(pod_store: Store<Pod>, tolerance: f64) -> Self {
        Self {
            client: MetricsClient::new(),
            pod_store,
            tolerance,
        }
    }

    /// Desired replicas for a resource utilization target, as
    /// `(replicas, utilization percentage, raw average, timestamp)`.
    /// The denominator is the pod requests, or the limits when
    /// `compute_by_limits` is set.
    pub async fn get_resource_replicas(
        &self,
        current_replicas: u32,
        target_utilization: u32,
        resource: &Resource,
        namespace: &str,
        selector: &Labels,
        container: Option<&str>,
        compute_by_limits: bool,
    ) -> Result<(u32, u32, i64, NaiveDateTime)> {
        let now = Local::now().naive_utc();
        let mut metrics = self
            .client
            .get_resource_metric_value(resource, selector, container)
            .await?;
        let pods = self.get_pods(namespace, selector).await;
        if pods.is_empty() {
            return Err(anyhow!("no pods returned by selector {}", selector));
        }

        let missing_pods = self.filter_pods(&mut metrics, &pods)?;
        if metrics.is_empty() {
            return Err(anyhow!("did not receive metrics for any ready pods"));
        }

        let denominator = |pod: &Pod| match container {
            Some(name) => {
                if compute_by_limits {
                    pod.container_limits(name, resource)
                } else {
                    pod.container_requests(name, resource)
                }
            },
            None => {
                if compute_by_limits {
                    pod.limits(resource)
                } else {
                    pod.requests(resource)
                }
            },
        };

        let (usage_total, denominator_total) =
            usage_and_denominator(&metrics, &pods, &denominator);
        if denominator_total == 0 {
            return Err(anyhow!(
                "missing {} for {}",
                if compute_by_limits { "limit" } else { "request" },
                resource
            ));
        }
        let utilization = (usage_total * 100) as f64 / denominator_total as f64;
        let raw_average = usage_total / metrics.len() as i64;
        let ratio = utilization / target_utilization as f64;
        if missing_pods.is_empty() && (ratio - 1.0).abs() <= self.tolerance {
            return Ok((current_replicas, utilization as u32, raw_average, now));
        }

        // assume full usage for missing pods when scaling down
        // and zero usage when scaling up, so that the assumption
        // never exaggerates the move
        for pod in &missing_pods {
            let value = if ratio < 1.0 { denominator(pod) } else { 0 };
            metrics.insert(
                pod.metadata.name.to_owned(),
                PodMetric {
                    timestamp: now,
                    window: 60,
                    value,
                },
            );
        }
        let (new_usage, new_denominator) = usage_and_denominator(&metrics, &pods, &denominator);
        if new_denominator == 0 {
            return Err(anyhow!("missing requests for {}", resource));
        }
        let new_ratio = ((new_usage * 100) as f64 / new_denominator as f64)
            / target_utilization as f64;
        let new_replicas = (new_ratio * metrics.len() as f64).ceil() as u32;
        if assumption_reverses_direction(ratio, new_ratio, new_replicas, current_replicas) {
            return Ok((current_replicas, utilization as u32, raw_average, now));
        }
        Ok((new_replicas, utilization as u32, raw_average, now))
    }

    /// Desired replicas for a per-pod average value target on a resource,
    /// as `(replicas, raw average, timestamp)`.
    pub async fn get_raw_resource_replicas(
        &self,
        current_replicas: u32,
        target_average: i64,
        resource: &Resource,
        namespace: &str,
        selector: &Labels,
        container: Option<&str>,
    ) -> Result<(u32, i64, NaiveDateTime)> {
        let mut metrics = self
            .client
            .get_resource_metric_value(resource, selector, container)
            .await?;
        self.calc_replicas_by_value(current_replicas, target_average, &mut metrics, namespace, selector)
            .await
    }

    /// Desired replicas for a per-pod average value target
    /// on a custom pods metric.
    pub async fn get_metric_replicas(
        &self,
        current_replicas: u32,
        target_average: i64,
        metric_name: &str,
        namespace: &str,
        selector: &Labels,
    ) -> Result<(u32, i64, NaiveDateTime)> {
        let mut metrics = self
            .client
            .get_pods_metric_value(metric_name, selector)
            .await?;
        self.calc_replicas_by_value(current_replicas, target_average, &mut metrics, namespace, selector)
            .await
    }

    /// Desired replicas for a whole-object metric value target,
    /// as `(replicas, metric value, timestamp)`.
    pub async fn get_object_metric_replicas(
        &self,
        current_replicas: u32,
        target_value: i64,
        metric_name: &str,
        namespace: &str,
        object: &ObjectReference,
    ) -> Result<(u32, i64, NaiveDateTime)> {
        let point = self
            .client
            .get_object_metric_value(namespace, object, metric_name)
            .await?;
        let (replicas, _) = self.scale_by_ratio(current_replicas, point.value, target_value);
        Ok((replicas, point.value, point.timestamp))
    }

    /// Desired replicas for an object metric divided across pods.
    pub async fn get_object_per_pod_metric_replicas(
        &self,
        status_replicas: u32,
        target_average: i64,
        metric_name: &str,
        namespace: &str,
        object: &ObjectReference,
    ) -> Result<(u32, i64, NaiveDateTime)> {
        let point = self
            .client
            .get_object_metric_value(namespace, object, metric_name)
            .await?;
        let (replicas, average) =
            self.scale_by_per_pod_ratio(status_replicas, point.value, target_average);
        Ok((replicas, average, point.timestamp))
    }

    /// Desired replicas for a cluster-total external metric value target.
    pub async fn get_external_metric_replicas(
        &self,
        current_replicas: u32,
        target_value: i64,
        metric_name: &str,
        metric_selector: Option<&Labels>,
    ) -> Result<(u32, i64, NaiveDateTime)> {
        let points = self
            .client
            .get_external_metric_value(metric_name, metric_selector)
            .await?;
        let usage: i64 = points.iter().map(|p| p.value).sum();
        let timestamp = points
            .iter()
            .map(|p| p.timestamp)
            .min()
            .unwrap_or_else(|| Local::now().naive_utc());
        let (replicas, _) = self.scale_by_ratio(current_replicas, usage, target_value);
        Ok((replicas, usage, timestamp))
    }

    /// Desired replicas for an external metric divided across pods.
    pub async fn get_external_per_pod_metric_replicas(
        &self,
        status_replicas: u32,
        target_average: i64,
        metric_name: &str,
        metric_selector: Option<&Labels>,
    ) -> Result<(u32, i64, NaiveDateTime)> {
        let points = self
            .client
            .get_external_metric_value(metric_name, metric_selector)
            .await?;
        let usage: i64 = points.iter().map(|p| p.value).sum();
        let timestamp = points
            .iter()
            .map(|p| p.timestamp)
            .min()
            .unwrap_or_else(|| Local::now().naive_utc());
        let (replicas, average) =
            self.scale_by_per_pod_ratio(status_replicas, usage, target_average);
        Ok((replicas, average, timestamp))
    }

    /// Scale the current count by `usage / target`,
    /// keeping it when the ratio is within tolerance.
    fn scale_by_ratio(&self, current_replicas: u32, usage: i64, target: i64) -> (u32, f64) {
        if target == 0 {
            return (current_replicas, 1.0);
        }
        let ratio = usage as f64 / target as f64;
        if (ratio - 1.0).abs() <= self.tolerance {
            return (current_replicas, ratio);
        }
        ((ratio * current_replicas as f64).ceil() as u32, ratio)
    }

    /// Replicas needed so that `usage / replicas` approaches the
    /// per-pod target, as `(replicas, current average)`.
    fn scale_by_per_pod_ratio(
        &self,
        status_replicas: u32,
        usage: i64,
        target_average: i64,
    ) -> (u32, i64) {
        if target_average == 0 {
            return (status_replicas, usage);
        }
        let average = if status_replicas > 0 {
            usage / status_replicas as i64
        } else {
            usage
        };
        if status_replicas > 0 {
            let ratio = usage as f64 / (target_average * status_replicas as i64) as f64;
            if (ratio - 1.0).abs() <= self.tolerance {
                return (status_replicas, average);
            }
        }
        (
            (usage as f64 / target_average as f64).ceil() as u32,
            average,
        )
    }

    /// Shared average value computation for resource and pods metrics.
    async fn calc_replicas_by_value(
        &self,
        current_replicas: u32,
        target_average: i64,
        metrics: &mut PodMetricsInfo,
        namespace: &str,
        selector: &Labels,
    ) -> Result<(u32, i64, NaiveDateTime)> {
        if target_average == 0 {
            return Err(anyhow!("target average value must not be zero"));
        }
        let now = Local::now().naive_utc();
        let pods = self.get_pods(namespace, selector).await;
        if pods.is_empty() {
            return Err(anyhow!("no pods returned by selector {}", selector));
        }
        let missing_pods = self.filter_pods(metrics, &pods)?;
        if metrics.is_empty() {
            return Err(anyhow!("did not receive metrics for any ready pods"));
        }

        let usage_total: i64 = metrics.values().map(|m| m.value).sum();
        let average = usage_total / metrics.len() as i64;
        let ratio = average as f64 / target_average as f64;
        if missing_pods.is_empty() && (ratio - 1.0).abs() <= self.tolerance {
            return Ok((current_replicas, average, now));
        }

        for pod in &missing_pods {
            let value = if ratio < 1.0 { target_average } else { 0 };
            metrics.insert(
                pod.metadata.name.to_owned(),
                PodMetric {
                    timestamp: now,
                    window: 60,
                    value,
                },
            );
        }
        let new_total: i64 = metrics.values().map(|m| m.value).sum();
        let new_ratio = (new_total / metrics.len() as i64) as f64 / target_average as f64;
        let new_replicas = (new_ratio * metrics.len() as f64).ceil() as u32;
        if assumption_reverses_direction(ratio, new_ratio, new_replicas, current_replicas) {
            return Ok((current_replicas, average, now));
        }
        Ok((new_replicas, average, now))
    }

    /// Pods that have no metric sample yet. Failed and unready pods
    /// are dropped from the sample instead.
    fn filter_pods(&self, metrics: &mut PodMetricsInfo, pods: &[Pod]) -> Result<Vec<Pod>> {
        let mut missing_pods = Vec::new();
        for pod in pods {
            let status = pod
                .status
                .as_ref()
                .with_context(|| format!("Missing status for pod {}", pod.metadata.name))?;
            if metrics.get(&pod.metadata.name).is_none() {
                tracing::debug!("No metrics found for pod {}", pod.metadata.name);
                missing_pods.push(pod.to_owned());
                continue;
            }
            if status.phase == PodPhase::Failed
                || !status
                    .conditions
                    .get(&PodConditionType::Ready)
                    .map(|c| c.status)
                    .unwrap_or(false)
            {
                tracing::info!("Ignored Pod {} since it's not ready", pod.metadata.name);
                metrics.remove(&pod.metadata.name);
            }
        }
        Ok(missing_pods)
    }

    async fn get_pods(&self, namespace: &str, selector: &Labels) -> Vec<Pod> {
        self.pod_store
            .read()
            .await
            .values()
            .filter(|pod| {
                pod.metadata.namespace == namespace && pod.metadata.labels.matches(selector)
            })
            .cloned()
            .collect()
    }
}

/// Sum of the sampled usage and of the matching per-pod denominators,
/// counting only pods present in the sample.
fn usage_and_denominator(
    metrics: &PodMetricsInfo,
    pods: &[Pod],
    denominator: &impl Fn(&Pod) -> i64,
) -> (i64, i64) {
    let usage: i64 = metrics.values().map(|m| m.value).sum();
    let denominator_total: i64 = pods
        .iter()
        .filter(|pod| metrics.contains_key(&pod.metadata.name))
        .map(|pod| denominator(pod))
        .sum();
    (usage, denominator_total)
}

/// The conservative assumption for missing pods must never flip the
/// scale direction, and the rebalanced ratio must still point the
/// same way as the raw one.
fn assumption_reverses_direction(
    ratio: f64,
    new_ratio: f64,
    new_replicas: u32,
    current_replicas: u32,
) -> bool {
    (new_ratio > 1.0 && (ratio < 1.0 || new_replicas < current_replicas))
        || (new_ratio < 1.0 && (ratio > 1.0 || new_replicas > current_replicas))
}
