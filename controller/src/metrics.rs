use anyhow::{anyhow, Result};
use reqwest::Client;
use resources::{
    models::Response,
    objects::{
        metrics::{MetricPoint, PodMetric, PodMetrics, PodMetricsInfo, Resource},
        object_reference::ObjectReference,
        Labels,
    },
};

use crate::CONFIG;

/// Window reported for samples that arrive without one.
const DEFAULT_METRIC_WINDOW: u32 = 60;

pub struct MetricsClient {
    client: Client,
}

impl MetricsClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Get pod resource usage in raw value,
    /// optionally scoped to a single named container.
    pub async fn get_resource_metric_value(
        &self,
        resource: &Resource,
        selector: &Labels,
        container: Option<&str>,
    ) -> Result<PodMetricsInfo> {
        let metrics = self.get_pod_metrics(selector).await?;
        if metrics.is_empty() {
            return Err(anyhow!("No metrics found"));
        }
        let mut metric_info = PodMetricsInfo::new();
        for pod in metrics {
            if pod.containers.is_empty() {
                continue;
            }
            let mut sum = 0;
            let mut missing = false;
            let mut found_container = false;
            for c in &pod.containers {
                if let Some(name) = container {
                    if c.name != name {
                        continue;
                    }
                }
                found_container = true;
                match c.usage.get(resource) {
                    Some(usage) => sum += *usage,
                    None => {
                        tracing::debug!(
                            "Missing resource metric {} for container {} in pod {}",
                            resource,
                            c.name,
                            pod.name
                        );
                        missing = true;
                        break;
                    },
                }
            }
            if missing || !found_container {
                continue;
            }
            metric_info.insert(
                pod.name,
                PodMetric {
                    timestamp: pod.timestamp,
                    window: pod.window,
                    value: sum,
                },
            );
        }
        Ok(metric_info)
    }

    /// Get per-pod values of a custom metric.
    pub async fn get_pods_metric_value(
        &self,
        metric_name: &str,
        selector: &Labels,
    ) -> Result<PodMetricsInfo> {
        let response = self
            .client
            .get(format!(
                "{}/api/v1/metrics/pods/{}",
                CONFIG.metrics_server_url, metric_name
            ))
            .query::<Vec<(&str, String)>>(&vec![("selector", selector.to_string())])
            .send()
            .await?
            .json::<Response<Vec<MetricPoint>>>()
            .await?;
        let points = response
            .data
            .ok_or_else(|| anyhow!("Failed to get pods metric {}", metric_name))?;
        Ok(points
            .into_iter()
            .map(|point| {
                (
                    point.name,
                    PodMetric {
                        timestamp: point.timestamp,
                        window: DEFAULT_METRIC_WINDOW,
                        value: point.value,
                    },
                )
            })
            .collect())
    }

    /// Get the value of a metric describing a single object.
    pub async fn get_object_metric_value(
        &self,
        namespace: &str,
        object: &ObjectReference,
        metric_name: &str,
    ) -> Result<MetricPoint> {
        let response = self
            .client
            .get(format!(
                "{}/api/v1/namespaces/{}/metrics/{}s/{}/{}",
                CONFIG.metrics_server_url,
                namespace,
                object.kind.to_lowercase(),
                object.name,
                metric_name
            ))
            .send()
            .await?
            .json::<Response<MetricPoint>>()
            .await?;
        response.data.ok_or_else(|| {
            anyhow!(
                "Failed to get object metric {} for {}/{}",
                metric_name,
                object.kind,
                object.name
            )
        })
    }

    /// Get all series of an external metric matching the selector.
    pub async fn get_external_metric_value(
        &self,
        metric_name: &str,
        selector: Option<&Labels>,
    ) -> Result<Vec<MetricPoint>> {
        let selector = selector.map(|s| s.to_string()).unwrap_or_default();
        let response = self
            .client
            .get(format!(
                "{}/api/v1/metrics/external/{}",
                CONFIG.metrics_server_url, metric_name
            ))
            .query::<Vec<(&str, String)>>(&vec![("selector", selector)])
            .send()
            .await?
            .json::<Response<Vec<MetricPoint>>>()
            .await?;
        response
            .data
            .ok_or_else(|| anyhow!("Failed to get external metric {}", metric_name))
    }

    async fn get_pod_metrics(&self, selector: &Labels) -> Result<Vec<PodMetrics>> {
        let response = self
            .client
            .get(format!(
                "{}/api/v1/metrics/pods",
                CONFIG.metrics_server_url,
            ))
            .query::<Vec<(&str, String)>>(&vec![("selector", selector.to_string())])
            .send()
            .await?
            .json::<Response<Vec<PodMetrics>>>()
            .await?;
        match response.data {
            Some(data) => Ok(data),
            None => Err(anyhow!("Failed to get pod metrics")),
        }
    }
}
