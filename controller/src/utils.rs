use std::collections::HashMap;

use anyhow::{anyhow, Error, Result};
use reqwest::Url;
use resources::{
    informer::{ListerWatcher, WsStream},
    models::Response,
    objects::{gpa::GeneralPodAutoscaler, scale::Scale, Labels, Object},
};
use serde_json::json;
use tokio_tungstenite::connect_async;

use crate::CONFIG;

pub fn create_lister_watcher<T: Object>(path: String) -> ListerWatcher<T> {
    let list_url = format!("{}/api/v1/{}", CONFIG.api_server_url, path);
    let watch_url = format!("{}/api/v1/watch/{}", CONFIG.api_server_watch_url, path);
    ListerWatcher {
        lister: Box::new(move |_| {
            let list_url = list_url.clone();
            Box::pin(async {
                let res = reqwest::get(list_url)
                    .await?
                    .json::<Response<Vec<T>>>()
                    .await?;
                let res = res.data.ok_or_else(|| anyhow!("Lister failed"))?;
                Ok::<Vec<T>, Error>(res)
            })
        }),
        watcher: Box::new(move |_| {
            let watch_url = watch_url.clone();
            Box::pin(async move {
                let url = Url::parse(watch_url.as_str())?;
                let (stream, _) = connect_async(url).await?;
                Ok::<WsStream, Error>(stream)
            })
        }),
    }
}

/// Splits a work queue key into namespace and name.
pub fn split_meta_namespace_key(key: &str) -> Result<(String, String)> {
    key.split_once('/')
        .map(|(namespace, name)| (namespace.to_string(), name.to_string()))
        .ok_or_else(|| anyhow!("Unexpected key format: {}", key))
}

/// Resolves a target kind to the plural resources carrying
/// a scale subresource.
pub struct RestMapper {
    mappings: HashMap<&'static str, Vec<&'static str>>,
}

impl RestMapper {
    pub fn new() -> Self {
        let mut mappings = HashMap::new();
        mappings.insert("ReplicaSet", vec!["replicasets"]);
        mappings.insert("Deployment", vec!["deployments"]);
        mappings.insert("StatefulSet", vec!["statefulsets"]);
        Self {
            mappings,
        }
    }

    pub fn rest_mappings(&self, kind: &str) -> Result<Vec<String>> {
        self.mappings
            .get(kind)
            .map(|resources| resources.iter().map(|r| r.to_string()).collect())
            .ok_or_else(|| anyhow!("no matches for kind {}", kind))
    }
}

pub async fn get_scale(namespace: &str, resource: &str, name: &str) -> Result<Scale> {
    let response = reqwest::get(format!(
        "{}/api/v1/namespaces/{}/{}/{}/scale",
        CONFIG.api_server_url, namespace, resource, name
    ))
    .await?
    .json::<Response<Scale>>()
    .await?;
    response
        .data
        .ok_or_else(|| anyhow!("Failed to get scale for {}/{}", namespace, name))
}

pub async fn update_scale(
    namespace: &str,
    resource: &str,
    name: &str,
    scale: &Scale,
) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .put(format!(
            "{}/api/v1/namespaces/{}/{}/{}/scale",
            CONFIG.api_server_url, namespace, resource, name
        ))
        .json(scale)
        .send()
        .await?
        .json::<Response<()>>()
        .await?;
    if let Some(msg) = response.msg {
        tracing::info!("{}", msg);
    }
    Ok(())
}

pub async fn update_gpa_status(gpa: &GeneralPodAutoscaler) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .put(format!("{}{}/status", CONFIG.api_server_url, gpa.uri()))
        .json(gpa)
        .send()
        .await?
        .json::<Response<()>>()
        .await?;
    if let Some(msg) = response.msg {
        tracing::info!("{}", msg);
    }
    Ok(())
}

/// Merges the labels into the GPA object, best effort.
pub async fn patch_gpa_labels(gpa: &GeneralPodAutoscaler, labels: &Labels) -> Result<()> {
    if labels.is_empty() {
        return Ok(());
    }
    if labels.iter().all(|(key, value)| {
        gpa.metadata.labels.get(key) == Some(value)
    }) {
        return Ok(());
    }
    let patch = json!({ "metadata": { "labels": labels } });
    let client = reqwest::Client::new();
    let response = client
        .patch(format!("{}{}", CONFIG.api_server_url, gpa.uri()))
        .json(&patch)
        .send()
        .await?
        .json::<Response<()>>()
        .await?;
    if let Some(msg) = response.msg {
        tracing::info!("{}", msg);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub enum EventType {
    Normal,
    Warning,
}

/// Emits structured controller events for an object.
pub struct EventRecorder;

impl EventRecorder {
    pub fn event<T: Object>(&self, object: &T, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => {
                tracing::info!(object = %object.store_key(), reason = reason, "{}", message)
            },
            EventType::Warning => {
                tracing::warn!(object = %object.store_key(), reason = reason, "{}", message)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_key() -> Result<()> {
        let (namespace, name) = split_meta_namespace_key("default/squad")?;
        assert_eq!(namespace, "default");
        assert_eq!(name, "squad");
        assert!(split_meta_namespace_key("squad").is_err());
        Ok(())
    }

    #[test]
    fn rest_mapper_resolves_known_kinds() {
        let mapper = RestMapper::new();
        assert_eq!(
            mapper.rest_mappings("ReplicaSet").unwrap(),
            vec!["replicasets".to_string()]
        );
        assert!(mapper.rest_mappings("CronJob").is_err());
    }
}
