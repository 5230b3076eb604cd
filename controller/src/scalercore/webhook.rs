use std::collections::HashMap;

use anyhow::{anyhow, Result};
use resources::objects::gpa::{GeneralPodAutoscaler, WebhookMode};
use serde::{Deserialize, Serialize};

/// Asks an external endpoint for the desired replica count.
pub struct WebhookScaler {
    mode: WebhookMode,
}

#[derive(Debug, Serialize)]
struct RequestBody {
    request: AutoscaleRequest,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AutoscaleRequest {
    uid: String,
    name: String,
    namespace: String,
    parameters: HashMap<String, String>,
    current_replicas: u32,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    response: Option<AutoscaleResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutoscaleResponse {
    #[allow(dead_code)]
    #[serde(default)]
    uid: String,
    scale: bool,
    #[serde(default)]
    replicas: u32,
}

impl WebhookScaler {
    pub fn new(mode: WebhookMode) -> Self {
        Self {
            mode,
        }
    }

    pub async fn get_replicas(
        &self,
        gpa: &GeneralPodAutoscaler,
        current_replicas: u32,
    ) -> Result<u32> {
        let url = self.resolve_url()?;
        let body = RequestBody {
            request: AutoscaleRequest {
                uid: gpa.metadata.uid.clone().unwrap_or_default(),
                name: gpa.metadata.name.clone(),
                namespace: gpa.metadata.namespace.clone(),
                parameters: self.mode.parameters.clone(),
                current_replicas,
            },
        };
        let response = reqwest::Client::new()
            .post(url)
            .json(&body)
            .send()
            .await?
            .json::<ResponseBody>()
            .await?;
        match response.response {
            Some(review) if review.scale => Ok(review.replicas),
            _ => {
                tracing::debug!(
                    "Webhook declined to scale {}, keeping {} replicas",
                    gpa.metadata.name,
                    current_replicas
                );
                Ok(current_replicas)
            },
        }
    }

    fn resolve_url(&self) -> Result<String> {
        if let Some(url) = &self.mode.url {
            return Ok(url.clone());
        }
        let service = self
            .mode
            .service
            .as_ref()
            .ok_or_else(|| anyhow!("webhook has neither url nor service"))?;
        Ok(format!(
            "http://{}.{}:{}{}",
            service.name,
            service.namespace,
            service.port.unwrap_or(80),
            service.path.clone().unwrap_or_default()
        ))
    }
}

#[cfg(test)]
mod tests {
    use resources::objects::gpa::ServiceRef;

    use super::*;

    #[test]
    fn service_reference_builds_url() {
        let scaler = WebhookScaler::new(WebhookMode {
            url: None,
            service: Some(ServiceRef {
                namespace: "default".to_string(),
                name: "sizer".to_string(),
                port: Some(8000),
                path: Some("/scale".to_string()),
            }),
            parameters: HashMap::new(),
        });
        assert_eq!(
            scaler.resolve_url().unwrap(),
            "http://sizer.default:8000/scale"
        );
    }

    #[test]
    fn missing_url_and_service_is_an_error() {
        let scaler = WebhookScaler::new(WebhookMode {
            url: None,
            service: None,
            parameters: HashMap::new(),
        });
        assert!(scaler.resolve_url().is_err());
    }
}
