use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{metrics::Resource, Metadata, Object};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Pod {
    pub metadata: Metadata,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: Option<PodStatus>,
}

impl Object for Pod {
    fn kind(&self) -> &'static str {
        "Pod"
    }

    fn resource() -> &'static str {
        "pods"
    }

    fn name(&self) -> &String {
        &self.metadata.name
    }

    fn namespace(&self) -> &String {
        &self.metadata.namespace
    }
}

impl Pod {
    /// Sum of the resource requests over all containers, in milli-units.
    pub fn requests(&self, resource: &Resource) -> i64 {
        self.spec
            .containers
            .iter()
            .map(|c| c.requests(resource))
            .sum()
    }

    /// Sum of the resource limits over all containers, in milli-units.
    pub fn limits(&self, resource: &Resource) -> i64 {
        self.spec
            .containers
            .iter()
            .map(|c| c.limits(resource))
            .sum()
    }

    /// Request of a single named container, in milli-units.
    pub fn container_requests(&self, container: &str, resource: &Resource) -> i64 {
        self.spec
            .containers
            .iter()
            .filter(|c| c.name == container)
            .map(|c| c.requests(resource))
            .sum()
    }

    /// Limit of a single named container, in milli-units.
    pub fn container_limits(&self, container: &str, resource: &Resource) -> i64 {
        self.spec
            .containers
            .iter()
            .filter(|c| c.name == container)
            .map(|c| c.limits(resource))
            .sum()
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|status| {
                status.phase == PodPhase::Running
                    && status
                        .conditions
                        .get(&PodConditionType::Ready)
                        .map(|c| c.status)
                        .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodSpec {
    /// List of containers belonging to the pod.
    /// There must be at least one container in a Pod.
    pub containers: Vec<Container>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Container {
    /// Name of the container specified as a DNS_LABEL.
    /// Each container in a pod must have a unique name.
    pub name: String,
    /// Docker image name.
    pub image: String,
    /// Compute resources required by this container.
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl Container {
    pub fn requests(&self, resource: &Resource) -> i64 {
        self.resources.requests.get(resource).copied().unwrap_or(0)
    }

    pub fn limits(&self, resource: &Resource) -> i64 {
        self.resources.limits.get(resource).copied().unwrap_or(0)
    }
}

/// Requests and limits per resource,
/// CPU in milli-cores and memory in megabytes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: HashMap<Resource, i64>,
    #[serde(default)]
    pub limits: HashMap<Resource, i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodStatus {
    pub phase: PodPhase,
    #[serde(default)]
    pub conditions: HashMap<PodConditionType, PodCondition>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub enum PodConditionType {
    Ready,
    ContainersReady,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodCondition {
    pub status: bool,
}
