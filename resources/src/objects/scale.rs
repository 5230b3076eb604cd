use serde::{Deserialize, Serialize};

use super::{Metadata, Object};

/// The replica count handle of a scalable workload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Scale {
    pub metadata: Metadata,
    pub spec: ScaleSpec,
    #[serde(default)]
    pub status: ScaleStatus,
}

impl Object for Scale {
    fn kind(&self) -> &'static str {
        "Scale"
    }

    fn resource() -> &'static str {
        "scales"
    }

    fn name(&self) -> &String {
        &self.metadata.name
    }

    fn namespace(&self) -> &String {
        &self.metadata.namespace
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ScaleSpec {
    /// Desired number of instances for the scaled object.
    pub replicas: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ScaleStatus {
    /// Actual number of observed instances of the scaled object.
    #[serde(default)]
    pub replicas: u32,
    /// Label query over the pods that should match the replica count,
    /// in the form `key1=value1,key2=value2`.
    #[serde(default)]
    pub selector: String,
}
