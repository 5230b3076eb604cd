use std::{
    collections::{btree_map, BTreeMap, HashMap},
    fmt::{self, Display},
    str::FromStr,
};

use anyhow::anyhow;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use self::object_reference::ObjectReference;

pub mod gpa;
pub mod metrics;
pub mod object_reference;
pub mod pod;
pub mod scale;

pub trait Object:
    Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn kind(&self) -> &'static str;
    /// Plural resource name used in API paths.
    fn resource() -> &'static str;
    fn name(&self) -> &String;
    fn namespace(&self) -> &String;

    /// Key under which the object is stored and enqueued.
    fn store_key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    fn uri(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/{}/{}",
            self.namespace(),
            Self::resource(),
            self.name()
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Metadata {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<ObjectReference>,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// A set of key value pairs, doubling as a label selector.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Labels(pub BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Labels(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.0.insert(key, value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    /// Whether all pairs of the selector are present in this label set.
    pub fn matches(&self, selector: &Labels) -> bool {
        selector
            .iter()
            .all(|(key, value)| self.get(key) == Some(value))
    }
}

impl Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs = self
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        write!(f, "{}", pairs.join(","))
    }
}

impl FromStr for Labels {
    type Err = anyhow::Error;

    /// Parses a selector of the form `key1=value1,key2=value2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut labels = BTreeMap::new();
        if s.trim().is_empty() {
            return Ok(Labels(labels));
        }
        for pair in s.split(',') {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("Invalid selector segment: {}", pair))?;
            if key.trim().is_empty() {
                return Err(anyhow!("Invalid selector segment: {}", pair));
            }
            labels.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Labels(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_round_trip() -> anyhow::Result<()> {
        let labels: Labels = "app=game,tier=backend".parse()?;
        assert_eq!(labels.get("app"), Some(&"game".to_string()));
        assert_eq!(labels.to_string(), "app=game,tier=backend");
        Ok(())
    }

    #[test]
    fn selector_rejects_garbage() {
        assert!("app game".parse::<Labels>().is_err());
        assert!("=x".parse::<Labels>().is_err());
    }

    #[test]
    fn selector_matching() {
        let labels: Labels = "app=game,tier=backend".parse().unwrap();
        let selector: Labels = "app=game".parse().unwrap();
        assert!(labels.matches(&selector));
        assert!(!labels.matches(&"app=web".parse().unwrap()));
        assert!(labels.matches(&Labels::new()));
    }
}
