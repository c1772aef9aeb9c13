//! Worker capabilities and task requirements.
//!
//! A [`Platform`] is a set of `key=value` properties. A key may carry several
//! values, e.g. a worker offering both `label=linux` and `label=gpu`. Matching
//! is plain set inclusion: an offer fulfills a requirement when every required
//! property is present in the offer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// Property key carrying the worker host name.
pub const HOSTNAME_KEY: &str = "worker.hostname";

/// Property key used for routing labels.
pub const LABEL_KEY: &str = "label";

/// A single `key=value` property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Property {
    pub key: String,
    pub value: String,
}

impl Property {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl std::str::FromStr for Property {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| Error::BadRequest(format!("invalid platform property: {s:?}")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::BadRequest(format!(
                "platform property without key: {s:?}"
            )));
        }
        Ok(Property::new(key, value))
    }
}

/// Ordered, duplicate-free set of properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Platform {
    properties: Vec<Property>,
}

impl Platform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform describing the local host: os, arch, cpu count and host name.
    pub fn with_defaults() -> Self {
        let mut platform = Self::new();
        platform.add_property("node.arch", std::env::consts::ARCH);
        platform.add_property("node.os", std::env::consts::OS);
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        platform.add_property("node.cpus", cpus.to_string());
        if let Ok(name) = hostname::get() {
            platform.add_property(HOSTNAME_KEY, name.to_string_lossy());
        }
        platform
    }

    /// Build a platform from `key=value` strings, as found in configuration.
    pub fn from_properties<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut platform = Self::new();
        for entry in entries {
            let property: Property = entry.as_ref().parse()?;
            platform.insert(property);
        }
        Ok(platform)
    }

    /// Parse a comma separated list, e.g. `label=linux,node.os=linux`.
    pub fn parse_list(list: &str) -> Result<Self> {
        Self::from_properties(list.split(',').map(str::trim).filter(|s| !s.is_empty()))
    }

    pub fn add_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(Property::new(key, value));
    }

    fn insert(&mut self, property: Property) {
        if !self.properties.contains(&property) {
            self.properties.push(property);
        }
    }

    /// True if every property of `requirement` is offered by `self`.
    pub fn fulfills(&self, requirement: &Platform) -> bool {
        requirement
            .properties
            .iter()
            .all(|p| self.properties.contains(p))
    }

    /// Values declared for `key`, or `None` if the key is absent.
    pub fn properties_for_key(&self, key: &str) -> Option<Vec<&str>> {
        let values: Vec<&str> = self
            .properties
            .iter()
            .filter(|p| p.key == key)
            .map(|p| p.value.as_str())
            .collect();
        if values.is_empty() { None } else { Some(values) }
    }

    pub fn hostname(&self) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.key == HOSTNAME_KEY)
            .map(|p| p.value.as_str())
    }

    pub fn to_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for p in &self.properties {
            map.entry(p.key.clone()).or_default().push(p.value.clone());
        }
        map
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.properties.iter().map(|p| p.to_string()).collect();
        f.write_str(&joined.join(","))
    }
}

impl FromIterator<Property> for Platform {
    fn from_iter<T: IntoIterator<Item = Property>>(iter: T) -> Self {
        let mut platform = Platform::new();
        for property in iter {
            platform.insert(property);
        }
        platform
    }
}
