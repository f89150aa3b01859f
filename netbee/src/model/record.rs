use std::{collections::BTreeMap, fmt, net::Ipv4Addr};

use serde::{Deserialize, Serialize};

/// A typed label or user-attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Str(String),
}

impl AttrValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Uint(v) => i64::try_from(*v).ok(),
            AttrValue::Str(s) => s.parse().ok(),
            AttrValue::Bool(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttrValue::Int(v) => u64::try_from(*v).ok(),
            AttrValue::Uint(v) => Some(*v),
            AttrValue::Str(s) => s.parse().ok(),
            AttrValue::Bool(_) => None,
        }
    }

    /// Addresses arrive either as dotted strings or as a host-order `u32`.
    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        match self {
            AttrValue::Str(s) => s.parse().ok(),
            other => other.as_u64().and_then(|v| u32::try_from(v).ok()).map(Ipv4Addr::from),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{}", v),
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Uint(v) => write!(f, "{}", v),
            AttrValue::Str(v) => write!(f, "{}", v),
        }
    }
}

/// Ordered label map. Later writes replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeMap(BTreeMap<String, AttrValue>);

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_int(&mut self, key: &str, value: i64) {
        self.0.insert(key.to_string(), AttrValue::Int(value));
    }

    pub fn add_str(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), AttrValue::Str(value.into()));
    }

    pub fn add_bool(&mut self, key: &str, value: bool) {
        self.0.insert(key.to_string(), AttrValue::Bool(value));
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.get(key)
    }

    pub fn get_int(&self, key: &str) -> i64 {
        self.get(key).and_then(AttrValue::as_i64).unwrap_or(0)
    }

    pub fn get_str(&self, key: &str) -> &str {
        match self.get(key) {
            Some(AttrValue::Str(s)) => s,
            _ => "",
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some(AttrValue::Bool(true)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Copy every entry of `other` over this map.
    pub fn merge(&mut self, other: &AttributeMap) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }
}

/// One output record: named gauges, labels and a start timestamp in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataGroup {
    pub name: String,
    pub values: BTreeMap<String, i64>,
    pub labels: AttributeMap,
    pub timestamp: u64,
}

impl DataGroup {
    pub fn new(name: &str, labels: AttributeMap, timestamp: u64) -> Self {
        Self {
            name: name.to_string(),
            values: BTreeMap::new(),
            labels,
            timestamp,
        }
    }

    pub fn set_value(&mut self, name: &str, value: i64) {
        self.values.insert(name.to_string(), value);
    }

    pub fn value(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }
}

impl fmt::Display for DataGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ts={}", self.name, self.timestamp)?;
        for (k, v) in &self.values {
            write!(f, " {}={}", k, v)?;
        }
        for (k, v) in self.labels.iter() {
            write!(f, " {}={}", k, v)?;
        }
        Ok(())
    }
}
