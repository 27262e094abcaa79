//! Decoded output of one acquisition cycle

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One decoded engineering quantity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Named values captured from one device in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedSnapshot {
    pub device: String,
    pub captured_at: DateTime<Utc>,
    pub values: BTreeMap<String, FieldValue>,
}

impl DecodedSnapshot {
    pub fn new(
        device: impl Into<String>,
        captured_at: DateTime<Utc>,
        values: BTreeMap<String, FieldValue>,
    ) -> Self {
        Self {
            device: device.into(),
            captured_at,
            values,
        }
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).map(|v| v.value)
    }

    /// Field name to bare value, the `data` object of a persisted reading
    pub fn data(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .map(|(name, v)| (name.clone(), v.value))
            .collect()
    }
}
