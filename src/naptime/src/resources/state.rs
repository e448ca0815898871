use controller_core::{Error, Result};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;

/// One workload instance's pre-sleep value. The value shape is kind
/// specific: a replica count for Deployments, a suspend flag for CronJobs,
/// a node selector map for DaemonSets.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OriginalStateEntry<V> {
    pub name: String,
    pub value: V,
}

/// Serializes original-state entries to the blob persisted in the
/// `SleepSchedule` status.
pub fn encode<V: Serialize>(entries: &[OriginalStateEntry<V>]) -> Result<String> {
    serde_json::to_string(entries).map_err(Error::SerializationError)
}

/// Rebuilds the name-keyed mapping from a persisted blob. Absent or empty
/// input yields an empty mapping so a namespace with no prior sleep cycle
/// restores cleanly; malformed input is a corruption signal and fails.
/// Duplicate names collapse to the last-written value.
pub fn decode<V: DeserializeOwned>(data: Option<&str>) -> Result<HashMap<String, V>> {
    let Some(data) = data else {
        return Ok(HashMap::new());
    };
    if data.is_empty() {
        return Ok(HashMap::new());
    }
    let entries: Vec<OriginalStateEntry<V>> =
        serde_json::from_str(data).map_err(Error::SerializationError)?;
    let mut restored = HashMap::with_capacity(entries.len());
    for entry in entries {
        if !entry.name.is_empty() {
            restored.insert(entry.name, entry.value);
        }
    }
    Ok(restored)
}
