use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub static SCHEDULE_FINALIZER: &str = "sleepschedules.naptime.dev";

/// `FilterRef` selects workload instances by kind and API version plus either
/// an exact name or a set of labels that must all be present and equal.
/// A rule with neither a name nor labels matches nothing.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub match_labels: Option<BTreeMap<String, String>>,
}

impl FilterRef {
    /// Kind and API version are compared case-sensitively; only then is the
    /// name or label criterion evaluated.
    pub fn matches(
        &self,
        kind: &str,
        api_version: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> bool {
        if self.kind != kind || self.api_version != api_version {
            return false;
        }
        if let Some(rule_name) = &self.name {
            if !rule_name.is_empty() && rule_name == name {
                return true;
            }
        }
        label_match(labels, self.match_labels.as_ref())
    }
}

// An empty matchLabels map never matches, otherwise an empty rule would
// select every instance of the kind.
fn label_match(labels: &BTreeMap<String, String>, match_labels: Option<&BTreeMap<String, String>>) -> bool {
    let Some(match_labels) = match_labels else {
        return false;
    };
    if match_labels.is_empty() {
        return false;
    }
    match_labels.iter().all(|(key, value)| labels.get(key) == Some(value))
}

/// The action the controller applies to the workloads of a namespace.
#[derive(Deserialize, Serialize, Copy, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ScheduleOperation {
    Sleep,
    WakeUp,
}

/// `SleepSchedule` puts the workloads of its namespace to sleep on a cron
/// schedule and optionally wakes them back up on another one.
/// Deployments are scaled to zero, CronJobs are suspended and DaemonSets get
/// a node selector no node can satisfy; the prior configuration is kept in
/// the status so wake-up restores it exactly.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    kind = "SleepSchedule",
    group = "naptime.dev",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "SleepScheduleStatus", shortname = "nap")]
#[serde(rename_all = "camelCase")]
pub struct SleepScheduleSpec {
    /// Cron expression for the sleep action.
    pub sleep_schedule: String,
    /// Cron expression for the wake action. Absent means sleep only.
    #[serde(default)]
    pub wake_schedule: Option<String>,
    /// IANA time zone name or fixed offset (for example `Europe/Kyiv`,
    /// `+03:00`). Defaults to UTC.
    #[serde(default)]
    pub time_zone: Option<String>,
    /// Workloads matching any of these rules are never touched.
    #[serde(default)]
    pub exclude_ref: Option<Vec<FilterRef>>,
    /// When non-empty, only workloads matching at least one rule are in scope.
    #[serde(default)]
    pub include_ref: Option<Vec<FilterRef>>,
    #[serde(default)]
    pub suspend_deployments: Option<bool>,
    #[serde(default)]
    pub suspend_cron_jobs: Option<bool>,
    #[serde(default)]
    pub suspend_daemon_sets: Option<bool>,
}

/// The status object of `SleepSchedule`: the persisted execution memory of
/// the engine. `original_resource_info` holds one encoded blob per workload
/// kind, keyed by a stable identifier, and must survive controller restarts.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SleepScheduleStatus {
    pub last_schedule_time: Option<DateTime<Utc>>,
    pub operation: Option<ScheduleOperation>,
    pub original_resource_info: Option<BTreeMap<String, String>>,
}

impl SleepSchedule {
    pub fn is_deployments_to_suspend(&self) -> bool {
        self.spec.suspend_deployments.unwrap_or(true)
    }

    pub fn is_cron_jobs_to_suspend(&self) -> bool {
        self.spec.suspend_cron_jobs.unwrap_or(false)
    }

    pub fn is_daemon_sets_to_suspend(&self) -> bool {
        self.spec.suspend_daemon_sets.unwrap_or(false)
    }

    pub fn exclude_refs(&self) -> &[FilterRef] {
        self.spec.exclude_ref.as_deref().unwrap_or_default()
    }

    pub fn include_refs(&self) -> &[FilterRef] {
        self.spec.include_ref.as_deref().unwrap_or_default()
    }

    pub fn last_schedule_time(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.last_schedule_time)
    }

    pub fn last_operation(&self) -> Option<ScheduleOperation> {
        self.status.as_ref().and_then(|s| s.operation)
    }

    pub fn original_resource_info(&self) -> Option<&BTreeMap<String, String>> {
        self.status.as_ref().and_then(|s| s.original_resource_info.as_ref())
    }
}
