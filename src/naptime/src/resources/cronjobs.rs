use super::state::{self, OriginalStateEntry};
use super::{filters, ignore_not_found, ResourceClient, Suspendable, LIST_PAGE_LIMIT};
use controller_core::{Error, Result};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::CronJob;
use kube::api::{Api, ListParams, PostParams, ResourceExt};
use std::collections::HashMap;
use tracing::{debug, info};

/// CronJobs sleep by setting the suspend flag and wake by restoring the
/// recorded prior value.
pub struct CronJobs {
    api: Api<CronJob>,
    data: Vec<CronJob>,
    original_suspended: HashMap<String, bool>,
    to_suspend: bool,
}

impl CronJobs {
    pub async fn load(res: &ResourceClient, original_suspended: HashMap<String, bool>) -> Result<Self> {
        let api: Api<CronJob> = Api::namespaced(res.client.clone(), &res.namespace);
        let to_suspend = res.schedule.is_cron_jobs_to_suspend();
        if !to_suspend {
            return Ok(Self {
                api,
                data: Vec::new(),
                original_suspended,
                to_suspend,
            });
        }

        let list = api
            .list(&ListParams::default().limit(LIST_PAGE_LIMIT))
            .await
            .map_err(Error::KubeError)?;
        debug!(
            "found {} cronjobs in namespace {}",
            list.items.len(),
            res.namespace,
        );
        let data = list
            .items
            .into_iter()
            .filter(|resource| filters::in_scope(resource, &res.schedule))
            .collect();
        Ok(Self {
            api,
            data,
            original_suspended,
            to_suspend,
        })
    }

    async fn apply(&self, name: &str, desired: &CronJob) -> Result<()> {
        match ignore_not_found(self.api.replace(name, &PostParams::default(), desired).await) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                info!("cronjob {} vanished before the update", name);
                Ok(())
            }
            Err(err) => Err(Error::KubeError(err)),
        }
    }
}

#[async_trait]
impl Suspendable for CronJobs {
    fn has_resource(&self) -> bool {
        !self.data.is_empty()
    }

    async fn sleep(&self) -> Result<()> {
        for resource in &self.data {
            let name = resource.name_any();
            let Some(desired) = suspended_for_sleep(resource) else {
                info!("cronjob {} is already suspended", name);
                continue;
            };
            info!("suspending cronjob {}", name);
            self.apply(&name, &desired).await?;
        }
        Ok(())
    }

    async fn wake_up(&self) -> Result<()> {
        for resource in &self.data {
            let name = resource.name_any();
            let original = self.original_suspended.get(&name).copied();
            let Some(desired) = resumed_for_wake(resource, original) else {
                continue;
            };
            info!("resuming cronjob {}", name);
            self.apply(&name, &desired).await?;
        }
        Ok(())
    }

    fn original_info_to_save(&self) -> Result<Option<String>> {
        if !self.to_suspend {
            return Ok(None);
        }
        let entries = original_entries(&self.data, &self.original_suspended);
        if entries.is_empty() {
            return Ok(None);
        }
        state::encode(&entries).map(Some)
    }
}

/// Decodes a persisted suspend-flag blob; absent input yields an empty mapping.
pub fn original_info_to_restore(data: Option<&str>) -> Result<HashMap<String, bool>> {
    state::decode(data)
}

fn suspended_for_sleep(resource: &CronJob) -> Option<CronJob> {
    let current = resource.spec.as_ref()?.suspend.unwrap_or(false);
    if current {
        return None;
    }
    let mut desired = resource.clone();
    desired.spec.as_mut()?.suspend = Some(true);
    Some(desired)
}

fn resumed_for_wake(resource: &CronJob, original: Option<bool>) -> Option<CronJob> {
    let current = resource.spec.as_ref()?.suspend.unwrap_or(false);
    if !current {
        return None;
    }
    let target = original.unwrap_or(false);
    if target == current {
        return None;
    }
    let mut desired = resource.clone();
    desired.spec.as_mut()?.suspend = Some(target);
    Some(desired)
}

/// Entries for the cronjobs sleep mutates this cycle; cronjobs found already
/// suspended keep a value restored from a previous cycle instead of being
/// re-recorded as suspended.
fn original_entries(
    data: &[CronJob],
    restored: &HashMap<String, bool>,
) -> Vec<OriginalStateEntry<bool>> {
    let mut entries = Vec::new();
    for resource in data {
        let name = resource.name_any();
        let current = resource.spec.as_ref().and_then(|s| s.suspend).unwrap_or(false);
        let value = if !current {
            false
        } else {
            match restored.get(&name) {
                Some(&prior) => prior,
                None => continue,
            }
        };
        entries.push(OriginalStateEntry { name, value });
    }
    entries
}
