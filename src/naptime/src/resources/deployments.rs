use super::state::{self, OriginalStateEntry};
use super::{filters, ignore_not_found, ResourceClient, Suspendable, LIST_PAGE_LIMIT};
use controller_core::{Error, Result};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, PostParams, ResourceExt};
use std::collections::HashMap;
use tracing::{debug, info};

/// Deployments sleep by scaling to zero replicas and wake by restoring the
/// recorded replica count.
pub struct Deployments {
    api: Api<Deployment>,
    data: Vec<Deployment>,
    original_replicas: HashMap<String, i32>,
    to_suspend: bool,
}

impl Deployments {
    pub async fn load(res: &ResourceClient, original_replicas: HashMap<String, i32>) -> Result<Self> {
        let api: Api<Deployment> = Api::namespaced(res.client.clone(), &res.namespace);
        let to_suspend = res.schedule.is_deployments_to_suspend();
        if !to_suspend {
            return Ok(Self {
                api,
                data: Vec::new(),
                original_replicas,
                to_suspend,
            });
        }

        let list = api
            .list(&ListParams::default().limit(LIST_PAGE_LIMIT))
            .await
            .map_err(Error::KubeError)?;
        debug!(
            "found {} deployments in namespace {}",
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
            original_replicas,
            to_suspend,
        })
    }

    async fn apply(&self, name: &str, desired: &Deployment) -> Result<()> {
        // replace carries the resourceVersion read at list time, so a
        // concurrent modification surfaces as a 409 conflict instead of
        // being overwritten
        match ignore_not_found(self.api.replace(name, &PostParams::default(), desired).await) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                info!("deployment {} vanished before the update", name);
                Ok(())
            }
            Err(err) => Err(Error::KubeError(err)),
        }
    }
}

#[async_trait]
impl Suspendable for Deployments {
    fn has_resource(&self) -> bool {
        !self.data.is_empty()
    }

    async fn sleep(&self) -> Result<()> {
        for resource in &self.data {
            let name = resource.name_any();
            let Some(desired) = scaled_for_sleep(resource) else {
                info!("deployment {} is already scaled to zero", name);
                continue;
            };
            info!("scaling deployment {} to zero", name);
            self.apply(&name, &desired).await?;
        }
        Ok(())
    }

    async fn wake_up(&self) -> Result<()> {
        for resource in &self.data {
            let name = resource.name_any();
            let original = self.original_replicas.get(&name).copied();
            let Some(desired) = scaled_for_wake(resource, original) else {
                continue;
            };
            info!(
                "restoring deployment {} to {} replicas",
                name,
                original.unwrap_or(1),
            );
            self.apply(&name, &desired).await?;
        }
        Ok(())
    }

    fn original_info_to_save(&self) -> Result<Option<String>> {
        if !self.to_suspend {
            return Ok(None);
        }
        let entries = original_entries(&self.data, &self.original_replicas);
        if entries.is_empty() {
            return Ok(None);
        }
        state::encode(&entries).map(Some)
    }
}

/// Decodes a persisted replicas blob; absent input yields an empty mapping.
pub fn original_info_to_restore(data: Option<&str>) -> Result<HashMap<String, i32>> {
    state::decode(data)
}

// An unset replicas field means one running replica.
fn scaled_for_sleep(resource: &Deployment) -> Option<Deployment> {
    let current = resource.spec.as_ref()?.replicas.unwrap_or(1);
    if current == 0 {
        return None;
    }
    let mut desired = resource.clone();
    desired.spec.as_mut()?.replicas = Some(0);
    Some(desired)
}

fn scaled_for_wake(resource: &Deployment, original: Option<i32>) -> Option<Deployment> {
    let current = resource.spec.as_ref()?.replicas.unwrap_or(1);
    if current != 0 {
        return None;
    }
    let target = original.unwrap_or(1);
    if target == 0 {
        return None;
    }
    let mut desired = resource.clone();
    desired.spec.as_mut()?.replicas = Some(target);
    Some(desired)
}

/// One entry per instance that sleep mutates this cycle, keeping the value
/// restored from a previous cycle for instances already at zero so repeated
/// sleeps never overwrite a recorded count with zero.
fn original_entries(
    data: &[Deployment],
    restored: &HashMap<String, i32>,
) -> Vec<OriginalStateEntry<i32>> {
    let mut entries = Vec::new();
    for resource in data {
        let name = resource.name_any();
        let current = resource.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let value = if current > 0 {
            current
        } else {
            match restored.get(&name) {
                Some(&replicas) if replicas > 0 => replicas,
                _ => continue,
            }
        };
        entries.push(OriginalStateEntry { name, value });
    }
    entries
}
