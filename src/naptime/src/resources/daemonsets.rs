use super::state::{self, OriginalStateEntry};
use super::{filters, ignore_not_found, ResourceClient, Suspendable, LIST_PAGE_LIMIT};
use controller_core::{Error, Result};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::{Api, ListParams, PostParams, ResourceExt};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// A pod-template node selector no node can satisfy, keeping the scheduler
/// from placing any pod while the DaemonSet object itself stays untouched.
static SLEEPING_NODE_SELECTOR: Lazy<BTreeMap<String, String>> = Lazy::new(|| {
    BTreeMap::from([("non-existing-node-selector".to_string(), "true".to_string())])
});

type NodeSelector = BTreeMap<String, String>;

/// DaemonSets sleep by merging the disabling marker into the pod-template
/// node selector and wake by restoring the recorded original selector.
pub struct DaemonSets {
    api: Api<DaemonSet>,
    data: Vec<DaemonSet>,
    original_selectors: HashMap<String, Option<NodeSelector>>,
    to_suspend: bool,
}

impl DaemonSets {
    pub async fn load(
        res: &ResourceClient,
        original_selectors: HashMap<String, Option<NodeSelector>>,
    ) -> Result<Self> {
        let api: Api<DaemonSet> = Api::namespaced(res.client.clone(), &res.namespace);
        let to_suspend = res.schedule.is_daemon_sets_to_suspend();
        if !to_suspend {
            return Ok(Self {
                api,
                data: Vec::new(),
                original_selectors,
                to_suspend,
            });
        }

        let list = api
            .list(&ListParams::default().limit(LIST_PAGE_LIMIT))
            .await
            .map_err(Error::KubeError)?;
        debug!(
            "found {} daemonsets in namespace {}",
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
            original_selectors,
            to_suspend,
        })
    }

    async fn apply(&self, name: &str, desired: &DaemonSet) -> Result<()> {
        match ignore_not_found(self.api.replace(name, &PostParams::default(), desired).await) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                info!("daemonset {} vanished before the update", name);
                Ok(())
            }
            Err(err) => Err(Error::KubeError(err)),
        }
    }
}

#[async_trait]
impl Suspendable for DaemonSets {
    fn has_resource(&self) -> bool {
        !self.data.is_empty()
    }

    async fn sleep(&self) -> Result<()> {
        for resource in &self.data {
            let name = resource.name_any();
            let Some(desired) = selector_for_sleep(resource) else {
                info!("daemonset {} is already unschedulable", name);
                continue;
            };
            info!("making daemonset {} unschedulable", name);
            self.apply(&name, &desired).await?;
        }
        Ok(())
    }

    async fn wake_up(&self) -> Result<()> {
        for resource in &self.data {
            let name = resource.name_any();
            let original = self.original_selectors.get(&name);
            let Some(desired) = selector_for_wake(resource, original) else {
                continue;
            };
            info!("restoring node selector of daemonset {}", name);
            self.apply(&name, &desired).await?;
        }
        Ok(())
    }

    fn original_info_to_save(&self) -> Result<Option<String>> {
        if !self.to_suspend {
            return Ok(None);
        }
        let entries = original_entries(&self.data, &self.original_selectors);
        if entries.is_empty() {
            return Ok(None);
        }
        state::encode(&entries).map(Some)
    }
}

/// Decodes a persisted node-selector blob; a null value records "had no
/// selector at all".
pub fn original_info_to_restore(data: Option<&str>) -> Result<HashMap<String, Option<NodeSelector>>> {
    state::decode(data)
}

fn node_selector_of(resource: &DaemonSet) -> Option<&NodeSelector> {
    resource
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .node_selector
        .as_ref()
}

fn is_sleeping(selector: Option<&NodeSelector>) -> bool {
    selector.is_some_and(|selector| {
        SLEEPING_NODE_SELECTOR.keys().all(|key| selector.contains_key(key))
    })
}

fn selector_for_sleep(resource: &DaemonSet) -> Option<DaemonSet> {
    if is_sleeping(node_selector_of(resource)) {
        return None;
    }
    let mut desired = resource.clone();
    let pod_spec = desired
        .spec
        .as_mut()?
        .template
        .spec
        .get_or_insert_with(Default::default);
    let selector = pod_spec.node_selector.get_or_insert_with(Default::default);
    for (key, value) in SLEEPING_NODE_SELECTOR.iter() {
        selector.insert(key.clone(), value.clone());
    }
    Some(desired)
}

fn selector_for_wake(resource: &DaemonSet, original: Option<&Option<NodeSelector>>) -> Option<DaemonSet> {
    let current = node_selector_of(resource)?;
    if !is_sleeping(Some(current)) {
        return None;
    }
    // Without a record, stripping the marker from the observed selector
    // still yields the pre-sleep configuration.
    let mut target = match original {
        Some(Some(original)) => original.clone(),
        Some(None) => NodeSelector::new(),
        None => current.clone(),
    };
    for key in SLEEPING_NODE_SELECTOR.keys() {
        target.remove(key);
    }
    let mut desired = resource.clone();
    let pod_spec = desired
        .spec
        .as_mut()?
        .template
        .spec
        .get_or_insert_with(Default::default);
    pod_spec.node_selector = (!target.is_empty()).then_some(target);
    Some(desired)
}

/// Entries record the selector each instance had before the marker was
/// merged in; instances found already asleep keep the selector restored from
/// a previous cycle so the marker itself is never recorded as original.
fn original_entries(
    data: &[DaemonSet],
    restored: &HashMap<String, Option<NodeSelector>>,
) -> Vec<OriginalStateEntry<Option<NodeSelector>>> {
    let mut entries = Vec::new();
    for resource in data {
        let name = resource.name_any();
        let current = node_selector_of(resource);
        let value = if !is_sleeping(current) {
            current.cloned()
        } else {
            match restored.get(&name) {
                Some(original) => original.clone(),
                None => continue,
            }
        };
        entries.push(OriginalStateEntry { name, value });
    }
    entries
}
