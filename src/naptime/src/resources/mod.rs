mod cronjobs;
mod daemonsets;
mod deployments;
pub mod filters;
pub mod state;

pub use cronjobs::CronJobs;
pub use daemonsets::DaemonSets;
pub use deployments::Deployments;

use crate::model::SleepSchedule;
use controller_core::{Error, Result};

use async_trait::async_trait;
use kube::client::Client;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Stable per-kind identifiers for the blobs persisted in the status.
pub const DEPLOYMENT_REPLICAS_KEY: &str = "deployment-replicas";
pub const CRON_JOB_SUSPENDED_KEY: &str = "cronjob-suspended";
pub const DAEMON_SET_NODE_SELECTOR_KEY: &str = "daemonset-node-selector";

pub(crate) const LIST_PAGE_LIMIT: u32 = 500;

/// Shared accessor handed to every resource capability: the Kubernetes
/// client, the active policy and the namespace to operate in.
#[derive(Clone)]
pub struct ResourceClient {
    pub client: Client,
    pub schedule: Arc<SleepSchedule>,
    pub namespace: String,
}

impl ResourceClient {
    pub fn new(client: Client, schedule: Arc<SleepSchedule>, namespace: String) -> Self {
        Self {
            client,
            schedule,
            namespace,
        }
    }

    /// Precondition check, run before any mutation is attempted.
    pub fn is_client_valid(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::InvalidParameters(
                "the target namespace is empty".into(),
            ));
        }
        Ok(())
    }
}

/// The uniform contract every workload kind implements. Each implementation
/// lists and filters its instances eagerly at construction and applies a
/// kind-specific suspend strategy. `sleep` and `wake_up` are idempotent:
/// re-applying to an instance already in the target state is a no-op.
#[async_trait]
pub trait Suspendable: Send + Sync {
    /// True iff at least one in-scope instance exists after filtering.
    fn has_resource(&self) -> bool;
    async fn sleep(&self) -> Result<()>;
    async fn wake_up(&self) -> Result<()>;
    /// Serialized original-state entries for this kind, or `None` when the
    /// kind does not participate or produced no reversible mutation.
    fn original_info_to_save(&self) -> Result<Option<String>>;
}

/// The per-kind original-state mappings decoded from a persisted status.
#[derive(Default, Debug)]
pub struct RestoredState {
    pub deployment_replicas: HashMap<String, i32>,
    pub cron_job_suspended: HashMap<String, bool>,
    pub daemon_set_node_selectors: HashMap<String, Option<BTreeMap<String, String>>>,
}

impl RestoredState {
    /// Decodes the blob map persisted in the `SleepSchedule` status. Missing
    /// keys restore to empty mappings; a malformed blob is a corruption
    /// signal and fails the reconciliation.
    pub fn from_status(info: Option<&BTreeMap<String, String>>) -> Result<Self> {
        let blob = |key: &str| info.and_then(|m| m.get(key)).map(String::as_str);
        Ok(Self {
            deployment_replicas: deployments::original_info_to_restore(blob(DEPLOYMENT_REPLICAS_KEY))?,
            cron_job_suspended: cronjobs::original_info_to_restore(blob(CRON_JOB_SUSPENDED_KEY))?,
            daemon_set_node_selectors: daemonsets::original_info_to_restore(blob(
                DAEMON_SET_NODE_SELECTOR_KEY,
            ))?,
        })
    }
}

/// Composes the capabilities of all enabled kinds for one namespace and
/// drives them through sleep and wake in a fixed kind order.
pub struct Resources {
    deployments: Deployments,
    daemon_sets: DaemonSets,
    cron_jobs: CronJobs,
}

impl Resources {
    pub async fn load(res: &ResourceClient, restored: RestoredState) -> Result<Self> {
        res.is_client_valid()?;
        let deployments = Deployments::load(res, restored.deployment_replicas).await?;
        let daemon_sets = DaemonSets::load(res, restored.daemon_set_node_selectors).await?;
        let cron_jobs = CronJobs::load(res, restored.cron_job_suspended).await?;
        Ok(Self {
            deployments,
            daemon_sets,
            cron_jobs,
        })
    }

    fn in_order(&self) -> [&dyn Suspendable; 3] {
        [&self.deployments, &self.daemon_sets, &self.cron_jobs]
    }

    pub fn has_resources(&self) -> bool {
        self.in_order().iter().any(|r| r.has_resource())
    }

    /// Applies the suspend strategy kind by kind, aborting on the first
    /// error. Earlier kinds may already be asleep at that point; the caller
    /// must requeue and retry, which is safe because sleep is idempotent.
    pub async fn sleep(&self) -> Result<()> {
        for resource in self.in_order() {
            resource.sleep().await?;
        }
        Ok(())
    }

    pub async fn wake_up(&self) -> Result<()> {
        for resource in self.in_order() {
            resource.wake_up().await?;
        }
        Ok(())
    }

    /// Merges the non-empty per-kind blobs into the map persisted on the
    /// status. Only called after `sleep` fully succeeded.
    pub fn original_info_to_save(&self) -> Result<BTreeMap<String, String>> {
        let mut info = BTreeMap::new();
        if let Some(blob) = self.deployments.original_info_to_save()? {
            info.insert(DEPLOYMENT_REPLICAS_KEY.to_string(), blob);
        }
        if let Some(blob) = self.cron_jobs.original_info_to_save()? {
            info.insert(CRON_JOB_SUSPENDED_KEY.to_string(), blob);
        }
        if let Some(blob) = self.daemon_sets.original_info_to_save()? {
            info.insert(DAEMON_SET_NODE_SELECTOR_KEY.to_string(), blob);
        }
        Ok(info)
    }
}

/// A target that vanished between list and update already satisfies the
/// desired end state, so not-found is swallowed rather than surfaced.
pub(crate) fn ignore_not_found<T>(result: kube::Result<T>) -> kube::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(err) => Err(err),
    }
}
