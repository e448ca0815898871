use crate::model::{ScheduleOperation, SleepSchedule, SleepScheduleStatus, SCHEDULE_FINALIZER};
use crate::resources::{ResourceClient, Resources, RestoredState};
use crate::schedule;

use controller_core::{telemetry, Error, Metrics, Result};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config,
    },
    Resource,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Source of "now", swappable for deterministic scheduling in tests
    pub clock: fn() -> DateTime<Utc>,
}

#[instrument(skip(ctx, doc), fields(trace_id))]
async fn reconcile(doc: Arc<SleepSchedule>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = doc.namespace().unwrap(); // doc is namespace scoped
    let schedules: Api<SleepSchedule> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling SleepSchedule \"{}\" in {}", doc.name_any(), ns);
    finalizer(&schedules, SCHEDULE_FINALIZER, doc, |event| async {
        match event {
            Finalizer::Apply(doc) => doc.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(doc) => doc.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

fn error_policy(doc: Arc<SleepSchedule>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&*doc, error);
    if error.is_conflict() {
        // a workload changed mid-write; retry promptly from a fresh read
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(30))
    }
}

impl SleepSchedule {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let ns = self.namespace().unwrap();
        let schedules: Api<SleepSchedule> = Api::namespaced(ctx.client.clone(), &ns);

        let now = (ctx.clock)();
        let created = self
            .meta()
            .creation_timestamp
            .as_ref()
            .map_or(now, |t| t.0);
        let verdict = schedule::evaluate(&self.spec, self.last_schedule_time(), created, now)?;

        if !verdict.is_to_execute {
            debug!(
                "nothing due for {}/{}, next {:?}, requeue in {:?}",
                ns, name, verdict.next_schedule, verdict.requeue_after,
            );
            return Ok(Action::requeue(verdict.requeue_after));
        }
        let Some(scheduled_at) = verdict.next_schedule else {
            return Ok(Action::requeue(verdict.requeue_after));
        };

        // A malformed run record is fatal for this cycle: wake targets
        // cannot be computed safely from corrupted state.
        let restored = RestoredState::from_status(self.original_resource_info())?;
        let resource_client =
            ResourceClient::new(ctx.client.clone(), Arc::new(self.clone()), ns.clone());
        let resources = Resources::load(&resource_client, restored).await?;

        let mut status = SleepScheduleStatus {
            last_schedule_time: Some(scheduled_at),
            operation: Some(verdict.operation),
            original_resource_info: self.original_resource_info().cloned(),
        };

        let event = if resources.has_resources() {
            match verdict.operation {
                ScheduleOperation::Sleep => {
                    info!("putting workloads of {} to sleep", ns);
                    resources.sleep().await?;
                    let info = resources.original_info_to_save()?;
                    status.original_resource_info = (!info.is_empty()).then_some(info);
                    Some(("Sleeping", "Sleep", format!("Put workloads of `{ns}` to sleep")))
                }
                ScheduleOperation::WakeUp => {
                    info!("waking workloads of {} up", ns);
                    resources.wake_up().await?;
                    // the record is consumed; a future sleep recreates it
                    status.original_resource_info = None;
                    Some(("WakingUp", "WakeUp", format!("Restored workloads of `{ns}`")))
                }
            }
        } else {
            debug!("no suspendable workloads in {}", ns);
            None
        };

        // The run record is persisted as soon as the mutations succeeded and
        // before anything else can fail, otherwise a retry would find the
        // workloads already in the target state and have no record left to
        // save. A failure before this point leaves the previous record
        // untouched and the same occurrence is retried on the next
        // invocation.
        let new_status = Patch::Apply(json!({
            "apiVersion": SleepSchedule::api_version(&()),
            "kind": "SleepSchedule",
            "status": status,
        }));
        let ps = PatchParams::apply("naptime").force();
        schedules
            .patch_status(&name, &ps, &new_status)
            .await
            .map_err(Error::KubeError)?;

        if let Some((reason, action, note)) = event {
            self.publish_event(&ctx, reason, action, &note).await?;
        }

        Ok(Action::requeue(verdict.requeue_after))
    }

    // Finalizer cleanup (the object was deleted, ensure nothing stays asleep)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let ns = self.namespace().unwrap();

        if self.last_operation() == Some(ScheduleOperation::Sleep) {
            info!("restoring workloads of {} before deleting the schedule", ns);
            let restored = RestoredState::from_status(self.original_resource_info())?;
            let resource_client =
                ResourceClient::new(ctx.client.clone(), Arc::new(self.clone()), ns.clone());
            let resources = Resources::load(&resource_client, restored).await?;
            resources.wake_up().await?;
        }

        self.publish_event(
            &ctx,
            "DeleteRequested",
            "Deleting",
            &format!("Delete `{}`", self.name_any()),
        )
        .await?;
        Ok(Action::await_change())
    }

    async fn publish_event(&self, ctx: &Context, reason: &str, action: &str, note: &str) -> Result<()> {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: reason.into(),
                note: Some(note.into()),
                action: action.into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    #[serde(deserialize_with = "from_ts")]
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "sleepschedule-controller".into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: Client, doc: &SleepSchedule) -> Recorder {
        Recorder::new(client, self.reporter.clone(), doc.object_ref(&()))
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: Metrics::default().register(&self.registry).unwrap(),
            diagnostics: self.diagnostics.clone(),
            clock: Utc::now,
        })
    }
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) {
    let client = Client::try_default().await.expect("failed to create kube Client");

    let schedules = Api::<SleepSchedule>::all(client.clone());
    if let Err(e) = schedules.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let context = state.to_context(client);

    Controller::new(schedules, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
