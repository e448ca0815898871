//! Helper methods only available for tests
use crate::controller::Context;
use crate::model::{
    ScheduleOperation, SleepSchedule, SleepScheduleSpec, SleepScheduleStatus, SCHEDULE_FINALIZER,
};
use crate::resources::DEPLOYMENT_REPLICAS_KEY;

use assert_json_diff::assert_json_include;
use chrono::{DateTime, TimeZone, Utc};
use http::{Request, Response};
use hyper::Body;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{client::Client, Resource, ResourceExt};
use prometheus::Registry;
use std::collections::BTreeMap;
use std::sync::Arc;

impl SleepSchedule {
    /// A schedule that sleeps the default namespace daily at 20:00 UTC.
    pub fn test() -> Self {
        let mut schedule = SleepSchedule::new(
            "test",
            SleepScheduleSpec {
                sleep_schedule: "0 20 * * *".to_string(),
                wake_schedule: None,
                time_zone: None,
                exclude_ref: None,
                include_ref: None,
                suspend_deployments: None,
                suspend_cron_jobs: None,
                suspend_daemon_sets: None,
            },
        );
        schedule.meta_mut().namespace = Some("default".into());
        schedule
    }

    /// Modify schedule to have the expected finalizer
    pub fn finalized(mut self) -> Self {
        self.finalizers_mut().push(SCHEDULE_FINALIZER.to_string());
        self
    }

    /// Modify schedule to have a deletion timestamp
    pub fn needs_delete(mut self) -> Self {
        self.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
        self
    }

    /// Yesterday's sleep was executed; today's (20:00) has elapsed on the
    /// fixture clock (20:05) and is due now.
    pub fn due_for_sleep(mut self) -> Self {
        self.status = Some(SleepScheduleStatus {
            last_schedule_time: Some(Utc.with_ymd_and_hms(2024, 4, 15, 20, 0, 0).unwrap()),
            operation: Some(ScheduleOperation::WakeUp),
            original_resource_info: None,
        });
        self
    }

    /// Today's sleep occurrence was already consumed, so nothing is due
    /// before tomorrow.
    pub fn recently_slept(mut self) -> Self {
        self.status = Some(SleepScheduleStatus {
            last_schedule_time: Some(Utc.with_ymd_and_hms(2024, 4, 16, 20, 0, 0).unwrap()),
            operation: Some(ScheduleOperation::Sleep),
            original_resource_info: Some(BTreeMap::from([(
                DEPLOYMENT_REPLICAS_KEY.to_string(),
                r#"[{"name":"api","value":3}]"#.to_string(),
            )])),
        });
        self
    }
}

/// All reconciles share this frozen clock so schedule verdicts are
/// reproducible.
fn test_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 16, 20, 5, 0).unwrap()
}

impl Context {
    // Create a test context with a mocked kube client, locked fixture clock,
    // unregistered metrics and default diagnostics
    pub fn test() -> (Arc<Self>, ApiServerVerifier, Registry) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let registry = Registry::default();
        let ctx = Self {
            client: mock_client,
            metrics: controller_core::Metrics::default().register(&registry).unwrap(),
            diagnostics: Arc::default(),
            clock: test_clock,
        };
        (Arc::new(ctx), ApiServerVerifier(handle), registry)
    }
}

/// Scenario variants for the mock API server
pub enum Scenario {
    /// objects without finalizers will get a finalizer applied (and not run the apply loop)
    FinalizerCreation(SleepSchedule),
    /// nothing is due, so no API traffic happens
    RadioSilence,
    /// a due sleep lists deployments, scales them down, persists the run
    /// record in the status and publishes an event
    SleepCycle(SleepSchedule),
    /// the run record is persisted even when the event publication fails
    SleepEventFailure(SleepSchedule),
    /// the third of five scale-down writes loses the optimistic concurrency
    /// race and the remaining writes are never attempted
    SleepConflict(SleepSchedule),
    /// objects with a deletion timestamp will run the cleanup loop sending event and removing the finalizer
    Cleanup(String, SleepSchedule),
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

/// Create a responder + verifier object that deals with the main reconcile scenarios
pub struct ApiServerVerifier(pub ApiServerHandle);
pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

impl ApiServerVerifier {
    /// Tests only get to run specific scenarios that has matching handlers
    ///
    /// This setup makes it easy to handle multiple requests by chaining handlers together.
    ///
    /// NB: If the controller is making more calls than we are handling in the scenario,
    /// you then typically see a `KubeError(Service(Closed(())))` from the reconciler.
    ///
    /// You should await the `JoinHandle` (with a timeout) from this function to ensure that the
    /// scenario runs to completion (i.e. all expected calls were responded to),
    /// using the timeout to catch missing api calls to Kubernetes.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match scenario {
                Scenario::FinalizerCreation(schedule) => {
                    self.handle_finalizer_creation(schedule).await
                }
                Scenario::RadioSilence => Ok(self),
                Scenario::SleepCycle(schedule) => {
                    self.handle_deployment_list(vec![("api", 3)])
                        .await
                        .unwrap()
                        .handle_deployment_scale_down("api")
                        .await
                        .unwrap()
                        .handle_status_patch(schedule)
                        .await
                        .unwrap()
                        .handle_event_create("Sleeping".into())
                        .await
                }
                Scenario::SleepEventFailure(schedule) => {
                    self.handle_deployment_list(vec![("api", 3)])
                        .await
                        .unwrap()
                        .handle_deployment_scale_down("api")
                        .await
                        .unwrap()
                        .handle_status_patch(schedule)
                        .await
                        .unwrap()
                        .handle_event_create_failure()
                        .await
                }
                Scenario::SleepConflict(_schedule) => {
                    self.handle_deployment_list(vec![
                        ("web", 1),
                        ("api", 3),
                        ("queue", 5),
                        ("cache", 2),
                        ("worker", 4),
                    ])
                    .await
                    .unwrap()
                    .handle_deployment_scale_down("web")
                    .await
                    .unwrap()
                    .handle_deployment_scale_down("api")
                    .await
                    .unwrap()
                    .handle_deployment_scale_down_conflict("queue")
                    .await
                }
                Scenario::Cleanup(reason, schedule) => {
                    self.handle_event_create(reason)
                        .await
                        .unwrap()
                        .handle_finalizer_removal(schedule)
                        .await
                }
            }
            .expect("scenario completed without errors");
        })
    }

    async fn handle_finalizer_creation(mut self, schedule: SleepSchedule) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        // We expect a json patch to the specified schedule adding our finalizer
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().to_string(),
            format!(
                "/apis/naptime.dev/v1alpha1/namespaces/default/sleepschedules/{}?",
                schedule.name_any()
            )
        );
        let expected_patch = serde_json::json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": vec![SCHEDULE_FINALIZER] }
        ]);
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let runtime_patch: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid schedule from runtime");
        assert_json_include!(actual: runtime_patch, expected: expected_patch);

        let response = serde_json::to_vec(&schedule.finalized()).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_finalizer_removal(mut self, schedule: SleepSchedule) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        // We expect a json patch to the specified schedule removing our finalizer (at index 0)
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().to_string(),
            format!(
                "/apis/naptime.dev/v1alpha1/namespaces/default/sleepschedules/{}?",
                schedule.name_any()
            )
        );
        let expected_patch = serde_json::json!([
            { "op": "test", "path": "/metadata/finalizers/0", "value": SCHEDULE_FINALIZER },
            { "op": "remove", "path": "/metadata/finalizers/0" }
        ]);
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let runtime_patch: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid schedule from runtime");
        assert_json_include!(actual: runtime_patch, expected: expected_patch);

        let response = serde_json::to_vec(&schedule).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_deployment_list(
        mut self,
        deployments: Vec<(&str, i32)>,
    ) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            "/apis/apps/v1/namespaces/default/deployments"
        );
        let items = deployments
            .into_iter()
            .map(|(name, replicas)| {
                serde_json::json!({
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": {
                        "name": name,
                        "namespace": "default",
                        "resourceVersion": "12345"
                    },
                    "spec": { "replicas": replicas }
                })
            })
            .collect::<Vec<_>>();
        let list = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "DeploymentList",
            "metadata": { "resourceVersion": "10" },
            "items": items
        });
        let response = serde_json::to_vec(&list).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_deployment_scale_down(mut self, name: &str) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PUT);
        assert_eq!(
            request.uri().path(),
            format!("/apis/apps/v1/namespaces/default/deployments/{name}")
        );
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let desired: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid deployment from runtime");
        assert_eq!(desired["spec"]["replicas"], 0, "sleep scales to zero");
        // the replace carries the resourceVersion read at list time
        assert_eq!(desired["metadata"]["resourceVersion"], "12345");

        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());
        Ok(self)
    }

    async fn handle_deployment_scale_down_conflict(
        mut self,
        name: &str,
    ) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PUT);
        assert_eq!(
            request.uri().path(),
            format!("/apis/apps/v1/namespaces/default/deployments/{name}")
        );
        let conflict = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Status",
            "metadata": {},
            "status": "Failure",
            "message": format!("Operation cannot be fulfilled on deployments.apps \"{name}\": the object has been modified"),
            "reason": "Conflict",
            "code": 409
        });
        let response = serde_json::to_vec(&conflict).unwrap();
        send.send_response(
            Response::builder()
                .status(409)
                .body(Body::from(response))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_event_create(mut self, reason: String) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(
            request.uri().path(),
            "/apis/events.k8s.io/v1/namespaces/default/events"
        );
        // verify the event reason matches the expected
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let postdata: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid event from runtime");
        assert_eq!(
            postdata.get("reason").unwrap().as_str().map(String::from),
            Some(reason)
        );
        // then pass through the body
        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());
        Ok(self)
    }

    async fn handle_event_create_failure(mut self) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(
            request.uri().path(),
            "/apis/events.k8s.io/v1/namespaces/default/events"
        );
        let failure = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Status",
            "metadata": {},
            "status": "Failure",
            "message": "etcd leader changed",
            "reason": "InternalError",
            "code": 500
        });
        let response = serde_json::to_vec(&failure).unwrap();
        send.send_response(
            Response::builder()
                .status(500)
                .body(Body::from(response))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_status_patch(mut self, schedule: SleepSchedule) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!(
                "/apis/naptime.dev/v1alpha1/namespaces/default/sleepschedules/{}/status",
                schedule.name_any()
            )
        );
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let patch: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid status patch from runtime");
        // the run record: the consumed occurrence, the action taken and the
        // pre-sleep state needed to wake back up
        let expected = serde_json::json!({
            "status": {
                "lastScheduleTime": "2024-04-16T20:00:00Z",
                "operation": "sleep",
                "originalResourceInfo": {
                    DEPLOYMENT_REPLICAS_KEY: r#"[{"name":"api","value":3}]"#
                }
            }
        });
        assert_json_include!(actual: patch.clone(), expected: expected);

        let status: SleepScheduleStatus =
            serde_json::from_value(patch["status"].clone()).expect("valid status");
        let mut updated = schedule.clone();
        updated.status = Some(status);
        let response = serde_json::to_vec(&updated).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }
}
