//! Extras that only show up during tests.
#![allow(missing_docs)]
use std::{collections::BTreeMap, sync::Arc};

use futures::Future;
use http::{Request, Response, StatusCode};
use kube::{
    client::Body,
    core::{ApiResource, GroupVersionKind},
    Client, Resource, ResourceExt,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_test::mock::SendResponse;

use super::*;
use api::v1alpha1::ResourceGraphDefinition;
use graph::{simpleschema, GraphBuilder, ResolvedSchema, StaticSchemaSource};

pub use test_log::test;

pub fn test_schema_source() -> Arc<StaticSchemaSource> {
    let vpc = ResolvedSchema {
        schema: simpleschema::transform(
            &json!({
                "spec": { "cidrBlock": "string" },
                "status": { "vpcID": "string" },
            }),
            None,
        )
        .expect("test schema"),
        namespaced: true,
        plural: "vpcs".into(),
    };
    let configmap = ResolvedSchema {
        schema: simpleschema::transform(&json!({ "data": "map[string]string" }), None)
            .expect("test schema"),
        namespaced: true,
        plural: "configmaps".into(),
    };
    Arc::new(
        StaticSchemaSource::new()
            .with(
                &GroupVersionKind {
                    group: "ec2.services.k8s.aws".into(),
                    version: "v1alpha1".into(),
                    kind: "VPC".into(),
                },
                vpc,
            )
            .with(
                &GroupVersionKind {
                    group: String::new(),
                    version: "v1".into(),
                    kind: "ConfigMap".into(),
                },
                configmap,
            ),
    )
}

impl Context {
    pub fn rgd_tests() -> (Arc<Self>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let config = config::ControllerConfig::default();
        let registry = Arc::new(registry::DynamicRegistry::new(
            mock_client.clone(),
            config.clone(),
            CancellationToken::new(),
        ));
        let ctx = Self {
            client: mock_client,
            kube_config: None,
            config,
            schemas: test_schema_source(),
            registry,
        };
        (Arc::new(ctx), ApiServerVerifier::new(handle))
    }

    pub fn instance_tests() -> (Arc<Self>, ApiServerVerifier) {
        // Same wiring; the split exists so scenarios read clearly.
        Self::rgd_tests()
    }
}

pub mod rgd {
    use super::*;

    /// Return a minimal valid ResourceGraphDefinition.
    pub fn test() -> ResourceGraphDefinition {
        ResourceGraphDefinition::new(
            "test",
            serde_json::from_value(json!({
                "schema": { "apiVersion": "v1alpha1", "kind": "WebApp" },
            }))
            .expect("valid spec"),
        )
    }

    pub fn finalized(mut r: ResourceGraphDefinition) -> ResourceGraphDefinition {
        r.finalizers_mut().push(FINALIZER.into());
        r.meta_mut().uid = Some("42".into());
        r
    }

    /// Two members that read each other; compilation must fail.
    pub fn cyclic() -> ResourceGraphDefinition {
        ResourceGraphDefinition::new(
            "test",
            serde_json::from_value(json!({
                "schema": { "apiVersion": "v1alpha1", "kind": "Loop" },
                "resources": [
                    {
                        "id": "a",
                        "template": {
                            "apiVersion": "ec2.services.k8s.aws/v1alpha1",
                            "kind": "VPC",
                            "metadata": { "name": "${b.status.vpcID}" },
                        },
                    },
                    {
                        "id": "b",
                        "template": {
                            "apiVersion": "ec2.services.k8s.aws/v1alpha1",
                            "kind": "VPC",
                            "metadata": { "name": "${a.status.vpcID}" },
                        },
                    },
                ],
            }))
            .expect("valid spec"),
        )
    }
}

pub mod instance {
    use super::*;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::DynamicObject;

    pub fn webapp_resource() -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind {
                group: "kro.run".into(),
                version: "v1alpha1".into(),
                kind: "WebApp".into(),
            },
            "webapps",
        )
    }

    /// Return a WebApp instance named "test" with spec.name = "demo".
    pub fn test() -> DynamicObject {
        let mut obj = DynamicObject::new("test", &webapp_resource()).within("default");
        obj.metadata.uid = Some("42".into());
        obj.metadata.generation = Some(1);
        obj.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        obj.data = json!({ "spec": { "name": "demo" } });
        obj
    }

    pub fn deleting(mut obj: DynamicObject) -> DynamicObject {
        obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
        obj
    }
}

/// Webapp_graph compiles the one-ConfigMap fixture definition.
pub async fn webapp_graph() -> Arc<graph::Graph> {
    let definition = ResourceGraphDefinition::new(
        "webapp",
        serde_json::from_value(json!({
            "schema": {
                "apiVersion": "v1alpha1",
                "kind": "WebApp",
                "spec": { "name": "string" },
                "status": { "configMapName": "${config.metadata.name}" },
            },
            "resources": [{
                "id": "config",
                "template": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": "${schema.spec.name}-cm" },
                    "data": { "name": "${schema.spec.name}" },
                },
            }],
        }))
        .expect("valid spec"),
    );
    Arc::new(
        GraphBuilder::new(test_schema_source())
            .build(&definition)
            .await
            .expect("fixture compiles"),
    )
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

// We wrap tower_test::mock::Handle
type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

pub struct ApiServerVerifier {
    handle: ApiServerHandle,
    state: BTreeMap<String, Value>,
}

/// Scenarios we want to test for
pub enum Scenario {
    /// The first reconcile of an unfinalized RGD only adds the finalizer.
    FinalizerCreation(ResourceGraphDefinition),
    /// A cyclic RGD patches status Inactive and publishes a warning.
    CompileFailure(ResourceGraphDefinition),
    /// A fresh instance creates its member and projects status.
    InstanceCreatesMember(kube::api::DynamicObject),
    /// A deleting instance removes owned members layer by layer.
    InstanceTeardown(kube::api::DynamicObject, Vec<Value>),
}

impl ApiServerVerifier {
    fn new(handle: ApiServerHandle) -> Self {
        Self {
            handle,
            state: BTreeMap::new(),
        }
    }

    #[inline]
    fn next_request(
        &mut self,
    ) -> impl Future<Output = Option<(Request<Body>, SendResponse<Response<Body>>)>> + '_ {
        self.handle.next_request()
    }

    /// Tests only get to run specific scenarios that have matching handlers.
    ///
    /// NB: If the controller makes more calls than the scenario handles, the
    /// reconciler sees a `Service(Closed(()))` error; await the returned
    /// `JoinHandle` (with a timeout) to catch missing calls.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            use Scenario::*;
            match scenario {
                FinalizerCreation(r) => self.handle_finalizer_creation(r).await,
                CompileFailure(r) => {
                    self.handle_rgd_status_patch("Inactive", "GraphVerified", "False")
                        .await
                        .unwrap()
                        .handle_event("GraphCompilationFailed")
                        .await
                }
                InstanceCreatesMember(_) => {
                    self.handle_member_get_absent("demo-cm")
                        .await
                        .unwrap()
                        .handle_member_create("demo-cm")
                        .await
                        .unwrap()
                        .handle_member_get_present("demo-cm")
                        .await
                        .unwrap()
                        .handle_instance_status_patch("Active")
                        .await
                }
                InstanceTeardown(_, remaining) => {
                    if remaining.is_empty() {
                        self.handle_member_list(vec![])
                            .await
                            .unwrap()
                            .handle_finalizer_removal()
                            .await
                    } else {
                        let name = remaining[0]
                            .pointer("/metadata/name")
                            .and_then(Value::as_str)
                            .unwrap()
                            .to_string();
                        self.handle_member_list(remaining)
                            .await
                            .unwrap()
                            .handle_member_delete(&name)
                            .await
                    }
                }
            }
            .expect("scenario completed without errors");
        })
    }

    async fn handle_finalizer_creation(mut self, r: ResourceGraphDefinition) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        // We expect a json patch to the specified document adding our
        // finalizer.
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().to_string(),
            format!(
                "/apis/kro.run/v1alpha1/resourcegraphdefinitions/{}?",
                r.name_any()
            )
        );
        let expected_patch = json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": vec![FINALIZER] }
        ]);
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let runtime_patch: Value =
            serde_json::from_slice(&req_body).expect("valid document from runtime");
        assert_json_diff::assert_json_include!(actual: runtime_patch, expected: expected_patch);

        let response = serde_json::to_vec(&rgd::finalized(r)).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_rgd_status_patch(
        mut self,
        state: &str,
        condition: &str,
        status: &str,
    ) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::PATCH, "unexpected method");
        assert!(
            uri.starts_with("/apis/kro.run/v1alpha1/resourcegraphdefinitions/test/status"),
            "unexpected path"
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let body: Value = serde_json::from_slice(&req_body).expect("status patch is json");
        assert_eq!(body["status"]["state"], json!(state));
        let found = body["status"]["conditions"]
            .as_array()
            .expect("conditions array")
            .iter()
            .find(|c| c["type"] == json!(condition))
            .expect("condition present");
        assert_eq!(found["status"], json!(status));

        let mut response_body = body;
        response_body["metadata"] = json!({"name": "test"});
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&response_body).unwrap()))
                .unwrap(),
        );
        Ok(self)
    }

    /// Tests that the next request is an Event with the given reason.
    async fn handle_event(mut self, reason: &str) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert!(
            matches!(*request.method(), http::Method::POST | http::Method::PATCH),
            "unexpected method"
        );
        assert!(
            uri.starts_with("/apis/events.k8s.io/v1/namespaces/default/events"),
            "unexpected path"
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let event: Value = serde_json::from_slice(&req_body).expect("event object is json");
        assert_eq!(event["reason"], json!(reason), "unexpected \"reason\"");

        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&event).unwrap()))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_member_get_absent(mut self, name: &str) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::GET, "unexpected method");
        assert!(
            uri.starts_with(&format!("/api/v1/namespaces/default/configmaps/{name}")),
            "unexpected path"
        );
        send.send_response(not_found::<k8s_openapi::api::core::v1::ConfigMap, _>(name));
        Ok(self)
    }

    async fn handle_member_create(mut self, name: &str) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::POST, "unexpected method");
        assert!(
            uri.starts_with("/api/v1/namespaces/default/configmaps?"),
            "unexpected path"
        );
        assert!(uri.contains(&format!("fieldManager={CONTROLLER_NAME}")));

        let req_body = request.into_body().collect_bytes().await.unwrap();
        let obj: Value = serde_json::from_slice(&req_body).expect("object is json");
        assert_eq!(obj.pointer("/metadata/name"), Some(&json!(name)));
        // Ownership is stamped before any write.
        assert_eq!(
            obj.pointer("/metadata/labels/kro.run~1owned"),
            Some(&json!("true"))
        );
        assert_eq!(
            obj.pointer("/metadata/ownerReferences/0/kind"),
            Some(&json!("WebApp"))
        );

        self.state.insert(name.to_string(), obj.clone());
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&obj).unwrap()))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_member_get_present(mut self, name: &str) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::GET, "unexpected method");
        assert!(
            uri.starts_with(&format!("/api/v1/namespaces/default/configmaps/{name}")),
            "unexpected path"
        );
        let obj = self.state.get(name).expect("object created").clone();
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&obj).unwrap()))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_instance_status_patch(mut self, state: &str) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::PATCH, "unexpected method");
        assert!(
            uri.starts_with("/apis/kro.run/v1alpha1/namespaces/default/webapps/test/status"),
            "unexpected path"
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let body: Value = serde_json::from_slice(&req_body).expect("status patch is json");
        assert_eq!(body["status"]["state"], json!(state));
        assert_eq!(body["status"]["configMapName"], json!("demo-cm"));

        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_member_list(mut self, items: Vec<Value>) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::GET, "unexpected method");
        assert!(
            uri.starts_with("/api/v1/namespaces/default/configmaps?"),
            "unexpected path"
        );
        assert!(uri.contains("labelSelector="), "owned selector missing");

        let list = json!({
            "apiVersion": "v1",
            "kind": "ConfigMapList",
            "metadata": {},
            "items": items,
        });
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&list).unwrap()))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_member_delete(mut self, name: &str) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::DELETE, "unexpected method");
        assert!(
            uri.starts_with(&format!("/api/v1/namespaces/default/configmaps/{name}")),
            "unexpected path"
        );
        let obj = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "default" },
        });
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&obj).unwrap()))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_finalizer_removal(mut self) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::PATCH, "unexpected method");
        assert!(
            uri.starts_with("/apis/kro.run/v1alpha1/namespaces/default/webapps/test"),
            "unexpected path"
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let body: Value = serde_json::from_slice(&req_body).expect("patch is json");
        assert_eq!(body.pointer("/metadata/finalizers"), Some(&json!([])));

        let obj = instance::test();
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&obj).unwrap()))
                .unwrap(),
        );
        Ok(self)
    }
}

fn not_found<R: Resource<DynamicType = ()>, S: ToString>(name: S) -> Response<Body> {
    let err = json!({
        "code": 404,
        "status": "Failure",
        "reason": "NotFound",
        "details": {
            "group": R::group(&()),
            "kind": R::kind(&()),
            "name": name.to_string(),
        },
    });
    let response = serde_json::to_vec(&err).unwrap();
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from(response))
        .unwrap()
}
