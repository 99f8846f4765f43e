#![allow(dead_code)]
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use controller::*;

pub async fn test_context(token: &CancellationToken) -> Arc<Context> {
    let config = kube::Config::infer()
        .await
        .expect("unable to infer kubeconfig");
    let client = kube::client::ClientBuilder::try_from(config.clone())
        .expect("unable to create client builder")
        .build();
    let cfg = config::ControllerConfig {
        default_requeue_duration: std::time::Duration::from_secs(2),
        ..Default::default()
    };
    let registry = Arc::new(registry::DynamicRegistry::new(
        client.clone(),
        cfg.clone(),
        token.clone(),
    ));
    Arc::new(Context {
        client: client.clone(),
        kube_config: Some(config),
        config: cfg,
        schemas: Arc::new(schemas::ClusterSchemaSource::new(client)),
        registry,
    })
}

pub async fn load_crds(client: &kube::Client) -> Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Api, PostParams};
    use kube::{CustomResourceExt, ResourceExt};

    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = api::v1alpha1::ResourceGraphDefinition::crd();
    let name = crd.name_any();
    trace!(name, "checking CRD");
    if api.get_metadata_opt(&name).await?.is_none() {
        trace!(name, "creating CRD");
        api.create(&PostParams::default(), &crd).await?;
    }
    trace!(name, "CRD ok");
    Ok(())
}

pub mod prelude {
    pub use std::sync::Arc;

    pub use kube::api::{Api, DeleteParams, PostParams};
    pub use serde_json::json;
    pub use test_log::test;
    pub use tokio::{task, time::Duration};
    pub use tokio_util::sync::CancellationToken;
}
