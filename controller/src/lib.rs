#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Controller implements common functionality for the controller binary and
//! the controller functions themselves.

use std::{env, pin::Pin, sync::Arc};

use chrono::Utc;
use futures::Future;
use k8s_openapi::{api::core, apimachinery::pkg::apis::meta};
use kube::runtime::events;
use lazy_static::lazy_static;

/// Prelude is the common types for the controllers.
pub(crate) mod prelude {
    pub use std::{collections::BTreeMap, collections::HashMap, sync::Arc};

    pub use chrono::Utc;
    pub use futures::prelude::*;
    pub use k8s_openapi::apimachinery::pkg::apis::meta::{self, v1::Condition};
    pub use kube::{
        self,
        api::{Api, Patch, PatchParams, PostParams},
        runtime::{
            controller::{Action, Controller},
            events::{Event, EventType},
            watcher,
        },
        Resource, ResourceExt,
    };
    pub use serde_json::json;
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use api::v1alpha1;

    pub use super::{
        kro_condition, kro_label, new_condition, set_condition, Context, ControllerFuture, Error,
        Request, Result, CONTROLLER_NAME, CREATE_PARAMS, DEFAULT_REQUEUE, PATCH_PARAMS,
    };
}

pub mod config;
pub mod instances;
pub mod metrics;
pub mod objects;
pub mod registry;
pub mod rgds;
pub mod schemas;

#[cfg(test)]
pub mod testing;

/// Error is the set of failures the controllers report.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// TracingConfig indicates the error came from the tracing setup.
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    /// Tracing indicates the error came from installing the tracing
    /// subscriber.
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    /// Kube is a generic error from the `kube` crate.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// KubeConfig indicates the process was unable to find a kubeconfig.
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    /// KubeconfigRead indicates a kubeconfig that could not be loaded.
    #[error("kubeconfig error: {0}")]
    KubeconfigRead(#[from] kube::config::KubeconfigError),
    /// Io indicates some OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON indicates a JSON serialization failed.
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    /// AddrParse indicates the provided string failed to parse into an
    /// address.
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    /// Tokio indicates an error starting or joining tasks.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    /// Graph indicates compilation of a ResourceGraphDefinition failed.
    #[error("graph error: {0}")]
    Graph(#[from] graph::Error),
    /// Finalizer indicates the finalizer machinery failed.
    #[error("finalizer error: {0}")]
    Finalizer(Box<dyn std::error::Error + Send + Sync>),
    /// MissingName indicates a name was needed and not provided.
    #[error("missing name for kubernetes object: {0}")]
    MissingName(&'static str),
    /// BadName indicates a disallowed name for a kubernetes object.
    #[error("bad name for kubernetes object: {0}")]
    BadName(String),
    /// NotRegistered indicates a reconcile for a kind with no registration.
    #[error("no reconciler registered for {0}")]
    NotRegistered(String),
    /// Terminal indicates an instance whose spec cannot converge; the
    /// runtime parks it until the spec changes.
    #[error("terminal error: {0}")]
    Terminal(String),
    /// Other is a catch-all error.
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result typedef for controllers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Context is common context for controllers.
pub struct Context {
    /// Client is a k8s client. This should only ever be `clone()`'d out of
    /// the Context.
    pub client: kube::Client,
    /// Kube_config rebuilds clients for service-account impersonation.
    /// Absent under the mock client in tests.
    pub kube_config: Option<kube::Config>,
    /// Config is the runtime configuration.
    pub config: config::ControllerConfig,
    /// Schemas resolves member schemas during compilation.
    pub schemas: Arc<dyn graph::SchemaSource>,
    /// Registry multiplexes the per-kind reconcilers.
    pub registry: Arc<registry::DynamicRegistry>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ctx")
    }
}

/// Request is common per-request data for controllers.
pub struct Request {
    now: meta::v1::Time,
    recorder: events::Recorder,
}

impl Request {
    /// New constructs a Request for the current reconcile request.
    pub fn new(c: &kube::Client, oref: core::v1::ObjectReference) -> Request {
        Request {
            now: meta::v1::Time(Utc::now()),
            recorder: events::Recorder::new(c.clone(), REPORTER.clone(), oref),
        }
    }
    /// Now reports the "now" of this request.
    pub fn now(&self) -> meta::v1::Time {
        self.now.clone()
    }
    /// Publish publishes a kubernetes Event.
    pub async fn publish(&self, ev: events::Event) -> Result<()> {
        Ok(self.recorder.publish(ev).await?)
    }
}

/// ControllerFuture is the type the controller constructors should return.
pub type ControllerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

lazy_static! {
    static ref REPORTER: events::Reporter = {
        events::Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: env::var("CONTROLLER_POD_NAME").ok(),
        }
    };
}

/// Condition is like [keyify], but does not force lower-case.
fn condition<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c,
        })
        .for_each(|c| out.push(c));
    out
}

/// Keyify sanitizes the key for use in k8s metadata.
fn keyify<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c.to_ascii_lowercase(),
        })
        .for_each(|c| out.push(c));
    out
}

/// Kro_condition returns the provided argument as a bare condition type.
///
/// Condition names are part of the user surface (`GraphVerified`,
/// `ReconcilerReady`, `InstanceSynced`), so no namespace prefix is added.
pub fn kro_condition<S: AsRef<str>>(s: S) -> String {
    condition("", s)
}

/// Kro_label returns the provided argument as a name in the kro space,
/// suitable for use as an annotation or label.
pub fn kro_label<S: AsRef<str>>(s: S) -> String {
    keyify("kro.run/", s)
}

/// K8s_label returns the provided argument as a name in the
/// "app.kubernetes.io" space, suitable for use as an annotation or label.
pub fn k8s_label<S: AsRef<str>>(s: S) -> String {
    keyify("app.kubernetes.io/", s)
}

/// New_condition builds a Condition stamped with `now`.
pub fn new_condition(
    type_: impl AsRef<str>,
    status: bool,
    reason: &str,
    message: &str,
    generation: Option<i64>,
    now: meta::v1::Time,
) -> meta::v1::Condition {
    meta::v1::Condition {
        type_: kro_condition(type_),
        status: if status { "True" } else { "False" }.into(),
        reason: reason.into(),
        message: message.into(),
        observed_generation: generation,
        last_transition_time: now,
    }
}

/// Set_condition upserts `next` by type, keeping the previous transition
/// time when the status did not flip.
pub fn set_condition(conditions: &mut Vec<meta::v1::Condition>, next: meta::v1::Condition) {
    match conditions.iter_mut().find(|c| c.type_ == next.type_) {
        Some(cur) => {
            let transition = if cur.status == next.status {
                cur.last_transition_time.clone()
            } else {
                next.last_transition_time.clone()
            };
            *cur = next;
            cur.last_transition_time = transition;
        }
        None => conditions.push(next),
    }
}

/// InstanceState is the coarse lifecycle of one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    /// Members are still being materialized or waiting on readiness.
    Progressing,
    /// Every member applied and reported ready.
    Active,
    /// The instance is being torn down.
    Deleting,
    /// The spec cannot converge until it changes.
    Error,
    /// Members applied but something is off, e.g. a failing gate.
    Degraded,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            InstanceState::Progressing => "Progressing",
            InstanceState::Active => "Active",
            InstanceState::Deleting => "Deleting",
            InstanceState::Error => "Error",
            InstanceState::Degraded => "Degraded",
        })
    }
}

/// RgdState is the surfaced lifecycle of a ResourceGraphDefinition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RgdState {
    /// Compiled and registered.
    Active,
    /// Compilation failed; any prior registration keeps running.
    Inactive,
}

impl std::fmt::Display for RgdState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RgdState::Active => "Active",
            RgdState::Inactive => "Inactive",
        })
    }
}

lazy_static! {
    /// OWNED_LABEL marks objects materialized by the runtime.
    pub static ref OWNED_LABEL: String = kro_label("owned");
    /// VERSION_LABEL records the controller build that wrote an object.
    pub static ref VERSION_LABEL: String = kro_label("version");
    /// MANAGED_BY_LABEL is the well-known "managed-by" label.
    pub static ref MANAGED_BY_LABEL: String = k8s_label("managed-by");

    /// CREATE_PARAMS is default post parameters.
    pub static ref CREATE_PARAMS: kube::api::PostParams = kube::api::PostParams {
        dry_run: false,
        field_manager: Some(String::from(CONTROLLER_NAME)),
    };
    /// PATCH_PARAMS is default patch parameters.
    pub static ref PATCH_PARAMS: kube::api::PatchParams =
        kube::api::PatchParams::apply(CONTROLLER_NAME).force();
    /// DEFAULT_REQUEUE is the steady-state requeue for healthy objects.
    pub static ref DEFAULT_REQUEUE: kube::runtime::controller::Action =
        kube::runtime::controller::Action::requeue(std::time::Duration::from_secs(300));
}

/// BUILD_VERSION is the controller build recorded on owned objects.
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// CONTROLLER_NAME is the name the controller uses whenever it needs a
/// human-readable name.
pub const CONTROLLER_NAME: &str = "kro-controller";

/// FINALIZER guards RGDs and instances so teardown can run first.
pub const FINALIZER: &str = "kro.run/finalizer";
