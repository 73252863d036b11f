//! Cluster collaborators used by the reconciler.
//!
//! The reconciler only talks to the cluster through the `Cluster` & `StatusWriter` traits. The
//! kube-backed implementations live here as well; tests use in-memory fakes.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::autoscaling::v2beta2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::timeout;

use crate::k8s::APP_NAME;
use tributary_core::crd::{Component, RequiredMetadata, Source, SourceStatus};
use tributary_core::AppError;

/// The default timeout to use for API calls.
pub const API_TIMEOUT: Duration = Duration::from_secs(5);

/// A sub-resource managed on behalf of a Source, one variant per Component.
#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum SubResource {
    Workload(StatefulSet),
    Service(Service),
    Autoscaler(HorizontalPodAutoscaler),
    MessagingBinding(ConfigMap),
}

impl SubResource {
    /// The Component this object belongs to.
    pub fn component(&self) -> Component {
        match self {
            Self::Workload(_) => Component::Workload,
            Self::Service(_) => Component::Service,
            Self::Autoscaler(_) => Component::Autoscaler,
            Self::MessagingBinding(_) => Component::MessagingBinding,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Workload(obj) => obj.meta(),
            Self::Service(obj) => obj.meta(),
            Self::Autoscaler(obj) => obj.meta(),
            Self::MessagingBinding(obj) => obj.meta(),
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Workload(obj) => obj.meta_mut(),
            Self::Service(obj) => obj.meta_mut(),
            Self::Autoscaler(obj) => obj.meta_mut(),
            Self::MessagingBinding(obj) => obj.meta_mut(),
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Check if this object has been marked for deletion.
    pub fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// The fields of this object which are owned by the operator, as JSON.
    ///
    /// This is the `labels` of the object plus its `spec`, or its `data` for ConfigMaps.
    pub fn managed_fields(&self) -> serde_json::Value {
        let labels = serde_json::to_value(&self.meta().labels).unwrap_or_default();
        let body = match self {
            Self::Workload(obj) => serde_json::to_value(&obj.spec),
            Self::Service(obj) => serde_json::to_value(&obj.spec),
            Self::Autoscaler(obj) => serde_json::to_value(&obj.spec),
            Self::MessagingBinding(obj) => serde_json::to_value(&obj.data),
        };
        let key = match self {
            Self::MessagingBinding(_) => "data",
            _ => "spec",
        };
        let mut fields = serde_json::Map::new();
        fields.insert("labels".into(), labels);
        fields.insert(key.into(), body.unwrap_or_default());
        serde_json::Value::Object(fields)
    }
}

/// Access to the sub-resources of Sources within a single namespace.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Fetch the live object of the given kind & name, `None` if it does not exist.
    async fn get(&self, kind: Component, name: &str) -> Result<Option<SubResource>, AppError>;
    /// Create the given object, which is expected to be absent.
    async fn create(&self, desired: &SubResource) -> Result<SubResource, AppError>;
    /// Update the given object so that the fields it sets match.
    async fn update(&self, desired: &SubResource) -> Result<SubResource, AppError>;
    /// Delete the object of the given kind & name. Deleting an absent object is not an error.
    async fn delete(&self, kind: Component, name: &str) -> Result<(), AppError>;
}

/// Persistence of Source status.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Write the given status for the given Source, returning the updated Source.
    ///
    /// The write is rejected with `AppError::Conflict` if the Source has been modified since it
    /// was observed.
    async fn write_status(&self, source: &Source, status: &SourceStatus) -> Result<Source, AppError>;
}

/// A `Cluster` implementation backed by the K8s API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: String) -> Self {
        Self { client, namespace }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn apply_sub_resource(&self, desired: &SubResource) -> Result<SubResource, AppError> {
        let mut desired = desired.clone();
        desired.meta_mut().managed_fields = None;
        Ok(match &desired {
            SubResource::Workload(obj) => SubResource::Workload(apply(self.api(), obj).await?),
            SubResource::Service(obj) => SubResource::Service(apply(self.api(), obj).await?),
            SubResource::Autoscaler(obj) => SubResource::Autoscaler(apply(self.api(), obj).await?),
            SubResource::MessagingBinding(obj) => SubResource::MessagingBinding(apply(self.api(), obj).await?),
        })
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, kind: Component, name: &str) -> Result<Option<SubResource>, AppError> {
        Ok(match kind {
            Component::Workload => get_opt(self.api::<StatefulSet>(), name).await?.map(SubResource::Workload),
            Component::Service => get_opt(self.api::<Service>(), name).await?.map(SubResource::Service),
            Component::Autoscaler => get_opt(self.api::<HorizontalPodAutoscaler>(), name).await?.map(SubResource::Autoscaler),
            Component::MessagingBinding => get_opt(self.api::<ConfigMap>(), name).await?.map(SubResource::MessagingBinding),
        })
    }

    /// Create the given object with Server-Side Apply, so that a single field manager owns every
    /// field the operator sets from the start, and later applies can remove them.
    #[tracing::instrument(level = "debug", skip(self, desired), fields(component = %desired.component(), name = desired.name()))]
    async fn create(&self, desired: &SubResource) -> Result<SubResource, AppError> {
        tracing::info!("creating sub-resource");
        self.apply_sub_resource(desired).await
    }

    #[tracing::instrument(level = "debug", skip(self, desired), fields(component = %desired.component(), name = desired.name()))]
    async fn update(&self, desired: &SubResource) -> Result<SubResource, AppError> {
        tracing::info!("patching sub-resource");
        self.apply_sub_resource(desired).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete(&self, kind: Component, name: &str) -> Result<(), AppError> {
        tracing::info!("deleting sub-resource");
        match kind {
            Component::Workload => delete(self.api::<StatefulSet>(), name).await,
            Component::Service => delete(self.api::<Service>(), name).await,
            Component::Autoscaler => delete(self.api::<HorizontalPodAutoscaler>(), name).await,
            Component::MessagingBinding => delete(self.api::<ConfigMap>(), name).await,
        }
    }
}

/// A `StatusWriter` implementation backed by the K8s API.
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: Client,
    namespace: String,
}

impl KubeStatusWriter {
    pub fn new(client: Client, namespace: String) -> Self {
        Self { client, namespace }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    /// Replace the status subresource of the given Source.
    ///
    /// The request carries the observed `resourceVersion`, so the API server rejects it if the
    /// Source changed in the meantime. A full replace is used so that pruned conditions are
    /// removed as well.
    #[tracing::instrument(level = "debug", skip(self, source, status), fields(name = source.name()))]
    async fn write_status(&self, source: &Source, status: &SourceStatus) -> Result<Source, AppError> {
        tracing::debug!("writing Source status");
        let api: Api<Source> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut updated = source.clone();
        updated.metadata.managed_fields = None;
        updated.status = Some(status.clone());
        let body = serde_json::to_vec(&updated).map_err(|err| AppError::Ise(err.into()))?;
        timeout(API_TIMEOUT, api.replace_status(source.name(), &PostParams::default(), body))
            .await
            .map_err(|_| AppError::Transient("timeout while writing Source status".into()))?
            .map_err(classify_error)
    }
}

/// Fetch the target object, mapping a 404 to `None`.
async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>, AppError>
where
    K: Clone + DeserializeOwned + Debug,
{
    let res = timeout(API_TIMEOUT, api.get(name))
        .await
        .map_err(|_| AppError::Transient(format!("timeout while fetching {}", name)))?;
    match res {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => Ok(None),
        Err(err) => Err(classify_error(err)),
    }
}

/// Create or patch the given object using Server-Side Apply.
async fn apply<K>(api: Api<K>, obj: &K) -> Result<K, AppError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = obj.meta().name.as_deref().unwrap_or_default();
    timeout(API_TIMEOUT, api.patch(name, &apply_params(), &Patch::Apply(obj)))
        .await
        .map_err(|_| AppError::Transient(format!("timeout while patching {}", name)))?
        .map_err(classify_error)
}

/// The parameters of every apply issued by the operator, for creates and updates alike.
fn apply_params() -> PatchParams {
    let mut params = PatchParams::apply(APP_NAME);
    params.force = true;
    params
}

async fn delete<K>(api: Api<K>, name: &str) -> Result<(), AppError>
where
    K: Clone + DeserializeOwned + Debug,
{
    let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
        .await
        .map_err(|_| AppError::Transient(format!("timeout while deleting {}", name)))?;
    match res {
        Ok(_val) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => Ok(()),
        Err(err) => Err(classify_error(err)),
    }
}

/// Classify a K8s client error as transient or permanent.
///
/// Conflicts, throttling & server errors are transient, as are all errors which never received
/// a response from the API server. Any other API status is permanent.
pub fn classify_error(err: kube::Error) -> AppError {
    match err {
        kube::Error::Api(resp) => classify_status(resp.code, &resp.reason, &resp.message),
        kube::Error::SerdeError(err) => AppError::Ise(err.into()),
        err => AppError::Transient(err.to_string()),
    }
}

fn classify_status(code: u16, reason: &str, message: &str) -> AppError {
    match code {
        404 => AppError::ResourceNotFound,
        409 => AppError::Conflict,
        429 | 500..=599 => AppError::Transient(format!("{} ({}): {}", reason, code, message)),
        _ => AppError::Permanent(format!("{} ({}): {}", reason, code, message)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn api_statuses_are_classified() {
        assert!(matches!(classify_status(409, "Conflict", "stale"), AppError::Conflict));
        assert!(matches!(classify_status(404, "NotFound", "gone"), AppError::ResourceNotFound));
        for code in [429u16, 500, 503, 504] {
            let err = classify_status(code, "ServerTimeout", "busy");
            assert!(err.is_transient(), "expected status {} to be transient, got {:?}", code, err);
        }
        for code in [400u16, 403, 422] {
            let err = classify_status(code, "Invalid", "rejected");
            assert!(!err.is_transient(), "expected status {} to be permanent, got {:?}", code, err);
        }
    }

    #[test]
    fn permanent_errors_carry_reason_and_message() {
        let err = classify_status(422, "Invalid", "spec.replicas: Invalid value");
        assert_eq!(err.to_string(), "permanent error: Invalid (422): spec.replicas: Invalid value");
    }

    #[test]
    fn applies_use_the_operator_field_manager() {
        let params = apply_params();
        assert_eq!(params.field_manager.as_deref(), Some(APP_NAME), "expected creates & updates to share one field manager");
        assert!(params.force, "expected applies to take ownership of conflicting fields");
    }

    #[test]
    fn managed_fields_cover_labels_and_body() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("orders-source-binding".into());
        cm.metadata.labels = Some(maplit::btreemap! {"app".into() => "tributary".into()});
        cm.data = Some(maplit::btreemap! {"DESTINATION".into() => "orders".into()});
        let fields = SubResource::MessagingBinding(cm).managed_fields();
        assert_eq!(
            fields,
            serde_json::json!({"labels": {"app": "tributary"}, "data": {"DESTINATION": "orders"}}),
            "unexpected managed fields"
        );
    }
}
