//! Component drivers.
//!
//! Each driver owns a single Component of a Source. Drivers are pure: they compute the desired
//! sub-resource from a Source, classify an observed sub-resource, and decide which action
//! converges the two. All I/O is performed by the reconciler.

mod autoscaler;
mod messaging;
mod service;
mod workload;

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::Resource;
use serde_json::Value;

pub use autoscaler::AutoscalerDriver;
pub use messaging::MessagingBindingDriver;
pub use service::ServiceDriver;
pub use workload::WorkloadDriver;

use crate::k8s::cluster::SubResource;
use tributary_core::crd::{Component, ConditionReason, RequiredMetadata, ResourceCondition, Source};
use tributary_core::AppError;

/// The canonical Tributary label identifying the owning Source.
pub const LABEL_TRIBUTARY_RS_SOURCE: &str = "tributary.rs/source";
/// The canonical Tributary label identifying the Component of an object.
pub const LABEL_TRIBUTARY_RS_COMPONENT: &str = "tributary.rs/component";

/// The action which converges a live sub-resource toward its desired state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Delete,
    NoOp,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        })
    }
}

/// A driver of a single Component kind.
pub trait Driver: Send + Sync {
    /// The Component driven by this driver.
    fn component(&self) -> Component;

    /// Check if the given Source requires this Component.
    fn implied_by(&self, _source: &Source) -> bool {
        true
    }

    /// The name of this Component's object for the given Source.
    fn name(&self, source: &Source) -> String;

    /// Build the desired object for the given Source.
    fn desired(&self, source: &Source) -> Result<SubResource, AppError>;

    /// Classify the observed state of this Component.
    ///
    /// An absent object is Pending and an object marked for deletion is Terminating; all other
    /// objects are classified by `classify`.
    fn observe(&self, live: Option<&SubResource>) -> ResourceCondition {
        match live {
            None => ResourceCondition::pending(ConditionReason::NotFound, format!("{} does not exist yet", self.component())),
            Some(obj) if obj.is_terminating() => ResourceCondition::terminating(format!("{} {} is being deleted", self.component(), obj.name())),
            Some(obj) => self.classify(obj),
        }
    }

    /// Classify a live object which is not being deleted.
    fn classify(&self, _live: &SubResource) -> ResourceCondition {
        ResourceCondition::ready()
    }

    /// Decide the action which converges `live` toward `desired`.
    fn converge(&self, desired: Option<&SubResource>, live: Option<&SubResource>) -> Action {
        match (desired, live) {
            (None, None) => Action::NoOp,
            // Objects already being deleted are left to finish.
            (_, Some(live)) if live.is_terminating() => Action::NoOp,
            (None, Some(_)) => Action::Delete,
            (Some(_), None) => Action::Create,
            (Some(desired), Some(live)) if self.matches(desired, live) => Action::NoOp,
            (Some(_), Some(_)) => Action::Update,
        }
    }

    /// Check if every field the operator sets on `desired` already holds on `live`.
    fn matches(&self, desired: &SubResource, live: &SubResource) -> bool {
        is_subset(&desired.managed_fields(), &live.managed_fields())
    }
}

/// Configuration shared by the standard drivers.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// The connector runner image used when a Source does not specify one.
    pub default_image: String,
}

/// The set of drivers used by a reconciler, keyed by Component.
pub struct DriverSet {
    drivers: BTreeMap<Component, Box<dyn Driver>>,
}

impl DriverSet {
    /// Build a driver set from the given drivers. Later drivers replace earlier ones of the same Component.
    pub fn new(drivers: Vec<Box<dyn Driver>>) -> Self {
        Self {
            drivers: drivers.into_iter().map(|driver| (driver.component(), driver)).collect(),
        }
    }

    /// The standard set of drivers, one for every Component.
    pub fn standard(config: DriverConfig) -> Self {
        Self::new(vec![
            Box::new(WorkloadDriver::new(config)),
            Box::new(ServiceDriver),
            Box::new(AutoscalerDriver),
            Box::new(MessagingBindingDriver),
        ])
    }

    pub fn get(&self, component: Component) -> Option<&dyn Driver> {
        self.drivers.get(&component).map(|driver| driver.as_ref())
    }

    /// All drivers, in Component order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Driver> {
        self.drivers.values().map(|driver| driver.as_ref())
    }

    /// The Components required by the given Source.
    pub fn implied_components(&self, source: &Source) -> BTreeSet<Component> {
        self.iter()
            .filter(|driver| driver.implied_by(source))
            .map(|driver| driver.component())
            .collect()
    }
}

/// Set the canonical labels on an object controlled by Tributary.
pub fn set_canonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert("app".into(), "tributary".into());
    labels.insert("tributary.rs/controlled-by".into(), "tributary-operator".into());
}

/// The labels selecting the pods of the given Source.
pub fn selector_labels(source: &Source) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".into(), "tributary".into());
    labels.insert(LABEL_TRIBUTARY_RS_SOURCE.into(), source.name().into());
    labels
}

/// Build the metadata of a Component object owned by the given Source.
pub fn object_meta(source: &Source, component: Component, name: String) -> ObjectMeta {
    let mut labels = BTreeMap::new();
    set_canonical_labels(&mut labels);
    labels.insert(LABEL_TRIBUTARY_RS_SOURCE.into(), source.name().into());
    labels.insert(LABEL_TRIBUTARY_RS_COMPONENT.into(), component.as_str().into());
    ObjectMeta {
        name: Some(name),
        namespace: Some(source.namespace().into()),
        labels: Some(labels),
        owner_references: owner_reference(source).map(|owner| vec![owner]),
        ..Default::default()
    }
}

/// A controller owner reference to the given Source, used for cascading deletion.
fn owner_reference(source: &Source) -> Option<OwnerReference> {
    let uid = source.meta().uid.clone()?;
    Some(OwnerReference {
        api_version: Source::api_version(&()).to_string(),
        kind: Source::kind(&()).to_string(),
        name: source.name().into(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// The name of the StatefulSet, Service & HorizontalPodAutoscaler of a Source.
pub fn workload_name(source: &Source) -> String {
    format!("{}-source", source.name())
}

/// The name of the messaging binding ConfigMap of a Source.
pub fn binding_name(source: &Source) -> String {
    format!("{}-source-binding", source.name())
}

/// Check if every value set in `desired` is present with the same value in `live`.
///
/// Objects are compared key by key, so fields populated by the server on `live` are ignored.
/// Arrays must have the same length and match element-wise. Empty values in `desired` match
/// absent or empty values in `live`, and an explicitly empty object only matches an empty one.
pub fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Null, _) => true,
        (Value::Object(desired), Value::Object(live)) if desired.is_empty() => live.values().all(is_empty),
        (Value::Object(desired), Value::Object(live)) => desired.iter().all(|(key, desired)| match live.get(key) {
            Some(live) => is_subset(desired, live),
            None => is_empty(desired),
        }),
        (Value::Array(desired), Value::Array(live)) => {
            desired.len() == live.len() && desired.iter().zip(live.iter()).all(|(desired, live)| is_subset(desired, live))
        }
        (desired, Value::Null) => is_empty(desired),
        (desired, live) => desired == live,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.values().all(is_empty),
        Value::Array(vals) => vals.is_empty(),
        _ => false,
    }
}
