//! Source CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, Resource};
use lazy_static::lazy_static;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

pub type Source = SourceCRD; // Mostly to resolve a Rust Analyzer issue.

/// The number of instances used when `parallelism` is absent or `0`.
pub const DEFAULT_PARALLELISM: i32 = 1;
/// The maximum length of a Source's object name.
///
/// Sub-resources are named `{name}-source`, and StatefulSet names longer than 52 characters can
/// not carry the `controller-revision-hash` label on their pods.
const MAX_NAME_LEN: usize = 45;

lazy_static! {
    /// Regular expression used to validate cluster names, which must be valid DNS-1123 labels.
    static ref RE_CLUSTER_NAME: Regex = Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("failed to compile RE_CLUSTER_NAME regex");
    /// Regular expression used to validate source & sink type selectors.
    static ref RE_TYPE_NAME: Regex = Regex::new(r"^[-_.a-zA-Z0-9]{1,100}$").expect("failed to compile RE_TYPE_NAME regex");
    /// Regular expression used to validate fully qualified connector class names.
    static ref RE_CLASS_NAME: Regex = Regex::new(r"^[a-zA-Z_$][a-zA-Z0-9_$]*(\.[a-zA-Z_$][a-zA-Z0-9_$]*)*$").expect("failed to compile RE_CLASS_NAME regex");
    /// Regular expression used to parse K8s resource quantities, e.g. `500m`, `1.5Gi` or `1e3`.
    static ref RE_QUANTITY: Regex = Regex::new(r"^([+-]?)([0-9]*)(?:\.([0-9]*))?(Ki|Mi|Gi|Ti|Pi|Ei|n|u|m|k|M|G|T|P|E|[eE][+-]?[0-9]+)?$")
        .expect("failed to compile RE_QUANTITY regex");
}

/// CRD spec for the Source resource.
///
/// A Source is a streaming data-ingestion connector. The operator runs the connector as a
/// StatefulSet fronted by a headless Service, binds it to its destination topic through a
/// ConfigMap, and optionally scales it with a HorizontalPodAutoscaler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "SourceCRD",
    status = "SourceStatus",
    group = "tributary.rs",
    version = "v1alpha1",
    kind = "Source",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "source",
    printcolumn = r#"{"name":"Source Type","type":"string","jsonPath":".spec.sourceType"}"#,
    printcolumn = r#"{"name":"Destination","type":"string","jsonPath":".spec.destination"}"#,
    printcolumn = r#"{"name":"Parallelism","type":"number","jsonPath":".spec.parallelism"}"#,
    printcolumn = r#"{"name":"Max Replicas","type":"number","jsonPath":".spec.maxReplicas"}"#,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// The name of the connector instance, defaults to the name of the Source object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The fully qualified class name of the connector implementation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// The type of system this Source ingests from, e.g. `kafka`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    /// The record type this Source emits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink_type: Option<String>,
    /// The number of connector instances to run.
    ///
    /// A value of `0` or an absent value uses the default of a single instance. When an
    /// autoscaling policy is configured via `maxReplicas`, this is the minimum replica count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,
    /// The maximum number of instances an autoscaler may scale this Source to.
    ///
    /// When absent, no autoscaler is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    /// The topic to which ingested records are published.
    ///
    /// When absent, the connector publishes to the default topic of its source type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// The schema type of published records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
    /// Connector specific configuration, passed through verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_config: BTreeMap<String, String>,
    /// The cluster on which this Source is deployed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// Message broker connection parameters.
    #[serde(flatten)]
    pub messaging: Messaging,
    /// Execution environment of the connector workload.
    #[serde(flatten)]
    pub runtime: Runtime,
}

/// Message broker connection parameters.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Messaging {
    /// Connection parameters for a Pulsar cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulsar: Option<PulsarMessaging>,
}

/// Connection parameters for a Pulsar cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PulsarMessaging {
    /// The broker service URL, e.g. `pulsar://pulsar-broker:6650`.
    pub service_url: String,
    /// The admin (web service) URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_url: Option<String>,
    /// The name of a Secret holding client authentication parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<String>,
    /// The name of a Secret holding the broker's TLS trust certificates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
}

/// Execution environment of the connector workload.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    /// The container image of the connector runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// The pull policy of the connector runner image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    /// Compute resources of each connector instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<RuntimeResources>,
    /// A Java connector package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java: Option<JavaRuntime>,
    /// A Python connector package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<PythonRuntime>,
    /// A Go connector package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub golang: Option<GoRuntime>,
}

/// Compute resources of a connector instance.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct RuntimeResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,
}

/// CPU & memory quantities, in K8s quantity notation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceList {
    /// All quantities of this list, as `(resource, quantity)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        [("cpu", self.cpu.as_deref()), ("memory", self.memory.as_deref())]
            .into_iter()
            .filter_map(|(resource, quantity)| quantity.map(|quantity| (resource, quantity)))
    }
}

/// Parse a K8s resource quantity into nano units.
///
/// Equal quantities parse to the same value regardless of notation, so `1000m`, `1` and `1e0` are
/// all `1_000_000_000`. Precision below nano units is rounded up, as the API server does.
/// Returns `None` for malformed or overflowing quantities.
pub fn parse_quantity(quantity: &str) -> Option<i128> {
    let caps = RE_QUANTITY.captures(quantity.trim())?;
    let whole = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    let fraction = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    let (exp10, exp2): (i32, u32) = match caps.get(4).map(|m| m.as_str()).unwrap_or_default() {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 10),
        "Mi" => (0, 20),
        "Gi" => (0, 30),
        "Ti" => (0, 40),
        "Pi" => (0, 50),
        "Ei" => (0, 60),
        exponent => (exponent[1..].parse().ok()?, 0),
    };

    let digits: i128 = format!("{}{}", whole, fraction).parse().ok()?;
    let value = digits.checked_mul(1i128 << exp2)?;
    let scale = exp10.checked_add(9)?.checked_sub(i32::try_from(fraction.len()).ok()?)?;
    let value = if scale >= 0 {
        value.checked_mul(10i128.checked_pow(u32::try_from(scale).ok()?)?)?
    } else {
        let divisor = 10i128.checked_pow(scale.unsigned_abs())?;
        (value + divisor - 1) / divisor
    };
    Some(if &caps[1] == "-" { -value } else { value })
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JavaRuntime {
    /// Path of the connector jar inside the runner image.
    pub jar: String,
    /// Remote location the jar is fetched from before start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jar_location: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PythonRuntime {
    /// Path of the connector module inside the runner image.
    pub py: String,
    /// Remote location the module is fetched from before start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub py_location: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GoRuntime {
    /// Path of the connector binary inside the runner image.
    pub go: String,
    /// Remote location the binary is fetched from before start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub go_location: Option<String>,
}

/// The language runtime of a connector package.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Language {
    Java,
    Python,
    Go,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Java => "java",
            Self::Python => "python",
            Self::Go => "go",
        }
    }
}

impl Runtime {
    /// The connector package as `(language, path, location)`, if one is configured.
    ///
    /// When more than one package is configured (which validation rejects) the first in
    /// `java`, `python`, `golang` order wins.
    pub fn package(&self) -> Option<(Language, &str, Option<&str>)> {
        if let Some(java) = &self.java {
            return Some((Language::Java, java.jar.as_str(), java.jar_location.as_deref()));
        }
        if let Some(python) = &self.python {
            return Some((Language::Python, python.py.as_str(), python.py_location.as_deref()));
        }
        self.golang
            .as_ref()
            .map(|golang| (Language::Go, golang.go.as_str(), golang.go_location.as_deref()))
    }
}

/// The autoscaling bounds derived from a Source spec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub min_replicas: i32,
    pub max_replicas: i32,
}

impl SourceSpec {
    /// The number of instances to run, applying the default for `0` or an absent value.
    pub fn effective_parallelism(&self) -> i32 {
        match self.parallelism {
            Some(parallelism) if parallelism > 0 => parallelism,
            _ => DEFAULT_PARALLELISM,
        }
    }

    /// The autoscaling policy of this Source, if one is configured.
    pub fn scaling_policy(&self) -> Option<ScalingPolicy> {
        self.max_replicas.map(|max_replicas| ScalingPolicy {
            min_replicas: self.effective_parallelism(),
            max_replicas,
        })
    }

    /// Statically validate this spec, returning all problems found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = vec![];

        match self.cluster_name.as_deref() {
            None | Some("") => errors.push("`clusterName` must be set".to_string()),
            Some(name) if !RE_CLUSTER_NAME.is_match(name) => {
                errors.push(format!("`clusterName` {:?} must be a valid DNS-1123 label", name));
            }
            Some(_) => (),
        }
        if let Some(name) = self.class_name.as_deref() {
            if !RE_CLASS_NAME.is_match(name) {
                errors.push(format!("`className` {:?} is not a valid class name", name));
            }
        }
        match self.source_type.as_deref() {
            None | Some("") => errors.push("`sourceType` must be set".to_string()),
            Some(name) if !RE_TYPE_NAME.is_match(name) => {
                errors.push(format!("`sourceType` {:?} must match the pattern `^[-_.a-zA-Z0-9]{{1,100}}$`", name));
            }
            Some(_) => (),
        }
        if let Some(sink_type) = self.sink_type.as_deref() {
            if !RE_TYPE_NAME.is_match(sink_type) {
                errors.push(format!("`sinkType` {:?} must match the pattern `^[-_.a-zA-Z0-9]{{1,100}}$`", sink_type));
            }
            if Some(sink_type) == self.source_type.as_deref() {
                errors.push(format!("`sinkType` {:?} may not be the same as `sourceType`", sink_type));
            }
        }
        if matches!(self.destination.as_deref(), Some(destination) if destination.trim().is_empty()) {
            errors.push("`destination` may not be blank when set".to_string());
        }
        if matches!(self.parallelism, Some(parallelism) if parallelism < 0) {
            errors.push("`parallelism` may not be negative".to_string());
        }
        if let Some(max_replicas) = self.max_replicas {
            let min_replicas = self.effective_parallelism();
            if max_replicas < min_replicas {
                errors.push(format!("`maxReplicas` ({}) may not be less than the effective parallelism ({})", max_replicas, min_replicas));
            }
        }
        if let Some(resources) = &self.runtime.resources {
            for (kind, list) in [("requests", &resources.requests), ("limits", &resources.limits)] {
                for (resource, quantity) in list.iter().flat_map(|list| list.entries()) {
                    if parse_quantity(quantity).is_none() {
                        errors.push(format!("`resources.{}.{}` {:?} is not a valid quantity", kind, resource, quantity));
                    }
                }
            }
        }
        if self.source_config.keys().any(|key| key.is_empty()) {
            errors.push("`sourceConfig` keys may not be empty".to_string());
        }
        if let Some(pulsar) = &self.messaging.pulsar {
            if pulsar.service_url.is_empty() {
                errors.push("`pulsar.serviceUrl` must be set".to_string());
            }
        }
        let packages = [self.runtime.java.is_some(), self.runtime.python.is_some(), self.runtime.golang.is_some()];
        if packages.iter().filter(|set| **set).count() > 1 {
            errors.push("only one of `java`, `python` or `golang` may be configured".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl SourceCRD {
    /// The name of the connector instance.
    pub fn connector_name(&self) -> &str {
        match self.spec.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => self.meta().name.as_deref().unwrap_or_default(),
        }
    }

    /// Statically validate this object, including its spec.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = match self.spec.validate() {
            Ok(()) => vec![],
            Err(errors) => errors,
        };
        let name = self.meta().name.as_deref().unwrap_or_default();
        if name.len() > MAX_NAME_LEN {
            errors.push(format!("Source names may contain a maximum of {} characters", MAX_NAME_LEN));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct SourceStatus {
    /// The last observed condition of each managed Component.
    #[serde(default, deserialize_with = "null_as_default")]
    #[schemars(with = "BTreeMap<Component, ResourceCondition>")]
    pub conditions: BTreeMap<Component, ResourceCondition>,
}

/// Deserialize a `null` value as the type's default.
fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

/// A sub-resource kind managed on behalf of a Source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Component {
    /// The StatefulSet running the connector.
    Workload,
    /// The headless Service fronting the connector pods.
    Service,
    /// The HorizontalPodAutoscaler scaling the workload.
    Autoscaler,
    /// The ConfigMap binding the connector to its broker & destination.
    MessagingBinding,
}

impl Component {
    /// All Components, in reconciliation order.
    pub const ALL: [Component; 4] = [Self::Workload, Self::Service, Self::Autoscaler, Self::MessagingBinding];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workload => "workload",
            Self::Service => "service",
            Self::Autoscaler => "autoscaler",
            Self::MessagingBinding => "messagingBinding",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The classified state of a Component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionState {
    Pending,
    Ready,
    Failed,
    Terminating,
}

impl std::fmt::Display for ConditionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Pending => "Pending",
                Self::Ready => "Ready",
                Self::Failed => "Failed",
                Self::Terminating => "Terminating",
            }
        )
    }
}

/// Stable, machine readable reason codes attached to conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionReason {
    /// The sub-resource does not exist yet.
    NotFound,
    /// The sub-resource exists but has not converged yet.
    Progressing,
    /// The sub-resource is serving.
    Available,
    /// The Source spec failed validation.
    InvalidSpec,
    /// The cluster rejected a request for the sub-resource.
    ApiError,
    /// A request for the sub-resource failed and will be retried.
    TransientError,
    /// Transient failures for the sub-resource exceeded the retry budget.
    RetryBudgetExhausted,
    /// The sub-resource is being deleted.
    Deleting,
    /// The autoscaler reports it is unable to scale the workload.
    UnableToScale,
}

/// The last observed condition of a Component.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCondition {
    pub status: ConditionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConditionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl ResourceCondition {
    fn new(status: ConditionState, reason: ConditionReason, message: Option<String>) -> Self {
        Self {
            status,
            reason: Some(reason),
            message,
            last_transition_time: None,
        }
    }

    pub fn pending(reason: ConditionReason, message: impl Into<String>) -> Self {
        Self::new(ConditionState::Pending, reason, Some(message.into()))
    }

    pub fn ready() -> Self {
        Self::new(ConditionState::Ready, ConditionReason::Available, None)
    }

    pub fn failed(reason: ConditionReason, message: impl Into<String>) -> Self {
        Self::new(ConditionState::Failed, reason, Some(message.into()))
    }

    pub fn terminating(message: impl Into<String>) -> Self {
        Self::new(ConditionState::Terminating, ConditionReason::Deleting, Some(message.into()))
    }

    pub fn is_ready(&self) -> bool {
        self.status == ConditionState::Ready
    }

    pub fn is_failed(&self) -> bool {
        self.status == ConditionState::Failed
    }
}
