//! The workload driver, running a Source's connector as a StatefulSet.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecretEnvSource, SecretVolumeSource, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use serde_json::Value;

use crate::k8s::cluster::SubResource;
use crate::k8s::drivers::{
    binding_name, is_subset, object_meta, selector_labels, workload_name, Driver, DriverConfig, LABEL_TRIBUTARY_RS_COMPONENT,
};
use tributary_core::crd::{parse_quantity, Component, ConditionReason, RequiredMetadata, ResourceCondition, ResourceList, Source};
use tributary_core::AppError;

/// The pod container name of the connector.
///
/// NOTE WELL: do not change the name of this container. It will cause breaking changes.
const CONTAINER_NAME_CONNECTOR: &str = "connector";
/// The port on which the connector runner exposes metrics & liveness.
pub const CONNECTOR_PORT_METRICS: i32 = 9094;
/// The location where the broker's TLS trust certificates are mounted.
const TLS_CERTS_PATH: &str = "/etc/tributary/tls";

/// The driver of the `workload` Component.
pub struct WorkloadDriver {
    config: DriverConfig,
}

impl WorkloadDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    fn build_statefulset(&self, source: &Source) -> StatefulSet {
        let spec = &source.spec;
        let mut pod_labels = selector_labels(source);
        pod_labels.insert(LABEL_TRIBUTARY_RS_COMPONENT.into(), Component::Workload.as_str().into());

        // An autoscaled workload leaves its replica count to the autoscaler.
        let replicas = match spec.scaling_policy() {
            Some(_) => None,
            None => Some(spec.effective_parallelism()),
        };

        let mut env = vec![
            EnvVar {
                name: "RUST_LOG".into(),
                value: Some("info".into()),
                ..Default::default()
            },
            EnvVar {
                name: "SOURCE_NAME".into(),
                value: Some(source.connector_name().into()),
                ..Default::default()
            },
            EnvVar {
                name: "METRICS_PORT".into(),
                value: Some(CONNECTOR_PORT_METRICS.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "NAMESPACE".into(),
                value_from: Some(field_ref("metadata.namespace")),
                ..Default::default()
            },
            EnvVar {
                name: "POD_NAME".into(),
                value_from: Some(field_ref("metadata.name")),
                ..Default::default()
            },
        ];
        if let Some((language, package, location)) = spec.runtime.package() {
            env.push(EnvVar {
                name: "CONNECTOR_LANGUAGE".into(),
                value: Some(language.as_str().into()),
                ..Default::default()
            });
            env.push(EnvVar {
                name: "CONNECTOR_PACKAGE".into(),
                value: Some(package.into()),
                ..Default::default()
            });
            if let Some(location) = location {
                env.push(EnvVar {
                    name: "CONNECTOR_PACKAGE_LOCATION".into(),
                    value: Some(location.into()),
                    ..Default::default()
                });
            }
        }

        // Broker & destination parameters come from the messaging binding.
        let mut env_from = vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: Some(binding_name(source)),
                optional: Some(false),
            }),
            ..Default::default()
        }];
        let pulsar = spec.messaging.pulsar.as_ref();
        if let Some(secret) = pulsar.and_then(|pulsar| pulsar.auth_secret.as_ref()) {
            env_from.push(EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: Some(secret.clone()),
                    optional: Some(false),
                }),
                ..Default::default()
            });
        }
        let (mut volumes, mut volume_mounts) = (vec![], vec![]);
        if let Some(secret) = pulsar.and_then(|pulsar| pulsar.tls_secret.as_ref()) {
            volumes.push(Volume {
                name: "tls".into(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: "tls".into(),
                mount_path: TLS_CERTS_PATH.into(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let resources = spec.runtime.resources.as_ref();
        let probe = |initial_delay_seconds, period_seconds| Probe {
            initial_delay_seconds: Some(initial_delay_seconds),
            period_seconds: Some(period_seconds),
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(CONNECTOR_PORT_METRICS),
                host: None,
            }),
            ..Default::default()
        };

        let container = Container {
            // NOTE WELL: do not change the name of this container. It will cause breaking changes.
            name: CONTAINER_NAME_CONNECTOR.into(),
            image: Some(spec.runtime.image.clone().unwrap_or_else(|| self.config.default_image.clone())),
            image_pull_policy: Some(spec.runtime.image_pull_policy.clone().unwrap_or_else(|| "IfNotPresent".into())),
            ports: Some(vec![ContainerPort {
                name: Some("metrics".into()),
                container_port: CONNECTOR_PORT_METRICS,
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            env: Some(env),
            env_from: Some(env_from),
            // Owned fields are always set, even when empty, so that removing them from the
            // Source is detected as drift.
            resources: Some(ResourceRequirements {
                requests: Some(quantities(resources.and_then(|resources| resources.requests.as_ref()))),
                limits: Some(quantities(resources.and_then(|resources| resources.limits.as_ref()))),
            }),
            volume_mounts: Some(volume_mounts),
            readiness_probe: Some(probe(5, 10)),
            liveness_probe: Some(probe(15, 20)),
            ..Default::default()
        };

        StatefulSet {
            metadata: object_meta(source, Component::Workload, self.name(source)),
            spec: Some(StatefulSetSpec {
                replicas,
                service_name: workload_name(source),
                pod_management_policy: Some("Parallel".into()),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".into()),
                    rolling_update: None,
                }),
                selector: LabelSelector {
                    match_labels: Some(selector_labels(source)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        termination_grace_period_seconds: Some(30),
                        containers: vec![container],
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}

impl Driver for WorkloadDriver {
    fn component(&self) -> Component {
        Component::Workload
    }

    fn name(&self, source: &Source) -> String {
        workload_name(source)
    }

    #[tracing::instrument(level = "debug", skip(self, source), fields(source = source.name()))]
    fn desired(&self, source: &Source) -> Result<SubResource, AppError> {
        Ok(SubResource::Workload(self.build_statefulset(source)))
    }

    fn matches(&self, desired: &SubResource, live: &SubResource) -> bool {
        let (mut desired, mut live) = (desired.managed_fields(), live.managed_fields());
        canonicalize_quantities(&mut desired);
        canonicalize_quantities(&mut live);
        is_subset(&desired, &live)
    }

    /// Ready once the StatefulSet controller has observed the latest generation and all desired
    /// replicas are ready.
    fn classify(&self, live: &SubResource) -> ResourceCondition {
        let sts = match live {
            SubResource::Workload(sts) => sts,
            other => return ResourceCondition::failed(ConditionReason::ApiError, format!("expected a StatefulSet, found {}", other.component())),
        };
        let status = match sts.status.as_ref() {
            Some(status) => status,
            None => return ResourceCondition::pending(ConditionReason::Progressing, "StatefulSet has no status yet"),
        };
        let generation = sts.metadata.generation.unwrap_or(0);
        let observed_generation = status.observed_generation.unwrap_or(0);
        if observed_generation < generation {
            return ResourceCondition::pending(
                ConditionReason::Progressing,
                format!("StatefulSet generation {} not yet observed (observed {})", generation, observed_generation),
            );
        }
        let desired = sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(status.replicas);
        let ready = status.ready_replicas.unwrap_or(0);
        if ready >= desired {
            ResourceCondition::ready()
        } else {
            ResourceCondition::pending(ConditionReason::Progressing, format!("{}/{} replicas ready", ready, desired))
        }
    }
}

fn field_ref(field_path: &str) -> EnvVarSource {
    EnvVarSource {
        field_ref: Some(ObjectFieldSelector {
            field_path: field_path.into(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(list: Option<&ResourceList>) -> BTreeMap<String, Quantity> {
    list.into_iter()
        .flat_map(|list| list.entries())
        .map(|(resource, quantity)| (resource.to_string(), Quantity(quantity.to_string())))
        .collect()
}

/// Rewrite the container resource quantities of a StatefulSet's managed fields into nano units.
///
/// The API server stores quantities in canonical notation (`1000m` becomes `1`), so quantities
/// are compared by value.
fn canonicalize_quantities(fields: &mut Value) {
    let containers = match fields.pointer_mut("/spec/template/spec/containers").and_then(Value::as_array_mut) {
        Some(containers) => containers,
        None => return,
    };
    for container in containers.iter_mut() {
        for kind in ["requests", "limits"] {
            let list = match container.pointer_mut(&format!("/resources/{}", kind)).and_then(Value::as_object_mut) {
                Some(list) => list,
                None => continue,
            };
            for quantity in list.values_mut() {
                if let Some(nanos) = quantity.as_str().and_then(parse_quantity) {
                    *quantity = Value::String(nanos.to_string());
                }
            }
        }
    }
}
