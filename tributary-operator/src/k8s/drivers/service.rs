//! The service driver, fronting a Source's connector pods with a headless Service.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::k8s::cluster::SubResource;
use crate::k8s::drivers::workload::CONNECTOR_PORT_METRICS;
use crate::k8s::drivers::{object_meta, selector_labels, workload_name, Driver};
use tributary_core::crd::{Component, Source};
use tributary_core::AppError;

/// The driver of the `service` Component.
///
/// The Service is Ready as soon as it exists.
pub struct ServiceDriver;

impl Driver for ServiceDriver {
    fn component(&self) -> Component {
        Component::Service
    }

    fn name(&self, source: &Source) -> String {
        workload_name(source)
    }

    fn desired(&self, source: &Source) -> Result<SubResource, AppError> {
        Ok(SubResource::Service(Service {
            metadata: object_meta(source, Component::Service, self.name(source)),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".into()),
                type_: Some("ClusterIP".into()),
                selector: Some(selector_labels(source)),
                ports: Some(vec![ServicePort {
                    name: Some("metrics".into()),
                    port: CONNECTOR_PORT_METRICS,
                    protocol: Some("TCP".into()),
                    target_port: Some(IntOrString::Int(CONNECTOR_PORT_METRICS)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }))
    }
}
