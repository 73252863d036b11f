//! The messaging binding driver.
//!
//! The binding is a ConfigMap carrying everything a connector instance needs to publish to its
//! destination: broker parameters, the destination topic, the schema type and the verbatim
//! connector config. The workload consumes it via `envFrom`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;

use crate::k8s::cluster::SubResource;
use crate::k8s::drivers::{binding_name, is_subset, object_meta, Driver};
use tributary_core::crd::{Component, Source};
use tributary_core::AppError;

/// The driver of the `messagingBinding` Component.
pub struct MessagingBindingDriver;

impl MessagingBindingDriver {
    fn build_data(source: &Source) -> Result<BTreeMap<String, String>, AppError> {
        let spec = &source.spec;
        let mut data = BTreeMap::new();
        let mut put = |key: &str, val: Option<&String>| {
            if let Some(val) = val {
                data.insert(key.to_string(), val.clone());
            }
        };
        put("CLASS_NAME", spec.class_name.as_ref());
        put("SOURCE_TYPE", spec.source_type.as_ref());
        put("SINK_TYPE", spec.sink_type.as_ref());
        put("DESTINATION", spec.destination.as_ref());
        put("SCHEMA_TYPE", spec.schema_type.as_ref());
        put("CLUSTER_NAME", spec.cluster_name.as_ref());
        if let Some(pulsar) = spec.messaging.pulsar.as_ref() {
            put("PULSAR_SERVICE_URL", Some(&pulsar.service_url));
            put("PULSAR_ADMIN_URL", pulsar.admin_url.as_ref());
        }
        data.insert("PARALLELISM".into(), spec.effective_parallelism().to_string());
        let config = serde_json::to_string(&spec.source_config).map_err(|err| AppError::Ise(err.into()))?;
        data.insert("SOURCE_CONFIG".into(), config);
        Ok(data)
    }
}

impl Driver for MessagingBindingDriver {
    fn component(&self) -> Component {
        Component::MessagingBinding
    }

    fn name(&self, source: &Source) -> String {
        binding_name(source)
    }

    fn desired(&self, source: &Source) -> Result<SubResource, AppError> {
        Ok(SubResource::MessagingBinding(ConfigMap {
            metadata: object_meta(source, Component::MessagingBinding, self.name(source)),
            data: Some(Self::build_data(source)?),
            ..Default::default()
        }))
    }

    /// Labels must be a subset of the live labels, but data must match exactly so that removed
    /// keys are removed from the binding as well.
    fn matches(&self, desired: &SubResource, live: &SubResource) -> bool {
        let data = |obj: &SubResource| match obj {
            SubResource::MessagingBinding(cm) => cm.data.clone().unwrap_or_default(),
            _ => BTreeMap::new(),
        };
        let labels = |obj: &SubResource| serde_json::to_value(&obj.meta().labels).unwrap_or_default();
        data(desired) == data(live) && is_subset(&labels(desired), &labels(live))
    }
}
