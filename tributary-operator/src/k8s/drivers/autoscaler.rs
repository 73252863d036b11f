//! The autoscaler driver, scaling a Source's workload with a HorizontalPodAutoscaler.

use k8s_openapi::api::autoscaling::v2beta2::{CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec};

use crate::k8s::cluster::SubResource;
use crate::k8s::drivers::{object_meta, workload_name, Driver};
use tributary_core::crd::{Component, ConditionReason, ResourceCondition, Source};
use tributary_core::AppError;

/// The driver of the `autoscaler` Component, implied only by Sources with a scaling policy.
pub struct AutoscalerDriver;

impl Driver for AutoscalerDriver {
    fn component(&self) -> Component {
        Component::Autoscaler
    }

    fn implied_by(&self, source: &Source) -> bool {
        source.spec.scaling_policy().is_some()
    }

    fn name(&self, source: &Source) -> String {
        workload_name(source)
    }

    fn desired(&self, source: &Source) -> Result<SubResource, AppError> {
        let policy = source
            .spec
            .scaling_policy()
            .ok_or_else(|| AppError::InvalidInput("`maxReplicas` must be set for the Source to be autoscaled".into()))?;
        Ok(SubResource::Autoscaler(HorizontalPodAutoscaler {
            metadata: object_meta(source, Component::Autoscaler, self.name(source)),
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".into()),
                    kind: "StatefulSet".into(),
                    name: workload_name(source),
                },
                min_replicas: Some(policy.min_replicas),
                max_replicas: policy.max_replicas,
                ..Default::default()
            }),
            status: None,
        }))
    }

    /// Failed when the autoscaler reports `AbleToScale=False`, Ready once `ScalingActive=True`.
    fn classify(&self, live: &SubResource) -> ResourceCondition {
        let hpa = match live {
            SubResource::Autoscaler(hpa) => hpa,
            other => return ResourceCondition::failed(ConditionReason::ApiError, format!("expected a HorizontalPodAutoscaler, found {}", other.component())),
        };
        let conditions = hpa.status.as_ref().map(|status| &status.conditions);
        let find = |type_: &str| conditions.and_then(|conds| conds.iter().find(|cond| cond.type_ == type_));

        if let Some(cond) = find("AbleToScale").filter(|cond| cond.status == "False") {
            return ResourceCondition::failed(
                ConditionReason::UnableToScale,
                cond.message.clone().or_else(|| cond.reason.clone()).unwrap_or_else(|| "autoscaler is unable to scale".into()),
            );
        }
        match find("ScalingActive") {
            Some(cond) if cond.status == "True" => ResourceCondition::ready(),
            Some(cond) => ResourceCondition::pending(
                ConditionReason::Progressing,
                cond.message.clone().unwrap_or_else(|| "autoscaler is not active yet".into()),
            ),
            None => ResourceCondition::pending(ConditionReason::Progressing, "autoscaler has not reported its conditions yet"),
        }
    }
}
