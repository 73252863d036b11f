use std::collections::BTreeSet;

use anyhow::Result;
use k8s_openapi::api::apps::v1::StatefulSetStatus;

use crate::k8s::cluster::SubResource;
use crate::k8s::drivers::{Action, DriverConfig, DriverSet};
use crate::k8s::fixtures::{Call, Failure, FakeCluster, FakeStatusWriter};
use crate::k8s::reconciler::{ReconcileOutcome, Reconciler, Requeue};
use tributary_core::condition::{ConditionTracker, OverallState};
use tributary_core::crd::{Component, ConditionReason, ConditionState, PulsarMessaging, ResourceList, RuntimeResources, Source, SourceSpec};

const RETRY_BUDGET: u32 = 3;

fn drivers() -> DriverSet {
    DriverSet::standard(DriverConfig {
        default_image: "example/runner:latest".into(),
    })
}

fn new_reconciler() -> Reconciler<FakeCluster, FakeStatusWriter> {
    Reconciler::new(FakeCluster::default(), FakeStatusWriter::default(), drivers(), RETRY_BUDGET)
}

fn kafka_source() -> Source {
    let mut source = Source::new(
        "orders",
        SourceSpec {
            class_name: Some("org.example.connect.KafkaSource".into()),
            source_type: Some("kafka".into()),
            parallelism: Some(3),
            destination: Some("persistent://public/default/orders".into()),
            cluster_name: Some("prod".into()),
            ..Default::default()
        },
    );
    source.metadata.namespace = Some("default".into());
    source.metadata.uid = Some("3f1e7c2a-uid".into());
    source.metadata.resource_version = Some("1".into());
    source
}

/// Run a pass, replacing `source` with its updated copy as the scheduler does.
async fn run(reconciler: &Reconciler<FakeCluster, FakeStatusWriter>, source: &mut Source, tracker: &mut ConditionTracker) -> ReconcileOutcome {
    let outcome = reconciler.reconcile(source, tracker).await;
    if let Some(updated) = outcome.updated.clone() {
        *source = updated;
    }
    outcome
}

fn components(tracker: &ConditionTracker) -> BTreeSet<Component> {
    tracker.components().collect()
}

#[test]
fn implied_components_are_a_function_of_spec() {
    let drivers = drivers();
    let mut source = kafka_source();
    let expected: BTreeSet<Component> = [Component::Workload, Component::Service, Component::MessagingBinding].into_iter().collect();
    assert_eq!(drivers.implied_components(&source), expected);
    assert_eq!(drivers.implied_components(&source), drivers.implied_components(&source.clone()));

    source.spec.max_replicas = Some(6);
    let implied = drivers.implied_components(&source);
    assert!(implied.contains(&Component::Autoscaler), "expected maxReplicas to imply the autoscaler, got {:?}", implied);
}

#[tokio::test]
async fn kafka_source_creates_workload_service_and_binding() -> Result<()> {
    let reconciler = new_reconciler();
    let (mut source, mut tracker) = (kafka_source(), ConditionTracker::new());

    let outcome = run(&reconciler, &mut source, &mut tracker).await;

    let expected: BTreeSet<Component> = [Component::Workload, Component::Service, Component::MessagingBinding].into_iter().collect();
    assert_eq!(components(&tracker), expected, "unexpected tracked components");
    assert_eq!(outcome.requeue, Requeue::Resync);
    assert_eq!(outcome.overall, OverallState::Pending, "expected the fresh workload to hold the Source at Pending");

    let creates: Vec<Call> = reconciler.cluster().writes();
    assert_eq!(
        creates,
        vec![
            Call::Create(Component::Workload, "orders-source".into()),
            Call::Create(Component::Service, "orders-source".into()),
            Call::Create(Component::MessagingBinding, "orders-source-binding".into()),
        ],
        "expected creates in Component order"
    );
    let writes = reconciler.status_writer().writes();
    assert_eq!(writes.len(), 1, "expected exactly one status write, got {}", writes.len());
    assert_eq!(writes[0].conditions.len(), 3);
    Ok(())
}

#[tokio::test]
async fn second_pass_converges_to_noop() -> Result<()> {
    let reconciler = new_reconciler();
    let (mut source, mut tracker) = (kafka_source(), ConditionTracker::new());
    run(&reconciler, &mut source, &mut tracker).await;

    let drivers = drivers();
    for component in drivers.implied_components(&source) {
        let driver = drivers.get(component).expect("expected a driver for every component");
        let desired = driver.desired(&source)?;
        let live = reconciler.cluster().object(component, desired.name());
        let action = driver.converge(Some(&desired), live.as_ref());
        assert_eq!(action, Action::NoOp, "expected {} to be converged, got {}", component, action);
    }

    reconciler.cluster().clear_calls();
    let outcome = run(&reconciler, &mut source, &mut tracker).await;
    assert!(reconciler.cluster().writes().is_empty(), "expected no writes, got {:?}", reconciler.cluster().writes());
    assert!(outcome.updated.is_none(), "expected an unchanged status to not be written");
    assert_eq!(reconciler.status_writer().writes().len(), 1);
    Ok(())
}

#[tokio::test]
async fn source_is_ready_once_workload_is_ready() -> Result<()> {
    let reconciler = new_reconciler();
    let (mut source, mut tracker) = (kafka_source(), ConditionTracker::new());
    run(&reconciler, &mut source, &mut tracker).await;

    reconciler.cluster().modify(Component::Workload, "orders-source", |obj| {
        if let SubResource::Workload(sts) = obj {
            sts.status = Some(StatefulSetStatus {
                observed_generation: sts.metadata.generation,
                ready_replicas: Some(3),
                replicas: 3,
                ..Default::default()
            });
        }
    });
    let outcome = run(&reconciler, &mut source, &mut tracker).await;

    assert_eq!(outcome.overall, OverallState::Ready, "expected all components to be ready, got {:?}", tracker.to_status());
    let status = source.status.as_ref().expect("expected a persisted status");
    assert!(status.conditions.values().all(|cond| cond.is_ready()), "expected every persisted condition to be Ready");
    Ok(())
}

#[tokio::test]
async fn pruning_deletes_once_and_removes_condition() -> Result<()> {
    let reconciler = new_reconciler();
    let mut source = kafka_source();
    source.spec.max_replicas = Some(6);
    let mut tracker = ConditionTracker::new();
    run(&reconciler, &mut source, &mut tracker).await;
    assert!(tracker.get(Component::Autoscaler).is_some(), "expected an autoscaler condition");
    assert!(reconciler.cluster().object(Component::Autoscaler, "orders-source").is_some());

    source.spec.max_replicas = None;
    reconciler.cluster().clear_calls();
    let outcome = run(&reconciler, &mut source, &mut tracker).await;

    let deletes: Vec<Call> = reconciler.cluster().writes().into_iter().filter(|call| matches!(call, Call::Delete(..))).collect();
    assert_eq!(deletes, vec![Call::Delete(Component::Autoscaler, "orders-source".into())], "expected exactly one delete");
    assert!(tracker.get(Component::Autoscaler).is_none(), "expected the autoscaler condition to be pruned");
    assert!(reconciler.cluster().object(Component::Autoscaler, "orders-source").is_none());
    let status = source.status.as_ref().expect("expected a persisted status");
    assert!(!status.conditions.contains_key(&Component::Autoscaler), "expected the persisted status to drop the autoscaler");
    assert_eq!(outcome.requeue, Requeue::Resync);

    // The workload takes over its own replica count again.
    let writes = reconciler.cluster().writes();
    let delete_pos = writes.iter().position(|call| matches!(call, Call::Delete(..)));
    let update_pos = writes.iter().position(|call| matches!(call, Call::Update(Component::Workload, _)));
    assert!(update_pos.is_some(), "expected the workload to be updated, got {:?}", writes);
    assert!(delete_pos < update_pos, "expected deletes to precede updates, got {:?}", writes);
    Ok(())
}

#[tokio::test]
async fn failed_delete_is_retained_as_terminating() -> Result<()> {
    let reconciler = new_reconciler();
    let mut source = kafka_source();
    source.spec.max_replicas = Some(6);
    let mut tracker = ConditionTracker::new();
    run(&reconciler, &mut source, &mut tracker).await;

    source.spec.max_replicas = None;
    reconciler.cluster().fail_writes(Component::Autoscaler, Some(Failure::Transient));
    let outcome = run(&reconciler, &mut source, &mut tracker).await;

    let condition = tracker.get(Component::Autoscaler).expect("expected the autoscaler condition to be retained");
    assert_eq!(condition.status, ConditionState::Terminating);
    assert_eq!(outcome.requeue, Requeue::Backoff, "expected a failed delete to be retried");
    Ok(())
}

#[tokio::test]
async fn permanent_delete_failure_is_reported_without_backoff() -> Result<()> {
    let reconciler = new_reconciler();
    let mut source = kafka_source();
    source.spec.max_replicas = Some(6);
    let mut tracker = ConditionTracker::new();
    run(&reconciler, &mut source, &mut tracker).await;

    source.spec.max_replicas = None;
    reconciler.cluster().fail_writes(Component::Autoscaler, Some(Failure::Permanent));
    let outcome = run(&reconciler, &mut source, &mut tracker).await;

    let condition = tracker.get(Component::Autoscaler).expect("expected the autoscaler condition to be retained");
    assert_eq!(condition.status, ConditionState::Failed, "expected a rejected delete to fail the component");
    assert_eq!(condition.reason, Some(ConditionReason::ApiError));
    assert_eq!(outcome.overall, OverallState::Failed);
    assert_eq!(outcome.requeue, Requeue::Resync, "expected permanent delete failures to not be retried with backoff");
    assert!(reconciler.cluster().object(Component::Autoscaler, "orders-source").is_some());

    reconciler.cluster().fail_writes(Component::Autoscaler, None);
    run(&reconciler, &mut source, &mut tracker).await;
    assert!(tracker.get(Component::Autoscaler).is_none(), "expected the autoscaler to be pruned once deleted");
    Ok(())
}

#[tokio::test]
async fn transient_delete_failures_exhaust_retry_budget() -> Result<()> {
    let reconciler = new_reconciler();
    let mut source = kafka_source();
    source.spec.max_replicas = Some(6);
    let mut tracker = ConditionTracker::new();
    run(&reconciler, &mut source, &mut tracker).await;

    source.spec.max_replicas = None;
    reconciler.cluster().fail_writes(Component::Autoscaler, Some(Failure::Transient));
    for _ in 1..RETRY_BUDGET {
        run(&reconciler, &mut source, &mut tracker).await;
    }
    let outcome = run(&reconciler, &mut source, &mut tracker).await;

    let condition = tracker.get(Component::Autoscaler).expect("expected the autoscaler condition to be retained");
    assert_eq!(condition.status, ConditionState::Failed);
    assert_eq!(condition.reason, Some(ConditionReason::RetryBudgetExhausted));
    assert_eq!(outcome.requeue, Requeue::Backoff);
    Ok(())
}

#[tokio::test]
async fn cleared_optional_fields_are_removed_from_workload() -> Result<()> {
    let reconciler = new_reconciler();
    let mut source = kafka_source();
    source.spec.messaging.pulsar = Some(PulsarMessaging {
        service_url: "pulsar+ssl://broker:6651".into(),
        tls_secret: Some("pulsar-tls".into()),
        ..Default::default()
    });
    source.spec.runtime.resources = Some(RuntimeResources {
        requests: None,
        limits: Some(ResourceList {
            cpu: Some("2".into()),
            memory: Some("1Gi".into()),
        }),
    });
    let mut tracker = ConditionTracker::new();
    run(&reconciler, &mut source, &mut tracker).await;

    source.spec.runtime.resources = None;
    if let Some(pulsar) = source.spec.messaging.pulsar.as_mut() {
        pulsar.tls_secret = None;
    }
    reconciler.cluster().clear_calls();
    run(&reconciler, &mut source, &mut tracker).await;

    let writes = reconciler.cluster().writes();
    assert!(
        writes.contains(&Call::Update(Component::Workload, "orders-source".into())),
        "expected the workload to be updated, got {:?}",
        writes
    );
    let sts = match reconciler.cluster().object(Component::Workload, "orders-source") {
        Some(SubResource::Workload(sts)) => sts,
        other => anyhow::bail!("expected a live workload, got {:?}", other),
    };
    let pod = sts.spec.and_then(|spec| spec.template.spec).expect("expected a pod spec");
    assert_eq!(pod.volumes.map(|vols| vols.len()), Some(0), "expected the TLS volume to be removed");
    let limits = pod.containers[0].resources.as_ref().and_then(|res| res.limits.clone()).unwrap_or_default();
    assert!(limits.is_empty(), "expected limits to be removed, got {:?}", limits);
    Ok(())
}

#[tokio::test]
async fn minimal_kafka_source_is_deployed() -> Result<()> {
    let reconciler = new_reconciler();
    let mut source = Source::new(
        "orders",
        SourceSpec {
            source_type: Some("kafka".into()),
            parallelism: Some(3),
            cluster_name: Some("prod".into()),
            ..Default::default()
        },
    );
    source.metadata.namespace = Some("default".into());
    let mut tracker = ConditionTracker::new();

    let outcome = run(&reconciler, &mut source, &mut tracker).await;

    let expected: BTreeSet<Component> = [Component::Workload, Component::Service, Component::MessagingBinding].into_iter().collect();
    assert_eq!(components(&tracker), expected, "unexpected tracked components");
    assert_eq!(outcome.overall, OverallState::Pending, "expected the Source to be deployed, got {:?}", tracker.to_status());
    assert_eq!(reconciler.cluster().writes().len(), 3, "expected every component to be created");
    Ok(())
}

#[tokio::test]
async fn component_failure_does_not_block_others() -> Result<()> {
    let reconciler = new_reconciler();
    reconciler.cluster().fail_writes(Component::Service, Some(Failure::Permanent));
    let (mut source, mut tracker) = (kafka_source(), ConditionTracker::new());

    let outcome = run(&reconciler, &mut source, &mut tracker).await;

    let service = tracker.get(Component::Service).expect("expected a service condition");
    assert_eq!(service.status, ConditionState::Failed);
    assert_eq!(service.reason, Some(ConditionReason::ApiError));
    assert!(reconciler.cluster().object(Component::Workload, "orders-source").is_some(), "expected the workload to be created");
    assert!(
        reconciler.cluster().object(Component::MessagingBinding, "orders-source-binding").is_some(),
        "expected the binding to be created"
    );
    assert_eq!(outcome.overall, OverallState::Failed);
    assert_eq!(outcome.requeue, Requeue::Resync, "expected permanent failures to not be retried with backoff");
    Ok(())
}

#[tokio::test]
async fn transient_failures_exhaust_retry_budget() -> Result<()> {
    let reconciler = new_reconciler();
    reconciler.cluster().fail_writes(Component::Workload, Some(Failure::Transient));
    let (mut source, mut tracker) = (kafka_source(), ConditionTracker::new());

    for attempt in 1..RETRY_BUDGET {
        let outcome = run(&reconciler, &mut source, &mut tracker).await;
        let condition = tracker.get(Component::Workload).expect("expected a workload condition");
        assert_eq!(condition.status, ConditionState::Pending, "expected attempt {} to stay Pending", attempt);
        assert_eq!(condition.reason, Some(ConditionReason::TransientError));
        assert_eq!(outcome.requeue, Requeue::Backoff);
    }

    let outcome = run(&reconciler, &mut source, &mut tracker).await;
    let condition = tracker.get(Component::Workload).expect("expected a workload condition");
    assert_eq!(condition.status, ConditionState::Failed, "expected the retry budget to be exhausted");
    assert_eq!(condition.reason, Some(ConditionReason::RetryBudgetExhausted));
    assert_eq!(outcome.overall, OverallState::Failed);

    reconciler.cluster().fail_writes(Component::Workload, None);
    let outcome = run(&reconciler, &mut source, &mut tracker).await;
    assert_eq!(tracker.failures(Component::Workload), 0, "expected a successful apply to reset the failure count");
    assert_eq!(tracker.get(Component::Workload).map(|cond| cond.status), Some(ConditionState::Pending));
    assert_eq!(outcome.requeue, Requeue::Resync);
    Ok(())
}

#[tokio::test]
async fn status_conflict_requeues_immediately() -> Result<()> {
    let reconciler = new_reconciler();
    reconciler.status_writer().conflict_next(1);
    let (mut source, mut tracker) = (kafka_source(), ConditionTracker::new());

    let outcome = run(&reconciler, &mut source, &mut tracker).await;
    assert_eq!(outcome.requeue, Requeue::Immediate);
    assert!(outcome.updated.is_none());
    assert!(reconciler.status_writer().writes().is_empty(), "expected the conflicting write to be rejected");

    let outcome = run(&reconciler, &mut source, &mut tracker).await;
    assert_eq!(outcome.requeue, Requeue::Resync);
    assert_eq!(reconciler.status_writer().writes().len(), 1, "expected the retried pass to write status");
    Ok(())
}

#[tokio::test]
async fn invalid_spec_fails_every_component_without_writes() -> Result<()> {
    let reconciler = new_reconciler();
    let (mut source, mut tracker) = (kafka_source(), ConditionTracker::new());
    source.spec.cluster_name = None;

    let outcome = run(&reconciler, &mut source, &mut tracker).await;

    assert!(reconciler.cluster().calls().is_empty(), "expected no cluster calls, got {:?}", reconciler.cluster().calls());
    assert_eq!(outcome.requeue, Requeue::None, "expected an invalid spec to not be retried");
    assert_eq!(outcome.overall, OverallState::Failed);
    for component in [Component::Workload, Component::Service, Component::MessagingBinding] {
        let condition = tracker.get(component).expect("expected a condition for every implied component");
        assert_eq!(condition.status, ConditionState::Failed);
        assert_eq!(condition.reason, Some(ConditionReason::InvalidSpec));
        assert!(
            condition.message.as_deref().unwrap_or_default().contains("clusterName"),
            "expected the validation message to name the field, got {:?}",
            condition.message
        );
    }
    Ok(())
}
