//! Kubernetes controller.
//!
//! This controller observes Source objects and the sub-resources managed on their behalf, caches
//! the Sources of its namespace, and runs a reconciliation pass for a Source whenever the Source
//! or one of its sub-resources changes.
//!
//! All reconciliation passes run on the controller's own task loop, so a Source is never
//! reconciled by two workers at once. Every known Source is also reconciled periodically, which
//! repairs drift that no watcher event reported.

mod cluster;
mod data;
mod drivers;
#[cfg(test)]
mod fixtures;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::prelude::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::autoscaling::v2beta2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream, ReceiverStream};

use crate::config::Config;
use crate::k8s::cluster::{KubeCluster, KubeStatusWriter};
use crate::k8s::drivers::{DriverConfig, DriverSet};
use crate::k8s::reconciler::Reconciler;
use crate::k8s::scheduler::SchedulerTask;
use tributary_core::condition::ConditionTracker;
use tributary_core::crd::Source;
use tributary_core::TRIBUTARY_OPERATOR_LABEL_SELECTORS;

/// The app name used by the operator.
const APP_NAME: &str = "tributary-operator";
/// The timeout duration used before rescheduling a scheduler task.
const RESCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);

const METRIC_RECONCILE_PASSES: &str = "tributary_operator_reconcile_passes";
const METRIC_RECONCILE_ERRORS: &str = "tributary_operator_reconcile_errors";
const METRIC_STATUS_CONFLICTS: &str = "tributary_operator_status_conflicts";
const METRIC_WATCHER_ERRORS: &str = "tributary_operator_watcher_errors";
const METRIC_SOURCES: &str = "tributary_operator_sources";

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// Kubernetes controller for watching Tributary CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of scheduler tasks.
    scheduler_tasks_tx: mpsc::Sender<SchedulerTask>,
    /// A channel of scheduler tasks.
    scheduler_tasks_rx: ReceiverStream<SchedulerTask>,

    /// The reconciler used for all Sources.
    reconciler: Reconciler<KubeCluster, KubeStatusWriter>,
    /// All known Source objects.
    sources: HashMap<Arc<String>, Source>,
    /// The condition tracker of each known Source.
    trackers: HashMap<Arc<String>, ConditionTracker>,
    /// The number of consecutive passes of each Source which requested a backoff.
    attempts: HashMap<Arc<String>, u32>,
    /// The token of the latest delayed retry of each Source; older retries are dropped.
    retry_tokens: HashMap<Arc<String>, u64>,
    /// The next retry token to hand out.
    next_retry_token: u64,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let (scheduler_tasks_tx, scheduler_tasks_rx) = mpsc::channel(1000);
        let drivers = DriverSet::standard(DriverConfig {
            default_image: config.default_image.clone(),
        });
        let reconciler = Reconciler::new(
            KubeCluster::new(client.clone(), config.namespace.clone()),
            KubeStatusWriter::new(client.clone(), config.namespace.clone()),
            drivers,
            config.retry_budget,
        );

        metrics::register_counter!(METRIC_RECONCILE_PASSES, metrics::Unit::Count, "reconciliation passes run, by overall state");
        metrics::register_counter!(METRIC_RECONCILE_ERRORS, metrics::Unit::Count, "reconciliation passes which requested a backoff");
        metrics::register_counter!(METRIC_STATUS_CONFLICTS, metrics::Unit::Count, "status writes rejected due to concurrent modification");
        metrics::register_counter!(METRIC_WATCHER_ERRORS, metrics::Unit::Count, "errors from K8s watchers");
        metrics::register_gauge!(METRIC_SOURCES, metrics::Unit::Count, "the number of known Sources");

        Ok(Self {
            client,
            config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            scheduler_tasks_tx,
            scheduler_tasks_rx: ReceiverStream::new(scheduler_tasks_rx),
            reconciler,
            sources: Default::default(),
            trackers: Default::default(),
            attempts: Default::default(),
            retry_tokens: Default::default(),
            next_retry_token: 0,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        // Build watcher streams.
        let params_labels = self.list_params_cluster_selector_labels();
        let params_spec = ListParams::default();
        let sources: Api<Source> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let sources_watcher = watcher(sources, params_spec);
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let statefulsets_watcher = watcher(statefulsets, params_labels.clone());
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let services_watcher = watcher(services, params_labels.clone());
        let autoscalers: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let autoscalers_watcher = watcher(autoscalers, params_labels.clone());
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let configmaps_watcher = watcher(configmaps, params_labels);
        tokio::pin!(sources_watcher, statefulsets_watcher, services_watcher, autoscalers_watcher, configmaps_watcher);

        let resync_period = self.config.resync_interval();
        let mut resync = IntervalStream::new(tokio::time::interval_at(tokio::time::Instant::now() + resync_period, resync_period));

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = sources_watcher.next() => self.handle_source_event(k8s_event_res).await,
                Some(k8s_event_res) = statefulsets_watcher.next() => self.handle_owned_event("StatefulSet", k8s_event_res).await,
                Some(k8s_event_res) = services_watcher.next() => self.handle_owned_event("Service", k8s_event_res).await,
                Some(k8s_event_res) = autoscalers_watcher.next() => self.handle_owned_event("HorizontalPodAutoscaler", k8s_event_res).await,
                Some(k8s_event_res) = configmaps_watcher.next() => self.handle_owned_event("ConfigMap", k8s_event_res).await,
                Some(_) = resync.next() => self.resync_all(),
                Some(scheduler_task) = self.scheduler_tasks_rx.next() => self.handle_scheduler_task(scheduler_task).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Schedule a reconciliation pass of every known Source.
    #[tracing::instrument(level = "debug", skip(self))]
    fn resync_all(&self) {
        tracing::debug!(count = self.sources.len(), "resyncing all Sources");
        for name in self.sources.keys() {
            self.spawn_scheduler_task(SchedulerTask::Reconcile(name.clone()), false);
        }
    }

    /// Spawn a task which emits a new scheduler tasks.
    ///
    /// This indirection is used to ensure that we don't use an unlimited amount of memory with an
    /// unbounded queue, and also so that we do not block the controller from making progress and
    /// dead-locking when we hit the scheduler task queue cap.
    fn spawn_scheduler_task(&self, task: SchedulerTask, is_retry: bool) {
        self.spawn_scheduler_task_after(task, if is_retry { Some(RESCHEDULE_TIMEOUT) } else { None });
    }

    /// Spawn a task which emits the given scheduler task after an optional delay.
    fn spawn_scheduler_task_after(&self, task: SchedulerTask, delay: Option<Duration>) {
        let tx = self.scheduler_tasks_tx.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let _res = tx.send(task).await;
        });
    }

    /// Create a list params object which selects only objects controlled by this operator.
    fn list_params_cluster_selector_labels(&self) -> ListParams {
        ListParams {
            label_selector: Some(TRIBUTARY_OPERATOR_LABEL_SELECTORS.into()),
            ..Default::default()
        }
    }
}
