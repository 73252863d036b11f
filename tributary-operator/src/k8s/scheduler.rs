//! Scheduling of reconciliation passes.
//!
//! Every pass runs on the controller's task loop. The outcome of a pass decides what runs next:
//! nothing until the next change or resync, a delayed retry with exponential backoff, or an
//! immediate pass against a freshly fetched copy of the Source after a write conflict.

use std::sync::Arc;
use std::time::Duration;

use kube::api::Api;
use rand::Rng;
use tokio::time::timeout;

use crate::k8s::cluster::API_TIMEOUT;
use crate::k8s::reconciler::Requeue;
use crate::k8s::{Controller, METRIC_RECONCILE_ERRORS, METRIC_RECONCILE_PASSES, METRIC_STATUS_CONFLICTS};
use tributary_core::condition::ConditionTracker;
use tributary_core::crd::Source;

/// The delay of the first backoff retry.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// The maximum delay between backoff retries.
const BACKOFF_MAX: Duration = Duration::from_secs(300);
/// The maximum fraction of a backoff delay added as jitter.
const BACKOFF_JITTER: f64 = 0.1;

/// A scheduling task to be performed.
#[derive(Debug)]
pub enum SchedulerTask {
    /// Run a reconciliation pass of the named Source.
    Reconcile(Arc<String>),
    /// Retry a failed pass of the named Source, unless superseded by a later retry.
    Retry(Arc<String>, u64),
}

impl Controller {
    /// Handle scheduler tasks.
    pub(super) async fn handle_scheduler_task(&mut self, task: SchedulerTask) {
        match task {
            SchedulerTask::Reconcile(name) => self.scheduler_reconcile(name).await,
            SchedulerTask::Retry(name, token) => {
                if self.retry_tokens.get(&name) != Some(&token) {
                    return;
                }
                self.retry_tokens.remove(&name);
                self.scheduler_reconcile(name).await
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, name), fields(source = %name))]
    async fn scheduler_reconcile(&mut self, name: Arc<String>) {
        let source = match self.sources.get(&name) {
            Some(source) => source.clone(),
            None => return,
        };
        let tracker = self
            .trackers
            .entry(name.clone())
            .or_insert_with(|| ConditionTracker::from_status(source.status.as_ref()));
        let outcome = self.reconciler.reconcile(&source, tracker).await;
        metrics::increment_counter!(METRIC_RECONCILE_PASSES, "overall" => outcome.overall.to_string());
        tracing::debug!(overall = %outcome.overall, requeue = ?outcome.requeue, "reconciliation pass finished");
        if let Some(updated) = outcome.updated {
            self.sources.insert(name.clone(), updated);
        }

        match outcome.requeue {
            Requeue::None | Requeue::Resync => {
                self.attempts.remove(&name);
                self.retry_tokens.remove(&name);
            }
            Requeue::Backoff => {
                metrics::increment_counter!(METRIC_RECONCILE_ERRORS);
                let attempts = self.attempts.entry(name.clone()).or_insert(0);
                let delay = with_jitter(backoff_delay(*attempts));
                *attempts = attempts.saturating_add(1);
                self.schedule_retry(name, delay);
            }
            Requeue::Immediate => {
                metrics::increment_counter!(METRIC_STATUS_CONFLICTS);
                self.scheduler_refetch(name).await;
            }
        }
    }

    /// Fetch a fresh copy of the given Source and schedule a pass against it.
    #[tracing::instrument(level = "debug", skip(self, name), fields(source = %name))]
    async fn scheduler_refetch(&mut self, name: Arc<String>) {
        let api: Api<Source> = Api::namespaced(self.client.clone(), &self.config.namespace);
        match timeout(API_TIMEOUT, api.get(name.as_str())).await {
            Ok(Ok(source)) => {
                self.sources.insert(name.clone(), source);
                self.spawn_scheduler_task(SchedulerTask::Reconcile(name), false);
            }
            Ok(Err(kube::Error::Api(err))) if err.code == http::StatusCode::NOT_FOUND => self.forget_source(&name),
            Ok(Err(err)) => {
                tracing::error!(error = ?err, "error fetching Source after a conflict");
                self.spawn_scheduler_task(SchedulerTask::Reconcile(name), true);
            }
            Err(_) => {
                tracing::error!("timeout while fetching Source after a conflict");
                self.spawn_scheduler_task(SchedulerTask::Reconcile(name), true);
            }
        }
    }

    /// Schedule a retry of the given Source, superseding any pending retry.
    fn schedule_retry(&mut self, name: Arc<String>, delay: Duration) {
        self.next_retry_token = self.next_retry_token.wrapping_add(1);
        let token = self.next_retry_token;
        self.retry_tokens.insert(name.clone(), token);
        tracing::debug!(?delay, source = %name, "scheduling reconciliation retry");
        self.spawn_scheduler_task_after(SchedulerTask::Retry(name, token), Some(delay));
    }
}

/// The backoff delay of the given zero based retry attempt: `1s * 2^attempt`, capped at 5 minutes.
pub(super) fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE.saturating_mul(1u32 << attempt.min(16)).min(BACKOFF_MAX)
}

fn with_jitter(delay: Duration) -> Duration {
    delay.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..BACKOFF_JITTER))
}
