//! The reconciliation pass of a single Source.
//!
//! ## Overview
//! A pass drives the sub-resources of one Source toward the state declared by its spec and
//! folds the observed state of each sub-resource into the Source's `ConditionTracker`.
//!
//! - The Source's spec is validated first. An invalid spec fails every implied Component and nothing is
//! written to the cluster.
//! - Sub-resources of Components which are no longer implied are deleted before anything else is
//! created or updated. A Component whose delete fails stays tracked until the delete succeeds.
//! - Each implied Component is converged independently. A failure of one Component is recorded
//! on that Component and the pass moves on to the next one.
//! - Status is only written when it differs from the persisted status, and every write is
//! conditional on the observed `resourceVersion`.

use crate::k8s::cluster::{Cluster, StatusWriter, SubResource};
use crate::k8s::drivers::{Action, Driver, DriverSet};
use tributary_core::condition::{ConditionTracker, OverallState};
use tributary_core::crd::{ConditionReason, ConditionState, RequiredMetadata, ResourceCondition, Source};
use tributary_core::AppError;

/// When the scheduler should run the next pass of a Source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Only run again once the Source changes.
    None,
    /// Run again at the next periodic resync.
    Resync,
    /// Run again after a backoff delay.
    Backoff,
    /// Re-fetch the Source and run again right away.
    Immediate,
}

/// The result of a single reconciliation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileOutcome {
    /// The aggregated state of the Source after this pass.
    pub overall: OverallState,
    pub requeue: Requeue,
    /// The updated Source, when this pass wrote its status.
    pub updated: Option<Source>,
}

/// Reconciler of Sources against a cluster.
pub struct Reconciler<C, W> {
    cluster: C,
    status_writer: W,
    drivers: DriverSet,
    /// The number of consecutive transient failures tolerated per Component.
    retry_budget: u32,
}

impl<C: Cluster, W: StatusWriter> Reconciler<C, W> {
    pub fn new(cluster: C, status_writer: W, drivers: DriverSet, retry_budget: u32) -> Self {
        Self {
            cluster,
            status_writer,
            drivers,
            retry_budget,
        }
    }

    #[cfg(test)]
    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    #[cfg(test)]
    pub fn status_writer(&self) -> &W {
        &self.status_writer
    }

    /// Run a single reconciliation pass of the given Source.
    #[tracing::instrument(level = "debug", skip(self, source, tracker), fields(source = source.name()))]
    pub async fn reconcile(&self, source: &Source, tracker: &mut ConditionTracker) -> ReconcileOutcome {
        let implied = self.drivers.implied_components(source);

        if let Err(errors) = source.validate() {
            let message = errors.join("; ");
            tracing::warn!(%message, "Source spec is invalid");
            for component in implied.iter() {
                tracker.set(*component, ResourceCondition::failed(ConditionReason::InvalidSpec, message.clone()));
            }
            return self.finish(source, tracker, Requeue::None).await;
        }

        let mut needs_retry = false;

        // Delete the sub-resources of Components which are no longer implied.
        let mut retained = implied.clone();
        for driver in self.drivers.iter().filter(|driver| !implied.contains(&driver.component())) {
            let component = driver.component();
            match self.prune_component(driver, source).await {
                Ok(None) => (),
                Ok(Some(condition)) => {
                    needs_retry = true;
                    retained.insert(component);
                    tracker.clear_failures(component);
                    tracker.set(component, condition);
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(error = ?err, %component, "transient error deleting sub-resource");
                    needs_retry = true;
                    retained.insert(component);
                    tracker.record_transient_as(component, ResourceCondition::terminating(err.to_string()), self.retry_budget);
                }
                Err(err) => {
                    // Retried at the next resync only.
                    tracing::error!(error = ?err, %component, "error deleting sub-resource");
                    retained.insert(component);
                    tracker.set(component, ResourceCondition::failed(ConditionReason::ApiError, err.to_string()));
                }
            }
        }
        let pruned = tracker.prune(&retained);
        if !pruned.is_empty() {
            tracing::info!(?pruned, "pruned Components no longer required by Source");
        }

        // Converge & observe each implied Component independently.
        for component in implied.iter().copied() {
            let driver = match self.drivers.get(component) {
                Some(driver) => driver,
                None => continue,
            };
            match self.converge_component(driver, source).await {
                Ok(live) => {
                    tracker.clear_failures(component);
                    tracker.set(component, driver.observe(live.as_ref()));
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(error = ?err, %component, "transient error converging sub-resource");
                    needs_retry = true;
                    tracker.record_transient(component, err.to_string(), self.retry_budget);
                    self.observe_after_error(driver, source, tracker).await;
                }
                Err(err) => {
                    tracing::error!(error = ?err, %component, "error converging sub-resource");
                    let reason = match &err {
                        AppError::InvalidInput(_) => ConditionReason::InvalidSpec,
                        _ => ConditionReason::ApiError,
                    };
                    tracker.set(component, ResourceCondition::failed(reason, err.to_string()));
                }
            }
        }

        let requeue = if needs_retry { Requeue::Backoff } else { Requeue::Resync };
        self.finish(source, tracker, requeue).await
    }

    /// Delete the sub-resource of a Component which is no longer implied.
    ///
    /// Returns `None` once the sub-resource is gone, or the condition to retain while it is
    /// still being deleted.
    async fn prune_component(&self, driver: &dyn Driver, source: &Source) -> Result<Option<ResourceCondition>, AppError> {
        let (component, name) = (driver.component(), driver.name(source));
        let live = self.cluster.get(component, &name).await?;
        match driver.converge(None, live.as_ref()) {
            Action::Delete => {
                tracing::info!(%component, %name, "deleting sub-resource");
                self.cluster.delete(component, &name).await?;
                Ok(None)
            }
            // Absent, or already being deleted.
            _ => match live {
                None => Ok(None),
                Some(_) => Ok(Some(driver.observe(live.as_ref()))),
            },
        }
    }

    /// Converge the sub-resource of an implied Component, returning the live object afterwards.
    async fn converge_component(&self, driver: &dyn Driver, source: &Source) -> Result<Option<SubResource>, AppError> {
        let desired = driver.desired(source)?;
        let (component, name) = (driver.component(), desired.name().to_string());
        let live = self.cluster.get(component, &name).await?;
        let action = driver.converge(Some(&desired), live.as_ref());
        tracing::debug!(%component, %name, %action, "converging sub-resource");
        match action {
            Action::NoOp => Ok(live),
            Action::Create => self.cluster.create(&desired).await.map(Some),
            Action::Update => self.cluster.update(&desired).await.map(Some),
            Action::Delete => {
                self.cluster.delete(component, &name).await?;
                Ok(None)
            }
        }
    }

    /// Observe a Component whose convergence failed transiently.
    ///
    /// The provisional error condition is kept unless the live object shows progress beyond
    /// Pending.
    async fn observe_after_error(&self, driver: &dyn Driver, source: &Source, tracker: &mut ConditionTracker) {
        let component = driver.component();
        let live = match self.cluster.get(component, &driver.name(source)).await {
            Ok(live) => live,
            Err(_) => return,
        };
        let observed = driver.observe(live.as_ref());
        if observed.status != ConditionState::Pending {
            tracker.set(component, observed);
        }
    }

    /// Write the tracker's status if it changed, and build the outcome of this pass.
    async fn finish(&self, source: &Source, tracker: &ConditionTracker, requeue: Requeue) -> ReconcileOutcome {
        let overall = tracker.aggregate();
        let status = tracker.to_status();
        if source.status.as_ref() == Some(&status) {
            return ReconcileOutcome { overall, requeue, updated: None };
        }

        match self.status_writer.write_status(source, &status).await {
            Ok(updated) => {
                tracing::debug!(%overall, "Source status updated");
                ReconcileOutcome {
                    overall,
                    requeue,
                    updated: Some(updated),
                }
            }
            Err(AppError::Conflict) => {
                tracing::debug!("Source was modified concurrently, retrying with a fresh copy");
                ReconcileOutcome {
                    overall,
                    requeue: Requeue::Immediate,
                    updated: None,
                }
            }
            Err(err) => {
                tracing::error!(error = ?err, "error writing Source status");
                ReconcileOutcome {
                    overall,
                    requeue: Requeue::Backoff,
                    updated: None,
                }
            }
        }
    }
}
