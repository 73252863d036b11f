//! Per-Source condition tracking.
//!
//! A `ConditionTracker` holds the last observed condition of each Component of a single Source.
//! Every Source owns its own tracker, and only the reconciler mutates it, so no synchronization
//! is needed here. Overall readiness is always derived from the tracked conditions and never
//! stored.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::crd::{Component, ConditionReason, ConditionState, ResourceCondition, SourceStatus};

/// The aggregated state of all Components of a Source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverallState {
    /// At least one Component is not yet Ready, and none have Failed.
    Pending,
    /// Every tracked Component is Ready.
    Ready,
    /// At least one Component has Failed.
    Failed,
}

impl std::fmt::Display for OverallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Pending => "Pending",
                Self::Ready => "Ready",
                Self::Failed => "Failed",
            }
        )
    }
}

/// A mapping of Components to their last observed condition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConditionTracker {
    conditions: BTreeMap<Component, ResourceCondition>,
    /// Consecutive transient failures per Component, never persisted.
    transient_failures: BTreeMap<Component, u32>,
}

impl ConditionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a tracker from a persisted status.
    pub fn from_status(status: Option<&SourceStatus>) -> Self {
        Self {
            conditions: status.map(|status| status.conditions.clone()).unwrap_or_default(),
            transient_failures: Default::default(),
        }
    }

    /// Snapshot this tracker into its persisted form.
    pub fn to_status(&self) -> SourceStatus {
        SourceStatus {
            conditions: self.conditions.clone(),
        }
    }

    /// Upsert the condition of the given Component.
    pub fn set(&mut self, component: Component, condition: ResourceCondition) {
        self.set_at(component, condition, Utc::now())
    }

    /// Upsert the condition of the given Component, using `now` as the transition time.
    ///
    /// The last transition time only moves when the condition's status changes; otherwise the
    /// previously recorded transition time is retained.
    pub fn set_at(&mut self, component: Component, mut condition: ResourceCondition, now: DateTime<Utc>) {
        condition.last_transition_time = match self.conditions.get(&component) {
            Some(prev) if prev.status == condition.status => prev.last_transition_time.or(Some(now)),
            _ => Some(now),
        };
        self.conditions.insert(component, condition);
    }

    pub fn get(&self, component: Component) -> Option<&ResourceCondition> {
        self.conditions.get(&component)
    }

    /// All tracked Components, in stable order.
    pub fn components(&self) -> impl Iterator<Item = Component> + '_ {
        self.conditions.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Remove every entry whose Component is not in `live`, returning the removed Components.
    pub fn prune(&mut self, live: &BTreeSet<Component>) -> Vec<Component> {
        let stale: Vec<Component> = self.conditions.keys().filter(|component| !live.contains(component)).copied().collect();
        for component in stale.iter() {
            self.conditions.remove(component);
            self.transient_failures.remove(component);
        }
        stale
    }

    /// Aggregate all tracked conditions into an overall state.
    ///
    /// Any Failed condition makes the whole Source Failed. Otherwise the Source is Ready only
    /// when every tracked condition is Ready.
    pub fn aggregate(&self) -> OverallState {
        let mut all_ready = true;
        for condition in self.conditions.values() {
            match condition.status {
                ConditionState::Failed => return OverallState::Failed,
                ConditionState::Ready => (),
                ConditionState::Pending | ConditionState::Terminating => all_ready = false,
            }
        }
        if all_ready {
            OverallState::Ready
        } else {
            OverallState::Pending
        }
    }

    /// Record a transient failure for the given Component.
    ///
    /// The Component is held Pending while its consecutive failures are below `budget`, and is
    /// downgraded to Failed once the budget is reached.
    pub fn record_transient(&mut self, component: Component, message: impl Into<String>, budget: u32) -> &ResourceCondition {
        self.record_transient_as(component, ResourceCondition::pending(ConditionReason::TransientError, message), budget)
    }

    /// Record a transient failure for the given Component, holding it at `provisional` while its
    /// consecutive failures are below `budget`.
    pub fn record_transient_as(&mut self, component: Component, provisional: ResourceCondition, budget: u32) -> &ResourceCondition {
        let failures = self.transient_failures.entry(component).or_insert(0);
        *failures = failures.saturating_add(1);
        let failures = *failures;
        let condition = if failures >= budget.max(1) {
            ResourceCondition::failed(
                ConditionReason::RetryBudgetExhausted,
                format!("{} (failed {} consecutive attempts)", provisional.message.as_deref().unwrap_or_default(), failures),
            )
        } else {
            provisional
        };
        self.set(component, condition);
        &self.conditions[&component]
    }

    /// Reset the transient failure count of the given Component.
    pub fn clear_failures(&mut self, component: Component) {
        self.transient_failures.remove(&component);
    }

    /// The number of consecutive transient failures recorded for the given Component.
    pub fn failures(&self, component: Component) -> u32 {
        self.transient_failures.get(&component).copied().unwrap_or(0)
    }
}
