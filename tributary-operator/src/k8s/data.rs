use std::sync::Arc;
use std::time::Duration;

use kube::api::ObjectMeta;
use kube::runtime::watcher::Event;
use kube::Resource;

use crate::k8s::drivers::LABEL_TRIBUTARY_RS_SOURCE;
use crate::k8s::scheduler::SchedulerTask;
use crate::k8s::{Controller, EventResult, METRIC_SOURCES, METRIC_WATCHER_ERRORS};
use tributary_core::crd::Source;

//////////////////////////////////////////////////////////////////////////////
// Source Events /////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `Source` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_source_event(&mut self, res: EventResult<Source>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Source k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS, "kind" => "Source");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.source_applied(obj),
            Event::Deleted(obj) => self.source_deleted(obj),
            Event::Restarted(objs) => self.source_restarted(objs),
        }
        metrics::gauge!(METRIC_SOURCES, self.sources.len() as f64);
    }

    #[tracing::instrument(level = "debug", skip(self, source))]
    fn source_applied(&mut self, source: Source) {
        let name_str = match source.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (name, spec_changed) = match self.sources.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &source {
                    return;
                }
                // Status only changes are the result of our own writes.
                let spec_changed = old.spec != source.spec || old.metadata.generation != source.metadata.generation;
                (Arc::clone(key), spec_changed) // No additional alloc.
            }
            None => (Arc::new(name_str.clone()), true),
        };
        self.sources.insert(name.clone(), source);
        if spec_changed {
            self.attempts.remove(&name);
            self.spawn_scheduler_task(SchedulerTask::Reconcile(name), false);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, source))]
    fn source_deleted(&mut self, source: Source) {
        let name_str = match source.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        tracing::info!(name = %name_str, "Source deleted, sub-resources will be garbage collected");
        self.forget_source(name_str);
    }

    #[tracing::instrument(level = "debug", skip(self, sources))]
    fn source_restarted(&mut self, sources: Vec<Source>) {
        let live: std::collections::HashSet<String> = sources.iter().filter_map(|source| source.meta().name.clone()).collect();
        let stale: Vec<Arc<String>> = self.sources.keys().filter(|name| !live.contains(name.as_str())).cloned().collect();
        for name in stale {
            self.forget_source(&name);
        }
        for source in sources {
            self.source_applied(source);
        }
    }

    /// Drop all state held for the given Source.
    #[allow(clippy::ptr_arg)]
    pub(super) fn forget_source(&mut self, name: &String) {
        self.sources.remove(name);
        self.trackers.remove(name);
        self.attempts.remove(name);
        self.retry_tokens.remove(name);
    }
}

//////////////////////////////////////////////////////////////////////////////
// Sub-resource Events ///////////////////////////////////////////////////////
impl Controller {
    /// Handle a watcher event of a sub-resource managed on behalf of a Source.
    ///
    /// Any change to a sub-resource schedules a pass of its owning Source, which observes the
    /// live object and repairs drift.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_owned_event<K: Resource>(&mut self, kind: &'static str, res: EventResult<K>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from {} k8s watcher", kind);
                metrics::increment_counter!(METRIC_WATCHER_ERRORS, "kind" => kind);
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) | Event::Deleted(obj) => self.owned_object_changed(obj.meta()),
            Event::Restarted(objs) => {
                for obj in objs {
                    self.owned_object_changed(obj.meta());
                }
            }
        }
    }

    fn owned_object_changed(&self, meta: &ObjectMeta) {
        let source = meta.labels.as_ref().and_then(|labels| labels.get(LABEL_TRIBUTARY_RS_SOURCE));
        let name = match source.and_then(|source| self.sources.get_key_value(source)) {
            Some((name, _)) => name.clone(),
            None => return, // Sources are reconciled when first observed.
        };
        self.spawn_scheduler_task(SchedulerTask::Reconcile(name), false);
    }
}
