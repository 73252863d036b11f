//! In-memory collaborators used to test the reconciler.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::k8s::cluster::{Cluster, StatusWriter, SubResource};
use tributary_core::crd::{Component, Source, SourceStatus};
use tributary_core::AppError;

/// A cluster request as recorded by `FakeCluster`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Get(Component, String),
    Create(Component, String),
    Update(Component, String),
    Delete(Component, String),
}

impl Call {
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Get(..))
    }
}

/// A failure injected into the writes of a Component.
#[derive(Clone, Copy, Debug)]
pub enum Failure {
    Transient,
    Permanent,
}

/// An in-memory cluster holding sub-resources by Component & name.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<(Component, String), SubResource>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<BTreeMap<Component, Failure>>,
}

impl FakeCluster {
    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// All write calls made so far, in order.
    pub fn writes(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_write).collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn object(&self, kind: Component, name: &str) -> Option<SubResource> {
        self.objects.lock().unwrap().get(&(kind, name.to_string())).cloned()
    }

    /// Modify a stored object in place, as another actor in the cluster would.
    pub fn modify(&self, kind: Component, name: &str, f: impl FnOnce(&mut SubResource)) {
        if let Some(obj) = self.objects.lock().unwrap().get_mut(&(kind, name.to_string())) {
            f(obj);
        }
    }

    /// Make every write for the given Component fail, or clear an injected failure.
    pub fn fail_writes(&self, kind: Component, failure: Option<Failure>) {
        let mut failures = self.failures.lock().unwrap();
        match failure {
            Some(failure) => failures.insert(kind, failure),
            None => failures.remove(&kind),
        };
    }

    fn check_failure(&self, kind: Component) -> Result<(), AppError> {
        match self.failures.lock().unwrap().get(&kind) {
            Some(Failure::Transient) => Err(AppError::Transient(format!("timeout while writing {}", kind))),
            Some(Failure::Permanent) => Err(AppError::Permanent(format!("Invalid (422): {} rejected", kind))),
            None => Ok(()),
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get(&self, kind: Component, name: &str) -> Result<Option<SubResource>, AppError> {
        self.record(Call::Get(kind, name.into()));
        Ok(self.object(kind, name))
    }

    async fn create(&self, desired: &SubResource) -> Result<SubResource, AppError> {
        let (kind, name) = (desired.component(), desired.name().to_string());
        self.record(Call::Create(kind, name.clone()));
        self.check_failure(kind)?;
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&(kind, name.clone())) {
            return Err(AppError::Conflict);
        }
        let mut created = desired.clone();
        created.meta_mut().generation = Some(1);
        objects.insert((kind, name), created.clone());
        Ok(created)
    }

    async fn update(&self, desired: &SubResource) -> Result<SubResource, AppError> {
        let (kind, name) = (desired.component(), desired.name().to_string());
        self.record(Call::Update(kind, name.clone()));
        self.check_failure(kind)?;
        let mut objects = self.objects.lock().unwrap();
        let generation = objects.get(&(kind, name.clone())).and_then(|obj| obj.meta().generation).unwrap_or(0);
        let mut updated = desired.clone();
        updated.meta_mut().generation = Some(generation + 1);
        objects.insert((kind, name), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, kind: Component, name: &str) -> Result<(), AppError> {
        self.record(Call::Delete(kind, name.into()));
        self.check_failure(kind)?;
        self.objects.lock().unwrap().remove(&(kind, name.to_string()));
        Ok(())
    }
}

/// An in-memory status writer recording every accepted write.
#[derive(Default)]
pub struct FakeStatusWriter {
    writes: Mutex<Vec<SourceStatus>>,
    conflicts: Mutex<u32>,
}

impl FakeStatusWriter {
    pub fn writes(&self) -> Vec<SourceStatus> {
        self.writes.lock().unwrap().clone()
    }

    /// Reject the next `count` writes with a conflict.
    pub fn conflict_next(&self, count: u32) {
        *self.conflicts.lock().unwrap() = count;
    }
}

#[async_trait]
impl StatusWriter for FakeStatusWriter {
    async fn write_status(&self, source: &Source, status: &SourceStatus) -> Result<Source, AppError> {
        {
            let mut conflicts = self.conflicts.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(AppError::Conflict);
            }
        }
        self.writes.lock().unwrap().push(status.clone());
        let mut updated = source.clone();
        let version = updated.metadata.resource_version.as_deref().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        updated.metadata.resource_version = Some((version + 1).to_string());
        updated.status = Some(status.clone());
        Ok(updated)
    }
}
