//! In-process implementations of every store contract.

use std::{
    collections::{BTreeMap, VecDeque},
    iter,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::{
    api::core::v1::{ObjectReference, Secret},
    apimachinery::pkg::apis::meta::v1::Time,
};
use futures::{future, Stream, StreamExt};
use kube::{
    runtime::{events::EventType, watcher},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{
    EventRecorder, Lister, NamespaceInfo, NamespaceLookup, ObjectKey, ResourceClient, Result,
    SecretStore, StoreError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteCounters {
    pub creates: usize,
    pub updates: usize,
    pub status_updates: usize,
    pub deletes: usize,
}

/// An object store with resource-version optimistic concurrency.
///
/// Follows the apiserver's rules for custom resources with a status
/// subresource: `update` never touches the status, `update_status` never
/// touches anything else, and an object carrying finalizers is only marked
/// for deletion until its last finalizer is removed.
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<ObjectKey, Arc<K>>>,
    counters: Mutex<WriteCounters>,
    next_version: AtomicU64,
    events: broadcast::Sender<watcher::Event<K>>,
}

impl<K> Default for MemoryStore<K>
where
    K: Clone,
{
    fn default() -> Self {
        Self {
            objects: Mutex::default(),
            counters: Mutex::default(),
            next_version: AtomicU64::new(1),
            events: broadcast::channel(1024).0,
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Clone + Resource + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Stores `object` as-is, replacing any previous version.
    pub fn insert(&self, mut object: K) -> Arc<K> {
        let key = ObjectKey::from_object(&object);
        self.stamp_new(&mut object);

        self.emit(watcher::Event::Apply(object.clone()));
        let object = Arc::new(object);
        lock(&self.objects).insert(key, object.clone());
        object
    }

    pub fn counters(&self) -> WriteCounters {
        *lock(&self.counters)
    }

    /// Replays the stored objects, then follows every change, as a watcher would.
    pub fn watch(&self) -> impl Stream<Item = watcher::Result<watcher::Event<K>>> + Send + 'static {
        // Subscribe before listing so no change in between is lost.
        let changes = BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| future::ready(event.ok()));
        let listing: Vec<_> = iter::once(watcher::Event::Init)
            .chain(
                self.list()
                    .into_iter()
                    .map(|object| watcher::Event::InitApply((*object).clone())),
            )
            .chain(iter::once(watcher::Event::InitDone))
            .collect();

        ::futures::stream::iter(listing).chain(changes).map(Ok)
    }

    fn stamp_new(&self, object: &mut K) {
        let version = self.next_version();
        let meta = object.meta_mut();
        meta.resource_version = Some(version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{version}"));
        }
        if meta.generation.is_none() {
            meta.generation = Some(1);
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(Utc::now()));
        }
    }

    fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn emit(&self, event: watcher::Event<K>) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn check_version(existing: &K, incoming: &K, key: &ObjectKey) -> Result<()> {
        if incoming.resource_version().is_some()
            && incoming.resource_version() != existing.resource_version()
        {
            Err(StoreError::Conflict(key.to_string()))
        } else {
            Ok(())
        }
    }

    fn commit(&self, objects: &mut BTreeMap<ObjectKey, Arc<K>>, key: ObjectKey, object: K) -> K {
        let removable = object.meta().deletion_timestamp.is_some() && object.finalizers().is_empty();
        if removable {
            objects.remove(&key);
            self.emit(watcher::Event::Delete(object.clone()));
        } else {
            objects.insert(key, Arc::new(object.clone()));
            self.emit(watcher::Event::Apply(object.clone()));
        }
        object
    }
}

impl<K> Lister<K> for MemoryStore<K>
where
    K: Send + Sync,
{
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        lock(&self.objects)
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    fn list(&self) -> Vec<Arc<K>> {
        lock(&self.objects).values().cloned().collect()
    }
}

#[async_trait]
impl<K> ResourceClient<K> for MemoryStore<K>
where
    K: Clone + Resource + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn create(&self, object: &K) -> Result<K> {
        let key = ObjectKey::from_object(object);
        let mut objects = lock(&self.objects);
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }

        let mut object = object.clone();
        object.meta_mut().resource_version = None;
        self.stamp_new(&mut object);

        objects.insert(key, Arc::new(object.clone()));
        lock(&self.counters).creates += 1;
        self.emit(watcher::Event::Apply(object.clone()));
        Ok(object)
    }

    async fn update(&self, object: &K) -> Result<K> {
        let key = ObjectKey::from_object(object);
        let mut objects = lock(&self.objects);
        let existing = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Self::check_version(&existing, object, &key)?;

        let mut updated = replace_field(object, existing.as_ref(), "status")?;
        let spec_changed = content(&updated)? != content(existing.as_ref())?;
        let meta = updated.meta_mut();
        meta.uid.clone_from(&existing.meta().uid);
        meta.creation_timestamp.clone_from(&existing.meta().creation_timestamp);
        meta.deletion_timestamp.clone_from(&existing.meta().deletion_timestamp);
        meta.generation = existing
            .meta()
            .generation
            .map(|generation| generation + i64::from(spec_changed));
        meta.resource_version = Some(self.next_version().to_string());

        lock(&self.counters).updates += 1;
        Ok(self.commit(&mut objects, key, updated))
    }

    async fn update_status(&self, object: &K) -> Result<K> {
        let key = ObjectKey::from_object(object);
        let mut objects = lock(&self.objects);
        let existing = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Self::check_version(&existing, object, &key)?;

        let mut updated = replace_field(existing.as_ref(), object, "status")?;
        updated.meta_mut().resource_version = Some(self.next_version().to_string());

        lock(&self.counters).status_updates += 1;
        Ok(self.commit(&mut objects, key, updated))
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let key = ObjectKey::new(namespace, name);
        let mut objects = lock(&self.objects);
        let existing = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let mut deleted = (*existing).clone();
        if deleted.meta().deletion_timestamp.is_none() {
            deleted.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
        }
        deleted.meta_mut().resource_version = Some(self.next_version().to_string());

        lock(&self.counters).deletes += 1;
        self.commit(&mut objects, key, deleted);
        Ok(())
    }
}

/// Returns `target` with `field` taken from `source`.
fn replace_field<K>(target: &K, source: &K, field: &str) -> Result<K>
where
    K: Serialize + DeserializeOwned,
{
    let mut target = to_value(target)?;
    let source = to_value(source)?;
    if let Value::Object(target) = &mut target {
        match source.get(field) {
            Some(value) => target.insert(field.into(), value.clone()),
            None => target.remove(field),
        };
    }
    ::serde_json::from_value(target).map_err(|error| StoreError::Other(error.to_string()))
}

/// Everything but metadata and status: what bumps the generation.
fn content<K>(object: &K) -> Result<Value>
where
    K: Serialize,
{
    let mut value = to_value(object)?;
    if let Value::Object(value) = &mut value {
        value.remove("metadata");
        value.remove("status");
    }
    Ok(value)
}

fn to_value<K>(object: &K) -> Result<Value>
where
    K: Serialize,
{
    ::serde_json::to_value(object).map_err(|error| StoreError::Other(error.to_string()))
}

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
    failures: Mutex<VecDeque<StoreError>>,
    next_version: AtomicU64,
}

impl MemorySecretStore {
    pub fn insert(&self, mut secret: Secret) {
        let key = secret_key(&secret);
        secret.metadata.resource_version = Some(self.next_version().to_string());
        lock(&self.secrets).insert(key, secret);
    }

    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<Secret> {
        lock(&self.secrets)
            .get(&(namespace.into(), name.into()))
            .cloned()
    }

    /// Makes the next write (create, update or delete) fail with `error`.
    pub fn fail_next_write(&self, error: StoreError) {
        lock(&self.failures).push_back(error);
    }

    fn next_failure(&self) -> Result<()> {
        match lock(&self.failures).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn secret_key(secret: &Secret) -> (String, String) {
    (secret.namespace().unwrap_or_default(), secret.name_any())
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.snapshot(namespace, name))
    }

    async fn create(&self, secret: &Secret) -> Result<Secret> {
        self.next_failure()?;

        let key = secret_key(secret);
        let mut secrets = lock(&self.secrets);
        if secrets.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("{}/{}", key.0, key.1)));
        }

        let mut secret = secret.clone();
        secret.metadata.resource_version = Some(self.next_version().to_string());
        if secret.metadata.uid.is_none() {
            secret.metadata.uid = secret.metadata.resource_version.clone();
        }
        secrets.insert(key, secret.clone());
        Ok(secret)
    }

    async fn update(&self, secret: &Secret) -> Result<Secret> {
        self.next_failure()?;

        let key = secret_key(secret);
        let mut secrets = lock(&self.secrets);
        let existing = secrets
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", key.0, key.1)))?;
        if secret.metadata.resource_version.is_some()
            && secret.metadata.resource_version != existing.metadata.resource_version
        {
            return Err(StoreError::Conflict(format!("{}/{}", key.0, key.1)));
        }

        let mut secret = secret.clone();
        secret.metadata.resource_version = Some(self.next_version().to_string());
        secrets.insert(key, secret.clone());
        Ok(secret)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.next_failure()?;

        lock(&self.secrets)
            .remove(&(namespace.into(), name.into()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("{namespace}/{name}")))
    }
}

#[derive(Default)]
pub struct MemoryNamespaces {
    namespaces: Mutex<BTreeMap<String, NamespaceInfo>>,
}

impl MemoryNamespaces {
    pub fn insert(&self, name: &str, uid: &str) {
        lock(&self.namespaces).insert(name.into(), NamespaceInfo { uid: uid.into() });
    }
}

#[async_trait]
impl NamespaceLookup for MemoryNamespaces {
    async fn get(&self, name: &str) -> Result<NamespaceInfo> {
        lock(&self.namespaces)
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.into()))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub reference: ObjectReference,
    pub type_: EventType,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .map(|event| event.reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        lock(&self.events).push(RecordedEvent {
            reference: reference.clone(),
            type_,
            reason: reason.into(),
            note,
        })
    }
}

#[cfg(test)]
mod tests {
    use catalog_api::broker::{ServiceBrokerCrd, ServiceBrokerSpec, ServiceBrokerStatus};

    use super::*;

    fn broker(name: &str) -> ServiceBrokerCrd {
        let mut broker = ServiceBrokerCrd::new(
            name,
            ServiceBrokerSpec {
                url: "http://broker.example.com".into(),
                auth_secret: None,
                relist_interval_secs: None,
            },
        );
        broker.meta_mut().finalizers = Some(vec!["keep".into()]);
        broker
    }

    #[tokio::test]
    async fn stale_writes_conflict() {
        let store = MemoryStore::default();
        let stored = (*store.insert(broker("b"))).clone();

        let mut first = stored.clone();
        first.spec.url = "http://other.example.com".into();
        store.update(&first).await.unwrap();

        let mut second = stored;
        second.spec.relist_interval_secs = Some(60);
        let error = store.update(&second).await.unwrap_err();
        assert!(error.is_conflict());
    }

    #[tokio::test]
    async fn status_and_spec_writes_are_separated() {
        let store = MemoryStore::default();
        let stored = (*store.insert(broker("b"))).clone();
        assert_eq!(stored.metadata.generation, Some(1));

        let mut with_status = stored.clone();
        with_status.spec.url = "ignored".into();
        with_status.status = Some(ServiceBrokerStatus::default());
        let updated = store.update_status(&with_status).await.unwrap();
        assert_eq!(updated.spec.url, "http://broker.example.com");
        assert!(updated.status.is_some());
        assert_eq!(updated.metadata.generation, Some(1));

        let mut with_spec = updated.clone();
        with_spec.spec.url = "http://other.example.com".into();
        with_spec.status = None;
        let updated = store.update(&with_spec).await.unwrap();
        assert!(updated.status.is_some());
        assert_eq!(updated.metadata.generation, Some(2));

        let counters = store.counters();
        assert_eq!(counters.updates, 1);
        assert_eq!(counters.status_updates, 1);
    }

    #[tokio::test]
    async fn finalizers_hold_back_deletion() {
        let store = MemoryStore::default();
        store.insert(broker("b"));

        store.delete(None, "b").await.unwrap();
        let pending = store.get(None, "b").unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());

        let mut released = (*pending).clone();
        released.metadata.finalizers = Some(Vec::default());
        store.update(&released).await.unwrap();
        assert!(store.get(None, "b").is_none());
    }

    #[tokio::test]
    async fn watch_replays_objects_before_following_changes() {
        let store = MemoryStore::default();
        store.insert(broker("a"));
        let mut events = Box::pin(store.watch());

        let mut unguarded = broker("b");
        unguarded.metadata.finalizers = None;
        store.insert(unguarded);
        store.delete(None, "b").await.unwrap();

        let mut seen = Vec::default();
        for _ in 0..5 {
            seen.push(match events.next().await.unwrap().unwrap() {
                watcher::Event::Init => "init".to_string(),
                watcher::Event::InitApply(object) => format!("init-apply {}", object.name_any()),
                watcher::Event::InitDone => "init-done".to_string(),
                watcher::Event::Apply(object) => format!("apply {}", object.name_any()),
                watcher::Event::Delete(object) => format!("delete {}", object.name_any()),
            });
        }
        assert_eq!(
            seen,
            ["init", "init-apply a", "init-done", "apply b", "delete b"],
        );
    }
}
