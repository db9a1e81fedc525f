//! Read caches and write clients the reconcilers work against.
//!
//! Reconcilers never talk to the cluster directly: they read from a
//! [`Lister`] and write through a [`ResourceClient`]. The [`memory`] backend
//! implements every contract in-process; [`cluster`] adapts them to `kube`.

pub mod cluster;
pub mod memory;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::{runtime::events::EventType, Resource, ResourceExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("the object has been modified: {0}")]
    Conflict(String),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type Result<T, E = StoreError> = ::core::result::Result<T, E>;

/// Identifies an object by its (optional) namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(Into::into),
            name: name.into(),
        }
    }

    pub fn from_object<K>(object: &K) -> Self
    where
        K: Resource,
    {
        Self {
            namespace: object.namespace(),
            name: object.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => self.name.fmt(f),
        }
    }
}

/// A read-only cache of objects.
///
/// Returned objects are shared: clone them before mutating.
pub trait Lister<K>: Send + Sync {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>>;

    fn list(&self) -> Vec<Arc<K>>;
}

/// Writes objects of a single kind.
///
/// `update` and `update_status` carry the resource version the caller last
/// observed and fail with [`StoreError::Conflict`] when it is stale.
#[async_trait]
pub trait ResourceClient<K>: Send + Sync {
    async fn create(&self, object: &K) -> Result<K>;

    async fn update(&self, object: &K) -> Result<K>;

    async fn update_status(&self, object: &K) -> Result<K>;

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()>;
}

/// A lister paired with the client writing the same kind.
pub struct ResourceStore<K> {
    pub lister: Arc<dyn Lister<K>>,
    pub client: Arc<dyn ResourceClient<K>>,
}

impl<K> Clone for ResourceStore<K> {
    fn clone(&self) -> Self {
        Self {
            lister: self.lister.clone(),
            client: self.client.clone(),
        }
    }
}

impl<K> ResourceStore<K> {
    pub fn new(lister: Arc<dyn Lister<K>>, client: Arc<dyn ResourceClient<K>>) -> Self {
        Self { lister, client }
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn create(&self, secret: &Secret) -> Result<Secret>;

    async fn update(&self, secret: &Secret) -> Result<Secret>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub uid: String,
}

#[async_trait]
pub trait NamespaceLookup: Send + Sync {
    async fn get(&self, name: &str) -> Result<NamespaceInfo>;
}

/// Publishes operator-facing events.
///
/// Publishing never fails from the caller's point of view: a lost event must
/// not break reconciliation.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    );
}
