//! Store contracts backed by a live cluster.

use std::{fmt, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{Namespace, ObjectReference, Secret},
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    ClusterResourceScope, NamespaceResourceScope,
};
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    runtime::{
        events::{Event, EventType, Recorder, Reporter},
        reflector::{ObjectRef, Store},
    },
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use super::{
    EventRecorder, Lister, NamespaceInfo, NamespaceLookup, ResourceClient, SecretStore, StoreError,
};

impl From<::kube::Error> for StoreError {
    fn from(error: ::kube::Error) -> Self {
        match &error {
            ::kube::Error::Api(response) => match (response.code, response.reason.as_str()) {
                (404, _) => Self::NotFound(response.message.clone()),
                (409, "AlreadyExists") => Self::AlreadyExists(response.message.clone()),
                (409, _) => Self::Conflict(response.message.clone()),
                _ => Self::Other(error.to_string()),
            },
            _ => Self::Other(error.to_string()),
        }
    }
}

/// A [`Lister`] over a reflector cache.
pub struct KubeLister<K>
where
    K: 'static + Resource<DynamicType = ()>,
{
    store: Store<K>,
}

impl<K> KubeLister<K>
where
    K: 'static + Resource<DynamicType = ()>,
{
    pub fn new(store: Store<K>) -> Self {
        Self { store }
    }
}

impl<K> Lister<K> for KubeLister<K>
where
    K: 'static + Clone + Resource<DynamicType = ()> + Send + Sync,
{
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        let key = ObjectRef::new(name);
        let key = match namespace {
            Some(namespace) => key.within(namespace),
            None => key,
        };
        self.store.get(&key)
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }
}

pub struct KubeResourceClient<K> {
    kube: Client,
    api: fn(Client, Option<&str>) -> Api<K>,
}

impl<K> KubeResourceClient<K>
where
    K: Resource<DynamicType = ()>,
{
    pub fn cluster(kube: Client) -> Self
    where
        K: Resource<Scope = ClusterResourceScope>,
    {
        Self {
            kube,
            api: |kube, _| Api::all(kube),
        }
    }

    pub fn namespaced(kube: Client) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self {
            kube,
            api: |kube, namespace| match namespace {
                Some(namespace) => Api::namespaced(kube, namespace),
                None => Api::all(kube),
            },
        }
    }

    fn api_for(&self, object: &K) -> Api<K> {
        (self.api)(self.kube.clone(), object.meta().namespace.as_deref())
    }
}

#[async_trait]
impl<K> ResourceClient<K> for KubeResourceClient<K>
where
    K: Clone + fmt::Debug + Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    K: Send + Sync + 'static,
{
    async fn create(&self, object: &K) -> super::Result<K> {
        let pp = PostParams {
            dry_run: false,
            field_manager: Some(crate::consts::NAME.into()),
        };
        self.api_for(object)
            .create(&pp, object)
            .await
            .map_err(Into::into)
    }

    async fn update(&self, object: &K) -> super::Result<K> {
        let pp = PostParams {
            dry_run: false,
            field_manager: Some(crate::consts::NAME.into()),
        };
        self.api_for(object)
            .replace(&object.name_any(), &pp, object)
            .await
            .map_err(Into::into)
    }

    async fn update_status(&self, object: &K) -> super::Result<K> {
        let pp = PostParams {
            dry_run: false,
            field_manager: Some(crate::consts::NAME.into()),
        };
        let data =
            ::serde_json::to_vec(object).map_err(|error| StoreError::Other(error.to_string()))?;
        self.api_for(object)
            .replace_status(&object.name_any(), &pp, data)
            .await
            .map_err(Into::into)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> super::Result<()> {
        (self.api)(self.kube.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(Into::into)
    }
}

pub struct KubeSecretStore {
    kube: Client,
}

impl KubeSecretStore {
    pub fn new(kube: Client) -> Self {
        Self { kube }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.kube.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> super::Result<Option<Secret>> {
        self.api(namespace).get_opt(name).await.map_err(Into::into)
    }

    async fn create(&self, secret: &Secret) -> super::Result<Secret> {
        let namespace = secret.namespace().unwrap_or_default();
        self.api(&namespace)
            .create(&PostParams::default(), secret)
            .await
            .map_err(Into::into)
    }

    async fn update(&self, secret: &Secret) -> super::Result<Secret> {
        let namespace = secret.namespace().unwrap_or_default();
        self.api(&namespace)
            .replace(&secret.name_any(), &PostParams::default(), secret)
            .await
            .map_err(Into::into)
    }

    async fn delete(&self, namespace: &str, name: &str) -> super::Result<()> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(Into::into)
    }
}

pub struct KubeNamespaces {
    api: Api<Namespace>,
}

impl KubeNamespaces {
    pub fn new(kube: Client) -> Self {
        Self {
            api: Api::all(kube),
        }
    }
}

#[async_trait]
impl NamespaceLookup for KubeNamespaces {
    async fn get(&self, name: &str) -> super::Result<NamespaceInfo> {
        let namespace = self
            .api
            .get_opt(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(name.into()))?;
        namespace
            .uid()
            .map(|uid| NamespaceInfo { uid })
            .ok_or_else(|| StoreError::Other(format!("namespace {name} has no uid")))
    }
}

/// Publishes events through the cluster's event API.
pub struct KubeRecorder {
    kube: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(kube: Client) -> Self {
        Self {
            kube,
            reporter: Reporter {
                controller: crate::consts::NAME.into(),
                instance: ::std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeRecorder {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let recorder = Recorder::new(self.kube.clone(), self.reporter.clone(), reference.clone());
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(note),
            action: "Reconcile".into(),
            secondary: None,
        };
        if let Err(error) = recorder.publish(event).await {
            warn!("failed to publish event ({reason}): {error}");
        }
    }
}

/// Installs or upgrades a custom resource definition.
pub async fn install_crd(kube: Client, crd: CustomResourceDefinition) -> Result<()> {
    let api = Api::<CustomResourceDefinition>::all(kube);
    let name = crd.name_any();

    if api.get_opt(&name).await?.is_none() {
        let pp = PostParams {
            dry_run: false,
            field_manager: Some(crate::consts::NAME.into()),
        };
        api.create(&pp, &crd).await?;

        info!("Created CRD: {name}");
    } else {
        let pp = PatchParams {
            dry_run: false,
            force: true,
            field_manager: Some(crate::consts::NAME.into()),
            ..Default::default()
        };
        api.patch(&name, &pp, &Patch::Apply(&crd)).await?;

        info!("Updated CRD: {name}");
    }
    Ok(())
}
