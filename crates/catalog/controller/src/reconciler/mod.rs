//! Per-kind control loops.

pub mod binding;
pub mod broker;
pub mod class;
pub mod instance;

use std::sync::Arc;

use async_trait::async_trait;
use catalog_api::{
    binding::{ServiceBindingCrd, ServiceBindingStatus},
    broker::{ServiceBrokerCrd, ServiceBrokerStatus},
    class::{ServiceClassCrd, ServiceClassStatus, ServicePlan},
    consts::FINALIZER_NAME,
    finalizer::FinalizerQueue,
    instance::{ServiceInstanceCrd, ServiceInstanceStatus},
    properties::{ObjectReference, UserInfo},
};
use catalog_broker::{
    models::OriginatingIdentity, BasicAuth, BrokerClient, BrokerClientConfig, BrokerClientFactory,
    BrokerError,
};
use kube::{
    runtime::{controller::Action, events::EventType},
    Resource, ResourceExt,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::ControllerConfig,
    injector::{InjectError, SecretInjector},
    parameters::ParametersError,
    store::{EventRecorder, NamespaceLookup, ResourceStore, SecretStore, StoreError},
};

pub mod reasons {
    pub const FETCHED_CATALOG: &str = "FetchedCatalog";
    pub const ERROR_FETCHING_CATALOG: &str = "ErrorFetchingCatalog";
    pub const ERROR_SYNCING_CATALOG: &str = "ErrorSyncingCatalog";
    pub const ERROR_DELETING_SERVICE_CLASS: &str = "ErrorDeletingServiceClass";
    pub const DELETED_SUCCESSFULLY: &str = "DeletedSuccessfully";

    pub const REFERENCES_NONEXISTENT_SERVICE_CLASS: &str = "ReferencesNonexistentServiceClass";
    pub const REFERENCES_NONEXISTENT_SERVICE_PLAN: &str = "ReferencesNonexistentServicePlan";
    pub const REFERENCES_NONEXISTENT_BROKER: &str = "ReferencesNonexistentBroker";
    pub const REFERENCES_NONEXISTENT_INSTANCE: &str = "ReferencesNonexistentInstance";
    pub const REFERENCES_DELETED_SERVICE_CLASS: &str = "ReferencesDeletedServiceClass";
    pub const ERROR_GETTING_AUTH_CREDENTIALS: &str = "ErrorGettingAuthCredentials";
    pub const ERROR_WITH_PARAMETERS: &str = "ErrorWithParameters";
    pub const ERROR_FINDING_NAMESPACE_FOR_INSTANCE: &str = "ErrorFindingNamespaceForInstance";
    pub const ERROR_WITH_ORIGINATING_IDENTITY: &str = "ErrorWithOriginatingIdentity";
    pub const ERROR_RECONCILIATION_RETRY_TIMEOUT: &str = "ErrorReconciliationRetryTimeout";

    pub const PROVISIONING: &str = "Provisioning";
    pub const PROVISIONED_SUCCESSFULLY: &str = "ProvisionedSuccessfully";
    pub const PROVISION_CALL_FAILED: &str = "ProvisionCallFailed";
    pub const DEPROVISIONING: &str = "Deprovisioning";
    pub const DEPROVISIONED_SUCCESSFULLY: &str = "DeprovisionedSuccessfully";
    pub const DEPROVISION_CALL_FAILED: &str = "DeprovisionCallFailed";

    pub const ERROR_ASYNC_OPERATION_IN_PROGRESS: &str = "ErrorAsyncOperationInProgress";
    pub const ERROR_NONBINDABLE_SERVICE_CLASS: &str = "ErrorNonbindableServiceClass";
    pub const ERROR_INSTANCE_NOT_READY: &str = "ErrorInstanceNotReady";
    pub const BINDING: &str = "Binding";
    pub const BIND_CALL_FAILED: &str = "BindCallFailed";
    pub const SERVICE_BINDING_RETURNED_FAILURE: &str = "ServiceBindingReturnedFailure";
    pub const SERVICE_BINDING_NEEDS_ORPHAN_MITIGATION: &str = "ServiceBindingNeedsOrphanMitigation";
    pub const ERROR_INJECTING_BIND_RESULT: &str = "ErrorInjectingBindResult";
    pub const INJECTED_BIND_RESULT: &str = "InjectedBindResult";
    pub const UNBINDING: &str = "Unbinding";
    pub const ERROR_EJECTING_BINDING: &str = "ErrorEjectingBinding";
    pub const UNBIND_CALL_FAILED: &str = "UnbindCallFailed";
    pub const ORPHAN_MITIGATION_SUCCESSFUL: &str = "OrphanMitigationSuccessful";
    pub const UNBOUND_SUCCESSFULLY: &str = "UnboundSuccessfully";
}

/// A reconcile error: the object is retried with backoff.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Broker(#[from] BrokerError),
    #[error("{0}")]
    Inject(#[from] InjectError),
    #[error("{0}")]
    Parameters(#[from] ParametersError),
    #[error("{0}")]
    Store(#[from] StoreError),
    /// A referenced object is missing or not in a usable state yet.
    #[error("{0}")]
    Dependency(String),
    #[error("reconcile panicked")]
    Panicked,
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    type Data: Send + Sync;

    const KIND: &'static str;

    async fn reconcile(&self, data: Arc<Self::Data>) -> Result<Action, Error>;
}

/// Gives the reconcilers uniform access to an object's status.
pub trait StatusObject: Clone + Resource<DynamicType = ()> + Send + Sync + 'static {
    type Status: Clone + Default + PartialEq + Send + Sync;

    fn status(&self) -> Option<&Self::Status>;

    fn status_mut(&mut self) -> &mut Option<Self::Status>;
}

macro_rules! impl_status_object {
    ( $( $crd:ty => $status:ty , )* ) => {
        $(
            impl StatusObject for $crd {
                type Status = $status;

                fn status(&self) -> Option<&Self::Status> {
                    self.status.as_ref()
                }

                fn status_mut(&mut self) -> &mut Option<Self::Status> {
                    &mut self.status
                }
            }
        )*
    };
}

impl_status_object!(
    ServiceBindingCrd => ServiceBindingStatus,
    ServiceBrokerCrd => ServiceBrokerStatus,
    ServiceClassCrd => ServiceClassStatus,
    ServiceInstanceCrd => ServiceInstanceStatus,
);

/// The class, plan and broker an instance resolves to.
#[derive(Clone, Debug)]
pub struct ServiceTarget {
    pub class: Arc<ServiceClassCrd>,
    pub plan: ServicePlan,
    pub broker: Arc<ServiceBrokerCrd>,
}

impl ServiceTarget {
    pub fn class_name(&self) -> String {
        self.class.name_any()
    }

    pub fn broker_name(&self) -> String {
        self.broker.name_any()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unresolved {
    pub reason: &'static str,
    pub message: String,
}

/// Everything a reconciler reads from and writes to.
pub struct Context {
    pub brokers: ResourceStore<ServiceBrokerCrd>,
    pub classes: ResourceStore<ServiceClassCrd>,
    pub instances: ResourceStore<ServiceInstanceCrd>,
    pub bindings: ResourceStore<ServiceBindingCrd>,
    pub secrets: Arc<dyn SecretStore>,
    pub namespaces: Arc<dyn NamespaceLookup>,
    pub recorder: Arc<dyn EventRecorder>,
    pub broker_clients: Arc<dyn BrokerClientFactory>,
    pub clock: Arc<dyn Clock>,
    pub config: ControllerConfig,
}

impl Context {
    pub fn injector(&self) -> SecretInjector {
        SecretInjector::new(self.secrets.clone())
    }

    pub async fn record<K>(&self, object: &K, type_: EventType, reason: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        self.recorder
            .publish(&object.object_ref(&()), type_, reason, note)
            .await
    }

    /// Persists `status` unless the object already carries it.
    pub async fn update_status<K>(
        &self,
        store: &ResourceStore<K>,
        object: &K,
        status: K::Status,
    ) -> Result<K, Error>
    where
        K: StatusObject,
    {
        if object.status() == Some(&status) {
            return Ok(object.clone());
        }

        let mut updated = object.clone();
        *updated.status_mut() = Some(status);
        store
            .client
            .update_status(&updated)
            .await
            .map_err(Into::into)
    }

    /// Adopts the object with our finalizer, leaving existing ones in place.
    pub async fn ensure_finalizer<K>(
        &self,
        store: &ResourceStore<K>,
        object: Arc<K>,
    ) -> Result<Arc<K>, Error>
    where
        K: StatusObject,
    {
        let queue = FinalizerQueue::new(object.finalizers());
        if queue.contains(FINALIZER_NAME) {
            return Ok(object);
        }

        let mut updated = (*object).clone();
        updated.meta_mut().finalizers = Some(queue.with_appended(FINALIZER_NAME));
        let updated = store.client.update(&updated).await?;

        let name = updated.name_any();
        let namespace = updated.namespace().unwrap_or_default();
        info!("added finalizer tag ({namespace}/{name})");
        Ok(Arc::new(updated))
    }

    /// Pops our finalizer from the head of the list.
    pub async fn release_finalizer<K>(&self, store: &ResourceStore<K>, object: &K) -> Result<(), Error>
    where
        K: StatusObject,
    {
        let Some(claim) = FinalizerQueue::new(object.finalizers()).claim_head(FINALIZER_NAME) else {
            return Ok(());
        };

        let mut updated = object.clone();
        updated.meta_mut().finalizers = Some(claim.release());
        store.client.update(&updated).await?;

        let name = updated.name_any();
        let namespace = updated.namespace().unwrap_or_default();
        info!("finalizing ({namespace}/{name})");
        Ok(())
    }

    /// Assigns a broker-side identifier once, so retries de-duplicate.
    pub async fn ensure_external_id<K>(
        &self,
        store: &ResourceStore<K>,
        object: Arc<K>,
        external_id: fn(&mut K) -> &mut String,
    ) -> Result<Arc<K>, Error>
    where
        K: StatusObject,
    {
        let mut updated = (*object).clone();
        let id = external_id(&mut updated);
        if !id.is_empty() {
            return Ok(object);
        }

        *id = Uuid::new_v4().to_string();
        let updated = store.client.update(&updated).await?;
        Ok(Arc::new(updated))
    }

    pub fn resolve_target(&self, class_name: &str, plan_name: &str) -> Result<ServiceTarget, Unresolved> {
        let class = self.classes.lister.get(None, class_name).ok_or_else(|| Unresolved {
            reason: reasons::REFERENCES_NONEXISTENT_SERVICE_CLASS,
            message: format!("References a non-existent ServiceClass {class_name:?}"),
        })?;

        let plan = class.spec.find_plan(plan_name).cloned().ok_or_else(|| Unresolved {
            reason: reasons::REFERENCES_NONEXISTENT_SERVICE_PLAN,
            message: format!(
                "References a non-existent ServicePlan {plan_name:?} on ServiceClass {class_name:?}"
            ),
        })?;

        let broker_name = &class.spec.broker_name;
        let broker = self.brokers.lister.get(None, broker_name).ok_or_else(|| Unresolved {
            reason: reasons::REFERENCES_NONEXISTENT_BROKER,
            message: format!(
                "The ServiceClass {class_name:?} references a non-existent ServiceBroker {broker_name:?}"
            ),
        })?;

        Ok(ServiceTarget {
            class,
            plan,
            broker,
        })
    }

    /// Resolves the broker's credentials and connects to it.
    pub async fn broker_client(
        &self,
        broker: &ServiceBrokerCrd,
    ) -> Result<Arc<dyn BrokerClient>, Error> {
        let auth = match &broker.spec.auth_secret {
            Some(reference) => Some(self.basic_auth(reference).await?),
            None => None,
        };

        let config = BrokerClientConfig {
            name: broker.name_any(),
            url: broker.spec.url.clone(),
            auth,
        };
        self.broker_clients
            .create(&config)
            .map_err(|error| Error::Dependency(error.to_string()))
    }

    async fn basic_auth(&self, reference: &ObjectReference) -> Result<BasicAuth, Error> {
        let ObjectReference { namespace, name } = reference;
        let secret = self
            .secrets
            .get(namespace, name)
            .await?
            .ok_or_else(|| Error::Dependency(format!("auth secret {namespace}/{name} not found")))?;

        let field = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| String::from_utf8_lossy(&value.0).into_owned())
                .ok_or_else(|| {
                    Error::Dependency(format!("auth secret {namespace}/{name} has no {key:?}"))
                })
        };
        Ok(BasicAuth {
            username: field("username")?,
            password: field("password")?,
        })
    }

    /// The identity of the requesting user, if forwarding it is enabled.
    pub fn originating_identity(
        &self,
        user_info: Option<&UserInfo>,
    ) -> Result<Option<OriginatingIdentity>, ::serde_json::Error> {
        match user_info {
            Some(user_info) if self.config.originating_identity => Ok(Some(OriginatingIdentity {
                platform: OriginatingIdentity::PLATFORM_KUBERNETES.into(),
                value: ::serde_json::to_value(user_info)?,
            })),
            _ => Ok(None),
        }
    }

    pub fn request_context(&self, namespace: &str) -> Option<Value> {
        self.config.osb_api_context_profile.then(|| {
            json!({
                "platform": OriginatingIdentity::PLATFORM_KUBERNETES,
                "namespace": namespace,
            })
        })
    }
}
