//! An in-memory broker that records every call it receives.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{
    client::{BrokerClient, BrokerClientConfig, BrokerClientFactory},
    error::{BrokerError, Result},
    models::{
        BindRequest, BindResponse, Catalog, DeprovisionRequest, Parameters, ProvisionRequest,
        ProvisionResponse, UnbindRequest,
    },
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FakeOperation {
    GetCatalog,
    Provision,
    Deprovision,
    Bind,
    Unbind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FakeAction {
    GetCatalog,
    Provision {
        instance_id: String,
        request: ProvisionRequest,
    },
    Deprovision {
        instance_id: String,
        request: DeprovisionRequest,
    },
    Bind(BindRequest),
    Unbind(UnbindRequest),
}

impl FakeAction {
    pub const fn operation(&self) -> FakeOperation {
        match self {
            Self::GetCatalog => FakeOperation::GetCatalog,
            Self::Provision { .. } => FakeOperation::Provision,
            Self::Deprovision { .. } => FakeOperation::Deprovision,
            Self::Bind(_) => FakeOperation::Bind,
            Self::Unbind(_) => FakeOperation::Unbind,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct ProvisionedInstance {
    service_id: String,
    plan_id: String,
    parameters: Parameters,
}

impl From<&ProvisionRequest> for ProvisionedInstance {
    fn from(request: &ProvisionRequest) -> Self {
        Self {
            service_id: request.service_id.clone(),
            plan_id: request.plan_id.clone(),
            parameters: request.parameters.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct FakeBrokerState {
    catalog: Catalog,
    credentials: Map<String, Value>,
    actions: Vec<FakeAction>,
    instances: BTreeMap<String, ProvisionedInstance>,
    bindings: BTreeMap<(String, String), Map<String, Value>>,
    failures: BTreeMap<FakeOperation, VecDeque<BrokerError>>,
}

impl FakeBrokerState {
    fn next_failure(&mut self, operation: FakeOperation) -> Option<BrokerError> {
        self.failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
    }
}

#[derive(Debug, Default)]
pub struct FakeBroker {
    state: Mutex<FakeBrokerState>,
}

impl FakeBroker {
    pub fn new(catalog: Catalog) -> Self {
        let broker = Self::default();
        broker.set_catalog(catalog);
        broker
    }

    pub fn set_catalog(&self, catalog: Catalog) {
        self.state().catalog = catalog;
    }

    /// Credentials handed out by every successful bind.
    pub fn set_credentials(&self, credentials: Map<String, Value>) {
        self.state().credentials = credentials;
    }

    /// Makes the next call of `operation` fail with `error`.
    ///
    /// Scripted failures queue up: each call consumes at most one.
    pub fn fail_next(&self, operation: FakeOperation, error: BrokerError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn actions(&self) -> Vec<FakeAction> {
        self.state().actions.clone()
    }

    pub fn count(&self, operation: FakeOperation) -> usize {
        self.state()
            .actions
            .iter()
            .filter(|action| action.operation() == operation)
            .count()
    }

    pub fn has_instance(&self, instance_id: &str) -> bool {
        self.state().instances.contains_key(instance_id)
    }

    pub fn has_binding(&self, instance_id: &str, binding_id: &str) -> bool {
        self.state()
            .bindings
            .contains_key(&(instance_id.into(), binding_id.into()))
    }

    fn state(&self) -> MutexGuard<'_, FakeBrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn get_catalog(&self) -> Result<Catalog> {
        let mut state = self.state();
        state.actions.push(FakeAction::GetCatalog);

        match state.next_failure(FakeOperation::GetCatalog) {
            Some(error) => Err(error),
            None => Ok(state.catalog.clone()),
        }
    }

    async fn create_service_instance(
        &self,
        instance_id: &str,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse> {
        let mut state = self.state();
        state.actions.push(FakeAction::Provision {
            instance_id: instance_id.into(),
            request: request.clone(),
        });

        if let Some(error) = state.next_failure(FakeOperation::Provision) {
            return Err(error);
        }

        let provisioned = ProvisionedInstance::from(request);
        match state.instances.get(instance_id) {
            Some(existing) if *existing != provisioned => Err(BrokerError::Http {
                status: 409,
                error_message: Some("Conflict".into()),
                description: Some(format!(
                    "service instance {instance_id} already exists with different attributes"
                )),
            }),
            Some(_) => Ok(ProvisionResponse::default()),
            None => {
                state.instances.insert(instance_id.into(), provisioned);
                Ok(ProvisionResponse::default())
            }
        }
    }

    async fn delete_service_instance(
        &self,
        instance_id: &str,
        request: &DeprovisionRequest,
    ) -> Result<()> {
        let mut state = self.state();
        state.actions.push(FakeAction::Deprovision {
            instance_id: instance_id.into(),
            request: request.clone(),
        });

        if let Some(error) = state.next_failure(FakeOperation::Deprovision) {
            return Err(error);
        }

        state.instances.remove(instance_id);
        state
            .bindings
            .retain(|(bound_instance_id, _), _| bound_instance_id != instance_id);
        Ok(())
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse> {
        let mut state = self.state();
        state.actions.push(FakeAction::Bind(request.clone()));

        if let Some(error) = state.next_failure(FakeOperation::Bind) {
            return Err(error);
        }

        let credentials = state.credentials.clone();
        state.bindings.insert(
            (request.instance_id.clone(), request.binding_id.clone()),
            credentials.clone(),
        );
        Ok(BindResponse {
            credentials,
            syslog_drain_url: None,
            route_service_url: None,
        })
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<()> {
        let mut state = self.state();
        state.actions.push(FakeAction::Unbind(request.clone()));

        if let Some(error) = state.next_failure(FakeOperation::Unbind) {
            return Err(error);
        }

        state
            .bindings
            .remove(&(request.instance_id.clone(), request.binding_id.clone()));
        Ok(())
    }
}

/// Hands out the same [`FakeBroker`] for every broker, keeping the configs
/// it was asked for.
#[derive(Debug, Default)]
pub struct FakeBrokerFactory {
    broker: Arc<FakeBroker>,
    configs: Mutex<Vec<BrokerClientConfig>>,
}

impl FakeBrokerFactory {
    pub fn new(broker: Arc<FakeBroker>) -> Self {
        Self {
            broker,
            configs: Mutex::default(),
        }
    }

    pub fn broker(&self) -> &Arc<FakeBroker> {
        &self.broker
    }

    pub fn configs(&self) -> Vec<BrokerClientConfig> {
        self.configs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl BrokerClientFactory for FakeBrokerFactory {
    fn create(&self, config: &BrokerClientConfig) -> ::anyhow::Result<Arc<dyn BrokerClient>> {
        self.configs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(config.clone());
        Ok(self.broker.clone())
    }
}
