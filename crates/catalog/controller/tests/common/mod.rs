#![allow(dead_code)]

use std::sync::Arc;

use catalog_api::{
    binding::{LocalObjectReference, ServiceBindingCrd, ServiceBindingSpec},
    broker::{ServiceBrokerCrd, ServiceBrokerSpec},
    class::{ServiceClassCrd, ServiceClassSpec, ServicePlan},
    condition::{ConditionStatus, ConditionType, Conditions},
    consts::FINALIZER_NAME,
    instance::{ServiceInstanceCrd, ServiceInstanceSpec, ServiceInstanceStatus},
};
use catalog_broker::{
    fake::{FakeBroker, FakeBrokerFactory},
    models::{Catalog, Plan, Service},
};
use catalog_controller::{
    clock::ManualClock,
    config::ControllerConfig,
    reconciler::Context,
    store::{
        memory::{MemoryNamespaces, MemoryRecorder, MemorySecretStore, MemoryStore},
        Lister, ResourceStore,
    },
};
use chrono::Utc;
use serde_json::{Map, Value};

pub const NAMESPACE: &str = "dev";
pub const NAMESPACE_UID: &str = "9f2c1b7e-dev";

/// An in-memory cluster wired to a fake broker.
pub struct Harness {
    pub brokers: Arc<MemoryStore<ServiceBrokerCrd>>,
    pub classes: Arc<MemoryStore<ServiceClassCrd>>,
    pub instances: Arc<MemoryStore<ServiceInstanceCrd>>,
    pub bindings: Arc<MemoryStore<ServiceBindingCrd>>,
    pub secrets: Arc<MemorySecretStore>,
    pub namespaces: Arc<MemoryNamespaces>,
    pub recorder: Arc<MemoryRecorder>,
    pub broker: Arc<FakeBroker>,
    pub clock: Arc<ManualClock>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let brokers = Arc::new(MemoryStore::default());
        let classes = Arc::new(MemoryStore::default());
        let instances = Arc::new(MemoryStore::default());
        let bindings = Arc::new(MemoryStore::default());
        let secrets = Arc::new(MemorySecretStore::default());
        let namespaces = Arc::new(MemoryNamespaces::default());
        let recorder = Arc::new(MemoryRecorder::default());
        let broker = Arc::new(FakeBroker::new(catalog()));
        let clock = Arc::new(ManualClock::new(Utc::now()));

        namespaces.insert(NAMESPACE, NAMESPACE_UID);

        let ctx = Arc::new(Context {
            brokers: ResourceStore::new(brokers.clone(), brokers.clone()),
            classes: ResourceStore::new(classes.clone(), classes.clone()),
            instances: ResourceStore::new(instances.clone(), instances.clone()),
            bindings: ResourceStore::new(bindings.clone(), bindings.clone()),
            secrets: secrets.clone(),
            namespaces: namespaces.clone(),
            recorder: recorder.clone(),
            broker_clients: Arc::new(FakeBrokerFactory::new(broker.clone())),
            clock: clock.clone(),
            config,
        });

        Self {
            brokers,
            classes,
            instances,
            bindings,
            secrets,
            namespaces,
            recorder,
            broker,
            clock,
            ctx,
        }
    }

    /// Registers broker `b1` and its `mysql` class, as a relist would.
    pub fn seed_catalog(&self) {
        self.brokers.insert(broker("b1"));

        let class = ServiceClassCrd::new(
            "mysql",
            ServiceClassSpec {
                broker_name: "b1".into(),
                external_id: "mysql-id".into(),
                description: "managed mysql".into(),
                bindable: true,
                plan_updatable: false,
                plans: vec![plan("small", None), plan("archive", Some(false))],
                tags: Vec::default(),
                requires: Vec::default(),
                external_metadata: None,
                dashboard_client: None,
            },
        );
        self.classes.insert(class);
    }

    /// Inserts a provisioned, ready instance of `mysql/<plan>`.
    pub fn ready_instance(&self, name: &str, plan: &str) -> Arc<ServiceInstanceCrd> {
        let mut instance = instance(name, plan);
        instance.metadata.finalizers = Some(vec![FINALIZER_NAME.into()]);

        let mut status = ServiceInstanceStatus {
            reconciled_generation: Some(1),
            ..Default::default()
        };
        status.set_condition(
            ConditionType::Ready,
            ConditionStatus::True,
            "ProvisionedSuccessfully",
            "The instance was provisioned successfully.",
            Utc::now(),
        );
        instance.status = Some(status);
        self.instances.insert(instance)
    }

    pub fn broker_object(&self, name: &str) -> Option<Arc<ServiceBrokerCrd>> {
        self.brokers.get(None, name)
    }

    pub fn class_object(&self, name: &str) -> Option<Arc<ServiceClassCrd>> {
        self.classes.get(None, name)
    }

    pub fn instance_object(&self, name: &str) -> Option<Arc<ServiceInstanceCrd>> {
        self.instances.get(Some(NAMESPACE), name)
    }

    pub fn binding_object(&self, name: &str) -> Option<Arc<ServiceBindingCrd>> {
        self.bindings.get(Some(NAMESPACE), name)
    }
}

pub fn catalog() -> Catalog {
    Catalog {
        services: vec![Service {
            id: "mysql-id".into(),
            name: "mysql".into(),
            description: "managed mysql".into(),
            bindable: true,
            plan_updateable: false,
            plans: vec![
                Plan {
                    id: "small-id".into(),
                    name: "small".into(),
                    description: String::default(),
                    free: None,
                    bindable: None,
                    metadata: None,
                },
                Plan {
                    id: "archive-id".into(),
                    name: "archive".into(),
                    description: String::default(),
                    free: None,
                    bindable: Some(false),
                    metadata: None,
                },
            ],
            tags: Vec::default(),
            requires: Vec::default(),
            metadata: None,
            dashboard_client: None,
        }],
    }
}

pub fn broker(name: &str) -> ServiceBrokerCrd {
    ServiceBrokerCrd::new(
        name,
        ServiceBrokerSpec {
            url: format!("http://{name}.brokers.svc"),
            auth_secret: None,
            relist_interval_secs: None,
        },
    )
}

fn plan(name: &str, bindable: Option<bool>) -> ServicePlan {
    ServicePlan {
        name: name.into(),
        external_id: format!("{name}-id"),
        description: String::default(),
        free: true,
        bindable,
        external_metadata: None,
    }
}

pub fn instance(name: &str, plan: &str) -> ServiceInstanceCrd {
    let mut instance = ServiceInstanceCrd::new(
        name,
        ServiceInstanceSpec {
            service_class_name: "mysql".into(),
            plan_name: plan.into(),
            parameters: None,
            parameters_from: Vec::default(),
            external_id: format!("{name}-id"),
            user_info: None,
        },
    );
    instance.metadata.namespace = Some(NAMESPACE.into());
    instance
}

pub fn binding(name: &str, instance: &str, parameters: Option<Value>) -> ServiceBindingCrd {
    let mut binding = ServiceBindingCrd::new(
        name,
        ServiceBindingSpec {
            instance_ref: LocalObjectReference {
                name: instance.into(),
            },
            parameters,
            parameters_from: Vec::default(),
            secret_name: format!("{name}-secret"),
            external_id: format!("{name}-id"),
            user_info: None,
        },
    );
    binding.metadata.namespace = Some(NAMESPACE.into());
    binding
}

pub fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => unreachable!("expected an object"),
    }
}

pub fn condition_reason<S>(status: Option<&S>, type_: ConditionType) -> Option<String>
where
    S: Conditions,
{
    status
        .and_then(|status| status.find_condition(type_))
        .map(|condition| condition.reason.clone())
}

pub fn condition_status<S>(status: Option<&S>, type_: ConditionType) -> Option<ConditionStatus>
where
    S: Conditions,
{
    status
        .and_then(|status| status.find_condition(type_))
        .map(|condition| condition.status)
}
