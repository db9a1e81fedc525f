mod common;

use std::time::Duration;

use catalog_api::{
    class::{ServiceClassCrd, ServiceClassSpec, ServiceClassStatus},
    condition::{ConditionStatus, ConditionType},
    consts::FINALIZER_NAME,
    properties::ObjectReference,
};
use catalog_broker::{error::BrokerError, fake::FakeOperation};
use catalog_controller::{
    clock::Clock,
    reconciler::{broker::BrokerReconciler, class::ClassReconciler, Error, Reconciler},
    store::{memory::WriteCounters, Lister, ResourceClient},
};
use kube::{runtime::controller::Action, ResourceExt};

use common::{broker, condition_reason, condition_status, instance, Harness};

fn orphan_class(name: &str, broker_name: &str) -> ServiceClassCrd {
    ServiceClassCrd::new(
        name,
        ServiceClassSpec {
            broker_name: broker_name.into(),
            external_id: format!("{name}-id"),
            description: String::default(),
            bindable: true,
            plan_updatable: false,
            plans: Vec::default(),
            tags: Vec::default(),
            requires: Vec::default(),
            external_metadata: None,
            dashboard_client: None,
        },
    )
}

#[tokio::test]
async fn catalog_fetch_failure_leaves_classes_untouched() {
    let h = Harness::new();
    h.seed_catalog();
    h.broker.fail_next(
        FakeOperation::GetCatalog,
        BrokerError::other("connection refused"),
    );

    let reconciler = BrokerReconciler::new(h.ctx.clone());
    let action = reconciler
        .reconcile(h.broker_object("b1").unwrap())
        .await
        .unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(15 * 60)));
    assert_eq!(h.classes.counters(), WriteCounters::default());
    assert!(h.class_object("mysql").unwrap().status.is_none());

    let broker = h.broker_object("b1").unwrap();
    let status = broker.status.as_ref();
    assert_eq!(
        condition_status(status, ConditionType::Ready),
        Some(ConditionStatus::False),
    );
    assert_eq!(
        condition_reason(status, ConditionType::Ready).as_deref(),
        Some("ErrorFetchingCatalog"),
    );
    assert!(status.unwrap().last_catalog_retrieval_time.is_none());
    assert_eq!(h.recorder.reasons(), ["ErrorFetchingCatalog"]);
}

#[tokio::test]
async fn unreadable_auth_secrets_fail_the_catalog_fetch() {
    let h = Harness::new();
    let mut data = broker("b1");
    data.spec.auth_secret = Some(ObjectReference {
        namespace: "brokers".into(),
        name: "missing".into(),
    });
    h.brokers.insert(data);

    let error = BrokerReconciler::new(h.ctx.clone())
        .reconcile(h.broker_object("b1").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Dependency(_)));
    assert_eq!(h.broker.count(FakeOperation::GetCatalog), 0);

    let broker = h.broker_object("b1").unwrap();
    let status = broker.status.as_ref();
    assert_eq!(
        condition_status(status, ConditionType::Ready),
        Some(ConditionStatus::False),
    );
    assert_eq!(
        condition_reason(status, ConditionType::Ready).as_deref(),
        Some("ErrorFetchingCatalog"),
    );
    assert_eq!(h.recorder.reasons(), ["ErrorFetchingCatalog"]);
}

#[tokio::test]
async fn catalog_sync_creates_classes_and_flags_removed_ones() {
    let h = Harness::new();
    h.brokers.insert(broker("b1"));
    h.classes.insert(orphan_class("legacy", "b1"));
    h.classes.insert(orphan_class("foreign", "b2"));

    BrokerReconciler::new(h.ctx.clone())
        .reconcile(h.broker_object("b1").unwrap())
        .await
        .unwrap();

    let mysql = h.class_object("mysql").unwrap();
    assert_eq!(mysql.spec.broker_name, "b1");
    assert_eq!(mysql.spec.external_id, "mysql-id");
    let plans: Vec<_> = mysql.spec.plans.iter().map(|plan| plan.name.as_str()).collect();
    assert_eq!(plans, ["small", "archive"]);

    assert_eq!(
        h.class_object("legacy").unwrap().status,
        Some(ServiceClassStatus {
            removed_from_broker_catalog: true,
        }),
    );
    assert!(h.class_object("foreign").unwrap().status.is_none());

    let broker = h.broker_object("b1").unwrap();
    assert_eq!(broker.finalizers(), [FINALIZER_NAME]);
    let status = broker.status.as_ref();
    assert_eq!(
        condition_reason(status, ConditionType::Ready).as_deref(),
        Some("FetchedCatalog"),
    );
    assert_eq!(
        status.unwrap().last_catalog_retrieval_time,
        Some(h.clock.now()),
    );
}

#[tokio::test]
async fn removed_classes_are_deleted_once_unreferenced() {
    let h = Harness::new();
    h.brokers.insert(broker("b1"));
    h.classes.insert(orphan_class("legacy", "b1"));
    h.classes.insert(orphan_class("pinned", "b1"));
    let mut pinned_user = instance("db1", "small");
    pinned_user.spec.service_class_name = "pinned".into();
    h.instances.insert(pinned_user);

    BrokerReconciler::new(h.ctx.clone())
        .reconcile(h.broker_object("b1").unwrap())
        .await
        .unwrap();

    let reconciler = ClassReconciler::new(h.ctx.clone());
    for name in ["legacy", "pinned", "mysql"] {
        reconciler
            .reconcile(h.class_object(name).unwrap())
            .await
            .unwrap();
    }

    assert!(h.class_object("legacy").is_none());
    assert!(h.class_object("pinned").is_some());
    assert!(h.class_object("mysql").is_some());
}

#[tokio::test]
async fn ready_brokers_are_relisted_after_their_interval() {
    let h = Harness::new();
    h.brokers.insert(broker("b1"));
    let reconciler = BrokerReconciler::new(h.ctx.clone());

    reconciler
        .reconcile(h.broker_object("b1").unwrap())
        .await
        .unwrap();
    assert_eq!(h.broker.count(FakeOperation::GetCatalog), 1);

    let action = reconciler
        .reconcile(h.broker_object("b1").unwrap())
        .await
        .unwrap();
    assert_eq!(h.broker.count(FakeOperation::GetCatalog), 1);
    assert_eq!(action, Action::requeue(Duration::from_secs(15 * 60)));

    h.clock.advance(::chrono::Duration::minutes(16));
    reconciler
        .reconcile(h.broker_object("b1").unwrap())
        .await
        .unwrap();
    assert_eq!(h.broker.count(FakeOperation::GetCatalog), 2);
}

#[tokio::test]
async fn unrepresentable_relist_intervals_are_never_due() {
    let h = Harness::new();
    let mut data = broker("b1");
    data.spec.relist_interval_secs = Some(u64::MAX);
    h.brokers.insert(data);
    let reconciler = BrokerReconciler::new(h.ctx.clone());

    reconciler
        .reconcile(h.broker_object("b1").unwrap())
        .await
        .unwrap();
    h.clock.advance(::chrono::Duration::days(365));
    let action = reconciler
        .reconcile(h.broker_object("b1").unwrap())
        .await
        .unwrap();

    assert_eq!(h.broker.count(FakeOperation::GetCatalog), 1);
    assert_eq!(action, Action::requeue(Duration::from_secs(u64::MAX)));
}

#[tokio::test]
async fn deleted_brokers_take_their_classes_with_them() {
    let h = Harness::new();
    h.brokers.insert(broker("b1"));
    h.classes.insert(orphan_class("foreign", "b2"));
    let reconciler = BrokerReconciler::new(h.ctx.clone());

    reconciler
        .reconcile(h.broker_object("b1").unwrap())
        .await
        .unwrap();
    assert!(h.class_object("mysql").is_some());

    h.brokers.delete(None, "b1").await.unwrap();
    reconciler
        .reconcile(h.broker_object("b1").unwrap())
        .await
        .unwrap();

    assert!(h.broker_object("b1").is_none());
    let remaining: Vec<_> = h.classes.list().iter().map(|class| class.name_any()).collect();
    assert_eq!(remaining, ["foreign"]);
    assert!(h.recorder.reasons().contains(&"DeletedSuccessfully".to_string()));
}
