//! Drives the reconcilers on kube's controller runtime.

use std::{
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use catalog_api::{
    binding::ServiceBindingCrd, broker::ServiceBrokerCrd, class::ServiceClassCrd,
    instance::ServiceInstanceCrd,
};
use catalog_core::signal::StopSignal;
use futures::{stream::BoxStream, FutureExt, Stream, StreamExt};
use kube::{
    runtime::{
        self,
        controller::{self, Action},
        reflector::{store::Writer, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Resource,
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, warn};

use crate::reconciler::{
    binding::BindingReconciler, broker::BrokerReconciler, class::ClassReconciler,
    instance::InstanceReconciler, Context, Error, Reconciler,
};

/// Per-object retry delays: `base * 2^failures`, capped at `max`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// One kind's change feed, mirrored into the cache the runtime reads from.
pub struct Watch<K>
where
    K: Resource<DynamicType = ()> + 'static,
{
    reader: Store<K>,
    objects: BoxStream<'static, watcher::Result<K>>,
}

impl<K> Watch<K>
where
    K: Clone + fmt::Debug + Resource<DynamicType = ()> + Send + Sync + 'static,
{
    pub fn new<S>(writer: Writer<K>, events: S) -> Self
    where
        S: Stream<Item = watcher::Result<watcher::Event<K>>> + Send + 'static,
    {
        Self {
            reader: writer.as_reader(),
            objects: events.reflect(writer).applied_objects().boxed(),
        }
    }

    pub fn reader(&self) -> Store<K> {
        self.reader.clone()
    }
}

/// The change feeds of every kind.
pub struct Watches {
    pub brokers: Watch<ServiceBrokerCrd>,
    pub classes: Watch<ServiceClassCrd>,
    pub instances: Watch<ServiceInstanceCrd>,
    pub bindings: Watch<ServiceBindingCrd>,
}

/// A reconciler with its retry bookkeeping.
struct Worker<R>
where
    R: Reconciler,
    R::Data: Resource<DynamicType = ()>,
{
    reconciler: R,
    backoff: Backoff,
    failures: Mutex<HashMap<ObjectRef<R::Data>, u32>>,
}

impl<R> Worker<R>
where
    R: Reconciler + 'static,
    R::Data: Clone + fmt::Debug + Resource<DynamicType = ()> + 'static,
{
    fn new(reconciler: R, backoff: Backoff) -> Self {
        Self {
            reconciler,
            backoff,
            failures: Mutex::default(),
        }
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<ObjectRef<R::Data>, u32>> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reconciles one object, isolating panics to it.
    async fn reconcile(&self, data: Arc<R::Data>) -> Result<Action, Error> {
        let kind = R::KIND;
        let key = ObjectRef::from_obj(data.as_ref());

        let result = AssertUnwindSafe(self.reconciler.reconcile(data))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!("panicked while reconciling {kind} {key}");
                Err(Error::Panicked)
            });
        if result.is_ok() {
            self.failures().remove(&key);
        }
        result
    }

    fn error_policy(&self, data: &R::Data, error: &Error) -> Action {
        let kind = R::KIND;
        let key = ObjectRef::from_obj(data);

        let failures = {
            let mut failures = self.failures();
            let count = failures.entry(key.clone()).or_default();
            let previous = *count;
            *count = count.saturating_add(1);
            previous
        };
        let delay = self.backoff.delay(failures);
        warn!("failed to reconcile {kind} {key}: {error}; retrying in {delay:?}");
        Action::requeue(delay)
    }
}

/// Runs every kind's reconciler until stopped.
pub struct Controller {
    ctx: Arc<Context>,
}

impl Controller {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, watches: Watches, signal: StopSignal) {
        info!("Starting controller");

        let Watches {
            brokers,
            classes,
            instances,
            bindings,
        } = watches;
        let ctx = &self.ctx;
        ::futures::join!(
            self.run_kind(BrokerReconciler::new(ctx.clone()), brokers, &signal),
            self.run_kind(ClassReconciler::new(ctx.clone()), classes, &signal),
            self.run_kind(InstanceReconciler::new(ctx.clone()), instances, &signal),
            self.run_kind(BindingReconciler::new(ctx.clone()), bindings, &signal),
        );

        info!("Shutting down controller");
    }

    async fn run_kind<R>(&self, reconciler: R, watch: Watch<R::Data>, signal: &StopSignal)
    where
        R: Reconciler + 'static,
        R::Data: Clone
            + fmt::Debug
            + Resource<DynamicType = ()>
            + ::serde::de::DeserializeOwned
            + Send
            + Sync
            + 'static,
    {
        let kind = R::KIND;
        let config = &self.ctx.config;
        let backoff = Backoff {
            base: config.backoff_base,
            max: config.backoff_max,
        };
        let concurrency = u16::try_from(config.workers_per_kind.max(1)).unwrap_or(u16::MAX);
        let resync = ::tokio::time::interval(config.resync_interval.max(Duration::from_secs(1)));
        let stopped = {
            let signal = signal.clone();
            async move { signal.wait_to_terminate().await }
        };

        runtime::Controller::for_stream(watch.objects, watch.reader)
            .with_config(controller::Config::default().concurrency(concurrency))
            .reconcile_all_on(IntervalStream::new(resync).map(|_| ()))
            .graceful_shutdown_on(stopped)
            .run(
                |data, worker| async move { worker.reconcile(data).await },
                |data, error, worker| worker.error_policy(&data, error),
                Arc::new(Worker::new(reconciler, backoff)),
            )
            .for_each(move |result| async move {
                match result {
                    Ok((object, _)) => debug!("reconciled {kind} {object}"),
                    // Already reported by the error policy.
                    Err(controller::Error::ReconcilerFailed(..)) => (),
                    Err(controller::Error::ObjectNotFound(object)) => {
                        debug!("{kind} {object}: not found in cache; dropping")
                    }
                    Err(error) => warn!("failed to run {kind} controller: {error}"),
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};

    use super::*;

    struct Flaky {
        panics: AtomicBool,
    }

    #[async_trait]
    impl Reconciler for Flaky {
        type Data = ConfigMap;

        const KIND: &'static str = "ConfigMap";

        async fn reconcile(&self, _: Arc<Self::Data>) -> Result<Action, Error> {
            if self.panics.load(Ordering::SeqCst) {
                panic!("reconciler bug");
            }
            Ok(Action::await_change())
        }
    }

    fn config_map(name: &str) -> Arc<ConfigMap> {
        Arc::new(ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("dev".into()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let backoff = Backoff {
            base: Duration::from_millis(5),
            max: Duration::from_millis(100),
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(5));
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(4), Duration::from_millis(80));
        assert_eq!(backoff.delay(5), Duration::from_millis(100));
        assert_eq!(backoff.delay(40), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn failures_back_off_per_object_until_a_success() {
        let worker = Worker::new(
            Flaky {
                panics: AtomicBool::new(true),
            },
            Backoff::default(),
        );
        let a = config_map("a");
        let b = config_map("b");

        let error = worker.reconcile(a.clone()).await.unwrap_err();
        assert!(matches!(error, Error::Panicked));
        assert_eq!(
            worker.error_policy(&a, &error),
            Action::requeue(Duration::from_millis(5)),
        );
        assert_eq!(
            worker.error_policy(&a, &error),
            Action::requeue(Duration::from_millis(10)),
        );
        assert_eq!(
            worker.error_policy(&b, &error),
            Action::requeue(Duration::from_millis(5)),
        );

        worker.reconciler.panics.store(false, Ordering::SeqCst);
        assert_eq!(worker.reconcile(a.clone()).await.unwrap(), Action::await_change());
        assert_eq!(
            worker.error_policy(&a, &error),
            Action::requeue(Duration::from_millis(5)),
        );
    }
}
