use std::{fmt, sync::Arc};

use anyhow::{anyhow, Result};
use catalog_api::{
    binding::ServiceBindingCrd, broker::ServiceBrokerCrd, class::ServiceClassCrd,
    instance::ServiceInstanceCrd,
};
use catalog_broker::http::HttpBrokerClientFactory;
use catalog_controller::{
    clock::SystemClock,
    config::ControllerConfig,
    controller::{Controller, Watch, Watches},
    reconciler::Context,
    store::{
        cluster::{
            install_crd, KubeLister, KubeNamespaces, KubeRecorder, KubeResourceClient,
            KubeSecretStore,
        },
        ResourceStore,
    },
};
use catalog_core::signal::StopSignal;
use kube::{
    runtime::{
        reflector,
        watcher::{self, watcher},
        WatchStreamExt,
    },
    Api, Client, CustomResourceExt, Resource,
};
use serde::de::DeserializeOwned;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    ::catalog_core::tracer::init_once();

    let signal = StopSignal::default();
    signal.trap_on_sigint()?;

    let config = ControllerConfig::try_infer()?;
    info!("Loaded configuration: {config:?}");

    let kube = Client::try_default()
        .await
        .map_err(|error| anyhow!("failed to load kubernetes account: {error}"))?;

    install_crd(kube.clone(), ServiceBrokerCrd::crd()).await?;
    install_crd(kube.clone(), ServiceClassCrd::crd()).await?;
    install_crd(kube.clone(), ServiceInstanceCrd::crd()).await?;
    install_crd(kube.clone(), ServiceBindingCrd::crd()).await?;

    let brokers = watch(Api::all(kube.clone()));
    let classes = watch(Api::all(kube.clone()));
    let instances = watch(Api::all(kube.clone()));
    let bindings = watch(Api::all(kube.clone()));

    let ctx = Context {
        brokers: ResourceStore::new(
            Arc::new(KubeLister::new(brokers.reader())),
            Arc::new(KubeResourceClient::cluster(kube.clone())),
        ),
        classes: ResourceStore::new(
            Arc::new(KubeLister::new(classes.reader())),
            Arc::new(KubeResourceClient::cluster(kube.clone())),
        ),
        instances: ResourceStore::new(
            Arc::new(KubeLister::new(instances.reader())),
            Arc::new(KubeResourceClient::namespaced(kube.clone())),
        ),
        bindings: ResourceStore::new(
            Arc::new(KubeLister::new(bindings.reader())),
            Arc::new(KubeResourceClient::namespaced(kube.clone())),
        ),
        secrets: Arc::new(KubeSecretStore::new(kube.clone())),
        namespaces: Arc::new(KubeNamespaces::new(kube.clone())),
        recorder: Arc::new(KubeRecorder::new(kube)),
        broker_clients: Arc::new(HttpBrokerClientFactory),
        clock: Arc::new(SystemClock),
        config,
    };

    let watches = Watches {
        brokers,
        classes,
        instances,
        bindings,
    };
    Controller::new(Arc::new(ctx)).run(watches, signal).await;
    Ok(())
}

/// Mirrors every object of a kind into a cache shared with the reconcilers.
fn watch<K>(api: Api<K>) -> Watch<K>
where
    K: 'static + Clone + fmt::Debug + DeserializeOwned + Resource<DynamicType = ()> + Send + Sync,
{
    let (_, writer) = reflector::store();
    Watch::new(
        writer,
        watcher(api, watcher::Config::default()).default_backoff(),
    )
}
