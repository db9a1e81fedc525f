use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use catalog_api::{
    broker::{ServiceBrokerCrd, ServiceBrokerStatus},
    class::{DashboardClient, ServiceClassCrd, ServiceClassSpec, ServiceClassStatus, ServicePlan},
    condition::{ConditionStatus, ConditionType, Conditions},
    consts::FINALIZER_NAME,
    finalizer::FinalizerQueue,
};
use catalog_broker::models::Catalog;
use kube::{
    runtime::{controller::Action, events::EventType},
    ResourceExt,
};
use tracing::{debug, info, instrument, warn, Level};

use crate::gate::{deadline, should_reconcile_broker};

use super::{reasons, Context, Error, Reconciler};

/// Mirrors each broker's catalog into service classes.
pub struct BrokerReconciler {
    ctx: Arc<Context>,
}

impl BrokerReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    fn relist_interval(&self, broker: &ServiceBrokerCrd) -> Duration {
        broker
            .spec
            .relist_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(self.ctx.config.broker_relist_interval)
    }
}

#[async_trait]
impl Reconciler for BrokerReconciler {
    type Data = ServiceBrokerCrd;

    const KIND: &'static str = "ServiceBroker";

    #[instrument(level = Level::INFO, skip_all, fields(name = %data.name_any()), err(Display))]
    async fn reconcile(&self, data: Arc<Self::Data>) -> Result<Action, Error> {
        let name = data.name_any();
        let now = self.ctx.clock.now();
        let interval = self.relist_interval(&data);

        if !should_reconcile_broker(&data, now, interval) {
            debug!("Not processing broker {name}: relist interval has not elapsed");
            let remaining = data
                .status
                .as_ref()
                .and_then(|status| status.last_catalog_retrieval_time)
                .and_then(|last| deadline(last, interval))
                .and_then(|next| (next - now).to_std().ok())
                .unwrap_or(interval);
            return Ok(Action::requeue(remaining));
        }

        if data.metadata.deletion_timestamp.is_some() {
            return self.finalize(&data).await;
        }

        let data = self.ctx.ensure_finalizer(&self.ctx.brokers, data).await?;
        info!("Processing broker {name}");

        let client = match self.ctx.broker_client(&data).await {
            Ok(client) => client,
            Err(error) => {
                // Surfaces as a catalog failure: the broker was never reached.
                let message =
                    format!("Error getting broker auth credentials for broker {name:?}: {error}");
                self.fail(data.as_ref(), reasons::ERROR_FETCHING_CATALOG, message)
                    .await?;
                return Err(error);
            }
        };

        let catalog = match client.get_catalog().await {
            Ok(catalog) => catalog,
            Err(error) => {
                let message = format!("Error getting broker catalog for broker {name:?}: {error}");
                self.fail(data.as_ref(), reasons::ERROR_FETCHING_CATALOG, message)
                    .await?;
                return Ok(Action::requeue(interval));
            }
        };
        debug!("Successfully fetched {} catalog entries for broker {name}", catalog.services.len());

        let classes = match convert_catalog(&name, &catalog) {
            Ok(classes) => classes,
            Err(error) => {
                let message =
                    format!("Error converting catalog payload for broker {name:?}: {error}");
                self.fail(data.as_ref(), reasons::ERROR_SYNCING_CATALOG, message)
                    .await?;
                return Ok(Action::requeue(interval));
            }
        };

        if let Err(error) = self.sync_classes(&name, classes).await {
            let message = format!("Error syncing catalog from broker {name:?}: {error}");
            self.fail(data.as_ref(), reasons::ERROR_SYNCING_CATALOG, message)
                .await?;
            return Err(error);
        }

        let mut status = data.status.clone().unwrap_or_default();
        status.set_condition(
            ConditionType::Ready,
            ConditionStatus::True,
            reasons::FETCHED_CATALOG,
            "Successfully fetched catalog entries from broker.",
            now,
        );
        status.last_catalog_retrieval_time = Some(now);
        status.reconciled_generation = data.metadata.generation;
        self.ctx
            .update_status(&self.ctx.brokers, data.as_ref(), status)
            .await?;
        self.ctx
            .record(
                data.as_ref(),
                EventType::Normal,
                reasons::FETCHED_CATALOG,
                "Successfully fetched catalog entries from broker.".into(),
            )
            .await;

        info!("Successfully synced catalog of broker {name}");
        Ok(Action::requeue(interval))
    }
}

impl BrokerReconciler {
    /// Creates or refreshes every advertised class, then flags the classes
    /// the broker stopped advertising.
    async fn sync_classes(
        &self,
        broker_name: &str,
        classes: BTreeMap<String, ServiceClassSpec>,
    ) -> Result<(), Error> {
        let store = &self.ctx.classes;

        for (name, spec) in &classes {
            match store.lister.get(None, name) {
                None => {
                    debug!("Creating service class {name} of broker {broker_name}");
                    store
                        .client
                        .create(&ServiceClassCrd::new(name, spec.clone()))
                        .await?;
                }
                Some(existing) => {
                    if existing.spec.broker_name != broker_name {
                        return Err(Error::Dependency(format!(
                            "service class {name:?} is already provided by broker {:?}",
                            existing.spec.broker_name,
                        )));
                    }
                    if existing.spec.external_id != spec.external_id {
                        return Err(Error::Dependency(format!(
                            "service class {name:?} changed its external id from {:?} to {:?}",
                            existing.spec.external_id, spec.external_id,
                        )));
                    }

                    let mut existing = (*existing).clone();
                    if existing.spec != *spec {
                        debug!("Updating service class {name} of broker {broker_name}");
                        existing.spec = spec.clone();
                        existing = store.client.update(&existing).await?;
                    }
                    if existing.status.as_ref().is_some_and(|status| status.removed_from_broker_catalog) {
                        self.ctx
                            .update_status(store, &existing, ServiceClassStatus::default())
                            .await?;
                    }
                }
            }
        }

        for class in store.lister.list() {
            let name = class.name_any();
            let removed = class
                .status
                .as_ref()
                .is_some_and(|status| status.removed_from_broker_catalog);
            if class.spec.broker_name != broker_name || removed || classes.contains_key(&name) {
                continue;
            }

            info!("Service class {name} was removed from the catalog of broker {broker_name}");
            let status = ServiceClassStatus {
                removed_from_broker_catalog: true,
            };
            self.ctx.update_status(store, class.as_ref(), status).await?;
        }
        Ok(())
    }

    /// Deletes the broker's classes, then releases the broker.
    async fn finalize(&self, data: &ServiceBrokerCrd) -> Result<Action, Error> {
        let name = data.name_any();
        if FinalizerQueue::new(data.finalizers())
            .claim_head(FINALIZER_NAME)
            .is_none()
        {
            debug!("Not finalizing broker {name}: finalizer is not at the head");
            return Ok(Action::await_change());
        }
        info!("Removing broker {name}");

        let owned: Vec<_> = self
            .ctx
            .classes
            .lister
            .list()
            .into_iter()
            .filter(|class| class.spec.broker_name == name)
            .collect();
        for class in owned {
            let class_name = class.name_any();
            match self.ctx.classes.client.delete(None, &class_name).await {
                Ok(()) => debug!("Deleted service class {class_name} of broker {name}"),
                Err(error) if error.is_not_found() => (),
                Err(error) => {
                    let message = format!("Error deleting service class {class_name:?} of broker {name:?}: {error}");
                    self.fail(data, reasons::ERROR_DELETING_SERVICE_CLASS, message)
                        .await?;
                    return Err(error.into());
                }
            }
        }

        let mut status = data.status.clone().unwrap_or_default();
        status.set_condition(
            ConditionType::Ready,
            ConditionStatus::False,
            reasons::DELETED_SUCCESSFULLY,
            "The broker was deleted successfully.",
            self.ctx.clock.now(),
        );
        let data = self
            .ctx
            .update_status(&self.ctx.brokers, data, status)
            .await?;
        self.ctx
            .record(
                &data,
                EventType::Normal,
                reasons::DELETED_SUCCESSFULLY,
                "The broker was deleted successfully.".into(),
            )
            .await;

        self.ctx
            .release_finalizer(&self.ctx.brokers, &data)
            .await?;
        Ok(Action::await_change())
    }

    async fn fail(&self, data: &ServiceBrokerCrd, reason: &str, message: String) -> Result<(), Error> {
        warn!("{message}");
        self.ctx
            .record(data, EventType::Warning, reason, message.clone())
            .await;

        let mut status: ServiceBrokerStatus = data.status.clone().unwrap_or_default();
        status.set_condition(
            ConditionType::Ready,
            ConditionStatus::False,
            reason,
            message,
            self.ctx.clock.now(),
        );
        self.ctx
            .update_status(&self.ctx.brokers, data, status)
            .await
            .map(|_| ())
    }
}

/// Converts a broker catalog into class specs keyed by class name.
pub fn convert_catalog(
    broker_name: &str,
    catalog: &Catalog,
) -> Result<BTreeMap<String, ServiceClassSpec>, String> {
    let mut classes = BTreeMap::default();
    for service in &catalog.services {
        if service.name.is_empty() || service.id.is_empty() {
            return Err("a service must have both a name and an id".into());
        }

        let plans = service
            .plans
            .iter()
            .map(|plan| {
                if plan.name.is_empty() || plan.id.is_empty() {
                    return Err(format!(
                        "a plan of service {:?} must have both a name and an id",
                        service.name,
                    ));
                }
                Ok(ServicePlan {
                    name: plan.name.clone(),
                    external_id: plan.id.clone(),
                    description: plan.description.clone(),
                    free: plan.free.unwrap_or(true),
                    bindable: plan.bindable,
                    external_metadata: plan.metadata.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let spec = ServiceClassSpec {
            broker_name: broker_name.into(),
            external_id: service.id.clone(),
            description: service.description.clone(),
            bindable: service.bindable,
            plan_updatable: service.plan_updateable,
            plans,
            tags: service.tags.clone(),
            requires: service.requires.clone(),
            external_metadata: service.metadata.clone(),
            dashboard_client: service.dashboard_client.as_ref().map(|client| DashboardClient {
                id: client.id.clone(),
                secret: client.secret.clone(),
                redirect_uri: client.redirect_uri.clone(),
            }),
        };
        if classes.insert(service.name.clone(), spec).is_some() {
            return Err(format!("service {:?} is advertised more than once", service.name));
        }
    }
    Ok(classes)
}

#[cfg(test)]
mod tests {
    use catalog_broker::models::{Plan, Service};

    use super::*;

    fn service(name: &str, plans: &[&str]) -> Service {
        Service {
            id: format!("{name}-id"),
            name: name.into(),
            description: String::default(),
            bindable: true,
            plan_updateable: false,
            plans: plans
                .iter()
                .map(|plan| Plan {
                    id: format!("{plan}-id"),
                    name: plan.to_string(),
                    description: String::default(),
                    free: None,
                    bindable: None,
                    metadata: None,
                })
                .collect(),
            tags: Vec::default(),
            requires: Vec::default(),
            metadata: None,
            dashboard_client: None,
        }
    }

    #[test]
    fn catalogs_convert_to_classes_by_name() {
        let catalog = Catalog {
            services: vec![service("mysql", &["small", "large"]), service("redis", &[])],
        };

        let classes = convert_catalog("b1", &catalog).unwrap();
        assert_eq!(classes.len(), 2);

        let mysql = &classes["mysql"];
        assert_eq!(mysql.broker_name, "b1");
        assert_eq!(mysql.external_id, "mysql-id");
        assert_eq!(mysql.find_plan("large").unwrap().external_id, "large-id");
        assert!(mysql.find_plan("small").unwrap().free);
    }

    #[test]
    fn malformed_catalogs_are_rejected() {
        let duplicated = Catalog {
            services: vec![service("mysql", &[]), service("mysql", &[])],
        };
        assert!(convert_catalog("b1", &duplicated).is_err());

        let mut unnamed = service("mysql", &["small"]);
        unnamed.plans[0].id = String::default();
        let catalog = Catalog {
            services: vec![unnamed],
        };
        assert!(convert_catalog("b1", &catalog).is_err());
    }
}
