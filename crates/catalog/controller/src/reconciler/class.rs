use std::sync::Arc;

use async_trait::async_trait;
use catalog_api::class::ServiceClassCrd;
use kube::{runtime::controller::Action, ResourceExt};
use tracing::{debug, info, instrument, Level};

use super::{Context, Error, Reconciler};

/// Garbage-collects classes their broker no longer offers.
pub struct ClassReconciler {
    ctx: Arc<Context>,
}

impl ClassReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for ClassReconciler {
    type Data = ServiceClassCrd;

    const KIND: &'static str = "ServiceClass";

    #[instrument(level = Level::INFO, skip_all, fields(name = %data.name_any()), err(Display))]
    async fn reconcile(&self, data: Arc<Self::Data>) -> Result<Action, Error> {
        let name = data.name_any();

        let removed = data
            .status
            .as_ref()
            .is_some_and(|status| status.removed_from_broker_catalog);
        if !removed || data.metadata.deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        let in_use = self
            .ctx
            .instances
            .lister
            .list()
            .iter()
            .any(|instance| instance.spec.service_class_name == name);
        if in_use {
            debug!("Keeping removed service class {name}: still referenced by instances");
            return Ok(Action::await_change());
        }

        info!("Deleting service class {name}: removed from its broker catalog");
        match self.ctx.classes.client.delete(None, &name).await {
            Ok(()) => Ok(Action::await_change()),
            Err(error) if error.is_not_found() => Ok(Action::await_change()),
            Err(error) => Err(error.into()),
        }
    }
}
