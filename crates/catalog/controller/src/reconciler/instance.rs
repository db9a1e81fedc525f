use std::sync::Arc;

use async_trait::async_trait;
use catalog_api::{
    condition::{ConditionStatus, ConditionType, Conditions},
    consts::FINALIZER_NAME,
    finalizer::FinalizerQueue,
    instance::{ServiceInstanceCrd, ServiceInstanceOperation, ServiceInstanceStatus},
    properties::PropertiesState,
};
use catalog_broker::models::{DeprovisionRequest, ProvisionRequest};
use kube::{
    runtime::{controller::Action, events::EventType},
    ResourceExt,
};
use serde_json::Value;
use tracing::{debug, info, instrument, warn, Level};

use crate::{
    gate::{parameters_checksum, should_reconcile_checksum, spec_checksum, RetryWindow},
    parameters::{build_parameters, BuiltParameters},
};

use super::{reasons, Context, Error, Reconciler};

/// Provisions and deprovisions service instances.
pub struct InstanceReconciler {
    ctx: Arc<Context>,
}

impl InstanceReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for InstanceReconciler {
    type Data = ServiceInstanceCrd;

    const KIND: &'static str = "ServiceInstance";

    #[instrument(
        level = Level::INFO,
        skip_all,
        fields(name = %data.name_any(), namespace = data.namespace()),
        err(Display),
    )]
    async fn reconcile(&self, data: Arc<Self::Data>) -> Result<Action, Error> {
        if data.metadata.deletion_timestamp.is_some() {
            return self.deprovision(&data).await;
        }

        let data = self
            .ctx
            .ensure_finalizer(&self.ctx.instances, data)
            .await?;
        let data = self
            .ctx
            .ensure_external_id(&self.ctx.instances, data, |instance| {
                &mut instance.spec.external_id
            })
            .await?;

        let checksum = spec_checksum(&data.spec);
        let reconciled = data
            .status
            .as_ref()
            .and_then(|status| status.reconciled_checksum.as_deref());
        if !should_reconcile_checksum(false, &checksum, reconciled) {
            let name = data.name_any();
            debug!("Not processing instance {name}: spec checksum shows there is no work to do");
            return Ok(Action::await_change());
        }

        self.provision(&data, checksum).await
    }
}

impl InstanceReconciler {
    async fn provision(&self, data: &ServiceInstanceCrd, checksum: String) -> Result<Action, Error> {
        let name = data.name_any();
        let namespace = data.namespace().unwrap_or_default();
        let spec = &data.spec;
        let mut status = data.status.clone().unwrap_or_default();
        info!("Provisioning instance {namespace}/{name}");

        let target = match self
            .ctx
            .resolve_target(&spec.service_class_name, &spec.plan_name)
        {
            Ok(target) => target,
            Err(unresolved) => {
                self.report(data, status, unresolved.reason, unresolved.message.clone())
                    .await?;
                return Err(Error::Dependency(unresolved.message));
            }
        };
        let class_name = target.class_name();
        let broker_name = target.broker_name();

        if target
            .class
            .status
            .as_ref()
            .is_some_and(|status| status.removed_from_broker_catalog)
        {
            let message = format!(
                "References a ServiceClass {class_name:?} that was removed from the catalog of broker {broker_name:?}"
            );
            status.reconciled_checksum = Some(checksum);
            self.report(data, status, reasons::REFERENCES_DELETED_SERVICE_CLASS, message)
                .await?;
            return Ok(Action::await_change());
        }

        let client = match self.ctx.broker_client(&target.broker).await {
            Ok(client) => client,
            Err(error) => {
                let message = format!(
                    "Error getting broker auth credentials for broker {broker_name:?}: {error}"
                );
                self.report(data, status, reasons::ERROR_GETTING_AUTH_CREDENTIALS, message)
                    .await?;
                return Err(error);
            }
        };

        let parameters = match build_parameters(
            self.ctx.secrets.as_ref(),
            &namespace,
            &spec.parameters_from,
            spec.parameters.as_ref(),
        )
        .await
        {
            Ok(parameters) => parameters,
            Err(error) => {
                let message = format!("Failed to prepare ServiceInstance parameters: {error}");
                if error.is_terminal() {
                    status.reconciled_checksum = Some(checksum);
                    self.report(data, status, reasons::ERROR_WITH_PARAMETERS, message)
                        .await?;
                    return Ok(Action::await_change());
                }
                self.report(data, status, reasons::ERROR_WITH_PARAMETERS, message)
                    .await?;
                return Err(error.into());
            }
        };

        let namespace_info = match self.ctx.namespaces.get(&namespace).await {
            Ok(info) => info,
            Err(error) => {
                let message = format!("Failed to get namespace {namespace:?}: {error}");
                self.report(data, status, reasons::ERROR_FINDING_NAMESPACE_FOR_INSTANCE, message)
                    .await?;
                return Err(error.into());
            }
        };

        let originating_identity = match self.ctx.originating_identity(spec.user_info.as_ref()) {
            Ok(identity) => identity,
            Err(error) => {
                let message = format!("Error building originating identity headers: {error}");
                status.reconciled_checksum = Some(checksum);
                self.report(data, status, reasons::ERROR_WITH_ORIGINATING_IDENTITY, message)
                    .await?;
                return Ok(Action::await_change());
            }
        };

        let now = self.ctx.clock.now();
        let mut data = data.clone();
        if status.current_operation.is_none() {
            status.current_operation = Some(ServiceInstanceOperation::Provision);
            status.operation_start_time = Some(now);
            status.async_op_in_progress = true;
            status.in_progress_properties = Some(properties_state(&parameters, spec.user_info.clone()));
            status.set_condition(
                ConditionType::Ready,
                ConditionStatus::False,
                reasons::PROVISIONING,
                "The instance is being provisioned.",
                now,
            );
            data = self
                .ctx
                .update_status(&self.ctx.instances, &data, status.clone())
                .await?;
        }

        let request = ProvisionRequest {
            service_id: target.class.spec.external_id.clone(),
            plan_id: target.plan.external_id.clone(),
            organization_guid: namespace_info.uid.clone(),
            space_guid: namespace_info.uid,
            parameters: parameters.merged,
            context: self.ctx.request_context(&namespace),
            accepts_incomplete: true,
            originating_identity,
        };

        match client
            .create_service_instance(&data.spec.external_id, &request)
            .await
        {
            Ok(_) => {
                status.external_properties = status.in_progress_properties.take();
                clear_current_operation(&mut status);
                status.reconciled_generation = data.metadata.generation;
                status.reconciled_checksum = Some(checksum);
                status.remove_condition(ConditionType::Failed);
                status.set_condition(
                    ConditionType::Ready,
                    ConditionStatus::True,
                    reasons::PROVISIONED_SUCCESSFULLY,
                    "The instance was provisioned successfully.",
                    now,
                );
                let data = self
                    .ctx
                    .update_status(&self.ctx.instances, &data, status)
                    .await?;
                self.ctx
                    .record(
                        &data,
                        EventType::Normal,
                        reasons::PROVISIONED_SUCCESSFULLY,
                        "The instance was provisioned successfully.".into(),
                    )
                    .await;

                info!("Successfully provisioned instance {namespace}/{name} of class {class_name} at broker {broker_name}");
                Ok(Action::await_change())
            }
            Err(error) => {
                let message = format!(
                    "Error provisioning ServiceInstance {namespace}/{name} of ServiceClass {class_name:?} at ServiceBroker {broker_name:?}: {error}"
                );
                status.set_condition(
                    ConditionType::Ready,
                    ConditionStatus::False,
                    reasons::PROVISION_CALL_FAILED,
                    message.clone(),
                    now,
                );

                let rejected = error
                    .status_code()
                    .is_some_and(|code| (400..500).contains(&code) && code != 408);
                let exhausted = status.operation_start_time.is_some_and(|started| {
                    RetryWindow::new(self.ctx.config.reconciliation_retry_duration)
                        .is_exhausted(started, now)
                });

                if rejected || exhausted {
                    let (reason, failure) = if rejected {
                        (reasons::PROVISION_CALL_FAILED, message.clone())
                    } else {
                        (
                            reasons::ERROR_RECONCILIATION_RETRY_TIMEOUT,
                            "Stopping reconciliation retries, too much time has elapsed".into(),
                        )
                    };
                    status.set_condition(
                        ConditionType::Failed,
                        ConditionStatus::True,
                        reason,
                        failure,
                        now,
                    );
                    clear_current_operation(&mut status);
                    status.reconciled_checksum = Some(checksum);
                }

                warn!("{message}");
                let data = self
                    .ctx
                    .update_status(&self.ctx.instances, &data, status)
                    .await?;
                self.ctx
                    .record(&data, EventType::Warning, reasons::PROVISION_CALL_FAILED, message)
                    .await;

                if rejected || exhausted {
                    Ok(Action::await_change())
                } else {
                    Err(error.into())
                }
            }
        }
    }

    async fn deprovision(&self, data: &ServiceInstanceCrd) -> Result<Action, Error> {
        let name = data.name_any();
        let namespace = data.namespace().unwrap_or_default();

        if FinalizerQueue::new(data.finalizers())
            .claim_head(FINALIZER_NAME)
            .is_none()
        {
            debug!("Not deprovisioning instance {namespace}/{name}: finalizer is not at the head");
            return Ok(Action::await_change());
        }

        // Nothing was ever sent to a broker.
        let Some(mut status) = data.status.clone() else {
            self.ctx
                .release_finalizer(&self.ctx.instances, data)
                .await?;
            return Ok(Action::await_change());
        };
        info!("Deprovisioning instance {namespace}/{name}");

        let target = match self
            .ctx
            .resolve_target(&data.spec.service_class_name, &data.spec.plan_name)
        {
            Ok(target) => target,
            Err(unresolved) => {
                self.report(data, status, unresolved.reason, unresolved.message.clone())
                    .await?;
                return Err(Error::Dependency(unresolved.message));
            }
        };
        let class_name = target.class_name();
        let broker_name = target.broker_name();

        let client = match self.ctx.broker_client(&target.broker).await {
            Ok(client) => client,
            Err(error) => {
                let message = format!(
                    "Error getting broker auth credentials for broker {broker_name:?}: {error}"
                );
                self.report(data, status, reasons::ERROR_GETTING_AUTH_CREDENTIALS, message)
                    .await?;
                return Err(error);
            }
        };

        let originating_identity = match self.ctx.originating_identity(data.spec.user_info.as_ref()) {
            Ok(identity) => identity,
            Err(error) => {
                let message = format!("Error building originating identity headers: {error}");
                self.report(data, status, reasons::ERROR_WITH_ORIGINATING_IDENTITY, message.clone())
                    .await?;
                return Err(Error::Dependency(message));
            }
        };

        let now = self.ctx.clock.now();
        let mut data = data.clone();
        if status.current_operation != Some(ServiceInstanceOperation::Deprovision) {
            status.current_operation = Some(ServiceInstanceOperation::Deprovision);
            status.operation_start_time = Some(now);
            status.set_condition(
                ConditionType::Ready,
                ConditionStatus::False,
                reasons::DEPROVISIONING,
                "The instance is being deprovisioned.",
                now,
            );
            data = self
                .ctx
                .update_status(&self.ctx.instances, &data, status.clone())
                .await?;
        }

        let request = DeprovisionRequest {
            service_id: target.class.spec.external_id.clone(),
            plan_id: target.plan.external_id.clone(),
            accepts_incomplete: true,
            originating_identity,
        };

        match client
            .delete_service_instance(&data.spec.external_id, &request)
            .await
        {
            Ok(()) => {
                clear_current_operation(&mut status);
                status.external_properties = None;
                status.set_condition(
                    ConditionType::Ready,
                    ConditionStatus::False,
                    reasons::DEPROVISIONED_SUCCESSFULLY,
                    "The instance was deprovisioned successfully.",
                    now,
                );
                let data = self
                    .ctx
                    .update_status(&self.ctx.instances, &data, status)
                    .await?;
                self.ctx
                    .record(
                        &data,
                        EventType::Normal,
                        reasons::DEPROVISIONED_SUCCESSFULLY,
                        "The instance was deprovisioned successfully.".into(),
                    )
                    .await;

                self.ctx
                    .release_finalizer(&self.ctx.instances, &data)
                    .await?;
                info!("Successfully deprovisioned instance {namespace}/{name} of class {class_name} at broker {broker_name}");
                Ok(Action::await_change())
            }
            Err(error) => {
                let message = format!(
                    "Error deprovisioning ServiceInstance {namespace}/{name} of ServiceClass {class_name:?} at ServiceBroker {broker_name:?}: {error}"
                );
                status.set_condition(
                    ConditionType::Ready,
                    ConditionStatus::Unknown,
                    reasons::DEPROVISION_CALL_FAILED,
                    message.clone(),
                    now,
                );

                warn!("{message}");
                let data = self
                    .ctx
                    .update_status(&self.ctx.instances, &data, status)
                    .await?;
                self.ctx
                    .record(&data, EventType::Warning, reasons::DEPROVISION_CALL_FAILED, message)
                    .await;
                Err(error.into())
            }
        }
    }

    /// Records a failed step: Ready=False with `reason`, plus a warning event.
    async fn report(
        &self,
        data: &ServiceInstanceCrd,
        mut status: ServiceInstanceStatus,
        reason: &str,
        message: String,
    ) -> Result<ServiceInstanceCrd, Error> {
        warn!("{message}");
        self.ctx
            .record(data, EventType::Warning, reason, message.clone())
            .await;

        status.set_condition(
            ConditionType::Ready,
            ConditionStatus::False,
            reason,
            message,
            self.ctx.clock.now(),
        );
        self.ctx
            .update_status(&self.ctx.instances, data, status)
            .await
    }
}

fn clear_current_operation(status: &mut ServiceInstanceStatus) {
    status.current_operation = None;
    status.operation_start_time = None;
    status.in_progress_properties = None;
    status.async_op_in_progress = false;
}

/// What gets persisted about a request: secret-sourced values stay masked.
pub(super) fn properties_state(
    parameters: &BuiltParameters,
    user_info: Option<catalog_api::properties::UserInfo>,
) -> PropertiesState {
    let has_parameters = !parameters.merged.is_empty();
    PropertiesState {
        parameters: has_parameters.then(|| Value::Object(parameters.redacted.clone())),
        parameters_checksum: has_parameters.then(|| parameters_checksum(&parameters.merged)),
        user_info,
    }
}
