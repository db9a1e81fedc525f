use std::sync::Arc;

use async_trait::async_trait;
use catalog_api::{
    binding::{ServiceBindingCrd, ServiceBindingOperation, ServiceBindingStatus, UnbindStatus},
    condition::{ConditionStatus, ConditionType, Conditions},
    consts::FINALIZER_NAME,
    finalizer::FinalizerQueue,
    instance::ServiceInstanceCrd,
};
use catalog_broker::{
    models::{BindRequest, UnbindRequest},
    BrokerClient,
};
use kube::{
    runtime::{controller::Action, events::EventType},
    Resource, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info, instrument, warn, Level};

use crate::{
    gate::{should_reconcile_generation, RetryWindow},
    parameters::build_parameters,
};

use super::{instance::properties_state, reasons, Context, Error, Reconciler, ServiceTarget};

/// Binds and unbinds, injecting credentials into the binding's secret.
pub struct BindingReconciler {
    ctx: Arc<Context>,
}

/// Everything a binding resolves to before a broker call.
struct Resolved {
    instance: Arc<ServiceInstanceCrd>,
    target: ServiceTarget,
    client: Arc<dyn BrokerClient>,
}

impl Resolved {
    fn describe(&self) -> String {
        let instance_namespace = self.instance.namespace().unwrap_or_default();
        let instance_name = self.instance.name_any();
        let class_name = self.target.class_name();
        let broker_name = self.target.broker_name();
        format!(
            "ServiceInstance {instance_namespace}/{instance_name} of ServiceClass {class_name:?} at ServiceBroker {broker_name:?}"
        )
    }
}

impl BindingReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for BindingReconciler {
    type Data = ServiceBindingCrd;

    const KIND: &'static str = "ServiceBinding";

    #[instrument(
        level = Level::INFO,
        skip_all,
        fields(name = %data.name_any(), namespace = data.namespace()),
        err(Display),
    )]
    async fn reconcile(&self, data: Arc<Self::Data>) -> Result<Action, Error> {
        let name = data.name_any();
        let namespace = data.namespace().unwrap_or_default();

        let deleting = data.metadata.deletion_timestamp.is_some();
        let status = data.status.clone().unwrap_or_default();
        let mitigating = status.orphan_mitigation_in_progress;

        if status.is_condition_true(ConditionType::Failed) && !deleting && !mitigating {
            debug!("Not processing binding {namespace}/{name}: status shows that it has failed");
            return Ok(Action::await_change());
        }
        if !should_reconcile_generation(
            deleting,
            data.metadata.generation,
            status.reconciled_generation,
        ) {
            debug!("Not processing binding {namespace}/{name}: reconciled generation shows there is no work to do");
            return Ok(Action::await_change());
        }

        let data = if deleting {
            if FinalizerQueue::new(data.finalizers())
                .claim_head(FINALIZER_NAME)
                .is_none()
            {
                debug!("Not unbinding {namespace}/{name}: finalizer is not at the head");
                return Ok(Action::await_change());
            }
            data
        } else {
            let data = self
                .ctx
                .ensure_finalizer(&self.ctx.bindings, data)
                .await?;
            self.ctx
                .ensure_external_id(&self.ctx.bindings, data, |binding| {
                    &mut binding.spec.external_id
                })
                .await?
        };
        info!("Processing binding {namespace}/{name}");

        let Some(resolved) = self.resolve(&data, status.clone()).await? else {
            return Ok(Action::await_change());
        };

        if deleting || mitigating {
            self.unbind(&data, status, &resolved).await
        } else {
            self.bind(&data, status, &resolved).await
        }
    }
}

impl BindingReconciler {
    /// Looks up the instance, class, plan and broker behind a binding.
    ///
    /// Returns `None` when the binding can never be served as-is.
    async fn resolve(
        &self,
        data: &ServiceBindingCrd,
        status: ServiceBindingStatus,
    ) -> Result<Option<Resolved>, Error> {
        let name = data.name_any();
        let namespace = data.namespace().unwrap_or_default();
        let instance_name = &data.spec.instance_ref.name;

        let Some(instance) = self
            .ctx
            .instances
            .lister
            .get(Some(&namespace), instance_name)
        else {
            let message = format!(
                "The binding references a ServiceInstance that does not exist: {namespace}/{instance_name}"
            );
            self.report(
                data,
                status,
                ConditionStatus::False,
                reasons::REFERENCES_NONEXISTENT_INSTANCE,
                message.clone(),
            )
            .await?;
            return Err(Error::Dependency(message));
        };

        if instance
            .status
            .as_ref()
            .is_some_and(|status| status.async_op_in_progress)
        {
            let message = format!(
                "Trying to bind to ServiceInstance {namespace}/{instance_name} that has ongoing asynchronous operation"
            );
            self.report(
                data,
                status,
                ConditionStatus::False,
                reasons::ERROR_ASYNC_OPERATION_IN_PROGRESS,
                message.clone(),
            )
            .await?;
            return Err(Error::Dependency(message));
        }

        let target = match self
            .ctx
            .resolve_target(&instance.spec.service_class_name, &instance.spec.plan_name)
        {
            Ok(target) => target,
            Err(unresolved) => {
                self.report(
                    data,
                    status,
                    ConditionStatus::False,
                    unresolved.reason,
                    unresolved.message.clone(),
                )
                .await?;
                return Err(Error::Dependency(unresolved.message));
            }
        };

        let client = match self.ctx.broker_client(&target.broker).await {
            Ok(client) => client,
            Err(error) => {
                let broker_name = target.broker_name();
                let message = format!(
                    "Error getting broker auth credentials for broker {broker_name:?}: {error}"
                );
                self.report(
                    data,
                    status,
                    ConditionStatus::False,
                    reasons::ERROR_GETTING_AUTH_CREDENTIALS,
                    message,
                )
                .await?;
                return Err(error);
            }
        };

        if !target.plan.is_bindable(&target.class.spec) {
            let class_name = target.class_name();
            let plan_name = &target.plan.name;
            let message = format!(
                "Binding {namespace}/{name} references a non-bindable ServiceClass {class_name:?} and plan {plan_name:?} combination"
            );
            self.report(
                data,
                status,
                ConditionStatus::False,
                reasons::ERROR_NONBINDABLE_SERVICE_CLASS,
                message,
            )
            .await?;
            return Ok(None);
        }

        Ok(Some(Resolved {
            instance,
            target,
            client,
        }))
    }

    async fn bind(
        &self,
        data: &ServiceBindingCrd,
        mut status: ServiceBindingStatus,
        resolved: &Resolved,
    ) -> Result<Action, Error> {
        let name = data.name_any();
        let namespace = data.namespace().unwrap_or_default();
        let spec = &data.spec;

        let namespace_info = match self.ctx.namespaces.get(&namespace).await {
            Ok(info) => info,
            Err(error) => {
                let message = format!("Failed to get namespace {namespace:?} during binding: {error}");
                self.report(
                    data,
                    status,
                    ConditionStatus::False,
                    reasons::ERROR_FINDING_NAMESPACE_FOR_INSTANCE,
                    message,
                )
                .await?;
                return Err(error.into());
            }
        };

        let instance_ready = resolved
            .instance
            .status
            .as_ref()
            .is_some_and(|status| status.is_condition_true(ConditionType::Ready));
        if !instance_ready {
            let instance_name = resolved.instance.name_any();
            let message = format!(
                "Binding cannot begin because referenced ServiceInstance {namespace}/{instance_name} is not ready"
            );
            self.report(
                data,
                status,
                ConditionStatus::False,
                reasons::ERROR_INSTANCE_NOT_READY,
                message,
            )
            .await?;
            return Ok(Action::await_change());
        }

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
                let message = format!("Failed to prepare ServiceBinding parameters: {error}");
                let terminal = error.is_terminal();
                self.report(
                    data,
                    status,
                    ConditionStatus::False,
                    reasons::ERROR_WITH_PARAMETERS,
                    message,
                )
                .await?;
                return if terminal {
                    Ok(Action::await_change())
                } else {
                    Err(error.into())
                };
            }
        };

        let originating_identity = match self.ctx.originating_identity(spec.user_info.as_ref()) {
            Ok(identity) => identity,
            Err(error) => {
                let message =
                    format!("Error building originating identity headers for binding: {error}");
                self.report(
                    data,
                    status,
                    ConditionStatus::False,
                    reasons::ERROR_WITH_ORIGINATING_IDENTITY,
                    message.clone(),
                )
                .await?;
                return Err(Error::Dependency(message));
            }
        };

        let now = self.ctx.clock.now();
        status.in_progress_properties = Some(properties_state(&parameters, spec.user_info.clone()));

        let mut data = data.clone();
        if status.current_operation.is_none() {
            status.current_operation = Some(ServiceBindingOperation::Bind);
            status.operation_start_time = Some(now);
            status.unbind_status = UnbindStatus::Required;
            status.set_condition(
                ConditionType::Ready,
                ConditionStatus::False,
                reasons::BINDING,
                "The binding is being created asynchronously",
                now,
            );
            data = self
                .ctx
                .update_status(&self.ctx.bindings, &data, status.clone())
                .await?;
        }

        let target = &resolved.target;
        let request = BindRequest {
            instance_id: resolved.instance.spec.external_id.clone(),
            binding_id: data.spec.external_id.clone(),
            service_id: target.class.spec.external_id.clone(),
            plan_id: target.plan.external_id.clone(),
            app_guid: Some(namespace_info.uid.clone()),
            bind_resource: Some(json!({ "app_guid": namespace_info.uid })),
            parameters: parameters.merged,
            context: self.ctx.request_context(&namespace),
            originating_identity,
        };

        let response = match resolved.client.bind(&request).await {
            Ok(response) => response,
            Err(error) if error.is_ambiguous_bind_failure() => {
                let failure = if error.is_timeout() {
                    format!("Communication with the ServiceBroker timed out; Bind operation will not be retried: {error}")
                } else {
                    format!("ServiceBroker returned a failure; Bind operation will not be retried: {error}")
                };
                status.set_condition(
                    ConditionType::Failed,
                    ConditionStatus::True,
                    reasons::BIND_CALL_FAILED,
                    failure,
                    now,
                );
                return self
                    .start_orphan_mitigation(&data, status, resolved, error.to_string())
                    .await;
            }
            Err(error) => {
                let message = format!(
                    "Error creating ServiceBinding {namespace}/{name} for {}: {error}",
                    resolved.describe(),
                );
                warn!("{message}");
                self.ctx
                    .record(&data, EventType::Warning, reasons::BIND_CALL_FAILED, message.clone())
                    .await;
                status.set_condition(
                    ConditionType::Ready,
                    ConditionStatus::False,
                    reasons::BIND_CALL_FAILED,
                    format!("Bind call failed. {message}"),
                    now,
                );

                // The broker rejected the request: nothing was created.
                if error.status_code().is_some() {
                    status.set_condition(
                        ConditionType::Failed,
                        ConditionStatus::True,
                        reasons::SERVICE_BINDING_RETURNED_FAILURE,
                        message,
                        now,
                    );
                    status.unbind_status = UnbindStatus::NotRequired;
                    clear_current_operation(&mut status, data.metadata.generation);
                    self.ctx
                        .update_status(&self.ctx.bindings, &data, status)
                        .await?;
                    return Ok(Action::await_change());
                }

                if self.is_exhausted(&status) {
                    self.give_up(&data, &mut status).await;
                    clear_current_operation(&mut status, data.metadata.generation);
                    self.ctx
                        .update_status(&self.ctx.bindings, &data, status)
                        .await?;
                    return Ok(Action::await_change());
                }

                self.ctx
                    .update_status(&self.ctx.bindings, &data, status)
                    .await?;
                return Err(error.into());
            }
        };

        // The broker holds the binding now, whatever happens to the secret.
        status.external_properties = status.in_progress_properties.clone();

        if let Err(error) = self.inject(&data, &response.credentials).await {
            let message = format!("Error injecting bind result: {error}");
            warn!("{message}");
            if let Error::Inject(error) = &error {
                if !error.is_retryable() {
                    warn!("Binding {namespace}/{name} will keep failing until its secret is fixed");
                }
            }
            self.ctx
                .record(
                    &data,
                    EventType::Warning,
                    reasons::ERROR_INJECTING_BIND_RESULT,
                    message.clone(),
                )
                .await;
            status.set_condition(
                ConditionType::Ready,
                ConditionStatus::False,
                reasons::ERROR_INJECTING_BIND_RESULT,
                format!("Error injecting bind result. {message}"),
                now,
            );

            if self.is_exhausted(&status) {
                self.give_up(&data, &mut status).await;
                return self
                    .start_orphan_mitigation(&data, status, resolved, "too much time has elapsed".into())
                    .await;
            }

            self.ctx
                .update_status(&self.ctx.bindings, &data, status)
                .await?;
            return Err(error);
        }

        clear_current_operation(&mut status, data.metadata.generation);
        status.set_condition(
            ConditionType::Ready,
            ConditionStatus::True,
            reasons::INJECTED_BIND_RESULT,
            "Injected bind result",
            now,
        );
        let data = self
            .ctx
            .update_status(&self.ctx.bindings, &data, status)
            .await?;
        self.ctx
            .record(
                &data,
                EventType::Normal,
                reasons::INJECTED_BIND_RESULT,
                "Injected bind result".into(),
            )
            .await;

        info!("Successfully bound {namespace}/{name} to {}", resolved.describe());
        Ok(Action::await_change())
    }

    async fn unbind(
        &self,
        data: &ServiceBindingCrd,
        mut status: ServiceBindingStatus,
        resolved: &Resolved,
    ) -> Result<Action, Error> {
        let name = data.name_any();
        let namespace = data.namespace().unwrap_or_default();
        let mitigating = status.orphan_mitigation_in_progress;

        if let Err(error) = self
            .ctx
            .injector()
            .eject(&namespace, &data.spec.secret_name)
            .await
        {
            let message = format!("Error deleting secret: {error}");
            self.report(
                data,
                status,
                ConditionStatus::Unknown,
                reasons::ERROR_EJECTING_BINDING,
                format!("Error ejecting binding. {message}"),
            )
            .await?;
            return Err(error.into());
        }

        let originating_identity = match self.ctx.originating_identity(data.spec.user_info.as_ref())
        {
            Ok(identity) => identity,
            Err(error) => {
                let message =
                    format!("Error building originating identity headers while unbinding: {error}");
                self.report(
                    data,
                    status,
                    ConditionStatus::False,
                    reasons::ERROR_WITH_ORIGINATING_IDENTITY,
                    message.clone(),
                )
                .await?;
                return Err(Error::Dependency(message));
            }
        };

        let now = self.ctx.clock.now();
        let mut data = data.clone();
        if status.current_operation.is_none() {
            status.current_operation = Some(ServiceBindingOperation::Unbind);
            status.operation_start_time = Some(now);
            status.set_condition(
                ConditionType::Ready,
                ConditionStatus::False,
                reasons::UNBINDING,
                "The binding is being deleted asynchronously",
                now,
            );
            data = self
                .ctx
                .update_status(&self.ctx.bindings, &data, status.clone())
                .await?;
        } else if mitigating && status.operation_start_time.is_none() {
            status.operation_start_time = Some(now);
        }

        let target = &resolved.target;
        let request = UnbindRequest {
            instance_id: resolved.instance.spec.external_id.clone(),
            binding_id: data.spec.external_id.clone(),
            service_id: target.class.spec.external_id.clone(),
            plan_id: target.plan.external_id.clone(),
            originating_identity,
        };

        if let Err(error) = resolved.client.unbind(&request).await {
            let message = format!(
                "Error unbinding ServiceBinding {namespace}/{name} for {}: {error}",
                resolved.describe(),
            );
            warn!("{message}");
            self.ctx
                .record(&data, EventType::Warning, reasons::UNBIND_CALL_FAILED, message.clone())
                .await;
            status.set_condition(
                ConditionType::Ready,
                ConditionStatus::Unknown,
                reasons::UNBIND_CALL_FAILED,
                format!("Unbind call failed. {message}"),
                now,
            );

            if error.status_code().is_some() {
                if !mitigating {
                    status.set_condition(
                        ConditionType::Failed,
                        ConditionStatus::True,
                        reasons::UNBIND_CALL_FAILED,
                        format!("Unbind call failed. {message}"),
                        now,
                    );
                }
                status.unbind_status = UnbindStatus::Failed;
                clear_current_operation(&mut status, data.metadata.generation);
                self.ctx
                    .update_status(&self.ctx.bindings, &data, status)
                    .await?;
                return Ok(Action::await_change());
            }

            if self.is_exhausted(&status) {
                if mitigating {
                    // Left for an operator: the broker is not called again.
                    let message = format!(
                        "Binding {namespace}/{name}: stopping reconciliation retries, too much time has elapsed during orphan mitigation"
                    );
                    info!("{message}");
                    self.ctx
                        .record(
                            &data,
                            EventType::Warning,
                            reasons::ERROR_RECONCILIATION_RETRY_TIMEOUT,
                            message.clone(),
                        )
                        .await;
                    if !status.is_condition_true(ConditionType::Failed) {
                        status.set_condition(
                            ConditionType::Failed,
                            ConditionStatus::True,
                            reasons::ERROR_RECONCILIATION_RETRY_TIMEOUT,
                            message,
                            now,
                        );
                    }
                    status.unbind_status = UnbindStatus::Failed;
                    clear_current_operation(&mut status, data.metadata.generation);
                } else {
                    self.give_up(&data, &mut status).await;
                    status.unbind_status = UnbindStatus::Failed;
                    clear_current_operation(&mut status, data.metadata.generation);
                }
                self.ctx
                    .update_status(&self.ctx.bindings, &data, status)
                    .await?;
                return Ok(Action::await_change());
            }

            self.ctx
                .update_status(&self.ctx.bindings, &data, status)
                .await?;
            return Err(error.into());
        }

        if mitigating {
            status.set_condition(
                ConditionType::Ready,
                ConditionStatus::False,
                reasons::ORPHAN_MITIGATION_SUCCESSFUL,
                "Orphan mitigation successful",
                now,
            );
        } else {
            status.set_condition(
                ConditionType::Ready,
                ConditionStatus::False,
                reasons::UNBOUND_SUCCESSFULLY,
                "The binding was deleted successfully",
                now,
            );
        }
        status.external_properties = None;
        status.unbind_status = UnbindStatus::Succeeded;
        clear_current_operation(&mut status, data.metadata.generation);
        let data = self
            .ctx
            .update_status(&self.ctx.bindings, &data, status)
            .await?;
        self.ctx
            .record(
                &data,
                EventType::Normal,
                reasons::UNBOUND_SUCCESSFULLY,
                "This binding was deleted successfully".into(),
            )
            .await;

        if !mitigating {
            self.ctx
                .release_finalizer(&self.ctx.bindings, &data)
                .await?;
        }
        info!("Successfully unbound {namespace}/{name} from {}", resolved.describe());
        Ok(Action::await_change())
    }

    async fn inject(
        &self,
        data: &ServiceBindingCrd,
        credentials: &::serde_json::Map<String, ::serde_json::Value>,
    ) -> Result<(), Error> {
        let namespace = data.namespace().unwrap_or_default();
        let owner = data.controller_owner_ref(&()).ok_or_else(|| {
            Error::Dependency(format!(
                "binding {namespace}/{} has no uid yet",
                data.name_any(),
            ))
        })?;

        self.ctx
            .injector()
            .inject(&namespace, &data.spec.secret_name, &owner, credentials)
            .await
            .map_err(Into::into)
    }

    fn is_exhausted(&self, status: &ServiceBindingStatus) -> bool {
        status.operation_start_time.is_some_and(|started| {
            RetryWindow::new(self.ctx.config.reconciliation_retry_duration)
                .is_exhausted(started, self.ctx.clock.now())
        })
    }

    /// Marks the binding failed once its retry window is spent.
    async fn give_up(&self, data: &ServiceBindingCrd, status: &mut ServiceBindingStatus) {
        let name = data.name_any();
        let namespace = data.namespace().unwrap_or_default();
        let message = format!(
            "Binding {namespace}/{name}: stopping reconciliation retries, too much time has elapsed"
        );
        info!("{message}");
        self.ctx
            .record(
                data,
                EventType::Warning,
                reasons::ERROR_RECONCILIATION_RETRY_TIMEOUT,
                message.clone(),
            )
            .await;
        status.set_condition(
            ConditionType::Failed,
            ConditionStatus::True,
            reasons::ERROR_RECONCILIATION_RETRY_TIMEOUT,
            message,
            self.ctx.clock.now(),
        );
    }

    /// Schedules an unbind for a bind whose outcome is unknown.
    async fn start_orphan_mitigation(
        &self,
        data: &ServiceBindingCrd,
        mut status: ServiceBindingStatus,
        resolved: &Resolved,
        detail: String,
    ) -> Result<Action, Error> {
        let name = data.name_any();
        let namespace = data.namespace().unwrap_or_default();
        let message = format!(
            "Binding {namespace}/{name}: starting orphan mitigation; {}, {detail}",
            resolved.describe(),
        );

        status.orphan_mitigation_in_progress = true;
        status.operation_start_time = None;
        status.in_progress_properties = None;
        status.set_condition(
            ConditionType::Ready,
            ConditionStatus::False,
            reasons::SERVICE_BINDING_NEEDS_ORPHAN_MITIGATION,
            message.clone(),
            self.ctx.clock.now(),
        );

        warn!("{message}");
        self.ctx
            .record(
                data,
                EventType::Warning,
                reasons::SERVICE_BINDING_NEEDS_ORPHAN_MITIGATION,
                message,
            )
            .await;
        self.ctx
            .update_status(&self.ctx.bindings, data, status)
            .await?;
        Ok(Action::await_change())
    }

    /// Records a failed step on the Ready condition, plus a warning event.
    async fn report(
        &self,
        data: &ServiceBindingCrd,
        mut status: ServiceBindingStatus,
        ready: ConditionStatus,
        reason: &str,
        message: String,
    ) -> Result<ServiceBindingCrd, Error> {
        warn!("{message}");
        self.ctx
            .record(data, EventType::Warning, reason, message.clone())
            .await;

        status.set_condition(ConditionType::Ready, ready, reason, message, self.ctx.clock.now());
        self.ctx
            .update_status(&self.ctx.bindings, data, status)
            .await
    }
}

fn clear_current_operation(status: &mut ServiceBindingStatus, generation: Option<i64>) {
    status.current_operation = None;
    status.operation_start_time = None;
    status.reconciled_generation = generation;
    status.in_progress_properties = None;
    status.orphan_mitigation_in_progress = false;
}
