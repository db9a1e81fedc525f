use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use crate::{
    condition::{Condition, Conditions},
    properties::{ParametersFromSource, PropertiesState, UserInfo},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema, CustomResource)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceInstance",
    root = "ServiceInstanceCrd",
    status = "ServiceInstanceStatus",
    shortname = "si",
    namespaced,
    printcolumn = r#"{
        "name": "class",
        "type": "string",
        "description": "service class name",
        "jsonPath": ".spec.serviceClassName"
    }"#,
    printcolumn = r#"{
        "name": "plan",
        "type": "string",
        "description": "service plan name",
        "jsonPath": ".spec.planName"
    }"#,
    printcolumn = r#"{
        "name": "operation",
        "type": "string",
        "description": "operation in flight",
        "jsonPath": ".status.currentOperation"
    }"#,
    printcolumn = r#"{
        "name": "created-at",
        "type": "date",
        "description": "created time",
        "jsonPath": ".metadata.creationTimestamp"
    }"#,
    printcolumn = r#"{
        "name": "version",
        "type": "integer",
        "description": "instance version",
        "jsonPath": ".metadata.generation"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    pub service_class_name: String,
    pub plan_name: String,
    /// Inline parameters; either an object or a YAML/JSON document string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub parameters_from: Vec<ParametersFromSource>,
    /// Identifier sent to the broker; fixed at creation.
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

impl ServiceInstanceCrd {
    pub const FINALIZER_NAME: &'static str = crate::consts::FINALIZER_NAME;
}

#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    EnumString,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum ServiceInstanceOperation {
    Provision,
    Update,
    Deprovision,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Set while a provision or deprovision call is in flight.
    #[serde(default)]
    pub async_op_in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<ServiceInstanceOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_properties: Option<PropertiesState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_properties: Option<PropertiesState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_generation: Option<i64>,
    /// Checksum of the spec the broker last accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_checksum: Option<String>,
}

impl Conditions for ServiceInstanceStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}
