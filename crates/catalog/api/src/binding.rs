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
    kind = "ServiceBinding",
    root = "ServiceBindingCrd",
    status = "ServiceBindingStatus",
    shortname = "sbd",
    namespaced,
    printcolumn = r#"{
        "name": "instance",
        "type": "string",
        "description": "bound service instance",
        "jsonPath": ".spec.instanceRef.name"
    }"#,
    printcolumn = r#"{
        "name": "secret",
        "type": "string",
        "description": "secret receiving the credentials",
        "jsonPath": ".spec.secretName"
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
        "description": "binding version",
        "jsonPath": ".metadata.generation"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Instance in the binding's own namespace.
    pub instance_ref: LocalObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub parameters_from: Vec<ParametersFromSource>,
    pub secret_name: String,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

impl ServiceBindingCrd {
    pub const FINALIZER_NAME: &'static str = crate::consts::FINALIZER_NAME;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    pub name: String,
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
pub enum ServiceBindingOperation {
    Bind,
    Unbind,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    Default,
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
pub enum UnbindStatus {
    #[default]
    NotRequired,
    Required,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<ServiceBindingOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_properties: Option<PropertiesState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_properties: Option<PropertiesState>,
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_generation: Option<i64>,
    #[serde(default)]
    pub unbind_status: UnbindStatus,
}

impl Conditions for ServiceBindingStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}
