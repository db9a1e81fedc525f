use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    condition::{Condition, Conditions},
    properties::ObjectReference,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema, CustomResource)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceBroker",
    root = "ServiceBrokerCrd",
    status = "ServiceBrokerStatus",
    shortname = "sb",
    printcolumn = r#"{
        "name": "url",
        "type": "string",
        "description": "endpoint of the broker",
        "jsonPath": ".spec.url"
    }"#,
    printcolumn = r#"{
        "name": "retrieved-at",
        "type": "date",
        "description": "last catalog retrieval time",
        "jsonPath": ".status.lastCatalogRetrievalTime"
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
        "description": "broker version",
        "jsonPath": ".metadata.generation"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerSpec {
    pub url: String,
    /// Secret holding `username` and `password` for basic auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<ObjectReference>,
    /// Overrides the controller-wide relist interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relist_interval_secs: Option<u64>,
}

impl ServiceBrokerCrd {
    pub const FINALIZER_NAME: &'static str = crate::consts::FINALIZER_NAME;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_catalog_retrieval_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_generation: Option<i64>,
}

impl Conditions for ServiceBrokerStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}
