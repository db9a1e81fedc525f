use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A service offered by a broker, together with its plans.
///
/// Classes are owned by the broker that advertised them and are rewritten
/// on every catalog relist.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema, CustomResource)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceClass",
    root = "ServiceClassCrd",
    status = "ServiceClassStatus",
    shortname = "sc",
    printcolumn = r#"{
        "name": "broker",
        "type": "string",
        "description": "broker advertising the class",
        "jsonPath": ".spec.brokerName"
    }"#,
    printcolumn = r#"{
        "name": "external-id",
        "type": "string",
        "description": "broker-side identifier",
        "jsonPath": ".spec.externalId"
    }"#,
    printcolumn = r#"{
        "name": "removed",
        "type": "boolean",
        "description": "whether the broker no longer offers the class",
        "jsonPath": ".status.removedFromBrokerCatalog"
    }"#,
    printcolumn = r#"{
        "name": "created-at",
        "type": "date",
        "description": "created time",
        "jsonPath": ".metadata.creationTimestamp"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassSpec {
    pub broker_name: String,
    pub external_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plan_updatable: bool,
    #[serde(default)]
    pub plans: Vec<ServicePlan>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_client: Option<DashboardClient>,
}

impl ServiceClassSpec {
    /// Finds a plan by name; the first one wins on duplicates.
    pub fn find_plan(&self, name: &str) -> Option<&ServicePlan> {
        self.plans.iter().find(|plan| plan.name == name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlan {
    pub name: String,
    pub external_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "ServicePlan::default_free")]
    pub free: bool,
    /// Overrides the class-level `bindable` flag when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_metadata: Option<Value>,
}

impl ServicePlan {
    const fn default_free() -> bool {
        true
    }

    pub fn is_bindable(&self, class: &ServiceClassSpec) -> bool {
        self.bindable.unwrap_or(class.bindable)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DashboardClient {
    pub id: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub redirect_uri: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassStatus {
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(name: &str, bindable: Option<bool>) -> ServicePlan {
        ServicePlan {
            name: name.into(),
            external_id: format!("{name}-id"),
            description: String::default(),
            free: true,
            bindable,
            external_metadata: None,
        }
    }

    #[test]
    fn plan_bindability_falls_back_to_class() {
        let spec = ServiceClassSpec {
            broker_name: "broker".into(),
            external_id: "class-id".into(),
            description: String::default(),
            bindable: true,
            plan_updatable: false,
            plans: vec![plan("small", None), plan("large", Some(false))],
            tags: Vec::default(),
            requires: Vec::default(),
            external_metadata: None,
            dashboard_client: None,
        };

        assert!(spec.find_plan("small").unwrap().is_bindable(&spec));
        assert!(!spec.find_plan("large").unwrap().is_bindable(&spec));
        assert!(spec.find_plan("medium").is_none());
    }

    #[test]
    fn spec_parses_from_yaml() {
        let spec: ServiceClassSpec = ::serde_yaml::from_str(
            r#"
brokerName: broker
externalId: class-id
plans:
  - name: default
    externalId: plan-id
"#,
        )
        .unwrap();

        assert!(!spec.bindable);
        let plan = spec.find_plan("default").unwrap();
        assert!(plan.free);
        assert_eq!(plan.external_id, "plan-id");
    }
}
