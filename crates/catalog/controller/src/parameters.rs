//! Builds the parameters sent to a broker from inline values and secrets.

use catalog_api::properties::{ParametersFromSource, SecretKeyReference};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::store::{SecretStore, StoreError};

pub const REDACTED: &str = "<redacted>";

#[derive(Debug, Error)]
pub enum ParametersError {
    #[error("failed to unmarshal parameters: {0}")]
    Malformed(String),
    #[error("parameter {0:?} is defined more than once")]
    DuplicateKey(String),
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },
    #[error("secret {namespace}/{name} has no key {key:?}")]
    SecretKeyNotFound {
        namespace: String,
        name: String,
        key: String,
    },
    #[error("failed to read secret {namespace}/{name}: {source}")]
    Store {
        namespace: String,
        name: String,
        source: StoreError,
    },
}

impl ParametersError {
    /// Whether retrying can never succeed without a spec change.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::DuplicateKey(_))
    }
}

pub type Result<T, E = ParametersError> = ::core::result::Result<T, E>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuiltParameters {
    /// What the broker receives.
    pub merged: Map<String, Value>,
    /// What may be persisted: secret-sourced values are masked.
    pub redacted: Map<String, Value>,
}

/// Reads inline parameters: either an object, or a YAML/JSON document
/// holding one.
pub fn unmarshal_parameters(parameters: Option<&Value>) -> Result<Map<String, Value>> {
    match parameters {
        None | Some(Value::Null) => Ok(Map::default()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(Value::String(document)) => unmarshal_document(document),
        Some(other) => Err(ParametersError::Malformed(format!(
            "expected an object, found {other}"
        ))),
    }
}

fn unmarshal_document(document: &str) -> Result<Map<String, Value>> {
    match ::serde_yaml::from_str(document) {
        Ok(Value::Null) => Ok(Map::default()),
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ParametersError::Malformed(format!(
            "expected a mapping, found {other}"
        ))),
        Err(error) => Err(ParametersError::Malformed(error.to_string())),
    }
}

pub async fn build_parameters(
    secrets: &dyn SecretStore,
    namespace: &str,
    parameters_from: &[ParametersFromSource],
    parameters: Option<&Value>,
) -> Result<BuiltParameters> {
    let merged = unmarshal_parameters(parameters)?;
    let mut built = BuiltParameters {
        redacted: merged.clone(),
        merged,
    };

    for source in parameters_from {
        let reference = source.secret_key_ref.as_ref().ok_or_else(|| {
            ParametersError::Malformed("a parametersFrom source must reference a secret".into())
        })?;

        let document = read_secret_key(secrets, namespace, reference).await?;
        for (key, value) in unmarshal_document(&document)? {
            if built.merged.contains_key(&key) {
                return Err(ParametersError::DuplicateKey(key));
            }
            built.redacted.insert(key.clone(), Value::String(REDACTED.into()));
            built.merged.insert(key, value);
        }
    }
    Ok(built)
}

async fn read_secret_key(
    secrets: &dyn SecretStore,
    namespace: &str,
    reference: &SecretKeyReference,
) -> Result<String> {
    let SecretKeyReference { name, key } = reference;

    let secret = secrets
        .get(namespace, name)
        .await
        .map_err(|source| ParametersError::Store {
            namespace: namespace.into(),
            name: name.clone(),
            source,
        })?
        .ok_or_else(|| ParametersError::SecretNotFound {
            namespace: namespace.into(),
            name: name.clone(),
        })?;

    let value = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| value.clone().into_bytes())
        })
        .ok_or_else(|| ParametersError::SecretKeyNotFound {
            namespace: namespace.into(),
            name: name.clone(),
            key: key.clone(),
        })?;

    String::from_utf8(value)
        .map_err(|error| ParametersError::Malformed(format!("secret {name}/{key}: {error}")))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{api::core::v1::Secret, ByteString};
    use kube::api::ObjectMeta;
    use maplit::btreemap;
    use serde_json::json;

    use crate::store::memory::MemorySecretStore;

    use super::*;

    fn secret(name: &str, key: &str, value: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("dev".into()),
                ..Default::default()
            },
            data: Some(btreemap! {
                key.to_string() => ByteString(value.as_bytes().to_vec()),
            }),
            ..Default::default()
        }
    }

    fn from_secret(name: &str, key: &str) -> ParametersFromSource {
        ParametersFromSource {
            secret_key_ref: Some(SecretKeyReference {
                name: name.into(),
                key: key.into(),
            }),
        }
    }

    #[test]
    fn inline_parameters_accept_objects_and_documents() {
        let object = json!({"size": "small"});
        assert_eq!(
            unmarshal_parameters(Some(&object)).unwrap()["size"],
            json!("small"),
        );

        let document = json!("size: large\nreplicas: 3\n");
        let parsed = unmarshal_parameters(Some(&document)).unwrap();
        assert_eq!(parsed["size"], json!("large"));
        assert_eq!(parsed["replicas"], json!(3));

        assert!(unmarshal_parameters(None).unwrap().is_empty());
    }

    #[test]
    fn non_mappings_are_malformed() {
        for parameters in [json!(42), json!(["a"]), json!("- a\n- b\n"), json!("{")] {
            let error = unmarshal_parameters(Some(&parameters)).unwrap_err();
            assert!(error.is_terminal(), "{parameters} should be malformed");
        }
    }

    #[tokio::test]
    async fn secret_sourced_values_are_redacted() {
        let secrets = MemorySecretStore::default();
        secrets.insert(secret("creds", "params", r#"{"password": "hunter2"}"#));

        let inline = json!({"username": "admin"});
        let built = build_parameters(
            &secrets,
            "dev",
            &[from_secret("creds", "params")],
            Some(&inline),
        )
        .await
        .unwrap();

        assert_eq!(built.merged["username"], json!("admin"));
        assert_eq!(built.merged["password"], json!("hunter2"));
        assert_eq!(built.redacted["username"], json!("admin"));
        assert_eq!(built.redacted["password"], json!(REDACTED));
    }

    #[tokio::test]
    async fn colliding_keys_are_terminal() {
        let secrets = MemorySecretStore::default();
        secrets.insert(secret("creds", "params", "username: other\n"));

        let inline = json!({"username": "admin"});
        let error = build_parameters(
            &secrets,
            "dev",
            &[from_secret("creds", "params")],
            Some(&inline),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, ParametersError::DuplicateKey(ref key) if key == "username"));
        assert!(error.is_terminal());
    }

    #[tokio::test]
    async fn missing_secrets_are_retryable() {
        let secrets = MemorySecretStore::default();
        let error = build_parameters(&secrets, "dev", &[from_secret("creds", "params")], None)
            .await
            .unwrap_err();
        assert!(!error.is_terminal());

        secrets.insert(secret("creds", "other", "{}"));
        let error = build_parameters(&secrets, "dev", &[from_secret("creds", "params")], None)
            .await
            .unwrap_err();
        assert!(matches!(error, ParametersError::SecretKeyNotFound { .. }));
        assert!(!error.is_terminal());
    }
}
