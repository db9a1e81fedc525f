//! Materializes bind results as secrets owned by their binding.

use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::{
    api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::OwnerReference, ByteString,
};
use kube::api::ObjectMeta;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::store::{SecretStore, StoreError};

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("unable to serialize credential value {key:?}: {message}")]
    Serialize { key: String, message: String },
    #[error("secret {name:?} is not owned by the binding (controller: {controller})")]
    NotOwned { name: String, controller: String },
    #[error("conflicting secret {0:?} update detected")]
    ConflictingUpdate(String),
    #[error("conflicting secret {0:?} creation detected")]
    ConflictingCreation(String),
    #[error("unexpected error in response: {0}")]
    Store(#[from] StoreError),
}

impl InjectError {
    /// Conflicts resolve themselves on a later attempt; everything else
    /// needs a human.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConflictingUpdate(_) | Self::ConflictingCreation(_))
    }
}

#[derive(Clone)]
pub struct SecretInjector {
    secrets: Arc<dyn SecretStore>,
}

impl SecretInjector {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    /// Writes `credentials` into the secret `namespace/name`, creating it
    /// with `owner` as its controller when absent.
    pub async fn inject(
        &self,
        namespace: &str,
        name: &str,
        owner: &OwnerReference,
        credentials: &Map<String, Value>,
    ) -> Result<(), InjectError> {
        debug!("Creating/updating secret {namespace}/{name}");

        let data = serialize_credentials(credentials)?;

        match self.secrets.get(namespace, name).await? {
            Some(mut secret) => {
                let controller = secret
                    .metadata
                    .owner_references
                    .as_ref()
                    .and_then(|owners| owners.iter().find(|owner| owner.controller == Some(true)));
                match controller {
                    Some(controller) if controller.uid == owner.uid => (),
                    Some(controller) => {
                        return Err(InjectError::NotOwned {
                            name: name.into(),
                            controller: format!("{}/{}", controller.kind, controller.name),
                        })
                    }
                    None => {
                        return Err(InjectError::NotOwned {
                            name: name.into(),
                            controller: "<none>".into(),
                        })
                    }
                }

                secret.data = Some(data);
                match self.secrets.update(&secret).await {
                    Ok(_) => Ok(()),
                    Err(StoreError::Conflict(_)) => Err(InjectError::ConflictingUpdate(name.into())),
                    Err(error) => Err(error.into()),
                }
            }
            None => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(name.into()),
                        namespace: Some(namespace.into()),
                        owner_references: Some(vec![owner.clone()]),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                match self.secrets.create(&secret).await {
                    Ok(_) => Ok(()),
                    Err(StoreError::AlreadyExists(_)) => {
                        Err(InjectError::ConflictingCreation(name.into()))
                    }
                    Err(error) => Err(error.into()),
                }
            }
        }
    }

    /// Deletes the secret; a missing secret is already ejected.
    pub async fn eject(&self, namespace: &str, name: &str) -> Result<(), InjectError> {
        debug!("Deleting secret {namespace}/{name}");

        match self.secrets.delete(namespace, name).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

fn serialize_credentials(
    credentials: &Map<String, Value>,
) -> Result<BTreeMap<String, ByteString>, InjectError> {
    credentials
        .iter()
        .map(|(key, value)| {
            let bytes = match value {
                Value::String(value) => value.as_bytes().to_vec(),
                value => ::serde_json::to_vec(value).map_err(|error| InjectError::Serialize {
                    key: key.clone(),
                    message: error.to_string(),
                })?,
            };
            Ok((key.clone(), ByteString(bytes)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::store::memory::MemorySecretStore;

    use super::*;

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "servicecatalog.k8s.io/v1beta1".into(),
            kind: "ServiceBinding".into(),
            name: "bind1".into(),
            uid: uid.into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn credentials() -> Map<String, Value> {
        match json!({"username": "admin", "port": 5432, "tls": {"enabled": true}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn data_of(secret: &Secret, key: &str) -> String {
        let data = secret.data.as_ref().unwrap();
        String::from_utf8(data[key].0.clone()).unwrap()
    }

    #[tokio::test]
    async fn values_are_encoded_by_type() {
        let secrets = Arc::new(MemorySecretStore::default());
        let injector = SecretInjector::new(secrets.clone());

        injector
            .inject("dev", "creds", &owner("uid-1"), &credentials())
            .await
            .unwrap();

        let secret = secrets.snapshot("dev", "creds").unwrap();
        assert_eq!(data_of(&secret, "username"), "admin");
        assert_eq!(data_of(&secret, "port"), "5432");
        assert_eq!(data_of(&secret, "tls"), r#"{"enabled":true}"#);
        assert_eq!(
            secret.metadata.owner_references.unwrap()[0].uid,
            "uid-1".to_string(),
        );

        // Re-injecting as the same owner overwrites.
        injector
            .inject("dev", "creds", &owner("uid-1"), &Map::default())
            .await
            .unwrap();
        let secret = secrets.snapshot("dev", "creds").unwrap();
        assert!(secret.data.unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_secrets_are_never_touched() {
        let secrets = Arc::new(MemorySecretStore::default());
        let injector = SecretInjector::new(secrets.clone());

        injector
            .inject("dev", "creds", &owner("uid-1"), &credentials())
            .await
            .unwrap();
        let before = secrets.snapshot("dev", "creds");

        let error = injector
            .inject("dev", "creds", &owner("uid-2"), &Map::default())
            .await
            .unwrap_err();
        assert!(matches!(error, InjectError::NotOwned { .. }));
        assert!(!error.is_retryable());
        assert_eq!(secrets.snapshot("dev", "creds"), before);

        secrets.insert(Secret {
            metadata: ObjectMeta {
                name: Some("unowned".into()),
                namespace: Some("dev".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        let error = injector
            .inject("dev", "unowned", &owner("uid-1"), &credentials())
            .await
            .unwrap_err();
        assert!(matches!(error, InjectError::NotOwned { .. }));
    }

    #[tokio::test]
    async fn races_are_retryable() {
        let secrets = Arc::new(MemorySecretStore::default());
        let injector = SecretInjector::new(secrets.clone());

        secrets.fail_next_write(StoreError::AlreadyExists("dev/creds".into()));
        let error = injector
            .inject("dev", "creds", &owner("uid-1"), &credentials())
            .await
            .unwrap_err();
        assert!(matches!(error, InjectError::ConflictingCreation(_)));
        assert!(error.is_retryable());

        injector
            .inject("dev", "creds", &owner("uid-1"), &credentials())
            .await
            .unwrap();
        secrets.fail_next_write(StoreError::Conflict("dev/creds".into()));
        let error = injector
            .inject("dev", "creds", &owner("uid-1"), &credentials())
            .await
            .unwrap_err();
        assert!(matches!(error, InjectError::ConflictingUpdate(_)));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn ejecting_a_missing_secret_succeeds() {
        let secrets = Arc::new(MemorySecretStore::default());
        let injector = SecretInjector::new(secrets.clone());

        injector.eject("dev", "creds").await.unwrap();

        injector
            .inject("dev", "creds", &owner("uid-1"), &credentials())
            .await
            .unwrap();
        injector.eject("dev", "creds").await.unwrap();
        assert!(secrets.snapshot("dev", "creds").is_none());
    }
}
