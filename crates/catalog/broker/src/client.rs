use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::Result,
    models::{
        BindRequest, BindResponse, Catalog, DeprovisionRequest, ProvisionRequest,
        ProvisionResponse, UnbindRequest,
    },
};

/// The capability to talk to a single Open Service Broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_catalog(&self) -> Result<Catalog>;

    async fn create_service_instance(
        &self,
        instance_id: &str,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse>;

    async fn delete_service_instance(
        &self,
        instance_id: &str,
        request: &DeprovisionRequest,
    ) -> Result<()>;

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse>;

    async fn unbind(&self, request: &UnbindRequest) -> Result<()>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl ::core::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerClientConfig {
    pub name: String,
    pub url: String,
    pub auth: Option<BasicAuth>,
}

/// Builds a client for a broker from its resolved configuration.
pub trait BrokerClientFactory: Send + Sync {
    fn create(&self, config: &BrokerClientConfig) -> ::anyhow::Result<Arc<dyn BrokerClient>>;
}
