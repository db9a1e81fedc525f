use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine;
use reqwest::{header::HeaderValue, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, instrument, Level};
use url::Url;

use crate::{
    client::{BasicAuth, BrokerClient, BrokerClientConfig, BrokerClientFactory},
    error::{BrokerError, Result},
    models::{
        BindRequest, BindResponse, Catalog, DeprovisionRequest, ErrorResponse,
        LastOperationResponse, LastOperationState, OriginatingIdentity, ProvisionRequest,
        ProvisionResponse, UnbindRequest,
    },
};

/// Talks to a broker over the Open Service Broker v2 HTTP API.
#[derive(Clone)]
pub struct HttpBrokerClient {
    name: String,
    endpoint: Url,
    auth: Option<BasicAuth>,
    session: ::reqwest::Client,
    polling_interval: Duration,
    polling_limit: usize,
}

impl HttpBrokerClient {
    pub const API_VERSION: &'static str = "2.13";

    const HEADER_API_VERSION: &'static str = "X-Broker-API-Version";
    const HEADER_ORIGINATING_IDENTITY: &'static str = "X-Broker-API-Originating-Identity";

    const TIMEOUT: Duration = Duration::from_secs(15);
    const POLLING_INTERVAL: Duration = Duration::from_secs(1);
    const POLLING_LIMIT: usize = 30;

    pub fn try_new(config: &BrokerClientConfig) -> ::anyhow::Result<Self> {
        let BrokerClientConfig { name, url, auth } = config;

        Ok(Self {
            name: name.clone(),
            endpoint: parse_endpoint(url)?,
            auth: auth.clone(),
            session: ::reqwest::ClientBuilder::new()
                .timeout(Self::TIMEOUT)
                .build()?,
            polling_interval: Self::POLLING_INTERVAL,
            polling_limit: Self::POLLING_LIMIT,
        })
    }

    pub fn with_polling(mut self, interval: Duration, limit: usize) -> Self {
        self.polling_interval = interval;
        self.polling_limit = limit;
        self
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    #[instrument(level = Level::INFO, skip_all, fields(broker = %self.name), err(Display))]
    async fn get_catalog(&self) -> Result<Catalog> {
        let request = RequestWithoutPayload {
            method: Method::GET,
            rel_url: "v2/catalog".into(),
            query: Vec::default(),
            payload: None,
            identity: None,
        };

        let response = self.execute(request).await?;
        match response.status() {
            StatusCode::OK => parse_body(response).await,
            _ => Err(error_from_response(response).await),
        }
    }

    #[instrument(
        level = Level::INFO,
        skip_all,
        fields(broker = %self.name, instance_id = %instance_id),
        err(Display),
    )]
    async fn create_service_instance(
        &self,
        instance_id: &str,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse> {
        let mut query = Vec::default();
        if request.accepts_incomplete {
            query.push(("accepts_incomplete", "true".into()));
        }

        let request = Request {
            method: Method::PUT,
            rel_url: format!("v2/service_instances/{instance_id}"),
            query,
            payload: Some(request),
            identity: request.originating_identity.as_ref(),
        };

        let response = self.execute(request).await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => parse_body_or_default(response).await,
            StatusCode::ACCEPTED => {
                let provisioned: ProvisionResponse = parse_body_or_default(response).await?;
                self.poll_last_operation(instance_id, provisioned.operation.as_deref(), false)
                    .await?;
                Ok(provisioned)
            }
            _ => Err(error_from_response(response).await),
        }
    }

    #[instrument(
        level = Level::INFO,
        skip_all,
        fields(broker = %self.name, instance_id = %instance_id),
        err(Display),
    )]
    async fn delete_service_instance(
        &self,
        instance_id: &str,
        request: &DeprovisionRequest,
    ) -> Result<()> {
        let mut query = vec![
            ("service_id", request.service_id.clone()),
            ("plan_id", request.plan_id.clone()),
        ];
        if request.accepts_incomplete {
            query.push(("accepts_incomplete", "true".into()));
        }

        let request = RequestWithoutPayload {
            method: Method::DELETE,
            rel_url: format!("v2/service_instances/{instance_id}"),
            query,
            payload: None,
            identity: request.originating_identity.as_ref(),
        };

        let response = self.execute(request).await?;
        match response.status() {
            StatusCode::OK | StatusCode::GONE => Ok(()),
            StatusCode::ACCEPTED => {
                let deprovisioned: ProvisionResponse = parse_body_or_default(response).await?;
                self.poll_last_operation(instance_id, deprovisioned.operation.as_deref(), true)
                    .await
            }
            _ => Err(error_from_response(response).await),
        }
    }

    #[instrument(
        level = Level::INFO,
        skip_all,
        fields(broker = %self.name, instance_id = %request.instance_id, binding_id = %request.binding_id),
        err(Display),
    )]
    async fn bind(&self, request: &BindRequest) -> Result<BindResponse> {
        let BindRequest {
            instance_id,
            binding_id,
            ..
        } = request;

        let request = Request {
            method: Method::PUT,
            rel_url: format!("v2/service_instances/{instance_id}/service_bindings/{binding_id}"),
            query: Vec::default(),
            payload: Some(request),
            identity: request.originating_identity.as_ref(),
        };

        let response = self.execute(request).await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => parse_body_or_default(response).await,
            _ => Err(error_from_response(response).await),
        }
    }

    #[instrument(
        level = Level::INFO,
        skip_all,
        fields(broker = %self.name, instance_id = %request.instance_id, binding_id = %request.binding_id),
        err(Display),
    )]
    async fn unbind(&self, request: &UnbindRequest) -> Result<()> {
        let UnbindRequest {
            instance_id,
            binding_id,
            service_id,
            plan_id,
            originating_identity,
        } = request;

        let request = RequestWithoutPayload {
            method: Method::DELETE,
            rel_url: format!("v2/service_instances/{instance_id}/service_bindings/{binding_id}"),
            query: vec![
                ("service_id", service_id.clone()),
                ("plan_id", plan_id.clone()),
            ],
            payload: None,
            identity: originating_identity.as_ref(),
        };

        let response = self.execute(request).await?;
        match response.status() {
            StatusCode::OK | StatusCode::GONE => Ok(()),
            _ => Err(error_from_response(response).await),
        }
    }
}

impl HttpBrokerClient {
    async fn poll_last_operation(
        &self,
        instance_id: &str,
        operation: Option<&str>,
        deleting: bool,
    ) -> Result<()> {
        let name = &self.name;

        for attempt in 1..=self.polling_limit {
            debug!("Polling broker {name} for instance {instance_id} (attempt {attempt})");

            let request = RequestWithoutPayload {
                method: Method::GET,
                rel_url: format!("v2/service_instances/{instance_id}/last_operation"),
                query: operation
                    .map(|operation| vec![("operation", operation.to_string())])
                    .unwrap_or_default(),
                payload: None,
                identity: None,
            };

            let response = self.execute(request).await?;
            match response.status() {
                StatusCode::OK => {
                    let last_operation: LastOperationResponse = parse_body(response).await?;
                    match last_operation.state {
                        LastOperationState::InProgress => {}
                        LastOperationState::Succeeded => return Ok(()),
                        LastOperationState::Failed => {
                            let description = last_operation
                                .description
                                .unwrap_or_else(|| "no description".into());
                            return Err(BrokerError::Other(format!(
                                "broker reported a failed operation: {description}"
                            )));
                        }
                    }
                }
                StatusCode::GONE if deleting => return Ok(()),
                _ => return Err(error_from_response(response).await),
            }

            ::tokio::time::sleep(self.polling_interval).await;
        }

        Err(BrokerError::Other(format!(
            "timed out while polling broker {name} for instance {instance_id}"
        )))
    }

    async fn execute<T>(&self, request: Request<'_, T>) -> Result<Response>
    where
        T: Serialize,
    {
        let Request {
            method,
            rel_url,
            query,
            payload,
            identity,
        } = request;

        let url = self
            .endpoint
            .join(&rel_url)
            .map_err(|error| BrokerError::Other(format!("invalid broker url: {error}")))?;

        let mut request = self
            .session
            .request(method, url)
            .header(Self::HEADER_API_VERSION, Self::API_VERSION);
        if let Some(BasicAuth { username, password }) = &self.auth {
            request = request.basic_auth(username, Some(password));
        }
        if !query.is_empty() {
            request = request.query(&query);
        }
        if let Some(payload) = payload {
            request = request.json(payload);
        }
        if let Some(identity) = identity {
            request = with_originating_identity(request, identity)?;
        }

        request.send().await.map_err(Into::into)
    }
}

type RequestWithoutPayload<'a> = Request<'a, ()>;

struct Request<'a, T> {
    method: Method,
    rel_url: String,
    query: Vec<(&'static str, String)>,
    payload: Option<&'a T>,
    identity: Option<&'a OriginatingIdentity>,
}

fn parse_endpoint(url: &str) -> ::anyhow::Result<Url> {
    let mut endpoint: Url = url.parse()?;
    if !endpoint.path().ends_with('/') {
        let path = format!("{}/", endpoint.path());
        endpoint.set_path(&path);
    }
    Ok(endpoint)
}

fn with_originating_identity(
    request: RequestBuilder,
    identity: &OriginatingIdentity,
) -> Result<RequestBuilder> {
    let OriginatingIdentity { platform, value } = identity;

    let value = ::serde_json::to_vec(value).map_err(BrokerError::other)?;
    let value = ::base64::engine::general_purpose::STANDARD.encode(value);
    let header = HeaderValue::from_str(&format!("{platform} {value}"))
        .map_err(BrokerError::other)?;
    Ok(request.header(HttpBrokerClient::HEADER_ORIGINATING_IDENTITY, header))
}

/// Decodes a JSON body that must be present.
async fn parse_body<R>(response: Response) -> Result<R>
where
    R: DeserializeOwned,
{
    let body = response.bytes().await?;
    if is_blank(&body) {
        return Err(BrokerError::Other(
            "broker returned an empty response body".into(),
        ));
    }
    decode(&body)
}

/// Decodes a JSON body whose fields are all optional, so an empty body reads as `{}`.
async fn parse_body_or_default<R>(response: Response) -> Result<R>
where
    R: Default + DeserializeOwned,
{
    let body = response.bytes().await?;
    if is_blank(&body) {
        return Ok(R::default());
    }
    decode(&body)
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

fn decode<R>(body: &[u8]) -> Result<R>
where
    R: DeserializeOwned,
{
    ::serde_json::from_slice(body)
        .map_err(|error| BrokerError::Other(format!("failed to parse broker response: {error}")))
}

async fn error_from_response(response: Response) -> BrokerError {
    let status = response.status().as_u16();
    let ErrorResponse { error, description } =
        parse_body_or_default(response).await.unwrap_or_default();
    BrokerError::Http {
        status,
        error_message: error,
        description,
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct HttpBrokerClientFactory;

impl BrokerClientFactory for HttpBrokerClientFactory {
    fn create(&self, config: &BrokerClientConfig) -> ::anyhow::Result<Arc<dyn BrokerClient>> {
        HttpBrokerClient::try_new(config).map(|client| Arc::new(client) as Arc<dyn BrokerClient>)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::models::Parameters;

    use super::*;

    async fn stub_broker() -> (MockServer, HttpBrokerClient) {
        let server = MockServer::start().await;
        let config = BrokerClientConfig {
            name: "stub".into(),
            url: server.uri(),
            auth: None,
        };
        let client = HttpBrokerClient::try_new(&config)
            .unwrap()
            .with_polling(Duration::from_millis(1), 3);
        (server, client)
    }

    fn provision_request() -> ProvisionRequest {
        ProvisionRequest {
            service_id: "mysql-id".into(),
            plan_id: "small-id".into(),
            organization_guid: "org".into(),
            space_guid: "space".into(),
            parameters: Parameters::default(),
            context: None,
            accepts_incomplete: true,
            originating_identity: None,
        }
    }

    #[test]
    fn endpoints_keep_their_path_prefix() {
        let endpoint = parse_endpoint("http://broker.example.com/osb").unwrap();
        assert_eq!(
            endpoint.join("v2/catalog").unwrap().as_str(),
            "http://broker.example.com/osb/v2/catalog",
        );

        let endpoint = parse_endpoint("http://broker.example.com").unwrap();
        assert_eq!(
            endpoint.join("v2/service_instances/abc").unwrap().as_str(),
            "http://broker.example.com/v2/service_instances/abc",
        );
    }

    #[test]
    fn malformed_endpoints_are_rejected() {
        let config = BrokerClientConfig {
            name: "broken".into(),
            url: "not a url".into(),
            auth: None,
        };
        assert!(HttpBrokerClientFactory.create(&config).is_err());
    }

    #[tokio::test]
    async fn unreachable_brokers_are_not_http_errors() {
        let config = BrokerClientConfig {
            name: "unreachable".into(),
            url: "http://127.0.0.1:9".into(),
            auth: Some(BasicAuth {
                username: "user".into(),
                password: "pass".into(),
            }),
        };
        let client = HttpBrokerClient::try_new(&config).unwrap();

        let error = client.get_catalog().await.unwrap_err();
        assert_eq!(error.status_code(), None);
        assert!(!error.is_ambiguous_bind_failure());
    }

    #[tokio::test]
    async fn catalogs_are_decoded() {
        let (server, client) = stub_broker().await;
        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .and(header("X-Broker-API-Version", "2.13"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "services": [{
                    "id": "mysql-id",
                    "name": "mysql",
                    "bindable": true,
                    "plans": [{ "id": "small-id", "name": "small" }],
                }],
            })))
            .mount(&server)
            .await;

        let catalog = client.get_catalog().await.unwrap();
        assert_eq!(catalog.services.len(), 1);
        assert_eq!(catalog.services[0].name, "mysql");
        assert_eq!(catalog.services[0].plans[0].id, "small-id");
    }

    #[tokio::test]
    async fn empty_catalog_bodies_are_malformed() {
        let (server, client) = stub_broker().await;
        Mock::given(method("GET"))
            .and(path("/v2/catalog"))
            .respond_with(ResponseTemplate::new(200).set_body_string(" \n"))
            .mount(&server)
            .await;

        let error = client.get_catalog().await.unwrap_err();
        assert!(matches!(error, BrokerError::Other(_)), "{error}");
        assert!(error.to_string().contains("empty response body"));
    }

    #[tokio::test]
    async fn empty_last_operation_bodies_fail_the_poll() {
        let (server, client) = stub_broker().await;
        Mock::given(method("PUT"))
            .and(path("/v2/service_instances/db1"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "operation": "op1" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/service_instances/db1/last_operation"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let error = client
            .create_service_instance("db1", &provision_request())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("empty response body"));
    }

    #[tokio::test]
    async fn empty_provision_bodies_read_as_empty_responses() {
        let (server, client) = stub_broker().await;
        Mock::given(method("PUT"))
            .and(path("/v2/service_instances/db1"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let response = client
            .create_service_instance("db1", &provision_request())
            .await
            .unwrap();
        assert_eq!(response, ProvisionResponse::default());
    }
}
