pub mod client;
pub mod error;
#[cfg(feature = "fake")]
pub mod fake;
pub mod http;
pub mod models;

pub use self::{
    client::{BasicAuth, BrokerClient, BrokerClientConfig, BrokerClientFactory},
    error::BrokerError,
};
