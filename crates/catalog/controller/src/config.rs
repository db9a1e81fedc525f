use std::time::Duration;

use anyhow::Result;
use catalog_core::env::{infer_duration_or, infer_or};

/// Tunables of the controller, passed explicitly to every reconciler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// How often a ready broker's catalog is fetched again.
    pub broker_relist_interval: Duration,
    /// How long an in-doubt operation is retried before giving up.
    pub reconciliation_retry_duration: Duration,
    /// How often every cached object is reconciled again.
    pub resync_interval: Duration,
    pub workers_per_kind: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Send `X-Broker-API-Originating-Identity` on every broker call.
    pub originating_identity: bool,
    /// Send the OSB `context` profile with provision and bind requests.
    pub osb_api_context_profile: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            broker_relist_interval: Duration::from_secs(15 * 60),
            reconciliation_retry_duration: Duration::from_secs(7 * 24 * 60 * 60),
            resync_interval: Duration::from_secs(5 * 60),
            workers_per_kind: 1,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            originating_identity: false,
            osb_api_context_profile: true,
        }
    }
}

impl ControllerConfig {
    pub fn try_infer() -> Result<Self> {
        let default = Self::default();
        Ok(Self {
            broker_relist_interval: infer_duration_or(
                "CATALOG_BROKER_RELIST_INTERVAL",
                default.broker_relist_interval,
            )?,
            reconciliation_retry_duration: infer_duration_or(
                "CATALOG_RECONCILIATION_RETRY_DURATION",
                default.reconciliation_retry_duration,
            )?,
            resync_interval: infer_duration_or("CATALOG_RESYNC_INTERVAL", default.resync_interval)?,
            workers_per_kind: infer_or("CATALOG_WORKERS_PER_KIND", default.workers_per_kind)?
                .max(1),
            backoff_base: infer_duration_or("CATALOG_BACKOFF_BASE", default.backoff_base)?,
            backoff_max: infer_duration_or("CATALOG_BACKOFF_MAX", default.backoff_max)?,
            originating_identity: infer_or(
                "CATALOG_ORIGINATING_IDENTITY",
                default.originating_identity,
            )?,
            osb_api_context_profile: infer_or(
                "CATALOG_OSB_API_CONTEXT_PROFILE",
                default.osb_api_context_profile,
            )?,
        })
    }
}
