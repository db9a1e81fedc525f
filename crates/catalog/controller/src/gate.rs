//! Decides whether an object needs another trip to its broker.

use std::{collections::BTreeMap, time::Duration};

use catalog_api::{
    broker::ServiceBrokerCrd,
    condition::{ConditionType, Conditions},
};
use chrono::{DateTime, Utc};
use kube::Resource;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// SHA-256 over the key-sorted JSON encoding of `value`.
pub fn spec_checksum<T>(value: &T) -> String
where
    T: Serialize,
{
    let value = ::serde_json::to_value(value).unwrap_or(Value::Null);
    checksum(&value)
}

pub fn parameters_checksum(parameters: &Map<String, Value>) -> String {
    checksum(&Value::Object(parameters.clone()))
}

fn checksum(value: &Value) -> String {
    let canonical = canonicalize(value);
    let encoded = ::serde_json::to_vec(&canonical).unwrap_or_default();
    format!("{:x}", Sha256::digest(encoded))
}

/// Object maps may keep insertion order, so keys are sorted explicitly.
#[derive(Serialize)]
#[serde(untagged)]
enum Canonical<'a> {
    Object(BTreeMap<&'a str, Canonical<'a>>),
    Array(Vec<Canonical<'a>>),
    Leaf(&'a Value),
}

fn canonicalize(value: &Value) -> Canonical<'_> {
    match value {
        Value::Object(map) => Canonical::Object(
            map.iter()
                .map(|(key, value)| (key.as_str(), canonicalize(value)))
                .collect(),
        ),
        Value::Array(items) => Canonical::Array(items.iter().map(canonicalize).collect()),
        leaf => Canonical::Leaf(leaf),
    }
}

pub fn should_reconcile_generation(
    deletion_pending: bool,
    generation: Option<i64>,
    reconciled_generation: Option<i64>,
) -> bool {
    deletion_pending || generation != reconciled_generation
}

pub fn should_reconcile_checksum(
    deletion_pending: bool,
    spec_checksum: &str,
    reconciled_checksum: Option<&str>,
) -> bool {
    deletion_pending || reconciled_checksum != Some(spec_checksum)
}

/// A broker is relisted when it is being deleted, was never listed, is not
/// ready, or its relist interval has passed.
pub fn should_reconcile_broker(
    broker: &ServiceBrokerCrd,
    now: DateTime<Utc>,
    relist_interval: Duration,
) -> bool {
    if broker.meta().deletion_timestamp.is_some() {
        return true;
    }

    let Some(status) = broker.status.as_ref() else {
        return true;
    };
    if !status.is_condition_true(ConditionType::Ready) {
        return true;
    }

    match status.last_catalog_retrieval_time {
        Some(last) => deadline(last, relist_interval).is_some_and(|next| now >= next),
        None => true,
    }
}

/// `start + duration`, or `None` past the representable range.
pub fn deadline(start: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    ::chrono::Duration::from_std(duration)
        .ok()
        .and_then(|duration| start.checked_add_signed(duration))
}

/// The application-level deadline for an operation that keeps failing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryWindow {
    pub duration: Duration,
}

impl RetryWindow {
    pub const fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn is_exhausted(&self, started: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        deadline(started, self.duration).is_some_and(|deadline| now >= deadline)
    }
}
