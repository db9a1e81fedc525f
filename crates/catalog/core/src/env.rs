use std::time::Duration;

use anyhow::{anyhow, Result};
use duration_string::DurationString;

pub fn infer<K, R>(key: K) -> Result<R>
where
    K: AsRef<str>,
    R: ::core::str::FromStr,
    <R as ::core::str::FromStr>::Err: 'static + Send + Sync + ::core::fmt::Display,
{
    let key = key.as_ref();

    infer_string(key).and_then(|e| {
        e.parse()
            .map_err(|error| anyhow!("failed to parse the environment variable ({key}): {error}"))
    })
}

pub fn infer_string<K>(key: K) -> Result<String>
where
    K: AsRef<str>,
{
    let key = key.as_ref();

    ::std::env::var(key).map_err(|_| anyhow!("failed to find the environment variable: {key}"))
}

/// Like [`infer`], but an unset variable yields `default`.
///
/// A variable that is set but cannot be parsed is still an error.
pub fn infer_or<K, R>(key: K, default: R) -> Result<R>
where
    K: AsRef<str>,
    R: ::core::str::FromStr,
    <R as ::core::str::FromStr>::Err: 'static + Send + Sync + ::core::fmt::Display,
{
    let key = key.as_ref();

    if ::std::env::var_os(key).is_some() {
        infer(key)
    } else {
        Ok(default)
    }
}

/// Parses human-readable durations such as `15m`, `30s` or `7d`.
pub fn infer_duration_or<K>(key: K, default: Duration) -> Result<Duration>
where
    K: AsRef<str>,
{
    infer_or(key, DurationString::from(default)).map(Into::into)
}
