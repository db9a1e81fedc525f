use std::{env, ffi::OsStr};

#[cfg(feature = "otlp")]
use opentelemetry_otlp as otlp;
use tracing::{dispatcher, warn, Subscriber};
use tracing_subscriber::{
    layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, Layer, Registry,
};

const KEY: &str = "RUST_LOG";

fn init_once_opentelemetry(export: bool) {
    #[cfg(feature = "otlp")]
    use opentelemetry_sdk::runtime::Tokio as Runtime;

    // Skip init if has been set
    if dispatcher::has_been_set() {
        return;
    }

    // Set default service name
    {
        const SERVICE_NAME_KEY: &str = "OTEL_SERVICE_NAME";
        const SERVICE_NAME_VALUE: &str = "catalog-controller";

        if env::var_os(SERVICE_NAME_KEY).is_none() {
            env::set_var(SERVICE_NAME_KEY, SERVICE_NAME_VALUE);
        }
    }

    #[cfg(feature = "otlp")]
    fn init_otlp_pipeline() -> otlp::TonicExporterBuilder {
        otlp::new_exporter().tonic()
    }

    fn init_layer_env_filter<S>() -> impl Layer<S>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        ::tracing_subscriber::EnvFilter::from_default_env()
    }

    fn init_layer_stdfmt<S>() -> impl Layer<S>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        ::tracing_subscriber::fmt::layer()
    }

    #[cfg(feature = "logs")]
    fn init_layer_otlp_logger<S>(failures: &mut Vec<String>) -> Option<impl Layer<S>>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        otlp::new_pipeline()
            .logging()
            .with_exporter(init_otlp_pipeline())
            .install_batch(Runtime)
            .map(|provider| {
                ::opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&provider)
            })
            .map_err(|error| failures.push(format!("failed to init a logger: {error}")))
            .ok()
    }

    #[cfg(feature = "metrics")]
    fn init_layer_otlp_metrics<S>(failures: &mut Vec<String>) -> Option<impl Layer<S>>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        otlp::new_pipeline()
            .metrics(Runtime)
            .with_exporter(init_otlp_pipeline())
            .build()
            .map(::tracing_opentelemetry::MetricsLayer::new)
            .map_err(|error| failures.push(format!("failed to init a metrics: {error}")))
            .ok()
    }

    #[cfg(feature = "trace")]
    fn init_layer_otlp_tracer<S>(failures: &mut Vec<String>) -> Option<impl Layer<S>>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        otlp::new_pipeline()
            .tracing()
            .with_exporter(init_otlp_pipeline())
            .install_batch(Runtime)
            .map(::tracing_opentelemetry::OpenTelemetryLayer::new)
            .map_err(|error| failures.push(format!("failed to init a tracer: {error}")))
            .ok()
    }

    #[allow(unused_mut)]
    let mut failures: Vec<String> = Vec::default();

    let layer = Registry::default()
        .with(init_layer_env_filter())
        .with(init_layer_stdfmt());

    if export {
        #[cfg(feature = "logs")]
        let layer = layer.with(init_layer_otlp_logger(&mut failures));
        #[cfg(feature = "metrics")]
        let layer = layer.with(init_layer_otlp_metrics(&mut failures));
        #[cfg(feature = "trace")]
        let layer = layer.with(init_layer_otlp_tracer(&mut failures));

        layer.init()
    } else {
        layer.init()
    }

    // The exporters are optional; the process keeps logging to stdout without them.
    for failure in failures {
        warn!("{failure}");
    }
}

pub fn init_once() {
    init_once_with_default(true)
}

pub fn init_once_with(level: impl AsRef<OsStr>, export: bool) {
    // Skip init if has been set
    if dispatcher::has_been_set() {
        return;
    }

    // set custom tracing level
    env::set_var(KEY, level);

    init_once_opentelemetry(export)
}

pub fn init_once_with_default(export: bool) {
    // Skip init if has been set
    if dispatcher::has_been_set() {
        return;
    }

    // set default tracing level
    if env::var_os(KEY).is_none() {
        env::set_var(KEY, "INFO");
    }

    init_once_opentelemetry(export)
}
