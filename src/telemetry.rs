//! Logging and OpenTelemetry export
//!
//! `init_logging` always installs an env-filtered fmt subscriber; when OTLP
//! is enabled a tracing-opentelemetry layer exporting spans is stacked on top.

use opentelemetry::trace::TracerProvider;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{propagation::TraceContextPropagator, runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::Config;
use crate::error::{Result, SyncError};

const DEFAULT_FILTER: &str = "airstream=info";

/// Flushes and shuts down the tracer provider on drop.
pub struct OtelGuard;

impl Drop for OtelGuard {
    fn drop(&mut self) {
        global::shutdown_tracer_provider();
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Returns a guard only when OTLP export is on.
pub fn init_logging(config: &Config) -> Result<Option<OtelGuard>> {
    if config.otlp_enabled {
        return init_telemetry("airstream").map(Some);
    }
    Registry::default()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| SyncError::Config(format!("logging already initialized: {e}")))?;
    Ok(None)
}

pub fn init_telemetry(service_name: &str) -> Result<OtelGuard> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .build_span_exporter()
        .map_err(|e| SyncError::Config(format!("OTLP exporter: {e}")))?;

    let trace_config = sdktrace::Config::default().with_resource(Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]));

    let provider = sdktrace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(trace_config)
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer(service_name.to_string());
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    Registry::default()
        .with(env_filter())
        .with(telemetry)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| SyncError::Config(format!("logging already initialized: {e}")))?;

    Ok(OtelGuard)
}
