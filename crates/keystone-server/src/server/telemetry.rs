//! # Telemetry Features
//!
//! Logs always go to the console through `tracing_subscriber::fmt`. Export to
//! an OpenTelemetry backend is opt-in.
//!
//! ## Feature matrix
//!
//! - `tracing`: OpenTelemetry distributed tracing (spans).
//! - `metrics`: OpenTelemetry metrics (counters, histograms).
//! - `otlp`: OTLP/gRPC exporter, configured from `OTLP_ENDPOINT`,
//!   `OTLP_COMPRESSION` and optionally `OTLP_API_KEY`.
//! - `stdout`: stdout exporter.
//!
//! Exporters require at least one of `tracing` or `metrics`.
//!
//! ## Metrics
//!
//! - `tasks_submitted` / `tasks_failed`, by task kind.
//! - `tasks_inflight`: requests waiting on a task.
//! - `task_duration`: end-to-end request duration in milliseconds.
//! - `allocator_refills`: authority round trips, by allocator.
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --features tracing,metrics,otlp
//! cargo run --features tracing,stdout
//! ```

#[cfg(all(feature = "otlp", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'tracing' or 'metrics' to be enabled.");

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use keystone::{IdAllocator, TaskKind, TimestampAllocator};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "tracing")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "otlp", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(feature = "otlp")]
use tonic::metadata::MetadataMap;
#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "tracing")))]
use tonic::transport::ClientTlsConfig;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, ObservableCounter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down the exporters. Errors go to stderr since the
    /// subscriber may already be gone.
    pub fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder("keystone")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        );

    #[cfg(feature = "tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "otlp")]
fn get_metadata() -> anyhow::Result<MetadataMap> {
    use anyhow::Context;

    let mut map = MetadataMap::new();
    if let Ok(api_key) = std::env::var("OTLP_API_KEY") {
        map.insert("x-api-key", api_key.parse().context("invalid API key")?);
    }
    Ok(map)
}

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "tracing")))]
fn otlp_settings() -> anyhow::Result<(String, Compression)> {
    use anyhow::Context;
    use std::str::FromStr;

    let endpoint = std::env::var("OTLP_ENDPOINT").context("missing `OTLP_ENDPOINT`")?;
    let raw = std::env::var("OTLP_COMPRESSION")
        .unwrap_or_else(|_| "gzip".to_string())
        .to_ascii_lowercase();
    Ok((endpoint, Compression::from_str(&raw)?))
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("keystone")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let (endpoint, compression) = otlp_settings()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(get_metadata()?)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(compression)
            .with_endpoint(endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let batch = sdktrace::BatchSpanProcessor::builder(SpanExporter::default())
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let (endpoint, compression) = otlp_settings()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(get_metadata()?)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(compression)
            .with_endpoint(endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;

        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();

        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static METER: OnceLock<Meter> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASKS_SUBMITTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASKS_FAILED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASKS_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASK_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ALLOCATOR_REFILLS: OnceLock<ObservableCounter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = TASKS_SUBMITTED.set(
        meter
            .u64_counter("tasks_submitted")
            .with_description("Tasks accepted by the scheduler")
            .build(),
    );

    let _ = TASKS_FAILED.set(
        meter
            .u64_counter("tasks_failed")
            .with_description("Tasks that ended in an error")
            .build(),
    );

    let _ = TASKS_INFLIGHT.set(
        meter
            .i64_up_down_counter("tasks_inflight")
            .with_description("Requests waiting on a task")
            .build(),
    );

    let _ = TASK_DURATION_MS.set(
        meter
            .f64_histogram("task_duration")
            .with_unit("ms")
            .with_description("End-to-end task duration")
            .build(),
    );

    let _ = METER.set(meter);
}

#[cfg(feature = "metrics")]
fn kind_attr(kind: TaskKind) -> [KeyValue; 1] {
    [KeyValue::new("kind", kind.as_str())]
}

#[cfg(feature = "metrics")]
pub fn increment_tasks_submitted(kind: TaskKind) {
    if let Some(counter) = TASKS_SUBMITTED.get() {
        counter.add(1, &kind_attr(kind));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_submitted(_kind: TaskKind) {}

#[cfg(feature = "metrics")]
pub fn increment_tasks_failed(kind: TaskKind) {
    if let Some(counter) = TASKS_FAILED.get() {
        counter.add(1, &kind_attr(kind));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_failed(_kind: TaskKind) {}

#[cfg(feature = "metrics")]
pub fn increment_tasks_inflight() {
    if let Some(counter) = TASKS_INFLIGHT.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_inflight() {}

#[cfg(feature = "metrics")]
pub fn decrement_tasks_inflight() {
    if let Some(counter) = TASKS_INFLIGHT.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_tasks_inflight() {}

#[cfg(feature = "metrics")]
pub fn record_task_duration(kind: TaskKind, duration_ms: f64) {
    if let Some(histogram) = TASK_DURATION_MS.get() {
        histogram.record(duration_ms, &kind_attr(kind));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_task_duration(_kind: TaskKind, _duration_ms: f64) {}

/// Reports allocator round trips on every metrics collection. Called once the
/// coordinator has started.
#[cfg(feature = "metrics")]
pub fn observe_allocator_refills(ids: Arc<IdAllocator>, timestamps: Arc<TimestampAllocator>) {
    let Some(meter) = METER.get() else {
        return;
    };
    let counter = meter
        .u64_observable_counter("allocator_refills")
        .with_description("Batches leased from the authority")
        .with_callback(move |observer| {
            observer.observe(ids.stats().refills(), &[KeyValue::new("allocator", "id")]);
            observer.observe(
                timestamps.stats().refills(),
                &[KeyValue::new("allocator", "timestamp")],
            );
        })
        .build();
    let _ = ALLOCATOR_REFILLS.set(counter);
}

#[cfg(not(feature = "metrics"))]
pub fn observe_allocator_refills(_ids: Arc<IdAllocator>, _timestamps: Arc<TimestampAllocator>) {}
