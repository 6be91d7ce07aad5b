//! Shared `OpenTelemetry` metrics initialisation.
//!
//! This module is only compiled when the `metrics` Cargo feature is enabled.
//! It sets up the OTLP exporter for both traces and metrics, sending
//! telemetry to a configurable endpoint (e.g. an `OpenTelemetry` Collector),
//! and exposes the hub's counters.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

/// Errors that can occur during metrics / tracing pipeline initialisation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build an OTLP exporter.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Failed during `OTel` SDK shutdown or flush.
    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Opaque handle that keeps the `OpenTelemetry` providers alive.
///
/// When dropped, the providers are **not** shut down automatically -- call
/// [`MetricsGuard::shutdown`] for a graceful flush before exiting.
pub struct MetricsGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    pub const fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.tracer_provider
    }

    /// Gracefully shut down both providers, flushing any buffered telemetry.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Initialise the `OpenTelemetry` OTLP pipeline for traces **and** metrics.
///
/// * `endpoint` -- OTLP receiver URL, e.g. `"http://localhost:4317"` (gRPC).
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter)
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard {
        tracer_provider,
        meter_provider,
    })
}

/// Counters recorded by the hub.
#[derive(Clone)]
pub struct HubMetrics {
    pub agents_spawned: Counter<u64>,
    pub spawn_failures: Counter<u64>,
    pub events_published: Counter<u64>,
}

impl std::fmt::Debug for HubMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubMetrics").finish_non_exhaustive()
    }
}

impl HubMetrics {
    /// Instruments on the global meter. Before [`init_metrics`] they record into a no-op provider.
    pub fn new() -> Self {
        let meter = global::meter("hive-hub");
        Self {
            agents_spawned: meter.u64_counter("hive.agents.spawned").build(),
            spawn_failures: meter.u64_counter("hive.agents.spawn_failures").build(),
            events_published: meter.u64_counter("hive.events.published").build(),
        }
    }
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self::new()
    }
}
