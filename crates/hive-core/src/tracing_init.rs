//! Shared tracing/logging initialization.
//!
//! Both hive-hub and hive-mcp set up `tracing_subscriber` with an env-filter
//! and optional JSON output. hive-mcp must log to stderr because stdout
//! carries the JSON-RPC stream.

use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Destination for formatted log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogWriter {
    #[default]
    Stdout,
    Stderr,
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()))
}

fn fmt_layer<S>(log_json: bool, writer: LogWriter) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer();
    match (log_json, writer) {
        (true, LogWriter::Stdout) => layer.json().boxed(),
        (true, LogWriter::Stderr) => layer.json().with_writer(std::io::stderr).boxed(),
        (false, LogWriter::Stdout) => layer.boxed(),
        (false, LogWriter::Stderr) => layer.with_writer(std::io::stderr).with_ansi(false).boxed(),
    }
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"hive_hub=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
/// * `writer` -- where formatted lines go.
pub fn init_tracing(default_filter: &str, log_json: bool, writer: LogWriter) {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(fmt_layer(log_json, writer))
        .init();
}

/// Like [`init_tracing`], additionally exporting spans and metrics over OTLP
/// when `endpoint` is set. The returned guard must live until exit.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    writer: LogWriter,
    endpoint: Option<&str>,
) -> Option<crate::metrics::MetricsGuard> {
    use opentelemetry::trace::TracerProvider as _;

    let Some(endpoint) = endpoint else {
        init_tracing(default_filter, log_json, writer);
        return None;
    };

    match crate::metrics::init_metrics(endpoint) {
        Ok(guard) => {
            let tracer = guard.tracer_provider().tracer("hive");
            tracing_subscriber::registry()
                .with(env_filter(default_filter))
                .with(fmt_layer(log_json, writer))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
            tracing::info!(endpoint, "OpenTelemetry export enabled");
            Some(guard)
        }
        Err(e) => {
            init_tracing(default_filter, log_json, writer);
            tracing::warn!(endpoint, error = %e, "OpenTelemetry export disabled");
            None
        }
    }
}
