use anyhow::{Context, Result};
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const SERVICE_NAME: &str = "entry";
const OTEL_STDOUT_ENV: &str = "ENTRY_OTEL_STDOUT";
const LOG_ENV: &str = "ENTRY_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

/// What the process-wide subscriber should look like. `RUST_LOG` still wins
/// over `log_filter` when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryOptions {
    pub log_filter: String,
    pub otel_stdout: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            otel_stdout: false,
        }
    }
}

impl TelemetryOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_filter = lookup(LOG_ENV)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        Self {
            log_filter,
            otel_stdout: lookup(OTEL_STDOUT_ENV).is_some_and(|value| truthy(&value)),
        }
    }
}

/// Process-wide logging and metrics. Keep it alive for the life of the
/// server; dropping it flushes the span exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(options: &TelemetryOptions) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_gateway_metrics();

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&options.log_filter))
            .with_context(|| format!("invalid log filter: {}", options.log_filter))?;
        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false));

        let tracer_provider = if options.otel_stdout {
            let provider = session_tracer_provider();
            let tracer = provider.tracer(SERVICE_NAME);
            global::set_tracer_provider(provider.clone());
            registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            info!("session spans exported to stdout ({OTEL_STDOUT_ENV})");
            Some(provider)
        } else {
            registry
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            None
        };

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "span exporter did not shut down cleanly");
            }
        }
    }
}

fn session_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn describe_gateway_metrics() {
    describe_counter!("entry_sessions_total", "Sessions accepted, by mode.");
    describe_counter!(
        "entry_setup_failures_total",
        "Sessions whose exec or attach could not be set up, by mode."
    );
    describe_counter!(
        "entry_handshake_failures_total",
        "Connections dropped before a session started, by reason."
    );
    describe_counter!("entry_frames_relayed_total", "Output frames sent to clients, by stream.");
    describe_counter!("entry_bytes_relayed_total", "Output bytes sent to clients, by stream.");
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
