//! Global `tracing` setup for labmesh processes.
//!
//! Call [`init_tracing`] once at process startup.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL (e.g. `http://localhost:4318`). When set, spans are exported over OTLP/HTTP. |
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `LABMESH_LOG_FORMAT=json` | Emit newline-delimited JSON logs. |
//!
//! Worker processes additionally pass an [`OutputCapture`] so that their log
//! lines are republished on the stdout/stderr topics.
//!
//! ```rust,no_run
//! let capture = labmesh_runtime::capture::OutputCapture::new();
//! let _guard = labmesh_runtime::telemetry::init_tracing("labmesh-worker", Some(&capture));
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::capture::OutputCapture;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Install the global subscriber.
///
/// The console formatter is always on; the OTLP exporter only when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set; the capture layer only when
/// `capture` is given.  Calling this twice leaves the first subscriber in
/// place.
///
/// The returned [`TracerProviderGuard`] must be held for the lifetime of the
/// process; dropping it flushes pending spans.
pub fn init_tracing(service_name: &str, capture: Option<&OutputCapture>) -> TracerProviderGuard {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let use_json = std::env::var("LABMESH_LOG_FORMAT").as_deref() == Ok("json");

    let provider = build_provider(service_name);

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if let Some(ref p) = provider {
        let tracer = p.tracer("labmesh");
        layers.push(tracing_opentelemetry::layer().with_tracer(tracer).boxed());
    }
    if use_json {
        layers.push(tracing_subscriber::fmt::layer().json().boxed());
    } else {
        layers.push(tracing_subscriber::fmt::layer().compact().boxed());
    }
    if let Some(capture) = capture {
        layers.push(capture.layer().boxed());
    }

    if tracing_subscriber::registry()
        .with(layers.with_filter(env_filter))
        .try_init()
        .is_err()
    {
        eprintln!("[labmesh] a global tracing subscriber was already installed");
    }

    TracerProviderGuard(provider)
}

// ─────────────────────────────────────────────────────────────────────────────
// RAII guard
// ─────────────────────────────────────────────────────────────────────────────

/// Shuts the OTel [`SdkTracerProvider`] down on drop, flushing pending
/// spans.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("[labmesh] OpenTelemetry provider shutdown error: {e}");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal helpers
// ─────────────────────────────────────────────────────────────────────────────

fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[labmesh] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder().with_service_name(service_name.to_string()).build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            // Synchronous export: workers create their Tokio runtime only
            // after tracing is initialised.
            .with_simple_exporter(exporter)
            .build(),
    )
}
