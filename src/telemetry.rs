//! Tracing / OpenTelemetry initialization.
//!
//! Mirrors `knhk-cli/src/tracing.rs`'s dual no-op-vs-OTLP tracer provider
//! construction, driven off `LOG_LEVEL` and `OTEL_EXPORTER_OTLP_ENDPOINT`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global `tracing` subscriber. Safe to call once at
/// process startup; subsequent calls are ignored.
pub fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    };

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        match build_otel_layer(&endpoint) {
            Ok(otel_layer) => {
                let _ = registry.with(otel_layer).try_init();
                return;
            }
            Err(e) => {
                eprintln!("warning: failed to initialize OTLP exporter: {e}");
            }
        }
    }

    let _ = registry.try_init();
}

fn build_otel_layer(
    endpoint: &str,
) -> Result<tracing_opentelemetry::OpenTelemetryLayer<tracing_subscriber::Registry, opentelemetry_sdk::trace::Tracer>, String> {
    use opentelemetry::global;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{trace::Config, Resource};
    use opentelemetry_semantic_conventions::resource::SERVICE_NAME;

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "conductor-core".to_string());
    let resource = Resource::new(vec![SERVICE_NAME.string(service_name)]);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(Config::default().with_resource(resource))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(|e| e.to_string())?;

    global::set_tracer_provider(tracer.provider().ok_or("missing tracer provider")?);
    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}
