use opentelemetry::trace::TraceId;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;
    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

#[cfg(feature = "telemetry")]
async fn init_tracer() -> anyhow::Result<opentelemetry::sdk::trace::Tracer> {
    use anyhow::Context;
    use opentelemetry_otlp::WithExportConfig;

    let otlp_endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL")
        .context("OPENTELEMETRY_ENDPOINT_URL must be set to use the telemetry feature")?;

    let channel = tonic::transport::Channel::from_shared(otlp_endpoint)
        .context("invalid OPENTELEMETRY_ENDPOINT_URL")?
        .connect()
        .await
        .context("failed to connect to the OTLP collector")?;

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_channel(channel))
        .with_trace_config(opentelemetry::sdk::trace::config().with_resource(
            opentelemetry::sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                "service.name",
                "naptime-controller",
            )]),
        ))
        .install_batch(opentelemetry::runtime::Tokio)
        .context("failed to install the OTLP tracer")?;
    Ok(tracer)
}

/// Initialize tracing & logging
pub async fn init() -> anyhow::Result<()> {
    let logger = tracing_subscriber::fmt::layer().compact();
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    // Decide on layers
    #[cfg(feature = "telemetry")]
    let collector = {
        let telemetry = tracing_opentelemetry::layer().with_tracer(init_tracer().await?);
        Registry::default().with(telemetry).with(logger).with(env_filter)
    };
    #[cfg(not(feature = "telemetry"))]
    let collector = Registry::default().with(logger).with(env_filter);

    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}
