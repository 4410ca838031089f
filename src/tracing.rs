use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    trace::{SdkTracerProvider, TracerProviderBuilder},
    Resource,
};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::config::StelvioConfig;

/// Providers that must be flushed before the process exits.
#[derive(Default)]
pub struct TelemetryProviders {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryProviders {
    pub fn shutdown(self) {
        if let Some(tracer_provider) = self.tracer_provider {
            if let Err(err) = tracer_provider.force_flush() {
                error!("Error flushing traces: {:?}", err);
            }
            if let Err(err) = tracer_provider.shutdown() {
                error!("Error shutting down tracer provider: {:?}", err);
            }
        }
        if let Some(meter_provider) = self.meter_provider {
            if let Err(err) = meter_provider.shutdown() {
                error!("Error shutting down meter provider: {:?}", err);
            }
        }
    }
}

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG used to control logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

// Logs go to stderr; stdout is reserved for command output.
pub fn get_log_layer<S>(config: &StelvioConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging() {
        return Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        );
    }

    Box::new(
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr),
    )
}

fn resource(config: &StelvioConfig) -> Resource {
    Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "stelvio"))
        .with_attribute(KeyValue::new("service.name", "stlv"))
        .with_attribute(KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        ))
        .with_attribute(KeyValue::new("stelvio.app", config.app.clone()))
        .with_attribute(KeyValue::new("stelvio.env", config.env.clone()))
        .build()
}

pub fn setup_tracing(config: &StelvioConfig) -> Result<TelemetryProviders> {
    let env_filter_layer = get_env_filter();
    let log_layer = get_log_layer(config);
    let subscriber =
        tracing_subscriber::Registry::default().with(log_layer.with_filter(env_filter_layer));

    let meter_provider = setup_metrics(config)?;

    if !config.telemetry.enable_tracing {
        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            error!("logger was already initiated, continuing: {:?}", e);
        }
        return Ok(TelemetryProviders {
            tracer_provider: None,
            meter_provider,
        });
    }

    let mut span_exporter = SpanExporter::builder().with_tonic();
    if let Some(endpoint) = &config.telemetry.endpoint {
        span_exporter = span_exporter.with_endpoint(endpoint.clone());
    }
    let span_exporter = span_exporter.build()?;

    let tracer_provider = TracerProviderBuilder::default()
        .with_resource(resource(config))
        .with_batch_exporter(span_exporter)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let tracer = tracer_provider.tracer("stlv");
    let subscriber = subscriber.with(tracing_opentelemetry::layer().with_tracer(tracer));
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("logger was already initiated, continuing: {:?}", e);
    }

    Ok(TelemetryProviders {
        tracer_provider: Some(tracer_provider),
        meter_provider,
    })
}

fn setup_metrics(config: &StelvioConfig) -> Result<Option<SdkMeterProvider>> {
    if !config.telemetry.enable_metrics {
        return Ok(None);
    }

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = &config.telemetry.endpoint {
        exporter = exporter.with_endpoint(endpoint.clone());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter).build();
    let provider = SdkMeterProvider::builder()
        .with_resource(resource(config))
        .with_reader(reader)
        .build();
    global::set_meter_provider(provider.clone());
    Ok(Some(provider))
}
