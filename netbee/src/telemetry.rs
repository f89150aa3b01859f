//! OpenTelemetry self-metrics export.
//!
//! ## OTLP Endpoint Priority
//! 1. `otel_exporter_otlp_endpoint` from settings (YAML file or environment)
//! 2. `OTEL_EXPORTER_OTLP_ENDPOINT` environment variable
//!
//! When neither is set, metrics are disabled and every `record_*` helper is
//! a no-op.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Meter, UpDownCounter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::sync::OnceLock;
use std::time::Duration;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<NetBeeMetrics> = OnceLock::new();

static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// netbee metrics collection
///
/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct NetBeeMetrics {
    pub parsed_request: Counter<u64>,
    pub tcp_connect: Counter<u64>,
    pub message_pair_size: UpDownCounter<i64>,
}

impl NetBeeMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            parsed_request: meter
                .u64_counter("netbee_parsed_request")
                .with_description("Number of request records emitted by the network analyzer")
                .with_unit("records")
                .build(),
            tcp_connect: meter
                .u64_counter("netbee_tcp_connect")
                .with_description("Number of finalized TCP connection attempts")
                .with_unit("connections")
                .build(),
            message_pair_size: meter
                .i64_up_down_counter("netbee_message_pair_size")
                .with_description("Live entries in the message pair store")
                .with_unit("pairs")
                .build(),
        }
    }
}

fn get_otlp_endpoint(configured: Option<&str>) -> Option<String> {
    let endpoint = match configured {
        Some(ep) if !ep.is_empty() => ep.to_string(),
        _ => std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?,
    };
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Exports to the OTLP collector via gRPC. Must be called inside a Tokio
/// runtime.
pub fn init_metrics(configured_endpoint: Option<&str>) -> Result<()> {
    let endpoint = match get_otlp_endpoint(configured_endpoint) {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "netbee"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("netbee");
    let _ = METRICS.set(NetBeeMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static NetBeeMetrics> {
    METRICS.get()
}

pub fn record_parsed_request(protocol: &str) {
    if let Some(m) = metrics() {
        m.parsed_request
            .add(1, &[KeyValue::new("protocol", protocol.to_string())]);
    }
}

pub fn record_tcp_connect(success: bool) {
    if let Some(m) = metrics() {
        m.tcp_connect.add(1, &[KeyValue::new("success", success)]);
    }
}

/// `l4` is `tcp` or `udp`.
pub fn record_message_pair_size(l4: &'static str, delta: i64) {
    if let Some(m) = metrics() {
        m.message_pair_size.add(delta, &[KeyValue::new("l4", l4)]);
    }
}

/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    info!("Shutting down OpenTelemetry metrics...");
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_not_set() {
        unsafe {
            std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        }
        assert!(get_otlp_endpoint(None).is_none());
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_empty() {
        unsafe {
            std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "");
        }
        assert!(get_otlp_endpoint(None).is_none());
        unsafe {
            std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        }
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_adds_http_prefix() {
        unsafe {
            std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "collector:4317");
        }
        assert_eq!(
            get_otlp_endpoint(None),
            Some("http://collector:4317".to_string())
        );
        unsafe {
            std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        }
    }

    #[test]
    #[serial]
    fn test_configured_endpoint_wins() {
        unsafe {
            std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "http://env:4317");
        }
        assert_eq!(
            get_otlp_endpoint(Some("https://cfg:4317")),
            Some("https://cfg:4317".to_string())
        );
        assert_eq!(
            get_otlp_endpoint(Some("")),
            Some("http://env:4317".to_string())
        );
        unsafe {
            std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        }
    }

    #[test]
    #[serial]
    fn test_init_without_endpoint_is_noop() {
        unsafe {
            std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        }
        assert!(init_metrics(None).is_ok());
        assert!(metrics().is_none());
        // Helpers must not panic while disabled.
        record_parsed_request("http");
        record_tcp_connect(true);
        record_message_pair_size("tcp", 1);
    }
}
