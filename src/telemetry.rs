//! Logging bootstrap and meter instruments.
//!
//! Instruments go through the OpenTelemetry global meter; without an
//! installed provider they are no-ops, so library code records freely and
//! the process decides whether anything is exported.

use crate::config::LoggingConfig;
use crate::{Error, Result};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct HttpInstruments {
    request_count: Counter<u64>,
    request_duration_seconds: Histogram<f64>,
    request_errors: Counter<u64>,
}

struct WriteInstruments {
    points_written: Counter<u64>,
}

fn http_instruments() -> &'static HttpInstruments {
    static INSTRUMENTS: OnceLock<HttpInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("meridian.api.http");
        HttpInstruments {
            request_count: meter
                .u64_counter("http.server.request.count")
                .with_description("Total number of HTTP requests handled")
                .build(),
            request_duration_seconds: meter
                .f64_histogram("http.server.request.duration")
                .with_description("HTTP request duration")
                .with_unit("s")
                .build(),
            request_errors: meter
                .u64_counter("http.server.request.errors")
                .with_description("HTTP requests with 4xx/5xx status codes")
                .build(),
        }
    })
}

fn write_instruments() -> &'static WriteInstruments {
    static INSTRUMENTS: OnceLock<WriteInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("meridian.write");
        WriteInstruments {
            points_written: meter
                .u64_counter("write.points")
                .with_description("Points accepted by the write pipeline")
                .build(),
        }
    })
}

/// Record one handled HTTP request.
pub fn record_http_request(method: &str, route: &str, status: u16, duration_seconds: f64) {
    let attrs = [
        KeyValue::new("http.request.method", method.to_string()),
        KeyValue::new("http.route", route.to_string()),
        KeyValue::new("http.response.status_code", status as i64),
    ];
    let instruments = http_instruments();
    instruments.request_count.add(1, &attrs);
    instruments
        .request_duration_seconds
        .record(duration_seconds, &attrs);
    if status >= 400 {
        instruments.request_errors.add(1, &attrs);
    }
}

/// Record points accepted by the write pipeline.
pub fn record_points_written(database: &str, count: u64) {
    let attrs = [KeyValue::new("database", database.to_string())];
    write_instruments().points_written.add(count, &attrs);
}

/// Install the tracing subscriber for a server process.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| Error::Config(format!("bad log level {:?}: {e}", config.level)))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match config.file.as_str() {
        "stderr" => builder.with_writer(std::io::stderr).init(),
        "stdout" => builder.with_writer(std::io::stdout).init(),
        path => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder.with_writer(std::sync::Arc::new(file)).init()
        }
    }
    Ok(())
}
