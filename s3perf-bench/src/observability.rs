//! Logging and remote metrics setup.

use std::env;
use std::io::{self, IsTerminal};

use secrecy::ExposeSecret;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, prelude::*};

use crate::config::{LogFormat, Logging, Metrics};

/// Initializes the global `merni` recorder if a Datadog key is configured.
///
/// All metrics are prefixed with `{service}.` and tagged with `service`. The returned flusher must
/// be flushed before the process exits, or the last interval is lost.
pub fn init_metrics(
    config: &Metrics,
    service: &'static str,
) -> io::Result<Option<merni::DatadogFlusher>> {
    config
        .datadog_key
        .as_ref()
        .map(|api_key| {
            let mut builder = merni::datadog(api_key.expose_secret().as_str())
                .prefix(&format!("{service}."))
                .global_tag("service", service);
            for (k, v) in &config.tags {
                builder = builder.global_tag(k, v);
            }
            builder.try_init()
        })
        .transpose()
}

/// Installs the global tracing subscriber writing to stderr.
pub fn init_tracing(config: &Logging) {
    let (level, env_filter) = parse_rust_log(config.level);

    let format = match config.format {
        LogFormat::Auto if io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(true);
    let layer = match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Simplified => layer.with_ansi(false).compact().boxed(),
        LogFormat::Pretty | LogFormat::Auto => layer.boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(level))
        .with(env_filter)
        .init();
}

/// Returns the effective level and the directive filter.
///
/// `RUST_LOG` may be a plain level, which replaces the configured one, or a full filter directive,
/// which is used literally.
fn parse_rust_log(configured: LevelFilter) -> (LevelFilter, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<Level>() {
            Ok(level) => LevelFilter::from(level),
            Err(_) => return (LevelFilter::TRACE, EnvFilter::new(value)),
        },
        Err(_) => configured,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "INFO,\
        s3perf_bench=TRACE,\
        s3perf_service=TRACE,\
        ",
    );

    (level, env_filter)
}
