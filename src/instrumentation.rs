//! Structured logging and panic reporting setup.

use std::panic;
use std::path::Path;

use tracing_appender::rolling;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    filter::{Directive, EnvFilter},
    fmt,
    prelude::*,
    registry::Registry,
};

/// Installs the global `tracing` subscriber: a human-readable layer, a JSON
/// layer (for container log collection), and an error layer that lets
/// `anyhow` chains carry span traces. Both fmt layers write through a
/// minutely-rolling file appender under `log_dir`.
pub fn init_tracing(log_dir: &Path) {
    let file_appender = rolling::minutely(log_dir, "lotus.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked on purpose: the guard must outlive the process for the
    // non-blocking writer to flush on exit, and `init_tracing` runs exactly
    // once at startup.
    std::mem::forget(guard);

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Ok(directive) = "lotus=debug".parse::<Directive>() {
        filter = filter.add_directive(directive);
    }

    let fmt_layer = fmt::layer()
        .with_ansi(true)
        .with_writer(non_blocking_writer.clone())
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let json_layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let error_layer = ErrorLayer::default();

    let subscriber = Registry::default().with(filter).with(fmt_layer).with(json_layer).with(error_layer);

    // tokio-console needs the runtime built with --cfg tokio_unstable; outside
    // that build the layer is left out entirely rather than attached inert.
    #[cfg(tokio_unstable)]
    let subscriber = subscriber.with(console_subscriber::ConsoleLayer::builder().spawn());

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber already initialized, skipping");
    }
}

/// Installs a panic hook that logs panics as structured `tracing` events
/// instead of letting them print raw to stderr, so they land in the same
/// log stream as everything else.
pub fn init_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => (*s).to_string(),
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => s.clone(),
                None => "unknown panic payload".to_string(),
            },
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        tracing::error!(message = %msg, location = %location, "process panicked");
    }));
}
