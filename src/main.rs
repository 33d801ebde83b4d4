mod backup;
mod buffer;
mod cli;
mod config;
mod error;
mod http;
mod instrumentation;
mod ipc;
mod journal;
mod metrics;
mod model;
mod parser;
mod retention;
mod runtime;
mod shutdown;
mod source;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    instrumentation::init_panic_handler();

    // Logging is initialized with a fixed fallback directory before the
    // configuration file is loaded, since a malformed/missing config is
    // itself something we need to be able to log about (spec.md §7 startup
    // faults). `runtime::run` re-initializes nothing further; this is the
    // one-time global subscriber install.
    let log_dir = config::default_log_dir();
    instrumentation::init_tracing(&log_dir);

    // Main entrypoint simply delegates control to the CLI layer, mirroring
    // the teacher's main.rs.
    cli::run().await
}
