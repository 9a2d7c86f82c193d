mod bridge;
mod capabilities;
mod config;
mod engine;
mod frame;
mod headers;
mod protocol;

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::bridge::ExecutionBridge;
use crate::capabilities::CapabilityScope;
use crate::config::Config;
use crate::engine::IsolateEngine;
use crate::frame::StdoutPort;

fn print_help() {
    println!(
        "\
frame-sandbox v{}

Cross-origin code execution sandbox. Renders component code posted by a
trusted parent frame and reports the result back to it.

USAGE:
    frame-sandbox [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/sandbox.toml]

OPTIONS:
    -h, --help         Print this help message and exit
    -V, --version      Print version and exit
        --print-headers
                       Print the response headers for the sandbox page and exit

TRANSPORT:
    stdin     One message event per line: {{\"origin\": ..., \"data\": ...}}
    stdout    One post per line: {{\"targetOrigin\": ..., \"message\": ...}}
    stderr    Logs

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, frame_sandbox=debug,warn)

EXAMPLES:
    frame-sandbox                              # uses config/sandbox.toml
    frame-sandbox /etc/sandbox/sandbox.toml    # custom config path
    frame-sandbox --print-headers              # headers for the web server
    RUST_LOG=debug frame-sandbox               # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let mut config_path = None;
    let mut print_headers = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("frame-sandbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--print-headers" => print_headers = true,
            flag if flag.starts_with('-') => bail!("Unknown option: {flag} (see --help)"),
            path => config_path = Some(path.to_string()),
        }
    }

    // stdout carries the message channel, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("frame_sandbox=info")),
        )
        .init();

    let config_path = config_path.unwrap_or_else(|| "config/sandbox.toml".to_string());
    info!("Loading configuration from {config_path}");
    let config = Arc::new(Config::load(&config_path)?);

    if print_headers {
        for (name, value) in headers::security_headers(&config) {
            println!("{name}: {value}");
        }
        return Ok(());
    }

    info!("frame-sandbox v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Allowed origins: {}",
        config.sandbox.allowed_origins.join(", ")
    );
    info!(
        "Engine: timeout {}ms, heap {}MB, max source {} bytes",
        config.engine.timeout_ms, config.engine.max_heap_mb, config.engine.max_code_size
    );

    let scope = Arc::new(CapabilityScope::builder().register_builtins().build()?);
    info!(
        "Capabilities: {}",
        scope.symbols().collect::<Vec<_>>().join(", ")
    );

    let engine = Arc::new(IsolateEngine::new(config.engine.clone()));
    let port = Arc::new(StdoutPort::new());
    let bridge = ExecutionBridge::new(config.clone(), scope, engine, port);
    let listener = frame::stdio::attach_stdin();

    tokio::select! {
        result = bridge.run(listener) => {
            if let Err(e) = &result {
                error!("Bridge error: {e}");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            Ok(())
        }
    }
}
