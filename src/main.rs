//! tapline - recording man-in-the-middle proxy
//!
//! Accepts clients on a loopback port, forwards their bytes to a fixed
//! upstream after a minimal HTTP request rewrite, and writes a
//! tab-separated trace of every protocol-level event to stdout.

mod error;
mod proxy;
mod timing;
mod trace;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::error::SetupError;
use crate::proxy::Proxy;
use crate::timing::Timers;
use crate::trace::TraceWriter;

/// Recording man-in-the-middle proxy for HTTP/1.x and WebSocket traffic
#[derive(Parser, Debug)]
#[command(name = "tapline", about = "Recording man-in-the-middle proxy for HTTP/1.x and WebSocket traffic", long_about = None)]
struct Cli {
    /// Port to listen on (loopback only)
    listen_port: u16,

    /// Upstream destination as host:port
    upstream: String,
}

fn main() -> Result<()> {
    let cli = parse_args();
    init_logging();

    let timers = Arc::new(Timers::new());
    timers.runtime.start();
    install_signal_handler(timers.clone())?;

    let upstream_addr = resolve_upstream(&cli.upstream)?;
    let trace = TraceWriter::stdout(timers.clone());
    let mut proxy = Proxy::bind(
        cli.listen_port,
        upstream_addr,
        cli.upstream.clone(),
        trace,
        timers,
    )?;

    tracing::info!(
        port = cli.listen_port,
        upstream = %cli.upstream,
        resolved = %upstream_addr,
        "tapline listening"
    );
    proxy.run()
}

fn parse_args() -> Cli {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            std::process::exit(0);
        }
        Err(_) => usage_exit(),
    };
    // the upstream argument must at least look like host:port
    match cli.upstream.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => cli,
        _ => usage_exit(),
    }
}

fn usage_exit() -> ! {
    eprintln!("usage: tapline <listen_port> <upstream_host:upstream_port>");
    std::process::exit(1);
}

/// Diagnostics go to stderr; stdout carries only the trace stream.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// SIGINT/SIGTERM stop the runtime clock, print the timing summary to
/// stderr and exit cleanly.
fn install_signal_handler(timers: Arc<Timers>) -> Result<()> {
    ctrlc::set_handler(move || {
        timers.runtime.stop();
        let mut err = io::stderr();
        let _ = timers.write_summary(&mut err);
        std::process::exit(0);
    })
    .context("failed to install signal handler")
}

/// Resolve the upstream exactly once at startup.
fn resolve_upstream(upstream: &str) -> Result<SocketAddr, SetupError> {
    let mut addrs = upstream
        .to_socket_addrs()
        .map_err(|source| SetupError::Resolve {
            addr: upstream.to_owned(),
            source,
        })?;
    addrs.next().ok_or_else(|| SetupError::NoAddress {
        addr: upstream.to_owned(),
    })
}
