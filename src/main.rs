//! playdap - Debug Adapter Protocol adapter for playbook runs.
//!
//! Talks DAP to the client over stdio, or over TCP with `--listen`, and drives a
//! debuggee that runs the playbook.

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{LevelFilter, info};
use playdap::adapter::session::SessionOptions;
use playdap::adapter::Session;
use playdap::dap::args::DEFAULT_CONNECT_TIMEOUT;
use playdap::dap::transport;
use playdap::debuggee::addr::SocketAddress;
use playdap::debuggee::launcher;
use playdap::log::LogConfig;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serve a single client over TCP on this address instead of stdio.
    #[clap(long)]
    listen: Option<String>,

    /// Log file for adapter diagnostics (default: stderr).
    #[clap(long, env = "PLAYDAP_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log level, overrides RUST_LOG.
    #[clap(long, env = "PLAYDAP_LOG_LEVEL")]
    log_level: Option<LevelFilter>,

    /// Trace DAP traffic (requests/responses/events) into the log at debug level.
    #[clap(long)]
    trace_dap: bool,

    /// Seconds to wait for the debuggee when the request does not set `connectTimeout`.
    #[clap(long, default_value_t = DEFAULT_CONNECT_TIMEOUT)]
    connect_timeout: f64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run a launched debuggee and report its exit to the adapter.
    #[command(hide = true)]
    Run {
        /// Address the adapter waits on for the exit report.
        #[clap(long)]
        exit_notify: String,

        /// Debuggee command line.
        #[clap(last = true, required = true)]
        command: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    playdap::log::init(&LogConfig {
        file: args.log_file.as_deref(),
        level: args.log_level,
    })
    .context("init logger")?;

    if let Some(Command::Run {
        exit_notify,
        command,
    }) = &args.command
    {
        let notify: SocketAddress = exit_notify
            .parse()
            .context("Invalid exit notification address")?;
        std::process::exit(launcher::run(&notify, command));
    }

    let options = SessionOptions {
        connect_timeout: args.connect_timeout,
    };

    match &args.listen {
        Some(listen) => {
            let addr: SocketAddr = listen.parse().context("Invalid listen address")?;
            let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
            info!(target: "dap", "playdap listening on {addr}");

            let (stream, peer) = listener.accept().context("accept DAP client")?;
            info!(target: "dap", "DAP client connected: {peer}");
            let (reader, writer) =
                transport::tcp(stream, args.trace_dap).context("init DAP I/O")?;
            Session::run(reader, writer, options);
        }
        None => {
            info!(target: "dap", "playdap serving on stdio");
            let (reader, writer) = transport::stdio(args.trace_dap);
            Session::run(reader, writer, options);
        }
    }
    Ok(())
}
