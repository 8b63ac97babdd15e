//! Standalone skep node.
//!
//! Loads a node config (or synthesizes a single-echo-service node when no
//! config is given), brings up the worker pool, and runs until a signal or
//! a fatal condition stops it. The process exit code is zero on graceful
//! shutdown, non-zero on fatal bootstrap failure.

mod args;
mod echo;

use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::Parser;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter};

use skep_runtime::{Error, NodeConfig, ServerBuilder, ServiceConfig};

use args::Args;
use echo::Echo;

fn main() {
    let args = Args::parse();

    let node = match load_node(&args) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };

    enable_logging(&args, &node);

    let builder = ServerBuilder::new(node)
        .register("echo", Echo::from_config)
        .stats_interval(Duration::from_secs(args.stats_interval.max(1)));

    let server = match builder.build() {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    let router = server.router();
    ctrlc::set_handler(move || {
        info!("received Ctrl-C, stopping");
        router.stop(0);
    })
    .expect("error setting Ctrl-C handler");

    let code = server.run();
    info!("server finished with code {code}");
    std::process::exit(code);
}

fn load_node(args: &Args) -> Result<NodeConfig, Error> {
    let mut node = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            NodeConfig::load(&json, args.sid)?
        }
        None => {
            // No config: a single echo service, handy for smoke testing.
            let mut node = NodeConfig::new(args.sid, "skep", default_threads());
            node.services.push(
                ServiceConfig::new("echo", "echo")
                    .with_extra("host", json!("0.0.0.0"))
                    .with_extra("port", json!(args.port)),
            );
            node
        }
    };

    if let Some(threads) = args.thread {
        node.thread = threads;
    }
    Ok(node)
}

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get())
}

fn enable_logging(args: &Args, node: &NodeConfig) {
    let level = if args.quiet {
        tracing::Level::ERROR
    } else {
        match args.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            2.. => tracing::Level::TRACE,
        }
    };
    let filters = filter::Targets::new().with_default(level);

    let log_path = node.log_path(&today());
    match log_path.and_then(|path| File::create(&path).ok().map(|f| (path, f))) {
        Some((path, file)) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .with_filter(filters);
            tracing_subscriber::registry().with(layer).init();
            info!("logging to {path}");
        }
        None => {
            let layer = tracing_subscriber::fmt::layer().compact().with_filter(filters);
            tracing_subscriber::registry().with(layer).init();
        }
    }
}

fn today() -> String {
    time_format::from_system_time(SystemTime::now())
        .ok()
        .and_then(|ts| time_format::strftime_utc("%Y%m%d", ts).ok())
        .unwrap_or_else(|| "00000000".to_string())
}
