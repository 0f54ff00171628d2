//! The `spliced` daemon: loads the configuration, sets up logging, runs the
//! proxy on a single-threaded reactor, and waits for a shutdown signal.

use std::env;
use std::path::PathBuf;
use std::process;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::LocalSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use spliced::{Proxy, ProxyConfig};

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let path = match env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => {
            eprintln!("usage: spliced <config-file>");
            return 2;
        }
    };
    let config = match ProxyConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("spliced: {}", err);
            return 2;
        }
    };

    init_logging(&config.log);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to build runtime: {}", err);
            return 1;
        }
    };

    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        let proxy = match Proxy::bind(config).await {
            Ok(proxy) => proxy,
            Err(err) => {
                error!("startup failed: {}", err);
                return 1;
            }
        };
        tokio::task::spawn_local(async move {
            if let Err(err) = proxy.run().await {
                error!("proxy stopped: {}", err);
            }
        });

        wait_for_shutdown().await;
        info!("shutting down");
        0
    })
}

/// The config directive provides the default filter; `RUST_LOG` overrides
/// it, so a misbehaving daemon can be inspected without a config change.
fn init_logging(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn wait_for_shutdown() {
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut quit = signal(SignalKind::quit()).expect("install SIGQUIT handler");
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
        _ = quit.recv() => info!("received SIGQUIT"),
    }
}
