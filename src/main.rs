//! `keyrelay` daemon: reads the configured input sources and publishes key
//! events to the event socket.

use anyhow::{Context, Result};
use clap::Parser;
use keyrelay::backends::probe_samplers;
use keyrelay::config::{Config, DEFAULT_CONFIG_PATH};
use keyrelay::socket::SocketServer;
use keyrelay::watcher::ConfigWatcher;
use keyrelay::{init_tracing, EventFilter, InputManager, LogSubscriber};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const STATUS_INTERVAL: Duration = Duration::from_millis(500);

/// Input daemon for IR remotes, GPIO buttons, rotary encoders and MPR121 touch pads
#[derive(Parser, Debug)]
#[command(name = "keyrelay", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "KEYRELAY_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    dump_default: bool,
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG_PATH) {
        warn!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    Config::load(path).with_context(|| format!("loading config {}", path.display()))
}

fn main() -> Result<()> {
    let epoch = Instant::now();
    let args = Args::parse();

    if args.dump_default {
        print!("{}", Config::default().to_toml_string()?);
        return Ok(());
    }

    init_tracing();
    let config = load_config(&args.config)?;
    if args.check {
        println!(
            "{}: ok ({} bindings)",
            args.config.display(),
            config.binding_count()
        );
        return Ok(());
    }

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGTERM, SIGINT] {
        signal_hook::flag::register(signal, Arc::clone(&stop))
            .with_context(|| format!("installing handler for signal {signal}"))?;
    }

    let mut manager = InputManager::new(config.clone()).context("starting input manager")?;
    manager.subscribe(LogSubscriber::new(), EventFilter::All);

    let server = if config.socket.enabled {
        match SocketServer::bind(&config.socket.path) {
            Ok(server) => {
                manager.subscribe(server.subscriber(epoch), EventFilter::All);
                Some(server)
            }
            Err(e) => {
                warn!(path = %config.socket.path.display(), error = %e, "event socket unavailable");
                None
            }
        }
    } else {
        None
    };

    for sampler in probe_samplers(&config) {
        let name = sampler.name().to_string();
        if let Err(e) = manager.add_source(sampler) {
            warn!(%name, error = %e, "source not started");
        }
    }
    manager.start().context("starting dispatcher")?;
    info!(sources = ?manager.sources(), "keyrelay running");

    let watcher = match ConfigWatcher::new(&args.config) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = ?e, "config reload disabled");
            None
        }
    };

    let mut last = manager.snapshot();
    info!(status = %last, "status");
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(STATUS_INTERVAL);

        if watcher.as_ref().is_some_and(ConfigWatcher::changed) {
            match Config::load(&args.config).and_then(|c| manager.reload(c)) {
                Ok(()) => info!(path = %args.config.display(), "config reloaded"),
                Err(e) => warn!(error = %e, "config reload rejected, keeping previous"),
            }
        }

        let snapshot = manager.snapshot();
        if snapshot.summary_differs(&last) {
            info!(status = %snapshot, "status");
        }
        last = snapshot;
    }

    info!("shutting down");
    manager.shutdown();
    drop(server);
    info!(status = %manager.snapshot(), "keyrelay stopped");
    Ok(())
}
