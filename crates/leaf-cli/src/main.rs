//! leaf-cli: host harness for the proxy runtime
//!
//! ```text
//! leaf-cli check <config> [--json]
//! leaf-cli run <config> --tun-fd <fd> [--options <toml>]
//! leaf-cli doh [--listen <addr>] [--server <addr>] [--domain <name>]
//! ```
//!
//! `run` reloads the configuration file on SIGHUP and stops on Ctrl-C.

mod summary;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use leaf_config::{Configuration, DohMethod, LogLevel, RuntimeOptions};
use leaf_doh::{DohConfig, DohRuntime};
use leaf_net::{DialerConfig, NoopProtector, ProtectedDialer};
use leaf_runtime::{Event, ProxyRuntime};
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::summary::ConfigSummary;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "leaf-cli", version, about = "Proxy core runtime harness")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and validate a configuration file
    Check {
        config: PathBuf,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the proxy on an inherited TUN descriptor
    Run {
        config: PathBuf,
        /// Open TUN descriptor passed by the parent process
        #[arg(long)]
        tun_fd: RawFd,
        /// Runtime options (TOML)
        #[arg(long)]
        options: Option<PathBuf>,
    },

    /// Run only the local DoH forwarder
    Doh {
        /// Local UDP listen address
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Upstream server address (IP:port)
        #[arg(long)]
        server: Option<SocketAddr>,
        /// Upstream host name for SNI and the Host header
        #[arg(long)]
        domain: Option<String>,
        /// Send queries with GET instead of POST
        #[arg(long)]
        get: bool,
        /// Disable TLS fragmentation
        #[arg(long)]
        no_fragment: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Check { config, json } => {
            let config = load_config(&config)?;
            let summary = ConfigSummary::new(&config);
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary);
            }
            Ok(())
        }
        Command::Run {
            config,
            tun_fd,
            options,
        } => run(config, tun_fd, options).await,
        Command::Doh {
            listen,
            server,
            domain,
            get,
            no_fragment,
        } => {
            init_logging(None, false);
            let mut config = DohConfig::cloudflare();
            if let Some(listen) = listen {
                config = config.with_listen(listen);
            }
            if let Some(server) = server {
                config.upstream.addr = server;
            }
            if let Some(domain) = domain {
                config.upstream.sni = domain.clone();
                config.upstream.domain = domain;
            }
            if get {
                config.method = DohMethod::Get;
            }
            if no_fragment {
                config.fragment = None;
            }
            doh(config).await
        }
    }
}

fn init_logging(level: Option<LogLevel>, no_color: bool) {
    let default = level.map(|l| l.as_str()).unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(!no_color)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(path: &Path) -> Result<Configuration> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config = leaf_config::parse(&text).with_context(|| format!("parsing {}", path.display()))?;
    leaf_config::validate(&config).with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

async fn run(path: PathBuf, tun_fd: RawFd, options: Option<PathBuf>) -> Result<()> {
    if tun_fd < 0 {
        bail!("invalid TUN descriptor {}", tun_fd);
    }

    let config = load_config(&path)?;
    let options = match options {
        Some(ref file) => RuntimeOptions::from_toml_file(file)
            .with_context(|| format!("loading options from {}", file.display()))?,
        None => RuntimeOptions::default(),
    };
    let effective = options.clone().with_env(&config.env);
    init_logging(config.general.loglevel, effective.log_no_color);

    info!("leaf-cli starting (config {})", path.display());
    let runtime = ProxyRuntime::builtin(options);

    let mut events = runtime.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::StartFailed(e)) => warn!("Start failed: {}", e),
                Ok(Event::ReloadFailed(e)) => warn!("Reload failed: {}", e),
                Ok(event) => info!("Event: {}", event.tag()),
                Err(RecvError::Lagged(n)) => warn!("Missed {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // SAFETY: the parent keeps the descriptor open while we run; `start`
    // duplicates it before returning.
    let tun = unsafe { BorrowedFd::borrow_raw(tun_fd) };
    let handle = runtime.start(tun, config).await?;
    if let Some(addr) = handle.local_addr() {
        info!("SOCKS5 inbound on {}", addr);
    }

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            _ = hangup.recv() => {
                info!("SIGHUP, reloading {}", path.display());
                match load_config(&path) {
                    Ok(config) => {
                        if runtime.reload(config).await.is_ok() {
                            info!("Generation {}", handle.generation());
                        }
                    }
                    Err(e) => warn!("Keeping current configuration: {:#}", e),
                }
            }
        }
    }

    runtime.stop().await;
    info!("leaf-cli shutting down");
    Ok(())
}

async fn doh(config: DohConfig) -> Result<()> {
    let dialer = ProtectedDialer::new(Arc::new(NoopProtector), DialerConfig::default());
    let mut runtime = DohRuntime::new(dialer);

    let upstream = config.upstream.addr;
    let listen = runtime.start(config).await?;
    info!("DoH forwarder on {} -> {}", listen, upstream);

    tokio::signal::ctrl_c().await?;
    runtime.stop().await;
    Ok(())
}
