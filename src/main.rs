//! tun-nat: user-space NAT for a TUN interface
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./tun-nat
//!
//! # Run with custom configuration
//! sudo ./tun-nat -c /path/to/config.json
//!
//! # Run with environment overrides
//! TUN_NAT_LOG_LEVEL=debug sudo ./tun-nat
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use tun_nat::config::{load_config_with_env, Config};
use tun_nat::device::TunDevice;
use tun_nat::direct::DirectHandler;
use tun_nat::nat::NatEngine;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tun-nat/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tun-nat v{}", tun_nat::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"tun-nat v{}

User-space NAT that hands every TCP and UDP flow of a TUN interface to a
dispatcher and writes the replies back.

USAGE:
    tun-nat [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tun-nat/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    TUN_NAT_DEVICE_FD       Use an already-open TUN descriptor
    TUN_NAT_DEVICE_NAME     Override the TUN interface name
    TUN_NAT_LOG_LEVEL       Override log level (trace, debug, info, warn, error)
    TUN_NAT_MTU             Override the device MTU

REQUIREMENTS:
    - CAP_NET_ADMIN capability (or root) to open the TUN interface
    - The portal and gateway addresses routed through the interface

EXAMPLE:
    ip tuntap add mode tun dev tun0
    ip addr add 172.19.0.1/30 dev tun0
    ip link set tun0 up
    ip route add default dev tun0 table 100

    sudo tun-nat -c /etc/tun-nat/config.json
"#,
        tun_nat::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Open the TUN device named by the configuration
fn open_device(config: &Config) -> Result<TunDevice> {
    if let Some(fd) = config.device.fd {
        use std::os::fd::{FromRawFd, OwnedFd};
        // SAFETY: the descriptor is handed to this process for its exclusive
        // use; validation guarantees it is non-negative.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        return TunDevice::from_fd(fd).context("Failed to attach TUN descriptor");
    }

    #[cfg(target_os = "linux")]
    if let Some(name) = config.device.name.as_deref() {
        return TunDevice::open(name).with_context(|| format!("Failed to open TUN device {name}"));
    }

    anyhow::bail!("No usable TUN device configured")
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        tun_nat::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).with_context(|| {
        format!("Failed to load configuration from {:?}", args.config_path)
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("tun-nat v{}", tun_nat::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let device = open_device(&config)?;
    let handler = Arc::new(DirectHandler::new(config.nat.udp_timeout()));
    let engine = NatEngine::builder(config.nat.clone())
        .error_sink(|e| error!(error = %e, "NAT engine error"))
        .start(device, handler)
        .await
        .context("Failed to start NAT engine")?;

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    info!("Shutting down...");
    engine.close().await;

    let stats = engine.stats().snapshot();
    info!(
        "Final stats: {} packets read, {} TCP redirected, {} UDP datagrams, {} dropped",
        stats.packets_read,
        stats.tcp_redirected,
        stats.udp_datagrams,
        stats.dropped()
    );
    info!(
        "Connections: {} accepted, {} rejected",
        stats.connections_accepted, stats.connections_rejected
    );

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
