//! sockwatch - connection-to-process resolver
//!
//! Attaches kernel probes that record which process owns each outbound
//! socket and keeps that mapping queryable for a firewall.

use clap::{Parser, Subcommand};
use sockwatch_core::config::{ConfigLoader, SockwatchConfig};
use sockwatch_ebpf::EbpfMonitor;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sockwatch")]
#[command(version)]
#[command(about = "Kernel-assisted connection-to-process resolver", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "SOCKWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach the probes and track connections until interrupted
    Run {
        /// Path to the compiled probe object
        #[arg(long)]
        probe_object: Option<PathBuf>,

        /// Track IPv4 sockets only
        #[arg(long)]
        no_ipv6: bool,

        /// Seconds between stream statistics log lines (0 disables)
        #[arg(long, default_value = "30")]
        stats_interval: u64,
    },

    /// Show host capabilities
    Status,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence over the config file
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.daemon.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            probe_object,
            no_ipv6,
            stats_interval,
        } => {
            let mut config = config;
            if let Some(path) = probe_object {
                config.probe.object_path = path;
            }
            if no_ipv6 {
                config.probe.ipv6 = false;
            }
            run_command(config, stats_interval).await
        }
        Commands::Status => status_command(&config),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> SockwatchConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // the subscriber is not installed yet
            eprintln!("Failed to load configuration: {}, using defaults", e);
            SockwatchConfig::default()
        }
    }
}

async fn run_command(config: SockwatchConfig, stats_interval: u64) -> anyhow::Result<()> {
    info!("sockwatch v{} starting", sockwatch_core::VERSION);

    let monitor = EbpfMonitor::start(&config).await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
                break;
            }
            _ = ticker.tick(), if stats_interval > 0 => log_stats(&monitor),
        }
    }

    info!("Shutting down...");
    if let Err(e) = monitor.stop().await {
        warn!("Shutdown incomplete: {}", e);
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn log_stats(monitor: &EbpfMonitor) {
    let stats = monitor.stats();
    info!(
        "events received={} applied={} superseded={} malformed={} lost={} cache={} baseline={}",
        stats.received,
        stats.applied,
        stats.superseded,
        stats.malformed,
        stats.lost,
        monitor.cache_len(),
        monitor.baseline_len()
    );
}

#[cfg(not(target_os = "linux"))]
fn log_stats(_monitor: &EbpfMonitor) {}

fn status_command(config: &SockwatchConfig) -> anyhow::Result<()> {
    println!();
    println!("sockwatch v{}", sockwatch_core::VERSION);
    println!();

    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    #[cfg(target_os = "linux")]
    {
        use sockwatch_ebpf::loader;

        println!();
        println!("Linux Capabilities:");
        println!("  Running as root: {}", loader::is_root());
        println!("  BPF filesystem: {}", loader::bpffs_available());
        match loader::kernel_version() {
            Some((major, minor, patch)) => println!("  Kernel: {}.{}.{}", major, minor, patch),
            None => println!("  Kernel: unknown"),
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        println!();
        println!("Kernel probes are only supported on Linux");
    }

    println!();
    println!("Probe object: {}", config.probe.object_path.display());
    println!("  Present: {}", config.probe.object_path.exists());
    println!("  IPv6: {}", config.probe.ipv6);
    println!();

    Ok(())
}
