use std::net::Ipv4Addr;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use nmguard::Config;
use nmguard::killswitch::{
    ConnectionEvent, KillSwitchConnectionHandler, KillSwitchError, NmKillSwitch,
};
use nmguard::nm::NmCli;

#[derive(Parser)]
#[command(name = "nmguard")]
#[command(about = "NetworkManager-based VPN kill switch for Linux")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Engage the kill switch
    Enable {
        /// Server to keep reachable while the tunnel comes up
        #[arg(short, long)]
        server_ip: Option<Ipv4Addr>,
        /// Keep blocking across disconnects and reboots
        #[arg(short, long)]
        permanent: bool,
    },
    /// Remove every kill switch connection
    Disable,
    /// Re-point the routed exception at a new server
    Update {
        #[arg(short, long)]
        server_ip: Ipv4Addr,
        /// Keep blocking across disconnects and reboots
        #[arg(short, long)]
        permanent: bool,
    },
    /// Apply a VPN connection lifecycle event
    ///
    /// Wire this into the VPN client's hooks, e.g.
    /// `nmguard event connecting --server-ip 185.159.157.1`
    /// followed by `nmguard event connected` once the tunnel is up.
    Event {
        event: EventKind,
        /// Server the tunnel is being established to
        #[arg(short, long)]
        server_ip: Option<Ipv4Addr>,
    },
    /// Toggle the standalone IPv6 leak protection
    Ipv6 { action: Ipv6Action },
    /// Show what is currently installed
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate default config file
    Init,
}

#[derive(Clone, Copy, ValueEnum)]
enum EventKind {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

#[derive(Clone, Copy, ValueEnum)]
enum Ipv6Action {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging
    // Logs go to stderr so status output stays scriptable
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load_or_default()?;

    match cli.command {
        Commands::Enable {
            server_ip,
            permanent,
        } => {
            warn_if_not_root();
            let mut ks = build_switch(&config, permanent);
            run_or_exit(ks.enable(server_ip).await, "Enable failed");
            println!("Kill switch enabled ({})", ks.state());
        }
        Commands::Disable => {
            warn_if_not_root();
            let mut ks = build_switch(&config, false);
            run_or_exit(ks.disable().await, "Disable failed");
            println!("Kill switch disabled");
        }
        Commands::Update {
            server_ip,
            permanent,
        } => {
            warn_if_not_root();
            let mut ks = build_switch(&config, permanent);
            run_or_exit(ks.update(server_ip).await, "Update failed");
            println!("Routed exception now points at {}", server_ip);
        }
        Commands::Event { event, server_ip } => {
            warn_if_not_root();
            if server_ip.is_some() && !matches!(event, EventKind::Connecting) {
                warn!("--server-ip only applies to the connecting event");
            }
            let mut ks = build_switch(&config, false);
            let event = match event {
                EventKind::Disconnected => ConnectionEvent::Disconnected,
                EventKind::Connecting => ConnectionEvent::Connecting { server_ip },
                EventKind::Connected => ConnectionEvent::Connected,
                EventKind::Disconnecting => ConnectionEvent::Disconnecting,
                EventKind::Error => ConnectionEvent::Error,
            };
            run_or_exit(ks.handle_event(event).await, "Event handling failed");
            info!("Kill switch state: {}", ks.state());
        }
        Commands::Ipv6 { action } => {
            warn_if_not_root();
            let ks = build_switch(&config, false);
            match action {
                Ipv6Action::On => {
                    run_or_exit(
                        ks.enable_ipv6_leak_protection().await,
                        "Enabling IPv6 leak protection failed",
                    );
                    println!("IPv6 leak protection enabled");
                }
                Ipv6Action::Off => {
                    run_or_exit(
                        ks.disable_ipv6_leak_protection().await,
                        "Disabling IPv6 leak protection failed",
                    );
                    println!("IPv6 leak protection disabled");
                }
            }
        }
        Commands::Status { json } => {
            let ks = build_switch(&config, false);
            let status = ks.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "NetworkManager: {}",
                    if status.network_manager_running {
                        "running"
                    } else {
                        "not running"
                    }
                );
                println!("Full block: {}", installed(status.full_block_active));
                println!("Routed exception: {}", installed(status.routed_active));
                println!(
                    "IPv6 leak protection: {}",
                    installed(status.ipv6_leak_protection_active)
                );
            }
        }
        Commands::Init => {
            info!("Generating default config...");
            let config = Config::default();
            let path = Config::default_path();
            config.save(&path)?;
            println!("Created default config: {}", path.display());
        }
    }

    Ok(())
}

fn build_switch(config: &Config, permanent_flag: bool) -> NmKillSwitch {
    let mut settings = config.settings();
    if permanent_flag {
        settings.permanent = true;
    }
    let client = Arc::new(NmCli::with_timeout(config.nm_timeout()));
    let handler =
        KillSwitchConnectionHandler::with_client(client).with_retry(config.retry_policy());
    NmKillSwitch::with_handler(handler, settings)
}

fn run_or_exit(result: Result<(), KillSwitchError>, context: &str) {
    if let Err(err) = result {
        error!("{}: {}", context, err);
        std::process::exit(1);
    }
}

fn installed(active: bool) -> &'static str {
    if active { "installed" } else { "not installed" }
}

#[cfg(unix)]
fn warn_if_not_root() {
    if !nix::unistd::Uid::effective().is_root() {
        warn!("Not running as root; NetworkManager will likely reject changes");
    }
}

#[cfg(not(unix))]
fn warn_if_not_root() {}
