use clap::Parser;
use greytrap_rs::config::Config;
use greytrap_rs::daemon::Daemon;
use greytrap_rs::GreytrapError;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// SMTP tarpit and greylisting daemon.
#[derive(Parser, Debug)]
#[command(name = "greytrap-rs", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// IPv4 address to listen on
    #[arg(short = 'l', long)]
    bind_address: Option<String>,

    /// IPv6 address to listen on
    #[arg(short = 'L', long)]
    bind_address_ipv6: Option<String>,

    /// Also listen on IPv6
    #[arg(short = '6', long)]
    enable_ipv6: bool,

    /// SMTP port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Loopback configuration port
    #[arg(long)]
    config_port: Option<u16>,

    /// Maximum concurrent connections
    #[arg(short = 'c', long)]
    max_cons: Option<usize>,

    /// Maximum concurrent blacklisted connections
    #[arg(short = 'B', long)]
    max_black: Option<usize>,

    /// Disable greylisting; blacklist-only tarpitting
    #[arg(short = 'b', long)]
    blacklist_only: bool,

    /// Seconds between stuttered bytes
    #[arg(short = 's', long)]
    stutter: Option<u64>,

    /// Seconds of stutter for greylisted connections
    #[arg(short = 'S', long)]
    grey_stutter: Option<u64>,

    /// Greylisting times as passtime(min):greyexp(h):whiteexp(h)
    #[arg(short = 'G', long, value_name = "PASS:GREY:WHITE")]
    grey_times: Option<String>,

    /// Hostname announced in SMTP banners
    #[arg(short = 'H', long)]
    hostname: Option<String>,

    /// Banner text appended to the SMTP greeting
    #[arg(short = 'n', long)]
    banner: Option<String>,

    /// SMTP code used for blacklist rejections
    #[arg(long, value_parser = ["450", "550"])]
    reply_code: Option<String>,

    /// Address of the low-priority MX used for trapping
    #[arg(short = 'M', long)]
    low_prio_mx: Option<String>,

    /// Log greylisting activity and message headers
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Sync peer to send updates to (repeatable)
    #[arg(short = 'Y', long = "sync-host")]
    sync_hosts: Vec<String>,

    /// Address to listen on for sync updates
    #[arg(short = 'y', long = "sync-listen")]
    sync_listen: Option<String>,

    /// Pid-file path
    #[arg(short = 'P', long)]
    pidfile: Option<PathBuf>,
}

fn apply_cli(config: &mut Config, cli: &Cli) -> Result<(), GreytrapError> {
    if let Some(addr) = &cli.bind_address {
        config.server.bind_address = Some(addr.clone());
    }
    if let Some(addr) = &cli.bind_address_ipv6 {
        config.server.bind_address_ipv6 = Some(addr.clone());
    }
    if cli.enable_ipv6 {
        config.server.enable_ipv6 = true;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(port) = cli.config_port {
        config.server.config_port = port;
    }
    if let Some(max_cons) = cli.max_cons {
        config.server.max_cons = max_cons;
    }
    if let Some(max_black) = cli.max_black {
        config.server.max_black = max_black;
    }
    if cli.blacklist_only {
        config.grey.enable = false;
    }
    if let Some(stutter) = cli.stutter {
        config.server.stutter = stutter;
    }
    if let Some(stutter) = cli.grey_stutter {
        config.grey.stutter = stutter;
    }
    if let Some(times) = &cli.grey_times {
        let parts: Vec<&str> = times.split(':').collect();
        let parsed: Option<(i64, i64, i64)> = match parts.as_slice() {
            [pass, grey, white] => {
                match (pass.parse(), grey.parse(), white.parse()) {
                    (Ok(pass), Ok(grey), Ok(white)) => Some((pass, grey, white)),
                    _ => None,
                }
            }
            _ => None,
        };
        let (pass, grey, white) = parsed.ok_or_else(|| {
            GreytrapError::Config(format!("bad grey times {times}, expected PASS:GREY:WHITE"))
        })?;
        config.grey.pass_time = pass * 60;
        config.grey.grey_expiry = grey * 60 * 60;
        config.grey.white_expiry = white * 60 * 60;
    }
    if let Some(hostname) = &cli.hostname {
        config.server.hostname = Some(hostname.clone());
    }
    if let Some(banner) = &cli.banner {
        config.server.banner = banner.clone();
    }
    if let Some(code) = &cli.reply_code {
        config.server.reply_code = code.clone();
    }
    if let Some(mx) = &cli.low_prio_mx {
        config.grey.low_prio_mx = Some(mx.clone());
    }
    if cli.verbose {
        config.server.verbose = true;
        config.logging.level = "debug".to_string();
    }
    for host in &cli.sync_hosts {
        config.sync.hosts.push(host.clone());
    }
    if let Some(addr) = &cli.sync_listen {
        config.sync.bind_address = Some(addr.clone());
    }
    if let Some(pidfile) = &cli.pidfile {
        config.server.pidfile = Some(pidfile.to_string_lossy().into_owned());
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("greytrap-rs: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Err(e) = apply_cli(&mut config, &cli) {
        eprintln!("greytrap-rs: {e}");
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "greytrap_rs={}",
                    config.logging.level
                ))
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting greytrap-rs v{}", env!("CARGO_PKG_VERSION"));
    info!("  SMTP listening on port: {}", config.server.port);
    info!("  hostname: {}", config.hostname());
    info!(
        "  greylisting: {}",
        if config.grey.enable { "enabled" } else { "disabled" }
    );

    if let Err(e) = Daemon::new(config).run().await {
        error!("fatal: {e}");
        let code = match e {
            GreytrapError::Config(_) | GreytrapError::Io(_) => 1,
            _ => 2,
        };
        std::process::exit(code);
    }
}
