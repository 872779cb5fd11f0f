//! Binary entrypoint for the meshgate CLI.
//!
//! Commands:
//! - `start [--port <path>]` - connect to a radio, print events as JSON lines, send stdin lines as text
//! - `replay <file>` - feed newline-delimited JSON packets through the engine without a device
//! - `init` - write a starter `config.toml`
//!
//! See the library crate docs for module-level details: `meshgate::`.
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use std::sync::Arc;

use meshgate::config::{log_level, Config};
use meshgate::gateway::events::JsonLinesSink;
use meshgate::gateway::{Gateway, GatewaySettings, RawPacket};
use meshgate::logutil::truncate_for_log;
use meshgate::metrics;

#[derive(Parser)]
#[command(name = "meshgate")]
#[command(about = "Packet ingestion and node-state gateway for Meshtastic radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a device and stream events
    Start {
        /// Meshtastic device port (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Replay recorded packets (one JSON object per line)
    Replay {
        /// Packet capture file
        file: String,
    },
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            init_logging(&None, cli.verbose);
            if !force && tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                bail!("{} already exists (use --force to overwrite)", cli.config);
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Replay { file } => {
            let config = load_or_default(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            replay(&config, &file).await?;
        }
        Commands::Start { port } => {
            let config = load_or_default(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting meshgate v{}", env!("CARGO_PKG_VERSION"));
            start(config, port).await?;
        }
    }

    Ok(())
}

async fn load_or_default(path: &str) -> Result<Config> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        Config::load(path).await
    } else {
        Ok(Config::default())
    }
}

fn stdout_gateway(config: &Config) -> Gateway {
    let sink = Arc::new(JsonLinesSink::new(std::io::stdout()));
    Gateway::new(GatewaySettings::from(&config.gateway), sink)
}

async fn replay(config: &Config, file: &str) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read packet file {}", file))?;
    let gateway = stdout_gateway(config);
    let mut dispatcher = gateway.dispatcher();
    let mut bad = 0usize;
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match RawPacket::from_json(line) {
            Ok(packet) => dispatcher.handle(packet),
            Err(e) => {
                bad += 1;
                metrics::inc_packets_malformed();
                warn!("{}:{}: {}", file, lineno + 1, truncate_for_log(&e.to_string(), 160));
            }
        }
    }

    println!();
    for node in gateway.list_nodes() {
        println!(
            "{:<12} {:<24} last_heard={} hops={}",
            node.num.to_string(),
            node.label(),
            node.last_heard.map_or_else(|| "-".to_string(), |t| t.to_string()),
            node.hops_away.map_or_else(|| "-".to_string(), |h| h.to_string()),
        );
    }
    info!(
        "Replayed {}: {} nodes, {} messages, {} unreadable lines",
        file,
        gateway.list_nodes().len(),
        gateway.list_messages(None).len(),
        bad
    );
    Ok(())
}

#[cfg(feature = "serial")]
async fn start(config: Config, port: Option<String>) -> Result<()> {
    use meshgate::meshtastic::SerialLink;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::time::{interval, Duration};

    let mut device_cfg = config.meshtastic.clone();
    if let Some(p) = port {
        device_cfg.port = p;
    }
    let gateway = stdout_gateway(&config);
    let (tx, rx) = gateway.event_channel();
    let link = SerialLink::open(&device_cfg, tx).await?;
    info!("Waiting for device configuration on {}", link.port_name());
    gateway.attach(link, rx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut status_tick = interval(Duration::from_secs(1));
    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Some((channel, text)) = parse_outbound(&line, device_cfg.channel) {
                        match gateway.send_message(&text, channel) {
                            Ok(id) => debug!("queued 0x{:08x} on ch{}", id, channel),
                            Err(e) => warn!("Send failed: {}", e),
                        }
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    stdin_open = false;
                }
            },
            _ = status_tick.tick() => {
                ticks += 1;
                if !gateway.is_connected() {
                    info!("Device link closed; shutting down");
                    break;
                }
                if ticks % 60 == 0 {
                    debug!("metrics: {:?}", metrics::snapshot());
                }
            }
        }
    }

    gateway.shutdown().await;
    info!("Final metrics: {:?}", metrics::snapshot());
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn start(_config: Config, _port: Option<String>) -> Result<()> {
    bail!("`start` requires the 'serial' feature")
}

/// `text` goes to the default channel; `/ch N text` picks channel N.
fn parse_outbound(line: &str, default_channel: u32) -> Option<(u32, String)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    if let Some(rest) = line.strip_prefix("/ch ") {
        let rest = rest.trim_start();
        let (num, text) = rest.split_once(' ')?;
        let channel = num.parse().ok()?;
        return Some((channel, text.to_string()));
    }
    Some((default_channel, line.to_string()))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| log_level(&c.logging.level))
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when someone is watching it
        let is_tty = atty::is(atty::Stream::Stderr);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
