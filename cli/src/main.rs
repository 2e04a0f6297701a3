// cloudlink — device-side SM agent
//
// Drives the Short Message engine over a UDP socket and exposes the wire
// utilities (Base85, CRC-16) used when debugging captures.

mod agent;
mod config;
mod link;

use agent::{DeviceAgent, Outcome};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cloudlink_core::{
    crc16, decode85, encode85, AesGcmProvider, BackendConfigStore, Command, PollStatus,
    RequestOptions, SledStorage, SmConnector, TransportContext,
};
use colored::*;
use link::UdpLink;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Upper bound on engine steps per tick so a chatty peer can't starve the timer
const MAX_STEPS_PER_TICK: usize = 64;

#[derive(Parser)]
#[command(name = "cloudlink")]
#[command(about = "Cloudlink — Short Message device agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Also write logs to daily files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted
    Run {
        /// Poll interval in milliseconds
        #[arg(short, long, default_value = "50")]
        interval: u64,
    },
    /// Send one request and wait for the response
    Send {
        #[arg(value_enum)]
        command: RequestCommand,
        /// Request body (UTF-8)
        #[arg(default_value = "")]
        message: String,
        /// Don't ask for a response
        #[arg(long)]
        no_response: bool,
        /// Compress the body
        #[arg(long)]
        compress: bool,
        /// Seconds to wait for the response
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },
    /// Base85-encode text (or hex with --hex)
    Encode85 {
        input: String,
        #[arg(long)]
        hex: bool,
    },
    /// Decode Base85 text
    Decode85 { input: String },
    /// CRC-16 of hex bytes
    Crc16 { hex: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set a config value
    Set { key: String, value: String },
    /// Get a config value
    Get { key: String },
    /// List all config values
    List,
    /// Show config file path
    Path,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RequestCommand {
    Connect,
    Ping,
    Data,
    Noop,
    Cli,
}

impl From<RequestCommand> for Command {
    fn from(value: RequestCommand) -> Self {
        match value {
            RequestCommand::Connect => Command::Connect,
            RequestCommand::Ping => Command::Ping,
            RequestCommand::Data => Command::Data,
            RequestCommand::Noop => Command::NoOp,
            RequestCommand::Cli => Command::Cli,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.json, cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Run { interval } => cmd_run(interval).await,
        Commands::Send {
            command,
            message,
            no_response,
            compress,
            timeout,
        } => cmd_send(command.into(), message, !no_response, compress, timeout).await,
        Commands::Encode85 { input, hex } => cmd_encode85(&input, hex),
        Commands::Decode85 { input } => cmd_decode85(&input),
        Commands::Crc16 { hex } => cmd_crc16(&hex),
        Commands::Config { action } => cmd_config(action),
    }
}

fn init_tracing(
    json: bool,
    log_dir: Option<&std::path::Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "cloudlink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(guard)
}

/// Everything a running agent holds on to
struct Device {
    connector: SmConnector,
    ctx: TransportContext,
    agent: Arc<DeviceAgent>,
}

fn open_device(config: &config::Config) -> Result<Device> {
    let sm_config = config.sm_config()?;
    let transport = config.transport_config()?;

    let backend = SledStorage::open(config.storage_dir()?).context("Failed to open storage")?;
    let store = Arc::new(BackendConfigStore::new(backend));

    let agent = Arc::new(DeviceAgent::new());
    let connector = SmConnector::new(
        sm_config,
        Arc::new(AesGcmProvider),
        store,
        agent.clone(),
    )
    .context("Failed to start SM engine")?;
    agent.attach(connector.config_service());

    let link = UdpLink::connect(config.bind_addr()?, config.remote_addr()?)?;
    info!(
        local = %link.local_addr()?,
        remote = %link.remote_addr(),
        "UDP link ready"
    );
    let ctx = connector
        .open(transport, Arc::new(link))
        .context("Failed to open transport")?;

    Ok(Device {
        connector,
        ctx,
        agent,
    })
}

/// Run the engine until it has nothing left to do this tick, then send
/// whatever the agent wants answered.
fn service(device: &mut Device) -> Result<PollStatus> {
    let mut status = PollStatus::Idle;
    for _ in 0..MAX_STEPS_PER_TICK {
        let step = device.ctx.poll()?;
        status = status.merge(step);
        if let Some(e) = device.agent.take_fatal() {
            return Err(anyhow::Error::new(e).context("Transport stopped"));
        }

        for reply in device.agent.take_replies() {
            if let Err(e) = device.ctx.send_response(reply.request_id, &reply.payload, None) {
                if e.is_fatal() {
                    return Err(e.into());
                }
                warn!(request_id = reply.request_id, error = %e, "response not sent");
            }
        }

        if step != PollStatus::Working {
            break;
        }
    }
    Ok(status)
}

async fn cmd_run(interval_ms: u64) -> Result<()> {
    let config = config::Config::load()?;
    let mut device = open_device(&config)?;

    println!("{}", "Cloudlink — Running".bold());
    println!("Device ID:  {}", config.device_id.bright_cyan());
    println!("Transport:  {}", device.ctx.kind());
    println!("Payload:    {} bytes/segment", device.ctx.max_payload_bytes());
    println!(
        "Encryption: {}",
        if device.connector.config().encryption {
            "on".green()
        } else {
            "off".yellow()
        }
    );
    println!();

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                service(&mut device)?;
            }
        }
    }

    println!("Shutting down...");
    device.ctx.shutdown()?;
    Ok(())
}

async fn cmd_send(
    command: Command,
    message: String,
    response_needed: bool,
    compress: bool,
    timeout_secs: u64,
) -> Result<()> {
    let config = config::Config::load()?;
    let mut device = open_device(&config)?;

    let timeout = Duration::from_secs(timeout_secs);
    let options = RequestOptions {
        response_needed,
        timeout: Some(timeout),
        compress,
    };
    let request_id = device
        .ctx
        .send_request(command, message.as_bytes(), options)
        .context("Failed to send request")?;
    println!("{} Sent request #{}", "✓".green(), request_id);

    if !response_needed {
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    loop {
        ticker.tick().await;
        service(&mut device)?;

        match device.agent.take_outcome(request_id) {
            Some(Outcome::Response(body)) => {
                println!("{} Response received ({} bytes)", "✓".green(), body.len());
                break;
            }
            Some(Outcome::Failed(error)) => {
                anyhow::bail!("Request #{} failed: {}", request_id, error)
            }
            None => {}
        }
    }

    device.ctx.shutdown()?;
    Ok(())
}

fn cmd_encode85(input: &str, is_hex: bool) -> Result<()> {
    let bytes = if is_hex {
        hex::decode(input).context("Invalid hex input")?
    } else {
        input.as_bytes().to_vec()
    };
    println!("{}", String::from_utf8_lossy(&encode85(&bytes)));
    Ok(())
}

fn cmd_decode85(input: &str) -> Result<()> {
    let bytes = decode85(input.as_bytes());
    match std::str::from_utf8(&bytes) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", hex::encode(&bytes)),
    }
    Ok(())
}

fn cmd_crc16(input: &str) -> Result<()> {
    let bytes = hex::decode(input).context("Invalid hex input")?;
    println!("{:#06x}", crc16(0, &bytes));
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:20} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
