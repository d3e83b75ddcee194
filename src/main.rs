use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod animation;
mod cancel;
mod config;
mod daemon;
mod device;
mod pixel;
mod pixel_format;
mod protocol;
mod transport;

use cancel::CancelToken;
use config::Config;
use daemon::Daemon;
use device::Device;

#[derive(Parser)]
#[command(name = "ledlink")]
#[command(about = "ledlink - LED strip daemon\n\nDrives an LED controller over a serial link, one acknowledged frame at a time.", long_about = None)]
struct Cli {
    /// Path to configuration file (JSON)
    config: PathBuf,

    /// Serial device, overrides the config file
    #[arg(long)]
    device: Option<String>,

    /// Baud rate, overrides the config file
    #[arg(long)]
    baud_rate: Option<u32>,

    /// Enable debug output (lifecycle and statistics)
    #[arg(short, long)]
    verbose: bool,

    /// Enable detailed debug (hex dumps every frame)
    #[arg(long)]
    ddebug: bool,

    /// Run against the built-in controller emulator instead of a serial port
    #[arg(long)]
    emulate: bool,
}

fn init_logging(cli: &Cli) {
    let default = if cli.ddebug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let mut config = Config::load(&cli.config)?;
    if let Some(device) = &cli.device {
        config.device = device.clone();
    }
    if let Some(baud_rate) = cli.baud_rate {
        config.baud_rate = baud_rate;
    }

    let daemon = Daemon::new(config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    // Ctrl-C cancels the run; the daemon clears the strip on its way out
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if handler_token.cancel() {
            info!("shutting down");
        }
    }) {
        warn!("could not set Ctrl-C handler: {}", e);
    }

    let result = if cli.emulate {
        let (transport, end) = transport::pipe();
        let (reader, writer) = end.split();
        let order = daemon.config().pixel_format;
        thread::spawn(move || {
            if let Err(e) = Device::new(reader, writer).with_channel_order(order).run() {
                warn!("emulated controller stopped: {}", e);
            }
        });
        debug!("running against the emulated controller");
        daemon.run_with(transport, &cancel)
    } else {
        daemon.run(&cancel)
    };

    debug!("final stats: {:?}", daemon.stats());
    result.context("daemon failed")?;
    Ok(())
}
