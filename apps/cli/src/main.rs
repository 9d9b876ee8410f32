use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bledfu_core::{FirmwareImage, SessionConfig};
use clap::{Parser, Subcommand};
use tracing::error;

#[derive(Parser, Debug)]
#[command(author, version, about = "Nordic legacy BLE DFU uploader", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// TOML session configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a firmware image (Intel HEX or raw binary)
    Upload {
        /// Image to upload
        #[arg(short, long)]
        file: PathBuf,

        /// Only connect to a device whose name contains this
        #[arg(short, long)]
        name: Option<String>,

        /// Only connect to this device address
        #[arg(short, long)]
        address: Option<String>,

        /// Acknowledgment timeout in milliseconds
        #[arg(long)]
        ack_timeout_ms: Option<u64>,

        /// Minimum gap between data packets in milliseconds
        #[arg(long)]
        packet_interval_ms: Option<u64>,
    },
    /// List nearby DFU targets
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Show how an image would be sent, without a device
    Inspect {
        #[arg(short, long)]
        file: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => SessionConfig::default(),
    };

    match args.command {
        Command::Upload {
            file,
            name,
            address,
            ack_timeout_ms,
            packet_interval_ms,
        } => {
            if name.is_some() {
                config.device_name = name;
            }
            if address.is_some() {
                config.device_address = address;
            }
            if let Some(ms) = ack_timeout_ms {
                config.ack_timeout_ms = ms;
            }
            if let Some(ms) = packet_interval_ms {
                config.packet_interval_ms = ms;
            }
            let image = FirmwareImage::load(&file)
                .with_context(|| format!("loading {}", file.display()))?;
            upload(&config, &image)
        }
        Command::Scan { duration } => scan(Duration::from_secs(duration)),
        Command::Inspect { file } => inspect(&config, &file),
    }
}

fn inspect(config: &SessionConfig, file: &Path) -> Result<()> {
    let image =
        FirmwareImage::load(file).with_context(|| format!("loading {}", file.display()))?;
    let plan = config.flow().plan(image.len());

    println!("File:          {}", file.display());
    println!("Base address:  0x{:08X}", image.base_address());
    println!("Size:          {} bytes", image.len());
    println!("Fits DFU size: {}", image.fits_size_record());
    println!("Packets:       {}", plan.packets);
    println!(
        "Receipt acks:  {} windowed + {} final",
        plan.window_acks, plan.final_acks
    );
    Ok(())
}

#[cfg(feature = "ble")]
fn upload(config: &SessionConfig, image: &FirmwareImage) -> Result<()> {
    use bledfu_core::{BtleplugTransport, DfuSession, GattTransport, ScanOptions};

    tracing::info!(size = image.len(), "Starting BLE DFU upload");
    let options = ScanOptions {
        name: config.device_name.clone(),
        address: config.device_address.clone(),
        timeout: Duration::from_secs(config.scan_timeout_secs),
    };
    let transport = BtleplugTransport::connect(&options)?;

    let mut session = DfuSession::new(&transport, config);
    let cancel = session.cancel_handle();
    ctrlc::set_handler(move || cancel.cancel()).context("installing Ctrl-C handler")?;

    let report = session.upload(image.as_bytes())?;
    tracing::info!(
        bytes = report.bytes_sent,
        seconds = report.elapsed.as_secs_f32(),
        "Firmware activated, device is resetting"
    );
    if transport.is_connected()
        && let Err(e) = transport.disconnect()
    {
        tracing::warn!(error = %e, "Failed to disconnect after activation");
    }
    Ok(())
}

#[cfg(not(feature = "ble"))]
fn upload(_config: &SessionConfig, _image: &FirmwareImage) -> Result<()> {
    anyhow::bail!("built without BLE support; rebuild with `--features ble`")
}

#[cfg(feature = "ble")]
fn scan(duration: Duration) -> Result<()> {
    tracing::info!(seconds = duration.as_secs(), "Scanning for DFU devices...");
    let devices = bledfu_core::BtleplugTransport::scan(duration)?;
    println!("Found {} DFU device(s):", devices.len());
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "N/A".to_string());
        println!(
            "  {} ({}) RSSI: {}",
            device.name.as_deref().unwrap_or("Unknown"),
            device.address,
            rssi
        );
    }
    Ok(())
}

#[cfg(not(feature = "ble"))]
fn scan(_duration: Duration) -> Result<()> {
    anyhow::bail!("built without BLE support; rebuild with `--features ble`")
}
