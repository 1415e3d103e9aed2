use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use pricetag::DeviceAddress;
use pricetag::encoder::{RasterImage, encode};
use pricetag_daemon::ble::BtleCentral;
use pricetag_daemon::config::{Config, load_config};
use pricetag_daemon::gatt::{BleCentral, BlePeripheral};
use pricetag_daemon::{ImageSource, UploadCoordinator, run_upload_worker};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Parser)]
#[command(
    name = "pricetag-daemon",
    about = "Push images to BLE e-paper price tags"
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload an image to one or more displays, one after another
    Upload {
        /// Image to send (defaults to image_dir/image_filename from the config)
        #[arg(long, short)]
        image: Option<PathBuf>,

        /// Display MAC address, may be repeated (defaults to device_address)
        #[arg(long = "address", short)]
        addresses: Vec<DeviceAddress>,
    },
    /// List the devices seen in a single scan
    Scan,
    /// Encode an image and write the raw display payload to a file
    Encode {
        #[arg(long, short)]
        image: PathBuf,

        #[arg(long, short)]
        output: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())
        .await
        .context("failed to load config")?;

    let log_level = if config.debug_mode {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    pricetag::init_logging(log_level);
    for warning in config.warnings() {
        warn!("config: {warning}");
    }

    match cli.command {
        Command::Upload { image, addresses } => run_upload(&config, image, addresses).await,
        Command::Scan => run_scan(&config).await,
        Command::Encode { image, output } => run_encode(&config, &image, &output).await,
    }
}

async fn run_upload(
    config: &Config,
    image: Option<PathBuf>,
    addresses: Vec<DeviceAddress>,
) -> Result<()> {
    let image_path = image
        .or_else(|| config.image_path())
        .context("no image given and no image_filename configured")?;
    let addresses = if addresses.is_empty() {
        config.device_address.into_iter().collect()
    } else {
        addresses
    };
    if addresses.is_empty() {
        bail!("no display address given and no device_address configured");
    }

    let central = BtleCentral::new(config.adapter_index)
        .await
        .context("failed to open bluetooth adapter")?;
    let coordinator = UploadCoordinator::new(central, config.upload_settings());

    let task_tracker = TaskTracker::new();
    let shutdown_token = CancellationToken::new();
    let handle = run_upload_worker(&task_tracker, coordinator, shutdown_token.clone());
    task_tracker.close();

    let ctrl_c_token = shutdown_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling upload");
            ctrl_c_token.cancel();
        }
    });

    let total = addresses.len();
    let mut failed = 0;
    for address in addresses {
        match handle
            .submit(ImageSource::Path(image_path.clone()), address, &shutdown_token)
            .await
        {
            Ok(report) => info!(
                "{address}: sent {} bytes in {} attempt(s)",
                report.payload_len, report.attempts
            ),
            Err(e) => {
                error!("{address}: {e}");
                failed += 1;
            }
        }
        if shutdown_token.is_cancelled() {
            break;
        }
    }

    shutdown_token.cancel();
    task_tracker.wait().await;

    if failed > 0 {
        bail!("{failed} of {total} uploads failed");
    }
    Ok(())
}

async fn run_scan(config: &Config) -> Result<()> {
    let central = BtleCentral::new(config.adapter_index)
        .await
        .context("failed to open bluetooth adapter")?;
    let duration = config.link_settings().scan_duration;
    info!("scanning for {duration:?}");
    let peripherals = central.scan(duration).await.context("scan failed")?;
    for peripheral in &peripherals {
        let ad = peripheral.advertisement();
        println!(
            "{}  {:>4}  {}",
            ad.address,
            ad.rssi.map(|r| r.to_string()).unwrap_or_default(),
            ad.name.as_deref().unwrap_or("Unknown")
        );
    }
    info!("found {} devices", peripherals.len());
    Ok(())
}

async fn run_encode(config: &Config, image: &Path, output: &Path) -> Result<()> {
    let bytes = tokio::fs::read(image)
        .await
        .with_context(|| format!("failed to read {}", image.display()))?;
    let raster = RasterImage::decode(&bytes)
        .context("failed to decode image")?
        .fit_to_screen(config.screen_type);
    let payload = encode(&raster);
    tokio::fs::write(output, payload.as_bytes())
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(
        "wrote {} bytes ({} per plane) to {}",
        payload.len(),
        payload.bw_plane().len(),
        output.display()
    );
    Ok(())
}
