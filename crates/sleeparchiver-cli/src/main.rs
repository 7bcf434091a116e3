//! sleeparchiver - archive sleep sessions from a docked wristwatch
//!
//! Subcommands:
//! - `sleeparchiver ports` - List serial ports
//! - `sleeparchiver import` - Fetch all sessions from the device into the archive
//! - `sleeparchiver list` - Show archived sessions
//! - `sleeparchiver export-csv <path>` / `export-xml <path>` - Export the archive
//! - `sleeparchiver import-xml <path>` / `import-csv <path>` - Merge a previous export

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use sleeparchiver_core::archive::{Archive, IngestReport, SharedArchive};
use sleeparchiver_core::config::ArchiverConfig;
use sleeparchiver_core::import::{join_import, spawn_import, ImportError, ImportPipeline, ImportSummary};
use sleeparchiver_core::session::format_timestamp;
use sleeparchiver_core::transport::{
    candidate_ports, list_ports, PortOpener, SerialPortOpener, Transport,
};

#[derive(Parser)]
#[command(name = "sleeparchiver")]
#[command(about = "Archive sleep sessions recorded by a serial-attached wristwatch")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Archive journal, overriding the config
    #[arg(long, global = true)]
    archive: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports
    Ports,

    /// Fetch every stored session from the device
    Import {
        /// Serial port to use instead of probing all ports
        #[arg(short, long)]
        port: Option<String>,
    },

    /// List archived sessions
    List {
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Export the archive as CSV
    ExportCsv { path: PathBuf },

    /// Export the archive as XML
    ExportXml { path: PathBuf },

    /// Merge sessions from an XML export into the archive
    ImportXml { path: PathBuf },

    /// Merge sessions from a CSV export into the archive
    ImportCsv { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = ArchiverConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(path) = cli.archive {
        config.archive.path = Some(path);
    }

    match cli.command {
        Commands::Ports => show_ports(),
        Commands::Import { port } => {
            let archive = open_archive(&config)?;
            run_import(&config, archive, port).await
        }
        Commands::List { json } => {
            let archive = open_archive(&config)?;
            list_sessions(&archive, json)
        }
        Commands::ExportCsv { path } => {
            let archive = open_archive(&config)?;
            archive
                .export_csv(&path)
                .with_context(|| format!("Failed to export {}", path.display()))?;
            println!("Exported {} session(s) to {}", archive.len(), path.display());
            Ok(())
        }
        Commands::ExportXml { path } => {
            let archive = open_archive(&config)?;
            archive
                .export_xml(&path)
                .with_context(|| format!("Failed to export {}", path.display()))?;
            println!("Exported {} session(s) to {}", archive.len(), path.display());
            Ok(())
        }
        Commands::ImportXml { path } => {
            let archive = open_archive(&config)?;
            let report = archive
                .write()
                .import_xml(&path)
                .with_context(|| format!("Failed to import {}", path.display()))?;
            print_merge(&path, report);
            Ok(())
        }
        Commands::ImportCsv { path } => {
            let archive = open_archive(&config)?;
            let report = archive
                .write()
                .import_csv(&path)
                .with_context(|| format!("Failed to import {}", path.display()))?;
            print_merge(&path, report);
            Ok(())
        }
    }
}

fn open_archive(config: &ArchiverConfig) -> Result<SharedArchive> {
    let path = config.archive.resolve_path()?;
    let archive = Archive::open(&path)
        .with_context(|| format!("Failed to open archive {}", path.display()))?
        .with_backup_exports(config.archive.backup_exports);
    Ok(SharedArchive::new(archive))
}

fn show_ports() -> Result<()> {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}  [{:04x}:{:04x}] {}",
                port.name,
                vid,
                pid,
                port.product.unwrap_or_default()
            ),
            _ => println!("{}", port.name),
        }
    }
    Ok(())
}

async fn run_import(
    config: &ArchiverConfig,
    archive: SharedArchive,
    port: Option<String>,
) -> Result<()> {
    let port = port.or_else(|| config.serial.port.clone());
    let candidates = candidate_ports(port.as_deref());
    if candidates.is_empty() {
        bail!("No serial ports found; is the device docked?");
    }

    let opener: Arc<dyn PortOpener> = Arc::new(SerialPortOpener::new(
        config.serial.baud_rate,
        config.serial.poll_timeout(),
    ));
    let transport_config = config.serial.transport_config();
    let transport =
        tokio::task::spawn_blocking(move || Transport::open(opener, &candidates, transport_config))
            .await
            .context("Port probe task failed")?
            .context("Could not connect to the device")?;
    info!("Connected on {}", transport.port_name());

    let pipeline = ImportPipeline::new(archive, config.protocol.clone())
        .with_capture_dir(config.capture_dir.clone());
    let cancel = pipeline.cancellation_token();

    let handle = spawn_import(pipeline, transport, |done: usize, total: usize| {
        eprintln!("  {}/{} session(s)", done, total);
    })?;

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping import");
            interrupt.cancel();
        }
    });

    match join_import(handle).await {
        Ok(summary) => {
            print_summary(&summary);
            Ok(())
        }
        Err(ImportError::Cancelled { partial }) => {
            print_summary(&partial);
            bail!("Import cancelled");
        }
        Err(e) => Err(e.into()),
    }
}

fn print_summary(summary: &ImportSummary) {
    if let Some(device) = &summary.device {
        println!(
            "Device {:08x} (firmware {}.{})",
            device.serial, device.firmware_major, device.firmware_minor
        );
    }
    println!(
        "{} listed, {} fetched, {} new, {} already archived, {} skipped",
        summary.total,
        summary.fetched,
        summary.inserted,
        summary.duplicate,
        summary.skipped.len()
    );
    for skipped in &summary.skipped {
        println!("  skipped {}: {}", skipped.handle, skipped.reason);
    }
}

fn print_merge(path: &Path, report: IngestReport) {
    println!(
        "Imported {}: {} new, {} already archived",
        path.display(),
        report.inserted,
        report.duplicate
    );
}

fn list_sessions(archive: &SharedArchive, json: bool) -> Result<()> {
    let archive = archive.read();

    if json {
        println!("{}", serde_json::to_string_pretty(archive.entries())?);
        return Ok(());
    }

    if archive.is_empty() {
        println!("Archive is empty");
        return Ok(());
    }

    for entry in archive.entries() {
        let session = &entry.session;
        let duration = session.duration_secs();
        println!(
            "{}  {:>2}h{:02}m  device {:08x}  {} epoch(s) x {} channel(s)",
            format_timestamp(&session.start()),
            duration / 3600,
            duration % 3600 / 60,
            session.device_serial(),
            session.epochs().len(),
            session.channels()
        );
    }
    println!("{} session(s)", archive.len());
    Ok(())
}
