/*!
# SEM Grabber

Acquires scan frames from a scanning electron microscope controller,
reconstructs one grayscale image per captured detector channel and saves
them, optionally pairing consecutive frames into red/blue stereo images.

## Features

- UDP capture from the controller's serial bridge
- Replay of recorded byte dumps
- Synthetic scan generator for testing without hardware
- Auto-contrast and scan jitter correction per frame
- Automatic restart of aborted acquisitions

## Usage

### Capture from the bridge
```bash
semgrabber capture --port 12345 --output-dir ./images
```

### Replay a recording
```bash
semgrabber replay scan.bin --stereo
```

### Generate a recording
```bash
semgrabber synthetic --frames 20 --record scan.bin
```
*/

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use shared::DirectoryStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod acquisition;
mod config;
mod consumer;
mod supervisor;
mod synthetic;
mod transport;

use acquisition::AcquisitionSettings;
use config::{AppConfig, StrategyKind};
use consumer::ImageConsumer;
use supervisor::Supervisor;
use synthetic::SyntheticTransport;
use transport::{ReaderTransport, Transport, UdpTransport};

#[derive(Parser)]
#[command(name = "semgrabber")]
#[command(about = "SEM scan acquisition and image reconstruction")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "semgrabber.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture frames from the UDP bridge
    Capture {
        /// UDP bind address
        #[arg(short, long)]
        bind_addr: Option<String>,

        /// UDP port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Replay a recorded byte dump
    Replay {
        /// Recording to decode
        file: PathBuf,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Acquire from the synthetic scan generator
    Synthetic {
        /// Number of frames to generate
        #[arg(short, long, default_value = "10")]
        frames: u32,

        /// Time between frames in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Write the frames to this file instead of acquiring them
        #[arg(long)]
        record: Option<PathBuf>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "semgrabber.toml")]
        output: PathBuf,
    },
}

/// Output options shared by the acquisition commands
#[derive(Args)]
struct OutputArgs {
    /// Root output directory
    #[arg(short, long)]
    output_dir: Option<String>,

    /// Do not save images
    #[arg(long)]
    no_save: bool,

    /// Pair consecutive frames into stereo images
    #[arg(long)]
    stereo: bool,

    /// Render lines as they arrive instead of buffering whole frames
    #[arg(long)]
    preview: bool,
}

impl OutputArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(dir) = &self.output_dir {
            config.output.output_directory = dir.clone();
        }
        if self.no_save {
            config.output.save_images = false;
        }
        if self.stereo {
            config.output.stereo_pairs = true;
        }
        if self.preview {
            config.acquisition.strategy = StrategyKind::Preview;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr, filtered by RUST_LOG
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config { output } => generate_config_file(output),

        Commands::Capture { bind_addr, port, output } => {
            let mut config = AppConfig::load_or_default(&cli.config)?;
            output.apply(&mut config);
            if let Some(bind_addr) = bind_addr {
                config.transport.udp_bind_addr = bind_addr;
            }
            if let Some(port) = port {
                config.transport.udp_port = port;
            }

            info!(
                "🚀 Capturing from {}:{}",
                config.transport.udp_bind_addr, config.transport.udp_port
            );
            let transport_config = config.transport.clone();
            run_acquisition(&config, true, move || Ok(UdpTransport::new(transport_config.clone())))
        }

        Commands::Replay { file, output } => {
            let mut config = AppConfig::load_or_default(&cli.config)?;
            output.apply(&mut config);

            info!("🚀 Replaying {}", file.display());
            // A recording replays the same way every time, so never restart it
            run_acquisition(&config, false, move || {
                ReaderTransport::open(&file)
                    .with_context(|| format!("Failed to open recording {}", file.display()))
            })
        }

        Commands::Synthetic { frames, interval_ms, record, output } => {
            let mut config = AppConfig::load_or_default(&cli.config)?;
            output.apply(&mut config);
            let geometry = config.acquisition.geometry()?;

            if let Some(path) = record {
                return synthetic::write_recording(&path, &geometry, frames);
            }

            info!("🧪 Acquiring {} synthetic frames", frames);
            let interval = Duration::from_millis(interval_ms);
            run_acquisition(&config, false, move || {
                Ok(SyntheticTransport::new(geometry.clone(), interval, Some(frames)))
            })
        }
    }
}

/// Acquire until the transport closes, the run gives up or Ctrl+C is pressed
fn run_acquisition<F, T>(config: &AppConfig, allow_restart: bool, make_transport: F) -> Result<()>
where
    F: FnMut() -> Result<T>,
    T: Transport + 'static,
{
    let settings = AcquisitionSettings::from_config(&config.acquisition)?;

    let store = if config.output.save_images {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let dir = format!("{}/{}", config.output.output_directory, timestamp);
        info!("📁 Images will be saved to: {}", dir);
        Some(DirectoryStore::new(&dir).with_context(|| format!("Failed to create {}", dir))?)
    } else {
        info!("📺 Image saving disabled");
        None
    };
    let mut consumer = ImageConsumer::new(store, &config.output);

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        eprintln!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        handler_flag.store(false, Ordering::SeqCst);
    })?;

    let max_restarts = if allow_restart { config.acquisition.max_restarts } else { 0 };
    let mut supervisor = Supervisor::new(make_transport, settings, running)
        .with_restarts(max_restarts, config.acquisition.restart_delay());

    let summary = supervisor.run(&mut consumer)?;
    consumer.finish();

    info!(
        "✅ Acquisition completed: {} frames in {} runs ({} restarts), final phase {:?}",
        summary.frames_completed, summary.runs, summary.restarts, summary.final_phase
    );
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   semgrabber --config {} capture", output_path.display());

    Ok(())
}
