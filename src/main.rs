//! SmolVLM Notes - command line front end
//!
//! Installs the model, runs photos through it and manages the local model
//! store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use smolvlm_notes::config::{self, PipelineConfig};
use smolvlm_notes::{storage, NotesPipeline, OrtEngine};

/// SmolVLM Notes - extract notes from photos on-device
#[derive(Parser, Debug)]
#[command(name = "smolvlm-notes")]
#[command(about = "Photo to note extraction with an on-device vision-language model")]
struct Args {
    /// Configuration file (defaults to config.toml in the config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// ONNX Runtime intra-op threads
    #[arg(long, default_value = "4")]
    threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download (if needed) and load the model
    Init,
    /// Extract a note from a photo
    Process {
        /// Photo to read (JPEG, PNG, ...)
        photo: PathBuf,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show installation and session status
    Status,
    /// Delete leftover partial downloads
    PurgeCache,
    /// Remove the installed model
    DeleteModel,
    /// Write the effective configuration to the config file
    WriteConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let (config, config_path) = load_or_default_config(args.config.as_deref())?;

    if let Command::WriteConfig = args.command {
        config::save_config(&config, &config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }

    let pipeline = Arc::new(NotesPipeline::from_config(
        &config,
        Arc::new(OrtEngine::new(args.threads)),
    )?);

    match args.command {
        Command::Init => {
            initialize_with_progress(&pipeline).await?;
            println!("Model ready");
        }
        Command::Process { photo, json } => {
            let bytes = std::fs::read(&photo)
                .with_context(|| format!("Failed to read {}", photo.display()))?;
            initialize_with_progress(&pipeline).await?;

            let result = pipeline.process(bytes).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result.text);
                println!();
                println!("confidence: {:.2}", result.confidence);
            }
            pipeline.cleanup().await;
        }
        Command::Status => {
            let status = pipeline.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::PurgeCache => {
            let removed = pipeline.purge_cache()?;
            println!("Removed {removed} cached file(s)");
        }
        Command::DeleteModel => {
            pipeline.delete_model().await?;
            println!("Model deleted");
        }
        Command::WriteConfig => {}
    }

    Ok(())
}

/// Load the configuration file, falling back to defaults when absent
fn load_or_default_config(explicit: Option<&Path>) -> Result<(PipelineConfig, PathBuf)> {
    let config_path = match explicit {
        Some(path) => path.to_path_buf(),
        None => storage::get_config_dir()?.join("config.toml"),
    };

    if config_path.exists() {
        let config = config::load_config(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;
        info!("Loaded configuration from {:?}", config_path);
        return Ok((config, config_path));
    }
    if explicit.is_some() {
        warn!("{:?} does not exist, using default configuration", config_path);
    } else {
        info!("Using default configuration");
    }
    Ok((PipelineConfig::default(), config_path))
}

/// Run `initialize` while logging download progress
async fn initialize_with_progress(pipeline: &Arc<NotesPipeline>) -> Result<()> {
    let init = pipeline.initialize();
    tokio::pin!(init);

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            result = &mut init => {
                result?;
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Some(task) = pipeline.download_progress() {
                    let task = task.borrow().clone();
                    info!(
                        "Downloading {}: {} ({} bytes)",
                        task.id, task.progress, task.bytes_written
                    );
                }
            }
        }
    }
}
