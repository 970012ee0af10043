use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use metastamp::config::Config;
use metastamp::engine::Engine;
use metastamp::model::{
    EffectiveDate, ExtractionMethod, FileRef, MediaCollection, MediaEntity, is_media_extension,
};
use metastamp::sidecar::{self, JsonSidecarProvider};
use metastamp::tool::{ExifToolProcess, MetadataTool};

#[derive(Parser, Debug)]
#[command(
    name = "metastamp",
    version,
    about = "Persist capture dates and GPS coordinates into media file metadata"
)]
struct Cli {
    /// Media files or directories to process
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Initialize a default config.json and exit
    #[arg(long)]
    init: bool,

    /// Write each file individually instead of batching tool calls
    #[arg(long)]
    no_batching: bool,

    /// Attempt writes even for formats with unreliable tool support
    #[arg(long)]
    force_unsupported: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Handle --init
    if cli.init {
        let config = Config::default();
        let path = cli.config.as_deref();
        config.save(path)?;
        let save_path = match path {
            Some(p) => p.to_path_buf(),
            None => Config::config_path()?,
        };
        println!("Default config written to {}", save_path.display());
        return Ok(());
    }

    // Load config, apply CLI overrides
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.no_batching {
        config.batching_enabled = false;
    }
    if cli.force_unsupported {
        config.force_unsupported = true;
    }

    if cli.paths.is_empty() {
        anyhow::bail!("No input files or directories specified. Use --help for usage.");
    }

    let files = collect_media(&cli.paths);
    if files.is_empty() {
        anyhow::bail!("No supported media files found in the specified paths.");
    }
    log::info!("Found {} media file(s) to process", files.len());

    let collection = build_collection(files).await;

    let tool = ExifToolProcess::probe(config.exiftool_path.clone())
        .await
        .map(|t| Arc::new(t) as Arc<dyn MetadataTool>);
    if tool.is_none() {
        log::warn!("exiftool not found; only JPEG files will be written (native patcher)");
    }

    let mut engine = Engine::new(config, tool);
    let summary = engine.run(&collection, &JsonSidecarProvider).await;

    log::info!(
        "Done: {} file(s) updated ({} with date, {} with GPS) across {} entities",
        summary.unique_files_touched,
        summary.unique_files_with_date,
        summary.unique_files_with_gps,
        engine.entities_processed()
    );

    Ok(())
}

/// Collect media files from the given paths. Directories are walked
/// recursively; non-media files and JSON sidecars are ignored.
fn collect_media(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            if has_media_extension(path) {
                files.push(path.clone());
            } else {
                log::warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            for entry in walkdir::WalkDir::new(path)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file() && has_media_extension(entry.path()) {
                    files.push(entry.path().to_path_buf());
                }
            }
        } else {
            log::warn!("Path not found: {}", path.display());
        }
    }
    files.sort();
    files.dedup();
    files
}

fn has_media_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(is_media_extension)
        .unwrap_or(false)
}

/// One entity per file. The capture date comes from a JSON sidecar when one
/// exists (exact, UTC); otherwise the filesystem modification time stands in
/// as a guess.
async fn build_collection(files: Vec<PathBuf>) -> MediaCollection {
    let mut entities = Vec::with_capacity(files.len());
    for path in files {
        let mut entity = MediaEntity::new(FileRef::primary(&path));

        if let Some(ts) = sidecar_timestamp(&path).await {
            if let Some(dt) = chrono::DateTime::from_timestamp(ts, 0) {
                entity = entity.with_date(
                    EffectiveDate::new(dt.naive_utc(), true),
                    ExtractionMethod::Json,
                );
            }
        } else if let Some(mtime) = file_mtime(&path) {
            entity = entity.with_date(EffectiveDate::new(mtime, false), ExtractionMethod::Guess);
        }

        entities.push(entity);
    }
    MediaCollection::new(entities)
}

async fn sidecar_timestamp(path: &Path) -> Option<i64> {
    sidecar::read_sidecar(path).await?.taken_timestamp()
}

fn file_mtime(path: &Path) -> Option<chrono::NaiveDateTime> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let dt: chrono::DateTime<chrono::Utc> = modified.into();
    Some(dt.naive_utc())
}
