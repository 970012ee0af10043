//! # metastamp
//!
//! Metadata write engine for organized media collections — persist capture
//! dates and GPS coordinates into the files themselves, so the metadata
//! survives outside the folder structure.
//!
//! Writes go through two tiers. JPEGs are patched in-process (fast, no
//! external process); everything else — and any JPEG the native patcher
//! cannot handle — is routed through batched `exiftool` invocations, grouped
//! so files needing identical tags share one call.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use metastamp::config::Config;
//! use metastamp::engine::Engine;
//! use metastamp::model::{FileRef, MediaCollection, MediaEntity};
//! use metastamp::sidecar::JsonSidecarProvider;
//! use metastamp::tool::ExifToolProcess;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!
//!     // Probe for exiftool; the engine runs native-only without it.
//!     let tool = ExifToolProcess::probe(config.exiftool_path.clone())
//!         .await
//!         .map(|t| Arc::new(t) as Arc<dyn metastamp::tool::MetadataTool>);
//!
//!     let collection = MediaCollection::new(vec![
//!         MediaEntity::new(FileRef::primary("photos/img_0001.jpg")),
//!     ]);
//!
//!     let mut engine = Engine::new(config, tool);
//!     let summary = engine.run(&collection, &JsonSidecarProvider).await;
//!     println!("{} file(s) updated", summary.unique_files_touched);
//!     Ok(())
//! }
//! ```
//!
//! ## Write Strategy
//!
//! | Input | Strategy |
//! |-------|----------|
//! | JPEG (`.jpg`, `.jpeg`) | Native EXIF patch; tool fallback on failure |
//! | Other images, videos | Batched exiftool, grouped by tagset |
//! | PNG/GIF/BMP | exiftool with XMP namespace tags |
//! | AVI, MPG/MPEG, BMP, WMV | Skipped unless forced (tool support is unreliable) |
//!
//! ## Modules
//!
//! - [`model`] — entities, file references, dates, coordinates
//! - [`config`] — engine configuration and JSON persistence
//! - [`tags`] — tag compilation (classic EXIF vs XMP) and the force-XMP registry
//! - [`native`] — in-process JPEG patcher
//! - [`tool`] — exiftool process wrapper and diagnostic parsing
//! - [`batch`] — tagset-keyed grouping and the adaptive flush algorithm
//! - [`telemetry`] — per-category/per-route counters and unique-file sets
//! - [`engine`] — the orchestrator tying it all together
//! - [`sidecar`] — GPS coordinate lookup from JSON sidecars

pub mod batch;
pub mod config;
pub mod engine;
pub mod model;
pub mod native;
pub mod sidecar;
pub mod tags;
pub mod telemetry;
pub mod tool;
