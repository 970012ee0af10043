//! Bounded-concurrency traversal of the collection, wiring the tag compiler,
//! native patcher, tool batching and telemetry into one run.
//!
//! Entities are processed in fixed-size concurrent slices. Per-file pipelines
//! only read shared state (config, force-XMP registry) and do file-local IO;
//! all shared mutation — telemetry, pending queues, registry updates — happens
//! between slices under a single writer, so counter updates stay commutative
//! and no intra-run file lock is needed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::batch::{BatchWriter, PendingBatches, QueuedWrite};
use crate::config::Config;
use crate::model::{
    Coordinates, FileRole, MediaCollection, MediaEntity, is_native_supported, is_video,
};
use crate::native;
use crate::sidecar::CoordinateProvider;
use crate::tags::{ForceXmpRegistry, compile_tags, passes_format_gate};
use crate::telemetry::{Category, Route, TelemetryState};
use crate::tool::MetadataTool;

/// What one run accomplished, for the surrounding pipeline's reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub unique_files_touched: usize,
    pub unique_files_with_date: usize,
    pub unique_files_with_gps: usize,
    pub date_attempts: u64,
    pub gps_attempts: u64,
}

#[derive(Debug)]
struct AttemptRecord {
    category: Category,
    route: Route,
    success: bool,
    elapsed: Duration,
}

#[derive(Debug, Default)]
struct FileOutcome {
    path: PathBuf,
    role: FileRole,
    records: Vec<AttemptRecord>,
    touched: Vec<Category>,
    queued: Option<QueuedWrite>,
}

/// The metadata write engine.
pub struct Engine {
    config: Config,
    writer: Option<BatchWriter>,
    pending: PendingBatches,
    telemetry: TelemetryState,
    registry: ForceXmpRegistry,
    entities_processed: u64,
    warned_no_tool: bool,
}

impl Engine {
    /// `tool` absent disables every tool-based path; native patching still
    /// runs.
    pub fn new(config: Config, tool: Option<Arc<dyn MetadataTool>>) -> Self {
        Self {
            config,
            writer: tool.map(BatchWriter::new),
            pending: PendingBatches::new(),
            telemetry: TelemetryState::new(),
            registry: ForceXmpRegistry::new(),
            entities_processed: 0,
            warned_no_tool: false,
        }
    }

    /// Entities processed so far.
    pub fn entities_processed(&self) -> u64 {
        self.entities_processed
    }

    /// Pending-flush items processed so far.
    pub fn flush_items_processed(&self) -> u64 {
        self.writer.as_ref().map(|w| w.items_processed()).unwrap_or(0)
    }

    /// Run the engine over the whole collection. Per-file failures never
    /// propagate; the summary is produced even under majority failure.
    pub async fn run(
        &mut self,
        collection: &MediaCollection,
        provider: &dyn CoordinateProvider,
    ) -> RunSummary {
        let slice_size = self.config.concurrency.max(1);

        for slice in collection.entities.chunks(slice_size) {
            let outcomes = {
                let config = &self.config;
                let registry = &self.registry;
                futures::future::join_all(
                    slice
                        .iter()
                        .map(|entity| process_entity(entity, provider, config, registry)),
                )
                .await
            };

            for entity_outcomes in outcomes {
                self.entities_processed += 1;
                for outcome in entity_outcomes {
                    self.apply_outcome(outcome).await;
                }
            }

            if self.config.batching_enabled {
                self.flush_over_threshold().await;
            }

            if self
                .writer
                .as_ref()
                .map(|w| w.capability_lost())
                .unwrap_or(false)
            {
                log::error!("Tool capability lost — draining without new slices");
                break;
            }
        }

        // Unconditional final flush of everything remaining.
        self.flush_all().await;

        self.telemetry.dump();
        self.summary()
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            unique_files_touched: self.telemetry.unique_touched(),
            unique_files_with_date: self.telemetry.unique_with_date(),
            unique_files_with_gps: self.telemetry.unique_with_gps(),
            date_attempts: self.telemetry.date_attempts(),
            gps_attempts: self.telemetry.gps_attempts(),
        }
    }

    async fn apply_outcome(&mut self, outcome: FileOutcome) {
        for record in &outcome.records {
            self.telemetry
                .record(record.category, record.route, record.success, record.elapsed);
        }
        for category in &outcome.touched {
            self.telemetry.mark_touched(&outcome.path, outcome.role, *category);
        }

        let Some(queued) = outcome.queued else { return };

        let Some(writer) = &self.writer else {
            if !self.warned_no_tool {
                log::warn!("No metadata tool available; tool-bound writes are skipped");
                self.warned_no_tool = true;
            }
            return;
        };

        if !self.config.batching_enabled {
            writer.write_individually(queued, &mut self.telemetry).await;
            return;
        }

        let cap = self.config.batch_cap(is_video(&queued.path));
        if let Some(drained) = self.pending.enqueue(queued, cap) {
            writer.flush(drained, &mut self.telemetry, &mut self.registry).await;
        }
    }

    async fn flush_over_threshold(&mut self) {
        let Some(writer) = &self.writer else { return };
        for queue in self.pending.take_over_threshold() {
            writer.flush(queue, &mut self.telemetry, &mut self.registry).await;
        }
    }

    async fn flush_all(&mut self) {
        let Some(writer) = &self.writer else { return };
        for queue in self.pending.drain_all() {
            writer.flush(queue, &mut self.telemetry, &mut self.registry).await;
        }
    }
}

/// Per-entity pipeline: resolve coordinates once, then compile and attempt a
/// write for each eligible file. Only file-local IO happens here.
async fn process_entity(
    entity: &MediaEntity,
    provider: &dyn CoordinateProvider,
    config: &Config,
    registry: &ForceXmpRegistry,
) -> Vec<FileOutcome> {
    let lookup_path = entity
        .files()
        .find_map(|f| f.eligible_target().map(|p| p.to_path_buf()));

    let coords = match &lookup_path {
        Some(path) => provider.coordinates_for(path).await,
        None => None,
    };

    let mut outcomes = Vec::new();
    for file in entity.files() {
        let Some(target) = file.eligible_target() else {
            continue;
        };
        outcomes.push(process_file(
            target.to_path_buf(),
            file.role,
            entity,
            coords.as_ref(),
            config,
            registry,
        ));
    }
    outcomes
}

fn process_file(
    path: PathBuf,
    role: FileRole,
    entity: &MediaEntity,
    coords: Option<&Coordinates>,
    config: &Config,
    registry: &ForceXmpRegistry,
) -> FileOutcome {
    let mut outcome = FileOutcome {
        path: path.clone(),
        role,
        ..Default::default()
    };

    let date = entity.date.as_ref();
    let coords = coords.filter(|c| !c.is_zero());
    if date.is_none() && coords.is_none() {
        return outcome;
    }

    let mut date_native = false;
    let mut gps_native = false;
    let mut fallback = false;

    // Native tier first for the JPEG family, unless the file is already
    // known to need the XMP namespace.
    if is_native_supported(&path) && !registry.contains(&path) {
        let category = match (date.is_some(), coords.is_some()) {
            (true, true) => Category::Combined,
            (true, false) => Category::DateOnly,
            (false, true) => Category::GpsOnly,
            (false, false) => unreachable!(),
        };

        let started = Instant::now();
        let success = match (date, coords) {
            (Some(d), Some(c)) => native::write_combined(&path, d, c),
            (Some(d), None) => native::write_date(&path, d),
            (None, Some(c)) => native::write_gps(&path, c),
            (None, None) => unreachable!(),
        };
        let elapsed = started.elapsed();

        outcome.records.push(AttemptRecord {
            category,
            route: Route::Native,
            success,
            elapsed,
        });

        if success {
            outcome.touched.push(category);
            date_native = date.is_some();
            gps_native = coords.is_some();
        } else {
            fallback = true;
        }
    }

    let compiled = compile_tags(
        &path,
        date,
        entity.method,
        coords,
        registry,
        date_native,
        gps_native,
    );

    if !compiled.tags.is_empty() && passes_format_gate(&path, config) {
        outcome.queued = Some(QueuedWrite {
            path,
            tags: compiled.tags,
            role,
            fallback,
        });
    }

    outcome
}
