//! Grouping of tool-bound writes and the adaptive flush algorithm.
//!
//! Files needing an identical TagSet share one tool invocation, bounded by
//! per-chunk caps. A rejected batch degrades to finer granularity: paths
//! recovered from the diagnostic are isolated and written individually, the
//! clean remainder retries as a batch, and a diagnostic with no recoverable
//! paths triggers bisection down to single-file calls.

use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::model::{FileRole, is_native_supported, is_video};
use crate::tags::{ForceXmpRegistry, TagSet, rewrite_to_xmp};
use crate::telemetry::{Category, Route, TelemetryState, proportional_share};
use crate::tool::{MetadataTool, ToolError, is_truncated_interop, parse_failed_paths};

/// One file's pending tool write.
#[derive(Debug, Clone)]
pub struct QueuedWrite {
    pub path: PathBuf,
    pub tags: TagSet,
    pub role: FileRole,
    /// Pre-marked when the tool is only being used because a native attempt
    /// failed for this file; attributes the write to the fallback route.
    pub fallback: bool,
}

impl QueuedWrite {
    fn route(&self) -> Route {
        if self.fallback {
            Route::ToolFallback
        } else {
            Route::ToolDirect
        }
    }
}

/// Per-key flush threshold checked after each processing slice. The base is
/// smaller where the command line is short; videos flush earlier still
/// because their tool calls are slower.
pub fn flush_threshold(contains_video: bool) -> usize {
    let base = if cfg!(windows) { 30 } else { 60 };
    if contains_video { base / 3 } else { base }
}

/// Batch size above which the argument list ships through an args file.
pub fn argfile_threshold(contains_video: bool) -> usize {
    match (contains_video, cfg!(windows)) {
        (true, true) => 5,
        (true, false) => 10,
        (false, true) => 20,
        (false, false) => 40,
    }
}

fn contains_video(queue: &[QueuedWrite]) -> bool {
    queue.iter().any(|w| is_video(&w.path))
}

/// Pending tool writes grouped by tagset key, append order preserved within
/// each group.
#[derive(Debug, Default)]
pub struct PendingBatches {
    queues: BTreeMap<String, Vec<QueuedWrite>>,
}

impl PendingBatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write under its tagset key. When the key's queue has already
    /// reached `cap`, the full queue is returned for draining before the new
    /// entry is accepted.
    pub fn enqueue(&mut self, write: QueuedWrite, cap: usize) -> Option<Vec<QueuedWrite>> {
        let key = write.tags.group_key();
        let queue = self.queues.entry(key).or_default();
        let drained = if queue.len() >= cap {
            Some(std::mem::take(queue))
        } else {
            None
        };
        queue.push(write);
        drained
    }

    /// Remove and return every queue whose length crosses its threshold.
    pub fn take_over_threshold(&mut self) -> Vec<Vec<QueuedWrite>> {
        let keys: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.len() >= flush_threshold(contains_video(q)))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| self.queues.remove(&k))
            .collect()
    }

    /// Remove and return everything, for the unconditional end-of-run flush.
    pub fn drain_all(&mut self) -> Vec<Vec<QueuedWrite>> {
        let queues = std::mem::take(&mut self.queues);
        queues.into_values().filter(|q| !q.is_empty()).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }
}

/// Drains pending queues against the external tool, degrading granularity on
/// failure.
pub struct BatchWriter {
    tool: Arc<dyn MetadataTool>,
    items_processed: AtomicU64,
    capability_lost: AtomicBool,
}

impl BatchWriter {
    pub fn new(tool: Arc<dyn MetadataTool>) -> Self {
        Self {
            tool,
            items_processed: AtomicU64::new(0),
            capability_lost: AtomicBool::new(false),
        }
    }

    /// Items drained so far (the pending-flush progress counter).
    pub fn items_processed(&self) -> u64 {
        self.items_processed.load(Ordering::Relaxed)
    }

    /// Set when the tool stopped being invocable mid-run. The orchestrator
    /// stops launching new slices once this trips.
    pub fn capability_lost(&self) -> bool {
        self.capability_lost.load(Ordering::Relaxed)
    }

    /// Flush one tagset-keyed queue. Recursion bisects on unattributable
    /// failures, so this terminates after at most O(n) tool calls.
    pub fn flush<'a>(
        &'a self,
        queue: Vec<QueuedWrite>,
        telemetry: &'a mut TelemetryState,
        registry: &'a mut ForceXmpRegistry,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match queue.len() {
                0 => {}
                1 => {
                    if let Some(entry) = queue.into_iter().next() {
                        self.write_individually(entry, telemetry).await;
                    }
                }
                _ => self.flush_batch(queue, telemetry, registry).await,
            }
        })
    }

    async fn flush_batch(
        &self,
        queue: Vec<QueuedWrite>,
        telemetry: &mut TelemetryState,
        registry: &mut ForceXmpRegistry,
    ) {
        if self.capability_lost() {
            return;
        }

        let files: Vec<PathBuf> = queue.iter().map(|w| w.path.clone()).collect();
        let tags = queue[0].tags.clone();
        let use_argfile = queue.len() > argfile_threshold(contains_video(&queue));

        let started = Instant::now();
        let result = if use_argfile {
            self.tool.write_batch_via_argfile(&files, &tags).await
        } else {
            self.tool.write_batch(&files, &tags).await
        };
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                let total = queue.len();
                let share = proportional_share(elapsed, 1, total);
                for entry in &queue {
                    if let Some(category) = Category::of(&entry.tags) {
                        telemetry.record(category, entry.route(), true, share);
                        telemetry.mark_touched(&entry.path, entry.role, category);
                    }
                }
                self.items_processed.fetch_add(total as u64, Ordering::Relaxed);
            }
            Err(ToolError::Unavailable(e)) => {
                log::error!("Metadata tool became unavailable mid-batch: {e}");
                self.capability_lost.store(true, Ordering::Relaxed);
                self.record_all_failed(&queue, telemetry, elapsed);
            }
            Err(ToolError::Failed { stderr }) => {
                self.handle_batch_failure(queue, stderr, telemetry, registry).await;
            }
        }
    }

    async fn handle_batch_failure(
        &self,
        queue: Vec<QueuedWrite>,
        stderr: String,
        telemetry: &mut TelemetryState,
        registry: &mut ForceXmpRegistry,
    ) {
        let implicated_paths = parse_failed_paths(&stderr);

        let (mut implicated, clean): (Vec<QueuedWrite>, Vec<QueuedWrite>) = queue
            .into_iter()
            .partition(|w| path_is_implicated(&w.path, &implicated_paths));

        if implicated.is_empty() {
            // No recovered path matches a queued entry — either the
            // diagnostic named no paths at all, or only path-like noise
            // (an argfile name, say). Re-batching the same queue would loop
            // on the same rejection, so the whole queue is suspect. Bisect;
            // single-entry halves bottom out in write_individually.
            log::debug!(
                "Batch of {} rejected with no attributable paths; bisecting",
                clean.len()
            );
            let mut left = clean;
            let right = left.split_off(left.len() / 2);
            self.flush(left, &mut *telemetry, &mut *registry).await;
            self.flush(right, &mut *telemetry, &mut *registry).await;
            return;
        }

        // A truncated interop sub-directory in a JPEG means the classic
        // structure cannot be extended; route those files through the XMP
        // namespace for the rest of the run.
        if is_truncated_interop(&stderr) {
            for entry in implicated.iter_mut() {
                if is_native_supported(&entry.path) {
                    log::info!(
                        "Switching {} to XMP tags after truncated InteropIFD",
                        entry.path.display()
                    );
                    registry.register(&entry.path);
                    entry.tags = rewrite_to_xmp(&entry.tags);
                }
            }
        }

        self.flush(clean, &mut *telemetry, &mut *registry).await;

        for entry in implicated {
            self.write_individually(entry, telemetry).await;
        }
    }

    /// One direct tool call for one file. Failure here is terminal for the
    /// file this run. The modification time is restored regardless of
    /// outcome, and a stray temporary from a failed call is removed.
    pub async fn write_individually(&self, entry: QueuedWrite, telemetry: &mut TelemetryState) {
        if self.capability_lost() {
            return;
        }
        let Some(category) = Category::of(&entry.tags) else {
            return;
        };

        let mtime = std::fs::metadata(&entry.path)
            .and_then(|m| m.modified())
            .ok();

        let started = Instant::now();
        let result = self.tool.write_single(&entry.path, &entry.tags).await;
        let elapsed = started.elapsed();

        restore_mtime(&entry.path, mtime);

        match result {
            Ok(()) => {
                telemetry.record(category, entry.route(), true, elapsed);
                telemetry.mark_touched(&entry.path, entry.role, category);
            }
            Err(ToolError::Unavailable(e)) => {
                log::error!("Metadata tool became unavailable: {e}");
                self.capability_lost.store(true, Ordering::Relaxed);
                telemetry.record(category, entry.route(), false, elapsed);
            }
            Err(ToolError::Failed { stderr }) => {
                if is_truncated_interop(&stderr) {
                    log::debug!(
                        "Benign diagnostic for {}: {}",
                        entry.path.display(),
                        stderr.trim()
                    );
                } else {
                    log::warn!(
                        "Metadata write failed for {} (not retried): {}",
                        entry.path.display(),
                        stderr.trim()
                    );
                }
                remove_stray_tmp(&entry.path);
                telemetry.record(category, entry.route(), false, elapsed);
            }
        }

        self.items_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_all_failed(
        &self,
        queue: &[QueuedWrite],
        telemetry: &mut TelemetryState,
        elapsed: std::time::Duration,
    ) {
        let share = proportional_share(elapsed, 1, queue.len());
        for entry in queue {
            if let Some(category) = Category::of(&entry.tags) {
                telemetry.record(category, entry.route(), false, share);
            }
        }
        self.items_processed
            .fetch_add(queue.len() as u64, Ordering::Relaxed);
    }
}

/// Match a queued path against diagnostic-recovered paths, tolerating
/// differing roots and slash direction.
fn path_is_implicated(path: &Path, implicated: &[PathBuf]) -> bool {
    let own = path.to_string_lossy().replace('\\', "/").to_lowercase();
    implicated.iter().any(|p| {
        let theirs = p.to_string_lossy().to_lowercase();
        own == theirs || own.ends_with(&theirs) || theirs.ends_with(&own)
    })
}

/// exiftool leaves a `<name>_exiftool_tmp` behind when it dies mid-write.
fn remove_stray_tmp(path: &Path) {
    let Some(name) = path.file_name() else { return };
    let mut tmp_name = name.to_os_string();
    tmp_name.push("_exiftool_tmp");
    let tmp = path.with_file_name(tmp_name);
    if tmp.exists() {
        if let Err(e) = std::fs::remove_file(&tmp) {
            log::debug!("Could not remove stray {}: {e}", tmp.display());
        }
    }
}

fn restore_mtime(path: &Path, mtime: Option<std::time::SystemTime>) {
    let Some(mtime) = mtime else { return };
    let restored = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(mtime));
    if let Err(e) = restored {
        log::debug!("Could not restore mtime for {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::TagValue;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Single(PathBuf, String),
        Batch(Vec<PathBuf>),
        ArgFile(Vec<PathBuf>),
    }

    /// Scripted tool double: batch calls fail with the queued stderr
    /// answers, then succeed.
    struct ScriptedTool {
        calls: Mutex<Vec<Call>>,
        batch_stderr: Mutex<Vec<String>>,
        fail_singles: bool,
    }

    impl ScriptedTool {
        fn new(batch_stderr: Vec<String>, fail_singles: bool) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                batch_stderr: Mutex::new(batch_stderr),
                fail_singles,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn next_batch_result(&self) -> Result<(), ToolError> {
            let mut queue = self.batch_stderr.lock().unwrap();
            if queue.is_empty() {
                Ok(())
            } else {
                Err(ToolError::Failed {
                    stderr: queue.remove(0),
                })
            }
        }
    }

    #[async_trait::async_trait]
    impl MetadataTool for ScriptedTool {
        async fn write_single(&self, file: &Path, tags: &TagSet) -> Result<(), ToolError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Single(file.to_path_buf(), tags.group_key()));
            if self.fail_singles {
                Err(ToolError::Failed {
                    stderr: "Error: unwritable".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn write_batch(&self, files: &[PathBuf], _tags: &TagSet) -> Result<(), ToolError> {
            self.calls.lock().unwrap().push(Call::Batch(files.to_vec()));
            self.next_batch_result()
        }

        async fn write_batch_via_argfile(
            &self,
            files: &[PathBuf],
            _tags: &TagSet,
        ) -> Result<(), ToolError> {
            self.calls.lock().unwrap().push(Call::ArgFile(files.to_vec()));
            self.next_batch_result()
        }
    }

    fn gps_tags() -> TagSet {
        let mut t = TagSet::new();
        t.set("GPSLatitude", TagValue::Num(40.6892));
        t.set("GPSLatitudeRef", TagValue::Str("N".into()));
        t.set("GPSLongitude", TagValue::Num(74.0445));
        t.set("GPSLongitudeRef", TagValue::Str("W".into()));
        t
    }

    fn queued(path: &str) -> QueuedWrite {
        QueuedWrite {
            path: PathBuf::from(path),
            tags: gps_tags(),
            role: FileRole::Primary,
            fallback: false,
        }
    }

    #[test]
    fn enqueue_groups_by_tagset_key() {
        let mut pending = PendingBatches::new();
        assert!(pending.enqueue(queued("/a.jpg"), 10).is_none());
        assert!(pending.enqueue(queued("/b.jpg"), 10).is_none());
        let mut other = queued("/c.jpg");
        other.tags.set("GPSLatitude", TagValue::Num(1.0));
        assert!(pending.enqueue(other, 10).is_none());
        assert_eq!(pending.pending_count(), 3);
        assert_eq!(pending.drain_all().len(), 2);
    }

    #[test]
    fn enqueue_drains_at_cap() {
        let mut pending = PendingBatches::new();
        assert!(pending.enqueue(queued("/a.jpg"), 2).is_none());
        assert!(pending.enqueue(queued("/b.jpg"), 2).is_none());
        let drained = pending.enqueue(queued("/c.jpg"), 2).unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(pending.pending_count(), 1);
    }

    #[test]
    fn thresholds_are_smaller_for_videos() {
        assert!(flush_threshold(true) < flush_threshold(false));
        assert!(argfile_threshold(true) < argfile_threshold(false));
    }

    #[tokio::test]
    async fn successful_batch_touches_every_entry() {
        let tool = Arc::new(ScriptedTool::new(vec![], false));
        let writer = BatchWriter::new(tool.clone());
        let mut telemetry = TelemetryState::new();
        let mut registry = ForceXmpRegistry::new();

        let queue = vec![queued("/a.jpg"), queued("/b.jpg"), queued("/c.jpg")];
        writer.flush(queue, &mut telemetry, &mut registry).await;

        assert_eq!(tool.calls(), vec![Call::Batch(vec![
            PathBuf::from("/a.jpg"),
            PathBuf::from("/b.jpg"),
            PathBuf::from("/c.jpg"),
        ])]);
        assert_eq!(telemetry.unique_with_gps(), 3);
        assert_eq!(telemetry.unique_touched(), 3);
        assert_eq!(writer.items_processed(), 3);
    }

    #[tokio::test]
    async fn single_entry_skips_batching() {
        let tool = Arc::new(ScriptedTool::new(vec![], false));
        let writer = BatchWriter::new(tool.clone());
        let mut telemetry = TelemetryState::new();
        let mut registry = ForceXmpRegistry::new();

        writer
            .flush(vec![queued("/only.jpg")], &mut telemetry, &mut registry)
            .await;

        assert!(matches!(tool.calls().as_slice(), [Call::Single(_, _)]));
    }

    #[tokio::test]
    async fn bad_path_isolation_retries_clean_subset_as_batch() {
        let stderr = "Error: Bad IFD0 directory - /data/photo2.jpg".to_string();
        let tool = Arc::new(ScriptedTool::new(vec![stderr], false));
        let writer = BatchWriter::new(tool.clone());
        let mut telemetry = TelemetryState::new();
        let mut registry = ForceXmpRegistry::new();

        let queue = vec![
            queued("/data/photo1.jpg"),
            queued("/data/photo2.jpg"),
            queued("/data/photo3.jpg"),
        ];
        writer.flush(queue, &mut telemetry, &mut registry).await;

        let calls = tool.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls[1],
            Call::Batch(vec![
                PathBuf::from("/data/photo1.jpg"),
                PathBuf::from("/data/photo3.jpg"),
            ])
        );
        assert!(matches!(&calls[2], Call::Single(p, _) if p == Path::new("/data/photo2.jpg")));
        assert_eq!(telemetry.unique_touched(), 3);
    }

    #[tokio::test]
    async fn truncated_interop_registers_force_xmp_and_rewrites_tags() {
        let stderr = "Error: truncated InteropIFD directory - /data/photo2.jpg".to_string();
        let tool = Arc::new(ScriptedTool::new(vec![stderr], false));
        let writer = BatchWriter::new(tool.clone());
        let mut telemetry = TelemetryState::new();
        let mut registry = ForceXmpRegistry::new();

        let queue = vec![
            queued("/data/photo1.jpg"),
            queued("/data/photo2.jpg"),
            queued("/data/photo3.jpg"),
        ];
        writer.flush(queue, &mut telemetry, &mut registry).await;

        assert!(registry.contains(Path::new("/data/photo2.jpg")));

        let calls = tool.calls();
        let single_key = calls
            .iter()
            .find_map(|c| match c {
                Call::Single(p, key) if p == Path::new("/data/photo2.jpg") => Some(key.clone()),
                _ => None,
            })
            .unwrap();
        // Signed decimals under the XMP prefix, no reference fields.
        assert!(single_key.contains("XMP:GPSLatitude=40.6892"));
        assert!(single_key.contains("XMP:GPSLongitude=-74.0445"));
        assert!(!single_key.contains("GPSLatitudeRef"));
    }

    #[tokio::test]
    async fn unattributable_failures_bisect_to_singles() {
        // Every batch call fails without naming a path; every entry must be
        // attempted at single-file granularity with a bounded call count.
        let n = 8;
        let stderr: Vec<String> = (0..n).map(|_| "Error: Format error".to_string()).collect();
        let tool = Arc::new(ScriptedTool::new(stderr, true));
        let writer = BatchWriter::new(tool.clone());
        let mut telemetry = TelemetryState::new();
        let mut registry = ForceXmpRegistry::new();

        let queue: Vec<QueuedWrite> = (0..n).map(|i| queued(&format!("/f{i}.jpg"))).collect();
        writer.flush(queue, &mut telemetry, &mut registry).await;

        let calls = tool.calls();
        let singles = calls.iter().filter(|c| matches!(c, Call::Single(_, _))).count();
        assert_eq!(singles, n);
        // n singles plus at most n-1 internal batch attempts.
        assert!(calls.len() <= 2 * n - 1);
        assert_eq!(writer.items_processed(), n as u64);
        assert_eq!(telemetry.unique_touched(), 0);
        // Only terminal outcomes are recorded as attempts.
        assert_eq!(telemetry.gps_attempts() as usize, n);
    }

    #[tokio::test]
    async fn diagnostic_naming_only_unrelated_paths_bisects_to_singles() {
        // The recovered path is path-shaped but matches nothing in the
        // queue (an args-file name, for instance). Must degrade exactly
        // like a path-free rejection: bounded calls, every entry bottoming
        // out at single-file granularity.
        let n = 4;
        let stderr: Vec<String> = (0..n)
            .map(|_| "Error: bad args - /tmp/metastamp-args-x1y2.txt".to_string())
            .collect();
        let tool = Arc::new(ScriptedTool::new(stderr, true));
        let writer = BatchWriter::new(tool.clone());
        let mut telemetry = TelemetryState::new();
        let mut registry = ForceXmpRegistry::new();

        let queue: Vec<QueuedWrite> = (0..n).map(|i| queued(&format!("/f{i}.jpg"))).collect();
        writer.flush(queue, &mut telemetry, &mut registry).await;

        let calls = tool.calls();
        let singles = calls.iter().filter(|c| matches!(c, Call::Single(_, _))).count();
        assert_eq!(singles, n);
        assert!(calls.len() <= 2 * n - 1);
        assert_eq!(writer.items_processed(), n as u64);
    }

    #[tokio::test]
    async fn fallback_entries_attribute_to_fallback_route() {
        let tool = Arc::new(ScriptedTool::new(vec![], false));
        let writer = BatchWriter::new(tool.clone());
        let mut telemetry = TelemetryState::new();
        let mut registry = ForceXmpRegistry::new();

        let mut a = queued("/a.jpg");
        a.fallback = true;
        let b = queued("/b.jpg");
        writer.flush(vec![a, b], &mut telemetry, &mut registry).await;

        // One fallback success excluded from the grand total.
        assert_eq!(
            telemetry.successes_excluding_fallback(Category::GpsOnly),
            1
        );
        assert_eq!(telemetry.unique_touched(), 2);
    }

    #[tokio::test]
    async fn argfile_transport_over_threshold() {
        let tool = Arc::new(ScriptedTool::new(vec![], false));
        let writer = BatchWriter::new(tool.clone());
        let mut telemetry = TelemetryState::new();
        let mut registry = ForceXmpRegistry::new();

        let n = argfile_threshold(false) + 1;
        let queue: Vec<QueuedWrite> = (0..n).map(|i| queued(&format!("/f{i}.jpg"))).collect();
        writer.flush(queue, &mut telemetry, &mut registry).await;

        assert!(matches!(tool.calls().as_slice(), [Call::ArgFile(files)] if files.len() == n));
    }
}
