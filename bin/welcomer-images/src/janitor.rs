//! Janitor: periodic reclamation of expired artifacts and idle cache entries.
//!
//! Each cycle removes expired artifacts (index first, then files), compares
//! the store folder against the index, sweeps the resource caches and
//! publishes the results. Folder/index drift is only reported.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use welcomer_common::{ArtifactRecord, DriftSnapshot, ImageMetrics};
use welcomer_render::{CacheSweep, Generator};
use welcomer_store::ArtifactStore;

/// Outcome of one janitor cycle
#[derive(Debug, Clone, Default)]
pub struct JanitorReport {
    /// Records removed from the index
    pub artifacts_freed: usize,
    /// Files removed from the store folder
    pub files_freed: usize,
    pub caches: CacheSweep,
    pub drift: DriftSnapshot,
    pub elapsed: Duration,
}

pub struct Janitor {
    store: ArtifactStore,
    generator: Arc<Generator>,
    metrics: Arc<ImageMetrics>,
    store_path: PathBuf,
}

impl Janitor {
    pub fn new(
        store: ArtifactStore,
        generator: Arc<Generator>,
        metrics: Arc<ImageMetrics>,
        store_path: PathBuf,
    ) -> Self {
        Self {
            store,
            generator,
            metrics,
            store_path,
        }
    }

    /// Run one full cycle as of `now`.
    pub fn run_cycle(&self, now: DateTime<Utc>) -> JanitorReport {
        let start = Instant::now();
        let mut report = JanitorReport::default();

        let live = self.reclaim_artifacts(now, &mut report);
        report.drift = self.reconcile(&live);

        report.caches = self.generator.sweep(Instant::now());
        self.publish(&report);

        report.elapsed = start.elapsed();
        self.metrics.record_janitor_run(report.elapsed);

        info!(
            "Janitor cycle: {} artifacts, {} profiles, {} backgrounds, {} font faces freed in {}ms",
            report.artifacts_freed,
            report.caches.profiles.removed,
            report.caches.backgrounds.removed,
            report.caches.font_faces.removed,
            report.elapsed.as_millis()
        );
        report
    }

    /// Delete expired artifacts and return the records still live.
    fn reclaim_artifacts(
        &self,
        now: DateTime<Utc>,
        report: &mut JanitorReport,
    ) -> Vec<ArtifactRecord> {
        let records = match self.store.list() {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to list artifacts: {}", e);
                return Vec::new();
            }
        };

        let (expired, mut live): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| r.is_expired(now));
        if expired.is_empty() {
            return live;
        }

        let ids: Vec<String> = expired.iter().map(|r| r.id.clone()).collect();
        let removed: HashSet<String> = match self.store.delete_expired(&ids, now) {
            Ok(removed) => removed.into_iter().collect(),
            Err(e) => {
                // Leave the files alone so nothing on disk loses its index entry
                error!("Failed to delete {} expired artifacts: {}", ids.len(), e);
                return live;
            }
        };
        report.artifacts_freed = removed.len();

        for record in expired {
            if !removed.contains(&record.id) {
                // Rewritten after the listing; the fresh record owns the file
                debug!("Artifact {} was refreshed, keeping it", record.id);
                if let Ok(Some(current)) = self.store.get(&record.id) {
                    live.push(current);
                }
                continue;
            }
            let path = self.store_path.join(&record.path);
            match std::fs::remove_file(&path) {
                Ok(()) => report.files_freed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("Expired artifact {} had no file at {}", record.id, path.display());
                }
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        live
    }

    /// Compare the index against the folder contents.
    fn reconcile(&self, live: &[ArtifactRecord]) -> DriftSnapshot {
        let files = match scan_folder(&self.store_path) {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to scan {}: {}", self.store_path.display(), e);
                HashMap::new()
            }
        };

        let indexed: HashSet<&str> = live.iter().map(|r| r.path.as_str()).collect();
        let orphan_files = files.keys().filter(|p| !indexed.contains(p.as_str())).count();
        let missing_files = live.iter().filter(|r| !files.contains_key(&r.path)).count();

        let drift = DriftSnapshot {
            store_count: live.len() as u64,
            store_bytes: live.iter().map(|r| r.size).sum(),
            folder_count: files.len() as u64,
            folder_bytes: files.values().sum(),
            orphan_files: orphan_files as u64,
            missing_files: missing_files as u64,
        };
        if orphan_files > 0 || missing_files > 0 {
            warn!(
                "Store drift: {} files without a record, {} records without a file",
                orphan_files, missing_files
            );
        }
        drift
    }

    fn publish(&self, report: &JanitorReport) {
        self.metrics.record_freed("artifacts", report.artifacts_freed);
        self.metrics.record_freed("profiles", report.caches.profiles.removed);
        self.metrics.record_freed("backgrounds", report.caches.backgrounds.removed);
        self.metrics.record_freed("font_faces", report.caches.font_faces.removed);
        self.metrics.set_drift(report.drift);
        for (kind, entries) in self.generator.cache_populations() {
            self.metrics.set_cache_population(kind, entries);
        }
    }
}

/// Relative path (`/`-separated) and size of every artifact file under `root`.
///
/// Temporary files from in-progress writes are skipped.
fn scan_folder(root: &Path) -> std::io::Result<HashMap<String, u64>> {
    let mut files = HashMap::new();
    if !root.exists() {
        return Ok(files);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(relative, entry.metadata()?.len());
        }
    }
    Ok(files)
}

/// Long-running background task: run a janitor cycle every `interval`.
pub async fn janitor_loop(janitor: Arc<Janitor>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let janitor = Arc::clone(&janitor);
        match tokio::task::spawn_blocking(move || janitor.run_cycle(Utc::now())).await {
            Ok(report) => debug!("Janitor report: {:?}", report),
            Err(e) => error!("Janitor cycle panicked: {}", e),
        }
    }
}
