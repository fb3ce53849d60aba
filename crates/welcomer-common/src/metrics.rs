//! Image service metrics for Prometheus
//!
//! Tracks generation, cache populations, store/folder drift, janitor sweeps,
//! avatar fetches and HTTP traffic.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries shared by every latency series
const LATENCY_BUCKET_BOUNDARIES_MS: [u64; 11] =
    [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

/// Resource caches reported by the janitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Fonts,
    FontFaces,
    Backgrounds,
    Profiles,
}

impl CacheKind {
    pub const ALL: [Self; 4] = [Self::Fonts, Self::FontFaces, Self::Backgrounds, Self::Profiles];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fonts => "fonts",
            Self::FontFaces => "font_faces",
            Self::Backgrounds => "backgrounds",
            Self::Profiles => "profiles",
        }
    }
}

/// HTTP routes with their own series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    ImagesGet,
    ImagesCreate,
    Other,
}

impl Route {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ImagesGet => "images_get",
            Self::ImagesCreate => "images_create",
            Self::Other => "other",
        }
    }
}

/// Cumulative latency histogram
#[derive(Debug, Default)]
struct Histogram {
    count: AtomicU64,
    sum_us: AtomicU64,
    buckets: [AtomicU64; 11],
}

impl Histogram {
    fn observe(&self, elapsed: Duration) {
        let latency_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let latency_ms = latency_us / 1000;
        for (i, &boundary) in LATENCY_BUCKET_BOUNDARIES_MS.iter().enumerate() {
            if latency_ms <= boundary {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn write(&self, output: &mut String, name: &str, labels: &str) {
        let sep = if labels.is_empty() { "" } else { "," };
        for (i, &boundary) in LATENCY_BUCKET_BOUNDARIES_MS.iter().enumerate() {
            let _ = writeln!(
                output,
                "{name}_bucket{{{labels}{sep}le=\"{}\"}} {}",
                boundary as f64 / 1000.0,
                self.buckets[i].load(Ordering::Relaxed)
            );
        }
        let count = self.count.load(Ordering::Relaxed);
        let braces = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{labels}}}")
        };
        let _ = writeln!(output, "{name}_bucket{{{labels}{sep}le=\"+Inf\"}} {count}");
        let _ = writeln!(
            output,
            "{name}_sum{braces} {}",
            self.sum_us.load(Ordering::Relaxed) as f64 / 1_000_000.0
        );
        let _ = writeln!(output, "{name}_count{braces} {count}");
    }
}

/// Per-route HTTP counters
#[derive(Debug, Default)]
struct RouteMetrics {
    requests_success: AtomicU64,
    requests_client_error: AtomicU64,
    requests_server_error: AtomicU64,
    latency: Histogram,
}

/// Values published at the end of a janitor sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriftSnapshot {
    pub store_count: u64,
    pub store_bytes: u64,
    pub folder_count: u64,
    pub folder_bytes: u64,
    pub orphan_files: u64,
    pub missing_files: u64,
}

/// Metrics collector owned by the service instance
#[derive(Debug)]
pub struct ImageMetrics {
    start_time: Instant,

    images_created: AtomicU64,
    images_persisted: AtomicU64,
    bytes_generated: AtomicU64,
    generation_failures: AtomicU64,
    generation_latency: Histogram,

    cache_population: RwLock<HashMap<CacheKind, u64>>,
    cache_freed: RwLock<HashMap<&'static str, u64>>,

    drift: RwLock<DriftSnapshot>,
    janitor_runs: AtomicU64,
    janitor_last_duration_us: AtomicU64,

    avatar_fetch_latency: Histogram,
    avatar_fetch_status: RwLock<HashMap<u16, u64>>,
    avatar_fallbacks: AtomicU64,

    quantizations_in_flight: AtomicU64,
    quantizer_limit: AtomicU64,

    routes: RwLock<HashMap<Route, RouteMetrics>>,
}

impl Default for ImageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            images_created: AtomicU64::new(0),
            images_persisted: AtomicU64::new(0),
            bytes_generated: AtomicU64::new(0),
            generation_failures: AtomicU64::new(0),
            generation_latency: Histogram::default(),
            cache_population: RwLock::new(HashMap::new()),
            cache_freed: RwLock::new(HashMap::new()),
            drift: RwLock::new(DriftSnapshot::default()),
            janitor_runs: AtomicU64::new(0),
            janitor_last_duration_us: AtomicU64::new(0),
            avatar_fetch_latency: Histogram::default(),
            avatar_fetch_status: RwLock::new(HashMap::new()),
            avatar_fallbacks: AtomicU64::new(0),
            quantizations_in_flight: AtomicU64::new(0),
            quantizer_limit: AtomicU64::new(0),
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Record a successful generation
    pub fn record_generation(&self, bytes: usize, elapsed: Duration) {
        self.images_created.fetch_add(1, Ordering::Relaxed);
        self.bytes_generated
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.generation_latency.observe(elapsed);
    }

    pub fn record_generation_failure(&self) {
        self.generation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self) {
        self.images_persisted.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn images_created(&self) -> u64 {
        self.images_created.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn images_persisted(&self) -> u64 {
        self.images_persisted.load(Ordering::Relaxed)
    }

    pub fn set_cache_population(&self, kind: CacheKind, entries: usize) {
        self.cache_population.write().insert(kind, entries as u64);
    }

    #[must_use]
    pub fn cache_population(&self, kind: CacheKind) -> u64 {
        self.cache_population.read().get(&kind).copied().unwrap_or(0)
    }

    /// Add to the freed counter of a janitor category (`artifacts`, `profiles`, ...)
    pub fn record_freed(&self, category: &'static str, count: usize) {
        *self.cache_freed.write().entry(category).or_insert(0) += count as u64;
    }

    #[must_use]
    pub fn freed(&self, category: &str) -> u64 {
        self.cache_freed.read().get(category).copied().unwrap_or(0)
    }

    pub fn set_drift(&self, snapshot: DriftSnapshot) {
        *self.drift.write() = snapshot;
    }

    #[must_use]
    pub fn drift(&self) -> DriftSnapshot {
        *self.drift.read()
    }

    pub fn record_janitor_run(&self, elapsed: Duration) {
        self.janitor_runs.fetch_add(1, Ordering::Relaxed);
        self.janitor_last_duration_us.store(
            u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    /// Record an avatar fetch; `status` is `None` when no response arrived
    pub fn record_avatar_fetch(&self, status: Option<u16>, elapsed: Duration) {
        self.avatar_fetch_latency.observe(elapsed);
        *self
            .avatar_fetch_status
            .write()
            .entry(status.unwrap_or(0))
            .or_insert(0) += 1;
    }

    pub fn record_avatar_fallback(&self) {
        self.avatar_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_quantizations_in_flight(&self, in_flight: usize) {
        self.quantizations_in_flight
            .store(in_flight as u64, Ordering::Relaxed);
    }

    pub fn set_quantizer_limit(&self, limit: usize) {
        self.quantizer_limit.store(limit as u64, Ordering::Relaxed);
    }

    /// Record a finished HTTP request
    pub fn record_request(&self, route: Route, status_code: u16, elapsed: Duration) {
        let mut routes = self.routes.write();
        let metrics = routes.entry(route).or_default();
        if status_code >= 500 {
            metrics.requests_server_error.fetch_add(1, Ordering::Relaxed);
        } else if status_code >= 400 {
            metrics.requests_client_error.fetch_add(1, Ordering::Relaxed);
        } else {
            metrics.requests_success.fetch_add(1, Ordering::Relaxed);
        }
        metrics.latency.observe(elapsed);
    }

    /// Export metrics in Prometheus format
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(8 * 1024);

        let _ = writeln!(output, "# HELP welcomer_images_uptime_seconds Service uptime in seconds");
        let _ = writeln!(output, "# TYPE welcomer_images_uptime_seconds counter");
        let _ = writeln!(
            output,
            "welcomer_images_uptime_seconds {}",
            self.start_time.elapsed().as_secs()
        );

        // Generation
        let _ = writeln!(output, "# HELP welcomer_images_created_total Images generated");
        let _ = writeln!(output, "# TYPE welcomer_images_created_total counter");
        let _ = writeln!(output, "welcomer_images_created_total {}", self.images_created());

        let _ = writeln!(output, "# HELP welcomer_images_persisted_total Images written to the store");
        let _ = writeln!(output, "# TYPE welcomer_images_persisted_total counter");
        let _ = writeln!(output, "welcomer_images_persisted_total {}", self.images_persisted());

        let _ = writeln!(output, "# HELP welcomer_images_failed_total Failed generations");
        let _ = writeln!(output, "# TYPE welcomer_images_failed_total counter");
        let _ = writeln!(
            output,
            "welcomer_images_failed_total {}",
            self.generation_failures.load(Ordering::Relaxed)
        );

        let _ = writeln!(output, "# HELP welcomer_images_generated_bytes_total Encoded bytes generated");
        let _ = writeln!(output, "# TYPE welcomer_images_generated_bytes_total counter");
        let _ = writeln!(
            output,
            "welcomer_images_generated_bytes_total {}",
            self.bytes_generated.load(Ordering::Relaxed)
        );

        let _ = writeln!(output, "# HELP welcomer_images_generation_seconds Generation latency");
        let _ = writeln!(output, "# TYPE welcomer_images_generation_seconds histogram");
        self.generation_latency
            .write(&mut output, "welcomer_images_generation_seconds", "");

        // Caches
        let _ = writeln!(output, "# HELP welcomer_images_cache_entries Entries per resource cache");
        let _ = writeln!(output, "# TYPE welcomer_images_cache_entries gauge");
        for kind in CacheKind::ALL {
            let _ = writeln!(
                output,
                "welcomer_images_cache_entries{{cache=\"{}\"}} {}",
                kind.as_str(),
                self.cache_population(kind)
            );
        }

        let _ = writeln!(output, "# HELP welcomer_images_janitor_freed_total Entries freed by the janitor");
        let _ = writeln!(output, "# TYPE welcomer_images_janitor_freed_total counter");
        {
            let freed = self.cache_freed.read();
            let mut categories: Vec<_> = freed.iter().collect();
            categories.sort_by_key(|(name, _)| **name);
            for (category, count) in categories {
                let _ = writeln!(
                    output,
                    "welcomer_images_janitor_freed_total{{category=\"{category}\"}} {count}"
                );
            }
        }

        // Janitor
        let _ = writeln!(output, "# HELP welcomer_images_janitor_runs_total Janitor sweeps");
        let _ = writeln!(output, "# TYPE welcomer_images_janitor_runs_total counter");
        let _ = writeln!(
            output,
            "welcomer_images_janitor_runs_total {}",
            self.janitor_runs.load(Ordering::Relaxed)
        );
        let _ = writeln!(output, "# HELP welcomer_images_janitor_duration_seconds Duration of the last sweep");
        let _ = writeln!(output, "# TYPE welcomer_images_janitor_duration_seconds gauge");
        let _ = writeln!(
            output,
            "welcomer_images_janitor_duration_seconds {}",
            self.janitor_last_duration_us.load(Ordering::Relaxed) as f64 / 1_000_000.0
        );

        // Drift
        let drift = self.drift();
        for (name, help, value) in [
            ("store_files", "Records in the artifact index", drift.store_count),
            ("store_bytes", "Bytes recorded in the artifact index", drift.store_bytes),
            ("folder_files", "Files in the store folder", drift.folder_count),
            ("folder_bytes", "Bytes in the store folder", drift.folder_bytes),
            ("orphan_files", "Files without an index record", drift.orphan_files),
            ("missing_files", "Index records without a file", drift.missing_files),
        ] {
            let _ = writeln!(output, "# HELP welcomer_images_{name} {help}");
            let _ = writeln!(output, "# TYPE welcomer_images_{name} gauge");
            let _ = writeln!(output, "welcomer_images_{name} {value}");
        }

        // Avatars
        let _ = writeln!(output, "# HELP welcomer_images_avatar_fetch_seconds Avatar fetch latency");
        let _ = writeln!(output, "# TYPE welcomer_images_avatar_fetch_seconds histogram");
        self.avatar_fetch_latency
            .write(&mut output, "welcomer_images_avatar_fetch_seconds", "");

        let _ = writeln!(output, "# HELP welcomer_images_avatar_fetch_total Avatar fetches by status code");
        let _ = writeln!(output, "# TYPE welcomer_images_avatar_fetch_total counter");
        {
            let statuses = self.avatar_fetch_status.read();
            let mut codes: Vec<_> = statuses.iter().collect();
            codes.sort_by_key(|(code, _)| **code);
            for (code, count) in codes {
                let _ = writeln!(
                    output,
                    "welcomer_images_avatar_fetch_total{{status=\"{code}\"}} {count}"
                );
            }
        }

        let _ = writeln!(output, "# HELP welcomer_images_avatar_fallbacks_total Fallback avatars served");
        let _ = writeln!(output, "# TYPE welcomer_images_avatar_fallbacks_total counter");
        let _ = writeln!(
            output,
            "welcomer_images_avatar_fallbacks_total {}",
            self.avatar_fallbacks.load(Ordering::Relaxed)
        );

        // Quantizer
        let _ = writeln!(output, "# HELP welcomer_images_quantizations_in_flight Frames being quantized");
        let _ = writeln!(output, "# TYPE welcomer_images_quantizations_in_flight gauge");
        let _ = writeln!(
            output,
            "welcomer_images_quantizations_in_flight {}",
            self.quantizations_in_flight.load(Ordering::Relaxed)
        );
        let _ = writeln!(output, "# HELP welcomer_images_quantizer_limit Concurrent quantization limit");
        let _ = writeln!(output, "# TYPE welcomer_images_quantizer_limit gauge");
        let _ = writeln!(
            output,
            "welcomer_images_quantizer_limit {}",
            self.quantizer_limit.load(Ordering::Relaxed)
        );

        // HTTP
        let routes = self.routes.read();
        let mut sorted: Vec<_> = routes.iter().collect();
        sorted.sort_by_key(|(route, _)| route.as_str());

        let _ = writeln!(output, "# HELP welcomer_images_http_requests_total HTTP requests by route and status class");
        let _ = writeln!(output, "# TYPE welcomer_images_http_requests_total counter");
        for (route, metrics) in &sorted {
            for (class, counter) in [
                ("2xx", &metrics.requests_success),
                ("4xx", &metrics.requests_client_error),
                ("5xx", &metrics.requests_server_error),
            ] {
                let _ = writeln!(
                    output,
                    "welcomer_images_http_requests_total{{route=\"{}\",status=\"{class}\"}} {}",
                    route.as_str(),
                    counter.load(Ordering::Relaxed)
                );
            }
        }

        let _ = writeln!(output, "# HELP welcomer_images_http_request_seconds HTTP latency");
        let _ = writeln!(output, "# TYPE welcomer_images_http_request_seconds histogram");
        for (route, metrics) in &sorted {
            let labels = format!("route=\"{}\"", route.as_str());
            metrics
                .latency
                .write(&mut output, "welcomer_images_http_request_seconds", &labels);
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_counters() {
        let metrics = ImageMetrics::new();
        metrics.record_generation(1200, Duration::from_millis(30));
        metrics.record_generation(800, Duration::from_millis(3));
        metrics.record_persisted();

        assert_eq!(metrics.images_created(), 2);
        assert_eq!(metrics.images_persisted(), 1);

        let text = metrics.export_prometheus();
        assert!(text.contains("welcomer_images_created_total 2"));
        assert!(text.contains("welcomer_images_generated_bytes_total 2000"));
        assert!(text.contains("welcomer_images_generation_seconds_bucket{le=\"0.005\"} 1"));
        assert!(text.contains("welcomer_images_generation_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(text.contains("welcomer_images_generation_seconds_count 2"));
    }

    #[test]
    fn test_cache_and_freed() {
        let metrics = ImageMetrics::new();
        metrics.set_cache_population(CacheKind::Profiles, 3);
        metrics.record_freed("profiles", 2);
        metrics.record_freed("profiles", 1);

        assert_eq!(metrics.cache_population(CacheKind::Profiles), 3);
        assert_eq!(metrics.cache_population(CacheKind::Backgrounds), 0);
        assert_eq!(metrics.freed("profiles"), 3);

        let text = metrics.export_prometheus();
        assert!(text.contains("welcomer_images_cache_entries{cache=\"profiles\"} 3"));
        assert!(text.contains("welcomer_images_janitor_freed_total{category=\"profiles\"} 3"));
    }

    #[test]
    fn test_route_status_classes() {
        let metrics = ImageMetrics::new();
        metrics.record_request(Route::ImagesCreate, 200, Duration::from_millis(1));
        metrics.record_request(Route::ImagesCreate, 401, Duration::from_millis(1));
        metrics.record_request(Route::ImagesCreate, 500, Duration::from_millis(1));

        let text = metrics.export_prometheus();
        assert!(text.contains(
            "welcomer_images_http_requests_total{route=\"images_create\",status=\"4xx\"} 1"
        ));
        assert!(text.contains(
            "welcomer_images_http_request_seconds_count{route=\"images_create\"} 3"
        ));
    }

    #[test]
    fn test_drift_snapshot() {
        let metrics = ImageMetrics::new();
        metrics.set_drift(DriftSnapshot {
            store_count: 2,
            folder_count: 3,
            orphan_files: 1,
            ..DriftSnapshot::default()
        });
        let text = metrics.export_prometheus();
        assert!(text.contains("welcomer_images_orphan_files 1"));
        assert!(text.contains("welcomer_images_folder_files 3"));
    }
}
