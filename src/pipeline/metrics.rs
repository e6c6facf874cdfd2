//! Request counters and stage timing.

use super::StageId;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Service-wide metrics, shared by all requests.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Requests received
    pub requests_total: AtomicU64,

    /// Requests answered with an archive
    pub requests_succeeded: AtomicU64,

    /// Requests refused with a client error
    pub requests_rejected: AtomicU64,

    /// Requests that failed with an internal error
    pub requests_failed: AtomicU64,

    /// Requests currently in flight
    pub requests_active: AtomicU64,

    /// Images written to workspaces
    pub images_ingested: AtomicU64,

    /// Upload bytes written to workspaces
    pub bytes_ingested: AtomicU64,

    /// Archive bytes sent to callers
    pub bytes_archived: AtomicU64,

    /// Stage timeouts
    pub stage_timeouts: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-stage timing (in microseconds for precision)
    pub retrieval_us: AtomicU64,
    pub pairs_us: AtomicU64,
    pub features_us: AtomicU64,
    pub matching_us: AtomicU64,
    pub reconstruction_us: AtomicU64,

    /// Time spent building archives (microseconds)
    pub archive_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Count a new request as received and in flight. It stays in flight
    /// until the returned guard is dropped, however the request ends.
    pub fn start_request(self: &Arc<Self>) -> ActiveRequest {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_active.fetch_add(1, Ordering::Relaxed);
        ActiveRequest {
            metrics: Arc::clone(self),
        }
    }

    pub fn add_success(&self, archive_bytes: u64) {
        self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        self.bytes_archived.fetch_add(archive_bytes, Ordering::Relaxed);
    }

    pub fn add_rejection(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_images(&self, count: u64, bytes: u64) {
        self.images_ingested.fetch_add(count, Ordering::Relaxed);
        self.bytes_ingested.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_stage_timeout(&self) {
        self.stage_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent in a stage (in microseconds).
    pub fn add_stage_time(&self, stage: StageId, duration: Duration) {
        let counter = match stage {
            StageId::RetrievalExtraction => &self.retrieval_us,
            StageId::PairGeneration => &self.pairs_us,
            StageId::FeatureExtraction => &self.features_us,
            StageId::Matching => &self.matching_us,
            StageId::Reconstruction => &self.reconstruction_us,
        };
        counter.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent building an archive (in microseconds).
    pub fn add_archive_time(&self, duration: Duration) {
        self.archive_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |counter: &AtomicU64| counter.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_active: self.requests_active.load(Ordering::Relaxed),
            images_ingested: self.images_ingested.load(Ordering::Relaxed),
            bytes_ingested: self.bytes_ingested.load(Ordering::Relaxed),
            bytes_archived: self.bytes_archived.load(Ordering::Relaxed),
            stage_timeouts: self.stage_timeouts.load(Ordering::Relaxed),
            uptime: self.elapsed(),
            retrieval_secs: secs(&self.retrieval_us),
            pairs_secs: secs(&self.pairs_us),
            features_secs: secs(&self.features_us),
            matching_secs: secs(&self.matching_us),
            reconstruction_secs: secs(&self.reconstruction_us),
            archive_secs: secs(&self.archive_us),
        }
    }
}

/// In-flight marker for one request.
#[derive(Debug)]
pub struct ActiveRequest {
    metrics: Arc<Metrics>,
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        let _ = self
            .metrics
            .requests_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_succeeded: u64,
    pub requests_rejected: u64,
    pub requests_failed: u64,
    pub requests_active: u64,
    pub images_ingested: u64,
    pub bytes_ingested: u64,
    pub bytes_archived: u64,
    pub stage_timeouts: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub uptime: Duration,
    /// Total time spent in retrieval extraction (seconds, summed across requests)
    pub retrieval_secs: f64,
    pub pairs_secs: f64,
    pub features_secs: f64,
    pub matching_secs: f64,
    pub reconstruction_secs: f64,
    pub archive_secs: f64,
}

impl MetricsSnapshot {
    fn stage_secs_total(&self) -> f64 {
        self.retrieval_secs + self.pairs_secs + self.features_secs + self.matching_secs + self.reconstruction_secs
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.stage_secs_total();
        let pct = |secs: f64| if total > 0.0 { secs / total * 100.0 } else { 0.0 };

        write!(
            f,
            "Requests: {} total, {} ok, {} rejected, {} failed, {} active | \
             Images: {} ({:.1} MB) | Archived: {:.1} MB | Timeouts: {} | Uptime: {:.0}s | \
             Time: retrieval {:.0}% | pairs {:.0}% | features {:.0}% | matching {:.0}% | reconstruction {:.0}%",
            self.requests_total,
            self.requests_succeeded,
            self.requests_rejected,
            self.requests_failed,
            self.requests_active,
            self.images_ingested,
            self.bytes_ingested as f64 / (1024.0 * 1024.0),
            self.bytes_archived as f64 / (1024.0 * 1024.0),
            self.stage_timeouts,
            self.uptime.as_secs_f64(),
            pct(self.retrieval_secs),
            pct(self.pairs_secs),
            pct(self.features_secs),
            pct(self.matching_secs),
            pct(self.reconstruction_secs),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Log a snapshot every interval until `shutdown` fires or closes.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    if snapshot.requests_total > 0 {
                        tracing::info!("{}", snapshot);
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }
}
