//! Progress tracking for long-running dataset transfers.
//!
//! Percentages and remaining-time estimates are only available when the
//! dataset's row count was prefetched; otherwise progress lines report rows
//! and throughput alone.

use std::time::{Duration, Instant};

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
const MIN_DOWNLOAD_DURATION: Duration = Duration::from_secs(30);

/// Controls update cadence.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    update_interval: Duration,
    min_percentage_step: f64,
    page_interval: u64,
}

impl ProgressTracker {
    /// Create a tracker with a custom interval, percentage step and page cadence.
    pub fn new(update_interval: Duration, min_percentage_step: f64, page_interval: u64) -> Self {
        Self {
            update_interval,
            min_percentage_step,
            page_interval,
        }
    }

    /// Build a [`ProgressState`] configured with the tracker defaults.
    pub fn create_state(&self, total_expected: Option<u64>) -> ProgressState {
        let mut state = ProgressState::new(total_expected);
        state.update_interval = self.update_interval;
        state.min_percentage_step = self.min_percentage_step;
        state.page_interval = self.page_interval;
        state
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(
            DEFAULT_UPDATE_INTERVAL,
            10.0,
            crate::downloader::config::PROGRESS_PAGE_INTERVAL,
        )
    }
}

/// Progress state of one transfer.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Rows written so far (resumed rows included).
    pub rows_written: u64,
    /// Rows written in this process, used for the rate.
    pub rows_this_run: u64,
    /// Pages written in this process.
    pub pages: u64,
    /// Total expected rows (if known).
    pub total_expected: Option<u64>,
    /// When the transfer started.
    pub start_time: Instant,
    /// Last time progress was reported.
    pub last_update: Instant,
    /// Minimum interval between time-based updates.
    pub update_interval: Duration,
    /// Current rate (rows per second).
    pub current_rate: f64,
    /// Last reported completion percentage.
    pub last_reported_percentage: f64,
    /// Minimum percentage delta required to emit a new update.
    pub min_percentage_step: f64,
    /// Emit every N pages (0 disables).
    pub page_interval: u64,
    pages_at_last_emit: u64,
}

impl ProgressState {
    /// Create a new progress state with default intervals.
    pub fn new(total_expected: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            rows_written: 0,
            rows_this_run: 0,
            pages: 0,
            total_expected,
            start_time: now,
            last_update: now,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            current_rate: 0.0,
            last_reported_percentage: 0.0,
            min_percentage_step: 10.0,
            page_interval: 0,
            pages_at_last_emit: 0,
        }
    }

    /// Start from rows already on disk.
    pub fn with_resumed_rows(mut self, rows: u64) -> Self {
        self.rows_written = rows;
        if let Some(pct) = self.percentage() {
            self.last_reported_percentage = pct;
        }
        self
    }

    /// Account for one written page.
    pub fn record_page(&mut self, rows: u64) {
        self.rows_written = self.rows_written.saturating_add(rows);
        self.rows_this_run = self.rows_this_run.saturating_add(rows);
        self.pages += 1;
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.current_rate = self.rows_this_run as f64 / elapsed;
        }
    }

    /// Whether a progress update should be emitted.
    pub fn should_emit_update(&self) -> bool {
        if self.rows_this_run == 0 {
            return false;
        }

        let percentage_jump = self
            .percentage()
            .map(|pct| pct - self.last_reported_percentage >= self.min_percentage_step)
            .unwrap_or(false);
        if percentage_jump {
            return true;
        }

        if self.page_interval > 0 && self.pages - self.pages_at_last_emit >= self.page_interval {
            return true;
        }

        self.start_time.elapsed() >= MIN_DOWNLOAD_DURATION
            && self.last_update.elapsed() >= self.update_interval
    }

    /// Call after emitting a progress line.
    pub fn mark_emitted(&mut self) {
        self.last_update = Instant::now();
        self.pages_at_last_emit = self.pages;
        if let Some(pct) = self.percentage() {
            self.last_reported_percentage = pct;
        }
    }

    /// Completion percentage, when the total is known.
    pub fn percentage(&self) -> Option<f64> {
        let total = self.total_expected?;
        if total == 0 {
            return Some(100.0);
        }
        Some(((self.rows_written as f64 / total as f64) * 100.0).min(100.0))
    }

    /// Remaining time estimate, when the total is known.
    pub fn estimate_remaining(&self) -> Option<Duration> {
        if self.current_rate <= 0.0 {
            return None;
        }
        let remaining = self.total_expected?.saturating_sub(self.rows_written);
        if remaining == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / self.current_rate))
    }

    /// Human-readable progress string for logging.
    pub fn format_progress(&self) -> String {
        let mut parts = vec![format!("[PROGRESS] Downloaded {} rows", self.rows_written)];

        if let Some(total) = self.total_expected {
            parts.push(format!("of {total}"));
        }

        if let Some(pct) = self.percentage() {
            parts.push(format!("- {pct:.1}% complete"));
        }

        parts.push(format!("(page {})", self.pages));

        if self.current_rate > 0.0 {
            parts.push(format!("at {:.0} rows/sec", self.current_rate));
        }

        if let Some(remaining) = self.estimate_remaining() {
            parts.push(format!("- ~{} remaining", format_duration(remaining)));
        }

        parts.join(" ")
    }
}

/// Compact duration for progress lines (`42s`, `5m`, `1.5h`)
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
