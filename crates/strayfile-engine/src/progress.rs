//! Progress snapshots and log fan-out for a running scan.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use strayfile_core::{ScanId, ScanPhase, ScanStatus};

/// Default per-subscriber buffer, in log lines.
pub const LOG_CHANNEL_SIZE: usize = 100;

/// Identifies one log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

/// Point-in-time view of scan progress.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub scan_id: Option<ScanId>,
    pub phase: ScanPhase,
    /// Files expected, from the counting phase. Zero when unknown.
    pub total_files: u64,
    pub processed_files: u64,
    /// 0.0 to 100.0.
    pub percent_complete: f64,
    pub current_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    /// Time elapsed since the scan began.
    pub elapsed: Duration,
    /// Extrapolated from throughput so far.
    pub eta: Option<Duration>,
    pub errors: u64,
}

impl ProgressSnapshot {
    fn idle() -> Self {
        Self {
            scan_id: None,
            phase: ScanPhase::Idle,
            total_files: 0,
            processed_files: 0,
            percent_complete: 0.0,
            current_path: None,
            started_at: None,
            elapsed: Duration::ZERO,
            eta: None,
            errors: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.scan_id.is_some() && !matches!(self.phase, ScanPhase::Idle | ScanPhase::Finished(_))
    }
}

#[derive(Debug)]
struct State {
    scan_id: Option<ScanId>,
    phase: ScanPhase,
    total: u64,
    processed: u64,
    current: Option<PathBuf>,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    /// Throughput is measured from here, so counting time does not skew it.
    phase_started: Option<Instant>,
    phase_base: u64,
    finished_after: Option<Duration>,
    errors: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            scan_id: None,
            phase: ScanPhase::Idle,
            total: 0,
            processed: 0,
            current: None,
            started_at: None,
            started: None,
            phase_started: None,
            phase_base: 0,
            finished_after: None,
            errors: 0,
        }
    }
}

/// Tracks one scan's progress and fans log lines out to subscribers.
///
/// Log delivery never blocks the scan: a subscriber whose buffer is full
/// misses the line, and a closed subscriber is dropped.
#[derive(Debug)]
pub struct ProgressTracker {
    state: Mutex<State>,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<String>>>,
    next_subscriber: AtomicU64,
    buffer: usize,
    dropped: AtomicU64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(LOG_CHANNEL_SIZE)
    }
}

impl ProgressTracker {
    pub fn new(buffer: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            buffer: buffer.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a log subscriber.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Lines that could not be delivered because a buffer was full.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Send a timestamped line to every subscriber.
    pub fn log(&self, line: impl AsRef<str>) {
        let line = format!("[{}] {}", Utc::now().format("%H:%M:%S"), line.as_ref());
        self.subscribers.lock().retain(|_, tx| match tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Reset for a new scan.
    pub fn begin(&self, scan_id: ScanId, started_at: DateTime<Utc>) {
        let now = Instant::now();
        *self.state.lock() = State {
            scan_id: Some(scan_id),
            phase: ScanPhase::Initializing,
            started_at: Some(started_at),
            started: Some(now),
            phase_started: Some(now),
            ..State::default()
        };
    }

    pub fn set_phase(&self, phase: ScanPhase) {
        let mut state = self.state.lock();
        state.phase = phase;
        state.phase_started = Some(Instant::now());
        state.phase_base = state.processed;
    }

    pub fn phase(&self) -> ScanPhase {
        self.state.lock().phase.clone()
    }

    pub fn set_total(&self, total: u64) {
        self.state.lock().total = total;
    }

    pub fn set_processed(&self, processed: u64) {
        let mut state = self.state.lock();
        state.processed = processed;
        state.phase_base = state.phase_base.min(processed);
    }

    pub fn advance(&self, files: u64, current: Option<PathBuf>) {
        let mut state = self.state.lock();
        state.processed += files;
        if current.is_some() {
            state.current = current;
        }
    }

    pub fn add_error(&self) {
        self.state.lock().errors += 1;
    }

    pub fn finish(&self, status: ScanStatus) {
        let mut state = self.state.lock();
        state.phase = ScanPhase::Finished(status);
        state.current = None;
        state.finished_after = state.started.map(|s| s.elapsed());
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        if state.scan_id.is_none() {
            return ProgressSnapshot::idle();
        }

        let elapsed = state
            .finished_after
            .or_else(|| state.started.map(|s| s.elapsed()))
            .unwrap_or_default();
        let finished = state.phase.is_finished();

        let percent_complete = if finished {
            100.0
        } else if state.total > 0 {
            (state.processed as f64 / state.total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        ProgressSnapshot {
            scan_id: state.scan_id,
            phase: state.phase.clone(),
            total_files: state.total,
            processed_files: state.processed,
            percent_complete,
            current_path: state.current.clone(),
            started_at: state.started_at,
            elapsed,
            eta: if finished { None } else { estimate_eta(&state) },
            errors: state.errors,
        }
    }
}

fn estimate_eta(state: &State) -> Option<Duration> {
    let done = state.processed.checked_sub(state.phase_base)?;
    if done == 0 || state.total == 0 || state.processed >= state.total {
        return None;
    }
    let elapsed = state.phase_started?.elapsed();
    let remaining = state.total - state.processed;
    Some(elapsed.mul_f64(remaining as f64 / done as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_snapshot() {
        let tracker = ProgressTracker::default();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.phase, ScanPhase::Idle);
        assert!(!snapshot.is_running());
        assert!(snapshot.eta.is_none());
    }

    #[test]
    fn test_percent_and_eta() {
        let tracker = ProgressTracker::default();
        tracker.begin(ScanId(7), Utc::now());
        tracker.set_phase(ScanPhase::ScanningFilesystem);
        tracker.set_total(200);
        std::thread::sleep(Duration::from_millis(5));
        tracker.advance(50, Some(PathBuf::from("/m/a")));

        let snapshot = tracker.snapshot();
        assert!(snapshot.is_running());
        assert_eq!(snapshot.processed_files, 50);
        assert!((snapshot.percent_complete - 25.0).abs() < f64::EPSILON);
        assert!(snapshot.eta.is_some());
        assert_eq!(snapshot.current_path, Some(PathBuf::from("/m/a")));

        tracker.finish(ScanStatus::Completed);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.phase, ScanPhase::Finished(ScanStatus::Completed));
        assert!((snapshot.percent_complete - 100.0).abs() < f64::EPSILON);
        assert!(snapshot.eta.is_none());
    }

    #[test]
    fn test_percent_never_exceeds_total() {
        let tracker = ProgressTracker::default();
        tracker.begin(ScanId(1), Utc::now());
        tracker.set_total(2);
        tracker.advance(5, None);
        assert!((tracker.snapshot().percent_complete - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_full_subscriber_drops_lines() {
        let tracker = ProgressTracker::new(2);
        let (_id, mut rx) = tracker.subscribe();
        for i in 0..5 {
            tracker.log(format!("line {i}"));
        }
        assert_eq!(tracker.dropped_lines(), 3);
        assert!(rx.try_recv().unwrap().ends_with("line 0"));
        assert!(rx.try_recv().unwrap().ends_with("line 1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_subscriber_is_removed() {
        let tracker = ProgressTracker::default();
        let (_a, rx) = tracker.subscribe();
        let (b, _rx_b) = tracker.subscribe();
        drop(rx);
        tracker.log("hello");
        assert_eq!(tracker.subscriber_count(), 1);
        assert!(tracker.unsubscribe(b));
        assert_eq!(tracker.subscriber_count(), 0);
    }
}
