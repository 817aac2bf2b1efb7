use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default minimum interval between progress emissions.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Samples older than this no longer count towards the reported speed.
const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Aggregate progress of a bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BulkProgress {
    pub transferred: u64,
    pub total: u64,
    pub bytes_per_second: f64,
}

/// Callback invoked with aggregated progress.
pub type ProgressCallback = Box<dyn Fn(BulkProgress) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sums progress from many concurrent transfers and forwards it to a
/// callback at most once per interval, plus once on [`finish`](Self::finish).
pub struct ProgressAggregator {
    state: Mutex<State>,
    callback: ProgressCallback,
}

struct State {
    transferred: u64,
    total: u64,
    interval: Duration,
    last_emit: Option<Instant>,
    recent: VecDeque<(Instant, u64)>,
}

impl State {
    /// Bytes per second across the samples still inside [`SPEED_WINDOW`].
    /// Zero until two samples are far enough apart to measure.
    fn speed(&self) -> f64 {
        let (Some((first, _)), Some((last, _))) = (self.recent.front(), self.recent.back()) else {
            return 0.0;
        };
        let span = last.duration_since(*first);
        if span.is_zero() {
            return 0.0;
        }
        let bytes: u64 = self.recent.iter().map(|(_, b)| b).sum();
        bytes as f64 / span.as_secs_f64()
    }

    fn progress(&self) -> BulkProgress {
        BulkProgress {
            transferred: self.transferred,
            total: self.total,
            bytes_per_second: self.speed(),
        }
    }
}

impl ProgressAggregator {
    /// Creates an aggregator for `total` bytes.
    ///
    /// If `interval` is `None`, defaults to 1 s.
    pub fn new(total: u64, interval: Option<Duration>, callback: ProgressCallback) -> Self {
        Self {
            state: Mutex::new(State {
                transferred: 0,
                total,
                interval: interval.unwrap_or(DEFAULT_INTERVAL),
                last_emit: None,
                recent: VecDeque::new(),
            }),
            callback,
        }
    }

    /// Records `bytes` more transferred. Emits if the interval has elapsed
    /// since the previous emission.
    pub fn record(&self, bytes: u64) {
        let progress = {
            let mut s = lock(&self.state);
            let now = Instant::now();
            s.transferred = s.transferred.saturating_add(bytes);
            s.recent.push_back((now, bytes));
            while s
                .recent
                .front()
                .is_some_and(|(at, _)| now.duration_since(*at) > SPEED_WINDOW)
            {
                s.recent.pop_front();
            }

            if s.last_emit.is_some_and(|last| now.duration_since(last) < s.interval) {
                return;
            }
            s.last_emit = Some(now);
            s.progress()
        };
        (self.callback)(progress);
    }

    /// Emits the final value regardless of throttling.
    pub fn finish(&self) {
        let progress = {
            let mut s = lock(&self.state);
            s.last_emit = Some(Instant::now());
            s.progress()
        };
        (self.callback)(progress);
    }
}
