use hdrhistogram::Histogram;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FirstToken,
    Total,
    TotalViolation,
    StreamError,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::FirstToken,
        EventKind::Total,
        EventKind::TotalViolation,
        EventKind::StreamError,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::FirstToken => "chat_first_token",
            EventKind::Total => "chat_total",
            EventKind::TotalViolation => "chat_total_violation",
            EventKind::StreamError => "chat_stream_error",
        }
    }

    /// Exactly one terminal event is reported per attempt.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventKind::FirstToken)
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventError {
    /// Grouping key, e.g. `HTTP 502` or `read timeout`.
    pub label: String,
    pub message: String,
}

/// A named, timed observation of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub elapsed: Duration,
    pub size: usize,
    pub error: Option<EventError>,
}

impl Event {
    pub fn new(kind: EventKind, elapsed: Duration, size: usize) -> Self {
        Self {
            kind,
            elapsed,
            size,
            error: None,
        }
    }

    pub fn error(elapsed: Duration, label: String, message: String) -> Self {
        Self {
            kind: EventKind::StreamError,
            elapsed,
            size: 0,
            error: Some(EventError { label, message }),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// Receives events as they happen. Implementations must be cheap and
/// non-blocking: they are called from inside the request loop.
pub trait EventSink: Send + Sync {
    fn report(&self, event: Event);
}

// =============================================================================
// Histogram Sink
// =============================================================================

const MAX_TRACKED_MICROS: u64 = 3_600_000_000;
const MAX_ERROR_LABELS: usize = 64;
const OTHER_ERRORS: &str = "(other)";

struct Series {
    latency_us: Histogram<u64>,
    count: u64,
    size_sum: u64,
}

impl Series {
    fn new() -> Result<Self, hdrhistogram::CreationError> {
        Ok(Self {
            latency_us: Histogram::<u64>::new_with_bounds(1, MAX_TRACKED_MICROS, 3)?,
            count: 0,
            size_sum: 0,
        })
    }
}

/// Aggregates events into latency histograms, one per event name.
pub struct HistogramSink {
    series: [Mutex<Series>; 4],
    errors: Mutex<HashMap<String, u64>>,
    pub attempts: AtomicU64,
    pub active_users: AtomicUsize,
}

impl HistogramSink {
    pub fn new() -> Result<Self, hdrhistogram::CreationError> {
        Ok(Self {
            series: [
                Mutex::new(Series::new()?),
                Mutex::new(Series::new()?),
                Mutex::new(Series::new()?),
                Mutex::new(Series::new()?),
            ],
            errors: Mutex::new(HashMap::new()),
            attempts: AtomicU64::new(0),
            active_users: AtomicUsize::new(0),
        })
    }

    pub fn count(&self, kind: EventKind) -> u64 {
        lock(&self.series[kind.index()]).count
    }

    pub fn error_counts(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<_> = lock(&self.errors)
            .iter()
            .map(|(label, n)| (label.clone(), *n))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts
    }

    pub fn print_summary(&self) {
        info!("╔════════════════════════════════════════════════════════════╗");
        info!("║                    BENCHMARK SUMMARY                       ║");
        info!("╚════════════════════════════════════════════════════════════╝");

        info!("");
        info!("Attempts: {}", self.attempts.load(Ordering::Relaxed));

        for kind in EventKind::ALL {
            let series = lock(&self.series[kind.index()]);
            info!("");
            info!("{} (ms):", kind.name());
            info!("  Count:  {}", series.count);
            if series.count == 0 {
                info!("  No data");
                continue;
            }
            let hist = &series.latency_us;
            info!("  Min:    {:.2}", hist.min() as f64 / 1000.0);
            info!("  Mean:   {:.2}", hist.mean() / 1000.0);
            info!("  p50:    {:.2}", hist.value_at_quantile(0.50) as f64 / 1000.0);
            info!("  p95:    {:.2}", hist.value_at_quantile(0.95) as f64 / 1000.0);
            info!("  p99:    {:.2}", hist.value_at_quantile(0.99) as f64 / 1000.0);
            info!("  Max:    {:.2}", hist.max() as f64 / 1000.0);
            if matches!(kind, EventKind::Total | EventKind::TotalViolation) {
                info!(
                    "  Avg chunks: {:.1}",
                    series.size_sum as f64 / series.count as f64
                );
            }
        }

        let errors = self.error_counts();
        if !errors.is_empty() {
            info!("");
            info!("Errors:");
            for (label, n) in errors.iter().take(10) {
                info!("  {:<24} {}", label, n);
            }
        }

        info!("");
        info!("═══════════════════════════════════════════════════════════");
    }
}

impl EventSink for HistogramSink {
    fn report(&self, event: Event) {
        debug!(
            name = event.kind.name(),
            elapsed_ms = event.elapsed_ms(),
            size = event.size,
            error = ?event.error.as_ref().map(|e| e.message.as_str()),
            "event"
        );

        if event.kind.is_terminal() {
            self.attempts.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut series = lock(&self.series[event.kind.index()]);
            let micros = u64::try_from(event.elapsed.as_micros()).unwrap_or(u64::MAX);
            series.latency_us.saturating_record(micros.max(1));
            series.count += 1;
            series.size_sum += event.size as u64;
        }

        if let Some(error) = event.error {
            let mut errors = lock(&self.errors);
            let key = if errors.contains_key(&error.label) || errors.len() < MAX_ERROR_LABELS {
                error.label
            } else {
                OTHER_ERRORS.to_string()
            };
            *errors.entry(key).or_insert(0) += 1;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names() {
        assert_eq!(EventKind::FirstToken.name(), "chat_first_token");
        assert_eq!(EventKind::Total.name(), "chat_total");
        assert_eq!(EventKind::TotalViolation.name(), "chat_total_violation");
        assert_eq!(EventKind::StreamError.name(), "chat_stream_error");
        assert!(!EventKind::FirstToken.is_terminal());
        assert!(EventKind::StreamError.is_terminal());
    }

    #[test]
    fn histogram_sink_counts_per_kind() {
        let sink = HistogramSink::new().unwrap();
        sink.report(Event::new(EventKind::FirstToken, Duration::from_millis(20), 0));
        sink.report(Event::new(EventKind::Total, Duration::from_millis(150), 12));
        sink.report(Event::new(EventKind::TotalViolation, Duration::from_millis(90), 2));
        sink.report(Event::error(
            Duration::from_millis(5),
            "HTTP 502".to_string(),
            "HTTP 502, body=".to_string(),
        ));
        sink.report(Event::error(
            Duration::from_millis(7),
            "HTTP 502".to_string(),
            "HTTP 502, body=".to_string(),
        ));

        assert_eq!(sink.count(EventKind::FirstToken), 1);
        assert_eq!(sink.count(EventKind::Total), 1);
        assert_eq!(sink.count(EventKind::TotalViolation), 1);
        assert_eq!(sink.count(EventKind::StreamError), 2);
        assert_eq!(sink.attempts.load(Ordering::Relaxed), 4);
        assert_eq!(sink.error_counts(), vec![("HTTP 502".to_string(), 2)]);
        sink.print_summary();
    }

    #[test]
    fn error_labels_are_bounded() {
        let sink = HistogramSink::new().unwrap();
        for i in 0..(MAX_ERROR_LABELS + 10) {
            sink.report(Event::error(
                Duration::from_millis(1),
                format!("label-{i}"),
                String::new(),
            ));
        }
        let counts = sink.error_counts();
        assert_eq!(counts.len(), MAX_ERROR_LABELS + 1);
        assert!(counts.contains(&(OTHER_ERRORS.to_string(), 10)));
    }
}
