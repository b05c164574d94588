use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use serde::Serialize;

pub const REQUESTS_TOTAL: &str = "dona_requests_total";
pub const REQUEST_ERRORS_TOTAL: &str = "dona_request_errors_total";
pub const REQUESTS_DENIED_TOTAL: &str = "dona_requests_denied_total";
pub const SLOW_REQUESTS_TOTAL: &str = "dona_slow_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "dona_request_duration_seconds";

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(3);

/// Registers descriptions for every request metric with the installed
/// recorder. Call once after the recorder is set.
pub fn register_metrics() {
    describe_counter!(REQUESTS_TOTAL, "Slash commands and events handled, by command");
    describe_counter!(REQUEST_ERRORS_TOTAL, "Requests that ended in an error reply");
    describe_counter!(REQUESTS_DENIED_TOTAL, "Requests refused by the rate limiter or access rules");
    describe_counter!(SLOW_REQUESTS_TOTAL, "Requests slower than the configured threshold");
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time from event receipt to the final reply"
    );
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    Succeeded,
    Failed,
    Denied,
}

impl RequestOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Denied => "denied",
        }
    }
}

/// Figures for one command over the rolling window.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommandMetrics {
    pub command: String,
    pub requests: u64,
    pub errors: u64,
    pub denied: u64,
    pub slow: u64,
    pub mean_duration_ms: u64,
    pub p95_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl CommandMetrics {
    /// Errors as a share of requests, in percent.
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.errors as f64 * 100.0 / self.requests as f64
    }
}

#[derive(Clone, Copy, Debug)]
struct Sample {
    at: Instant,
    outcome: RequestOutcome,
    elapsed_ms: u64,
    slow: bool,
}

/// Emits request metrics through the `metrics` facade and keeps a rolling
/// window of samples so `/dona-metrics` and the periodic reporter can read
/// recent figures back without an exporter.
#[derive(Debug)]
pub struct RequestMetrics {
    window: Duration,
    slow_threshold: Duration,
    samples: Mutex<HashMap<String, VecDeque<Sample>>>,
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::with_settings(DEFAULT_WINDOW, DEFAULT_SLOW_THRESHOLD)
    }
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(window: Duration, slow_threshold: Duration) -> Self {
        Self { window, slow_threshold, samples: Mutex::new(HashMap::new()) }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn record(&self, command: &str, outcome: RequestOutcome, elapsed: Duration) {
        self.record_at(command, outcome, elapsed, Instant::now());
    }

    pub fn record_at(&self, command: &str, outcome: RequestOutcome, elapsed: Duration, now: Instant) {
        let slow = elapsed > self.slow_threshold;
        counter!(REQUESTS_TOTAL, "command" => command.to_owned(), "outcome" => outcome.as_str())
            .increment(1);
        match outcome {
            RequestOutcome::Succeeded => {}
            RequestOutcome::Failed => {
                counter!(REQUEST_ERRORS_TOTAL, "command" => command.to_owned()).increment(1)
            }
            RequestOutcome::Denied => {
                counter!(REQUESTS_DENIED_TOTAL, "command" => command.to_owned()).increment(1)
            }
        }
        if slow {
            counter!(SLOW_REQUESTS_TOTAL, "command" => command.to_owned()).increment(1);
        }
        histogram!(REQUEST_DURATION_SECONDS, "command" => command.to_owned())
            .record(elapsed.as_secs_f64());

        let sample = Sample {
            at: now,
            outcome,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            slow,
        };
        let mut samples = self.lock();
        samples.entry(command.to_owned()).or_default().push_back(sample);
        prune(&mut samples, self.window, now);
    }

    /// Per-command figures for the window ending now, sorted by command.
    pub fn snapshot(&self) -> Vec<CommandMetrics> {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> Vec<CommandMetrics> {
        let mut samples = self.lock();
        prune(&mut samples, self.window, now);
        let mut rows: Vec<CommandMetrics> = samples
            .iter()
            .map(|(command, window)| summarize(command, window.iter()))
            .collect();
        rows.sort_by(|a, b| a.command.cmp(&b.command));
        rows
    }

    pub fn totals(&self) -> CommandMetrics {
        self.totals_at(Instant::now())
    }

    pub fn totals_at(&self, now: Instant) -> CommandMetrics {
        let mut samples = self.lock();
        prune(&mut samples, self.window, now);
        summarize("all", samples.values().flatten())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<Sample>>> {
        match self.samples.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn prune(samples: &mut HashMap<String, VecDeque<Sample>>, window: Duration, now: Instant) {
    samples.retain(|_, queue| {
        while let Some(oldest) = queue.front() {
            if now.saturating_duration_since(oldest.at) < window {
                break;
            }
            queue.pop_front();
        }
        !queue.is_empty()
    });
}

fn summarize<'a>(command: &str, samples: impl Iterator<Item = &'a Sample>) -> CommandMetrics {
    let mut row = CommandMetrics { command: command.to_owned(), ..CommandMetrics::default() };
    let mut durations = Vec::new();
    for sample in samples {
        row.requests += 1;
        match sample.outcome {
            RequestOutcome::Succeeded => {}
            RequestOutcome::Failed => row.errors += 1,
            RequestOutcome::Denied => row.denied += 1,
        }
        if sample.slow {
            row.slow += 1;
        }
        durations.push(sample.elapsed_ms);
    }
    if durations.is_empty() {
        return row;
    }

    durations.sort_unstable();
    let total: u128 = durations.iter().map(|ms| u128::from(*ms)).sum();
    row.mean_duration_ms = u64::try_from(total / durations.len() as u128).unwrap_or(u64::MAX);
    row.p95_duration_ms = percentile(&durations, 95);
    row.max_duration_ms = durations[durations.len() - 1];
    row
}

/// Nearest-rank percentile over an ascending slice.
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    let index = (sorted.len() * pct / 100).min(sorted.len() - 1);
    sorted[index]
}
