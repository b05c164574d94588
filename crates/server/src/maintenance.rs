use std::sync::Arc;
use std::time::{Duration, Instant};

use dona_core::rate_limit::RateLimiter;
use dona_slack::metrics::{CommandMetrics, RequestMetrics};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Periodically reclaims rate limit buckets that have gone idle so memory
/// stays proportional to active users.
pub fn spawn_bucket_reclaimer(limiter: Arc<RateLimiter>, every: Duration) -> JoinHandle<()> {
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let reclaimed = sweep(&limiter, Instant::now());
            debug!(
                event_name = "system.maintenance.rate_limit_sweep",
                correlation_id = "maintenance",
                reclaimed,
                remaining = limiter.bucket_count(),
                "rate limit sweep finished"
            );
        }
    })
}

pub fn sweep(limiter: &RateLimiter, now: Instant) -> usize {
    limiter.purge_idle(now)
}

/// Logs a summary of the request metrics window every `every`.
pub fn spawn_metrics_reporter(metrics: Arc<RequestMetrics>, every: Duration) -> JoinHandle<()> {
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            report(&metrics, Instant::now());
        }
    })
}

pub fn report(metrics: &RequestMetrics, now: Instant) -> CommandMetrics {
    let totals = metrics.totals_at(now);
    let window_secs = metrics.window().as_secs();

    if totals.requests == 0 {
        info!(
            event_name = "system.maintenance.metrics_summary",
            correlation_id = "maintenance",
            window_secs,
            requests = 0u64,
            "no requests in the last metrics window"
        );
        return totals;
    }

    info!(
        event_name = "system.maintenance.metrics_summary",
        correlation_id = "maintenance",
        window_secs,
        requests = totals.requests,
        errors = totals.errors,
        error_rate_pct = totals.error_rate(),
        denied = totals.denied,
        slow = totals.slow,
        p95_ms = totals.p95_duration_ms,
        max_ms = totals.max_duration_ms,
        "request metrics summary"
    );
    for row in metrics.snapshot_at(now) {
        debug!(
            event_name = "system.maintenance.metrics_command",
            correlation_id = "maintenance",
            command = %row.command,
            requests = row.requests,
            errors = row.errors,
            mean_ms = row.mean_duration_ms,
            p95_ms = row.p95_duration_ms,
            "command metrics"
        );
    }
    totals
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use dona_core::rate_limit::RateLimiter;
    use dona_slack::metrics::{RequestMetrics, RequestOutcome};

    use super::{report, spawn_bucket_reclaimer, spawn_metrics_reporter, sweep};

    #[test]
    fn sweep_reclaims_only_buckets_outside_their_window() {
        let limiter = RateLimiter::default();
        let start = Instant::now();
        assert!(limiter.try_admit("T1:U1", "/dona-task", start).is_admitted());
        assert!(limiter.try_admit("T1:U2", "/dona-task", start + Duration::from_secs(50)).is_admitted());
        // one global bucket, plus a user and a command bucket per user
        assert_eq!(limiter.bucket_count(), 5);

        assert_eq!(sweep(&limiter, start + Duration::from_secs(30)), 0);
        assert_eq!(sweep(&limiter, start + Duration::from_secs(61)), 2);
        assert_eq!(limiter.bucket_count(), 3);
        assert_eq!(sweep(&limiter, start + Duration::from_secs(120)), 3);
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn report_summarizes_the_window() {
        let metrics = RequestMetrics::with_settings(Duration::from_secs(300), Duration::from_secs(1));
        let start = Instant::now();
        assert_eq!(report(&metrics, start).requests, 0);

        metrics.record_at("/dona-task", RequestOutcome::Succeeded, Duration::from_millis(200), start);
        metrics.record_at("/dona-task", RequestOutcome::Failed, Duration::from_millis(1_500), start);
        metrics.record_at("/dona-help", RequestOutcome::Succeeded, Duration::from_millis(20), start);
        metrics.record_at("/dona-help", RequestOutcome::Denied, Duration::from_millis(1), start);

        let totals = report(&metrics, start + Duration::from_secs(60));
        assert_eq!((totals.requests, totals.errors, totals.denied, totals.slow), (4, 1, 1, 1));
        assert_eq!(totals.error_rate(), 25.0);
        assert_eq!(totals.max_duration_ms, 1_500);

        assert_eq!(report(&metrics, start + Duration::from_secs(301)).requests, 0);
    }

    #[tokio::test]
    async fn metrics_reporter_task_can_be_stopped() {
        let handle =
            spawn_metrics_reporter(Arc::new(RequestMetrics::new()), Duration::from_secs(300));
        handle.abort();
        assert!(handle.await.expect_err("aborted").is_cancelled());
    }

    #[tokio::test]
    async fn reclaimer_task_can_be_stopped() {
        let handle = spawn_bucket_reclaimer(Arc::new(RateLimiter::default()), Duration::from_secs(60));
        handle.abort();
        assert!(handle.await.expect_err("aborted").is_cancelled());
    }
}
