use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use cartwheel_core::config::HealthConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    /// Point sample: latency of the most recent call, not an average.
    pub last_latency_ms: u64,
    pub error_rate: f64,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Default)]
struct WindowCounters {
    requests: u64,
    errors: u64,
    cache_hits: u64,
    cache_misses: u64,
    last_latency_ms: u64,
}

/// Rolling-window health signal over backend calls and cache lookups.
///
/// Counters accumulate between evaluations and reset at each tick; each
/// window stands alone, so one bad minute cannot poison the next.
#[derive(Debug)]
pub struct HealthMonitor {
    window: Mutex<WindowCounters>,
    snapshot: Mutex<HealthSnapshot>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            window: Mutex::new(WindowCounters::default()),
            snapshot: Mutex::new(HealthSnapshot {
                status: HealthStatus::Healthy,
                checked_at: Utc::now(),
                last_latency_ms: 0,
                error_rate: 0.0,
                cache_hit_rate: 1.0,
            }),
            interval,
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(Duration::from_secs(config.check_interval_secs))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn record_call(&self, latency: Duration, succeeded: bool) {
        let latency_ms = latency.as_millis() as u64;
        {
            let mut window = self.window.lock().expect("health window lock poisoned");
            window.requests += 1;
            if !succeeded {
                window.errors += 1;
            }
            window.last_latency_ms = latency_ms;
        }
        debug!(
            event_name = "health.call_recorded",
            latency_ms, succeeded, "backend call observed"
        );
    }

    pub fn record_cache(&self, hit: bool) {
        let mut window = self.window.lock().expect("health window lock poisoned");
        if hit {
            window.cache_hits += 1;
        } else {
            window.cache_misses += 1;
        }
    }

    /// Classifies the current window, logs one line, resets the counters, and
    /// publishes the snapshot. Called by the tick task and directly by tests.
    pub fn evaluate(&self) -> HealthSnapshot {
        let (requests, errors, hits, misses, last_latency_ms) = {
            let mut window = self.window.lock().expect("health window lock poisoned");
            let drained = (
                window.requests,
                window.errors,
                window.cache_hits,
                window.cache_misses,
                window.last_latency_ms,
            );
            window.requests = 0;
            window.errors = 0;
            window.cache_hits = 0;
            window.cache_misses = 0;
            drained
        };

        let error_rate = if requests == 0 { 0.0 } else { errors as f64 / requests as f64 };
        let lookups = hits + misses;
        let cache_hit_rate = if lookups == 0 { 1.0 } else { hits as f64 / lookups as f64 };

        let status = if error_rate >= 0.10 || cache_hit_rate < 0.30 {
            HealthStatus::Unhealthy
        } else if error_rate >= 0.05 || cache_hit_rate < 0.50 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let snapshot = HealthSnapshot {
            status,
            checked_at: Utc::now(),
            last_latency_ms,
            error_rate,
            cache_hit_rate,
        };

        info!(
            event_name = "health.tick",
            status = status.as_str(),
            request_count = requests,
            error_rate,
            cache_hit_rate,
            last_latency_ms,
            "health window evaluated"
        );

        *self.snapshot.lock().expect("health snapshot lock poisoned") = snapshot.clone();
        snapshot
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot.lock().expect("health snapshot lock poisoned").clone()
    }
}

/// Spawns the periodic evaluation task for the monitor's interval.
pub fn spawn_ticker(monitor: Arc<HealthMonitor>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(monitor.interval());
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            monitor.evaluate();
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{HealthMonitor, HealthStatus};

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(Duration::from_secs(60))
    }

    #[test]
    fn high_error_rate_is_unhealthy_regardless_of_cache() {
        let monitor = monitor();
        for index in 0..10 {
            monitor.record_call(Duration::from_millis(5), index != 0);
        }
        for _ in 0..100 {
            monitor.record_cache(true);
        }

        assert_eq!(monitor.evaluate().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn low_errors_and_good_hit_rate_is_healthy() {
        let monitor = monitor();
        for _ in 0..50 {
            monitor.record_call(Duration::from_millis(5), true);
        }
        monitor.record_cache(true);
        monitor.record_cache(false);

        assert_eq!(monitor.evaluate().status, HealthStatus::Healthy);
    }

    #[test]
    fn mid_error_rate_degrades() {
        let monitor = monitor();
        for index in 0..20 {
            monitor.record_call(Duration::from_millis(5), index != 0);
        }

        let snapshot = monitor.evaluate();
        assert_eq!(snapshot.status, HealthStatus::Degraded);
        assert!((snapshot.error_rate - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn poor_cache_hit_rate_alone_is_unhealthy() {
        let monitor = monitor();
        monitor.record_call(Duration::from_millis(5), true);
        for _ in 0..8 {
            monitor.record_cache(false);
        }
        monitor.record_cache(true);

        assert_eq!(monitor.evaluate().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn windows_are_memoryless() {
        let monitor = monitor();
        for _ in 0..10 {
            monitor.record_call(Duration::from_millis(5), false);
        }
        assert_eq!(monitor.evaluate().status, HealthStatus::Unhealthy);

        for _ in 0..10 {
            monitor.record_call(Duration::from_millis(5), true);
        }
        let snapshot = monitor.evaluate();
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert_eq!(snapshot.error_rate, 0.0);
    }

    #[test]
    fn latency_is_a_point_sample_of_the_latest_call() {
        let monitor = monitor();
        monitor.record_call(Duration::from_millis(5), true);
        monitor.record_call(Duration::from_millis(120), true);

        assert_eq!(monitor.evaluate().last_latency_ms, 120);
    }

    #[test]
    fn idle_window_stays_healthy() {
        let monitor = monitor();
        let snapshot = monitor.evaluate();
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert_eq!(snapshot.error_rate, 0.0);
        assert_eq!(snapshot.cache_hit_rate, 1.0);
    }
}
