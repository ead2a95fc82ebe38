//! # Shared Application State
//!
//! One `AppState` is built at startup and handed to every request handler and
//! realtime session through `web::Data`. Configuration is immutable once
//! loaded; the mutable pieces (request metrics, session accounting) live
//! behind their own lock so handlers never contend on the config.
//!
//! ## Sharing Pattern:
//! - `Arc` for the cache and store so sessions outlive individual requests
//! - `RwLock` around metrics: many readers, one writer at a time
//! - Locks are held only long enough to copy data in or out

use crate::config::AppConfig;
use crate::interviews::InterviewStore;
use crate::models::ModelCache;
use candle_core::Device;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration, fixed after startup validation.
    pub config: AppConfig,

    /// Compute device every speech model is loaded onto.
    pub device: Device,

    /// Speech model cache shared by realtime sessions, batch transcription,
    /// and interview processing.
    pub models: Arc<ModelCache>,

    /// Interview records backed by SQLite.
    pub interviews: Arc<InterviewStore>,

    /// Request metrics, updated by the telemetry middleware and the
    /// realtime session lifecycle.
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started.
    pub start_time: Instant,
}

/// Service-wide counters collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start.
    pub request_count: u64,

    /// Total number of errors encountered since server start.
    pub error_count: u64,

    /// Currently open realtime transcription sessions.
    pub active_sessions: u32,

    /// Per-endpoint statistics, keyed by "METHOD /path".
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Rolled-up statistics for a single endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint.
    pub request_count: u64,

    /// Total time spent processing requests to this endpoint, in ms.
    pub total_duration_ms: u64,

    /// Number of requests that resulted in an error response.
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        device: Device,
        models: Arc<ModelCache>,
        interviews: Arc<InterviewStore>,
    ) -> Self {
        Self {
            config,
            device,
            models,
            interviews,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Snapshot of the configuration for code that wants an owned copy.
    pub fn get_config(&self) -> AppConfig {
        self.config.clone()
    }

    /// Increment the total request counter (called by middleware for every
    /// request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called for 4xx/5xx responses).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record timing for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Claim a realtime session slot.
    ///
    /// The check and the increment happen under one write lock, so two
    /// connections racing for the last slot cannot both win. Returns `false`
    /// when the configured cap is already reached.
    pub fn try_begin_session(&self) -> bool {
        let mut metrics = self.metrics.write().unwrap();
        if (metrics.active_sessions as usize) >= self.config.performance.max_concurrent_sessions {
            return false;
        }
        metrics.active_sessions += 1;
        true
    }

    /// Release a realtime session slot claimed by `try_begin_session`.
    pub fn end_session(&self) {
        let mut metrics = self.metrics.write().unwrap();
        // Guard against mismatched calls rather than wrapping to u32::MAX.
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Currently open realtime sessions.
    pub fn active_sessions(&self) -> u32 {
        self.metrics.read().unwrap().active_sessions
    }

    /// Copy out the current metrics so no lock is held while the response
    /// is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MockLoader;

    fn test_state(max_sessions: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = max_sessions;
        AppState::new(
            config,
            Device::Cpu,
            Arc::new(ModelCache::new(Box::new(MockLoader::new()))),
            Arc::new(InterviewStore::new_in_memory().unwrap()),
        )
    }

    #[test]
    fn test_session_slots_respect_the_cap() {
        let state = test_state(2);

        assert!(state.try_begin_session());
        assert!(state.try_begin_session());
        assert!(!state.try_begin_session());
        assert_eq!(state.active_sessions(), 2);
    }

    #[test]
    fn test_ending_a_session_frees_a_slot() {
        let state = test_state(1);

        assert!(state.try_begin_session());
        assert!(!state.try_begin_session());

        state.end_session();
        assert!(state.try_begin_session());
    }

    #[test]
    fn test_end_session_never_underflows() {
        let state = test_state(1);

        state.end_session();
        assert_eq!(state.active_sessions(), 0);
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = test_state(1);

        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.error_count, 1);
        assert!((metric.average_duration_ms() - 20.0).abs() < f64::EPSILON);
        assert!((metric.error_rate() - 0.5).abs() < f64::EPSILON);
    }
}
