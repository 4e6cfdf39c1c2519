//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every call session through `web::Data`.
//!
//! ## Arc<RwLock<T>> Pattern:
//! - **Arc**: every worker thread and every running call holds a reference
//! - **RwLock**: many readers (health checks, new calls reading config) or one writer
//! - Locks are held only long enough to copy or bump a value, never across an `.await`
//!
//! ## Call Capacity:
//! A call slot is taken with `try_begin_session` before the WebSocket upgrade and given back
//! when the returned `SessionSlot` is dropped. Checking and incrementing happen under one
//! write lock, so two concurrent upgrades cannot both take the last slot.

use crate::bridge::session::{SessionEnd, SessionReport};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    /// Runtime-updatable configuration. Calls copy what they need when they start.
    pub config: Arc<RwLock<AppConfig>>,

    /// Bridge counters since server start.
    pub metrics: Arc<RwLock<BridgeMetrics>>,

    pub start_time: Instant,
}

/// Counters across all calls handled by this process.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BridgeMetrics {
    /// Calls currently bridged
    pub active_sessions: u32,
    /// Calls upgraded and handed to a session since start
    pub total_sessions: u64,
    /// Calls that ended with `stop` or a hang-up
    pub completed_sessions: u64,
    /// Calls that ended on a protocol violation, an unreachable agent, or an aborted duty
    pub failed_sessions: u64,
    /// Upgrades refused because every slot was taken
    pub rejected_sessions: u64,
    pub protocol_violations: u64,
    pub upstream_failures: u64,
    pub barge_ins: u64,
    pub blocks_forwarded: u64,
    pub audio_bytes_forwarded: u64,
    pub media_events_sent: u64,
    pub audio_bytes_returned: u64,
}

/// One reserved call slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct SessionSlot {
    metrics: Arc<RwLock<BridgeMetrics>>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(BridgeMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// A copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration if it validates.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Reserve a call slot, or fail with 503 when `max_concurrent_sessions` calls are running.
    pub fn try_begin_session(&self) -> AppResult<SessionSlot> {
        let limit = self.get_config().performance.max_concurrent_sessions;
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        if metrics.active_sessions as usize >= limit {
            metrics.rejected_sessions += 1;
            return Err(AppError::ServiceUnavailable(format!(
                "Maximum concurrent calls ({}) reached",
                limit
            )));
        }

        metrics.active_sessions += 1;
        Ok(SessionSlot {
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Count a call whose WebSocket upgrade succeeded.
    pub fn record_session_accepted(&self) {
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .total_sessions += 1;
    }

    /// Fold a finished call into the counters.
    pub fn record_report(&self, report: &SessionReport) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        if report.end.is_failure() {
            metrics.failed_sessions += 1;
        } else {
            metrics.completed_sessions += 1;
        }
        match report.end {
            SessionEnd::ProtocolViolation(_) => metrics.protocol_violations += 1,
            SessionEnd::UpstreamUnavailable(_) => metrics.upstream_failures += 1,
            _ => {}
        }

        metrics.barge_ins += report.downlink.clears_sent;
        metrics.blocks_forwarded += report.uplink.blocks_sent;
        metrics.audio_bytes_forwarded += report.uplink.bytes_sent;
        metrics.media_events_sent += report.downlink.media_sent;
        metrics.audio_bytes_returned += report.downlink.audio_bytes;
    }

    pub fn get_metrics_snapshot(&self) -> BridgeMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
