//! Call and connection statistics.
//!
//! Counters are plain data; owners wrap them in a lock and update them with a single
//! `record_*` call per event so readers never observe a half-applied update.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Rolling counters for one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolCallStats {
    /// Tool key the counters belong to.
    pub tool_key: String,
    pub total_calls: u64,
    pub success_calls: u64,
    pub failed_calls: u64,
    /// Accumulated duration of successful calls.
    pub total_duration_ms: f64,
    pub last_call_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ToolCallStats {
    pub fn new(tool_key: impl Into<String>) -> Self {
        Self {
            tool_key: tool_key.into(),
            ..Default::default()
        }
    }

    /// Record one completed call.
    pub fn record_call(&mut self, success: bool, duration: Duration, error: Option<String>) {
        self.total_calls += 1;
        self.last_call_time = Some(Utc::now());
        if success {
            self.success_calls += 1;
            self.total_duration_ms += duration.as_secs_f64() * 1000.0;
        } else {
            self.failed_calls += 1;
            self.last_error = error;
        }
    }

    /// Percentage of successful calls, 0 when nothing has been recorded.
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.success_calls as f64 / self.total_calls as f64 * 100.0
    }

    /// Mean duration of successful calls in milliseconds.
    pub fn avg_duration_ms(&self) -> f64 {
        if self.success_calls == 0 {
            return 0.0;
        }
        self.total_duration_ms / self.success_calls as f64
    }

    /// Serializable view including the derived rates.
    pub fn snapshot(&self) -> ToolStatsSnapshot {
        ToolStatsSnapshot {
            tool_key: self.tool_key.clone(),
            total_calls: self.total_calls,
            success_calls: self.success_calls,
            failed_calls: self.failed_calls,
            success_rate: round2(self.success_rate()),
            avg_duration_ms: round2(self.avg_duration_ms()),
            last_call_time: self.last_call_time,
            last_error: self.last_error.clone(),
        }
    }
}

/// Point-in-time view of a tool's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolStatsSnapshot {
    pub tool_key: String,
    pub total_calls: u64,
    pub success_calls: u64,
    pub failed_calls: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub last_call_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Connection counters for one server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub server_name: String,
    pub connect_count: u64,
    pub disconnect_count: u64,
    pub reconnect_count: u64,
    /// Failed heartbeats, calls or connects since the last success.
    pub consecutive_failures: u32,
    pub last_connect_time: Option<DateTime<Utc>>,
    pub last_disconnect_time: Option<DateTime<Utc>>,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
}

impl ServerStats {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ..Default::default()
        }
    }

    pub fn record_connect(&mut self) {
        self.connect_count += 1;
        self.last_connect_time = Some(Utc::now());
        self.consecutive_failures = 0;
    }

    pub fn record_disconnect(&mut self) {
        self.disconnect_count += 1;
        self.last_disconnect_time = Some(Utc::now());
    }

    pub fn record_reconnect(&mut self) {
        self.reconnect_count += 1;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat_time = Some(Utc::now());
    }
}

/// Manager-wide roll-up of routed calls.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalStats {
    pub total_tool_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub started_at: DateTime<Utc>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            total_tool_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            started_at: Utc::now(),
        }
    }
}

impl GlobalStats {
    pub fn record_call(&mut self, success: bool) {
        self.total_tool_calls += 1;
        if success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
        }
    }

    pub fn snapshot(&self) -> GlobalStatsSnapshot {
        let uptime = (Utc::now() - self.started_at).to_std().unwrap_or_default().as_secs_f64();
        let calls_per_minute = if uptime > 0.0 {
            self.total_tool_calls as f64 / (uptime / 60.0)
        } else {
            0.0
        };
        GlobalStatsSnapshot {
            total_tool_calls: self.total_tool_calls,
            successful_calls: self.successful_calls,
            failed_calls: self.failed_calls,
            started_at: self.started_at,
            uptime_seconds: round2(uptime),
            calls_per_minute: round2(calls_per_minute),
        }
    }
}

/// Point-in-time view of the global roll-up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalStatsSnapshot {
    pub total_tool_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub calls_per_minute: f64,
}

/// Everything `get_all_stats` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub global: GlobalStatsSnapshot,
    /// Per-server connection counters keyed by server name.
    pub servers: BTreeMap<String, ServerStats>,
    /// Per-tool counters keyed by qualified tool name.
    pub tools: BTreeMap<String, ToolStatsSnapshot>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn tool_stats_track_outcomes() {
        let mut stats = ToolCallStats::new("test_tool");
        stats.record_call(true, ms(100), None);
        stats.record_call(true, ms(200), None);
        stats.record_call(false, ms(50), Some("timeout".into()));

        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.success_calls, 2);
        assert_eq!(stats.failed_calls, 1);
        assert!((stats.success_rate() - 200.0 / 3.0).abs() < 1e-9);
        assert!((stats.avg_duration_ms() - 150.0).abs() < 1e-9);
        assert_eq!(stats.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn empty_tool_stats_do_not_divide_by_zero() {
        let stats = ToolCallStats::new("idle");
        assert_eq!(stats.success_rate(), 0.0);
        assert_eq!(stats.avg_duration_ms(), 0.0);
        assert_eq!(stats.snapshot().success_rate, 0.0);
    }

    #[test]
    fn totals_always_add_up() {
        // Every success/failure sequence of length 8, with durations varying per call.
        for bits in 0u32..256 {
            let mut stats = ToolCallStats::new("mixed");
            let mut succeeded = 0u64;
            let mut success_ms = 0u64;
            let mut last_error = None;

            for i in 0..8u64 {
                let success = bits & (1 << i) != 0;
                let duration = (bits as u64 * 7 + i * 13) % 50;
                let error = (!success).then(|| format!("err {bits}/{i}"));
                if success {
                    succeeded += 1;
                    success_ms += duration;
                } else {
                    last_error.clone_from(&error);
                }
                stats.record_call(success, ms(duration), error);

                assert_eq!(stats.total_calls, i + 1);
                assert_eq!(stats.total_calls, stats.success_calls + stats.failed_calls);
                assert_eq!(stats.success_calls, succeeded);
                let expected = succeeded as f64 / stats.total_calls as f64 * 100.0;
                assert!((stats.success_rate() - expected).abs() < 1e-9);
            }

            let average = if succeeded == 0 { 0.0 } else { success_ms as f64 / succeeded as f64 };
            assert!((stats.avg_duration_ms() - average).abs() < 1e-6, "pattern {bits:08b}");
            assert_eq!(stats.last_error, last_error, "pattern {bits:08b}");
            assert!((0.0..=100.0).contains(&stats.success_rate()));
        }
    }

    #[test]
    fn server_stats_streaks() {
        let mut stats = ServerStats::new("test_server");
        stats.record_connect();
        stats.record_heartbeat();
        stats.record_disconnect();
        stats.record_failure();
        stats.record_failure();

        assert_eq!(stats.connect_count, 1);
        assert_eq!(stats.disconnect_count, 1);
        assert_eq!(stats.consecutive_failures, 2);
        assert!(stats.last_heartbeat_time.is_some());

        stats.record_reconnect();
        assert_eq!(stats.reconnect_count, 1);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[test]
    fn global_snapshot_counts_calls() {
        let mut global = GlobalStats::default();
        global.record_call(true);
        global.record_call(false);
        let snapshot = global.snapshot();
        assert_eq!(snapshot.total_tool_calls, 2);
        assert_eq!(snapshot.successful_calls, 1);
        assert_eq!(snapshot.failed_calls, 1);
        assert!(snapshot.uptime_seconds >= 0.0);
    }
}
