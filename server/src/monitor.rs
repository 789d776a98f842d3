//! Execution monitoring: lifecycle tracking, system-health sampling, and
//! cache-operation metrics.
//!
//! All state lives behind a single mutex; readers take snapshots. History
//! stores are ring buffers, oldest entries dropping first. The health
//! sampler runs on its own tokio task and shuts down within one interval
//! tick of [`ExecutionMonitor::shutdown`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Disks, Networks, System};
use uuid::Uuid;

/// Default execution-history ring size.
pub const DEFAULT_MAX_HISTORY: usize = 10_000;

/// Default health-sample ring size.
const HEALTH_HISTORY_SIZE: usize = 1_000;

/// Rolling window of cache-op latencies retained for averaging.
const CACHE_TIMING_WINDOW: usize = 100;

/// Default seconds between health samples.
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 60;

/// One tracked backtest execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    /// Execution id (correlation id when the caller supplied one)
    pub id: String,
    /// Requesting user, when identified
    pub user_id: Option<String>,
    /// Start timestamp
    pub start_time: DateTime<Utc>,
    /// End timestamp, absent while running
    pub end_time: Option<DateTime<Utc>>,
    /// Wall-clock duration in seconds
    pub duration_seconds: Option<f64>,
    /// Number of input signals
    pub signals_count: usize,
    /// Number of emitted trades
    pub trades_count: usize,
    /// Request parameters
    pub parameters: serde_json::Value,
    /// Headline performance metrics
    pub performance_metrics: Option<serde_json::Value>,
    /// Whether the result came from the cache
    pub cache_hit: bool,
    /// Process memory at completion, MB
    pub memory_mb: f64,
    /// Global CPU usage at completion, percent
    pub cpu_pct: f64,
    /// Failure description, absent on success
    pub error_message: Option<String>,
}

/// One system-health sample.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSample {
    /// Sample timestamp
    pub timestamp: DateTime<Utc>,
    /// Memory usage percent
    pub memory_pct: f64,
    /// CPU usage percent
    pub cpu_pct: f64,
    /// Disk usage percent of the fullest disk
    pub disk_pct: f64,
    /// Total bytes received across interfaces
    pub network_rx_bytes: u64,
    /// Total bytes transmitted across interfaces
    pub network_tx_bytes: u64,
    /// Number of processes
    pub process_count: usize,
    /// Number of threads (Linux; 0 elsewhere)
    pub thread_count: usize,
    /// 1/5/15-minute load averages, where available
    pub load_average: Option<[f64; 3]>,
}

/// A currently running execution.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveExecution {
    /// Execution id
    pub id: String,
    /// Requesting user, when identified
    pub user_id: Option<String>,
    /// Start timestamp
    pub start_time: DateTime<Utc>,
    /// Seconds elapsed so far
    pub elapsed_seconds: f64,
    /// Process memory at start, MB
    pub memory_start_mb: f64,
}

/// One entry of a user's activity log.
#[derive(Debug, Clone, Serialize)]
pub struct UserActivity {
    /// Completion timestamp
    pub timestamp: DateTime<Utc>,
    /// Execution id
    pub execution_id: String,
    /// Wall-clock duration in seconds
    pub duration_seconds: f64,
    /// Whether the execution completed without error
    pub success: bool,
    /// Number of input signals
    pub signals_count: usize,
    /// Number of emitted trades
    pub trades_count: usize,
}

/// Rolling cache performance counters.
#[derive(Debug, Clone, Serialize)]
pub struct CachePerformance {
    /// Cache hits observed
    pub hits: u64,
    /// Cache misses observed
    pub misses: u64,
    /// `hits / (hits + misses) * 100`, 0 when no lookups yet
    pub hit_rate_pct: f64,
    /// All get/set operations observed
    pub total_operations: u64,
    /// Mean get latency over the rolling window, ms
    pub average_get_time_ms: f64,
    /// Mean set latency over the rolling window, ms
    pub average_set_time_ms: f64,
}

/// Aggregated execution analytics over a trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    /// Window length in days
    pub period_days: i64,
    /// Executions started inside the window
    pub total_executions: usize,
    /// Executions that finished without error
    pub successful_executions: usize,
    /// `successful / total * 100`
    pub success_rate_pct: f64,
    /// Mean duration of finished executions, seconds
    pub average_duration_seconds: f64,
    /// Mean signal count
    pub average_signals: f64,
    /// Mean trade count
    pub average_trades: f64,
    /// Percent of executions served from cache
    pub cache_hit_rate_pct: f64,
    /// Execution counts keyed by `YYYY-MM-DD`
    pub executions_by_day: HashMap<String, usize>,
}

/// Kind of cache operation being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// A cache lookup
    Get,
    /// A cache store
    Set,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: u64,
    misses: u64,
    total_operations: u64,
    get_times_ms: VecDeque<f64>,
    set_times_ms: VecDeque<f64>,
}

#[derive(Debug)]
struct ActiveState {
    user_id: Option<String>,
    start_time: DateTime<Utc>,
    memory_start_mb: f64,
    signals_count: usize,
    parameters: serde_json::Value,
    performance_metrics: Option<serde_json::Value>,
    trades_count: usize,
    cache_hit: bool,
}

#[derive(Debug, Default)]
struct MonitorState {
    active: HashMap<String, ActiveState>,
    history: VecDeque<ExecutionRecord>,
    health_history: VecDeque<HealthSample>,
    cache_stats: CacheStats,
    user_activity: HashMap<String, Vec<UserActivity>>,
}

/// Lifecycle tracker for simulation and optimization invocations.
pub struct ExecutionMonitor {
    state: Mutex<MonitorState>,
    max_history: usize,
    health_interval: Duration,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl ExecutionMonitor {
    /// Create a monitor with the given history cap and health interval.
    pub fn new(max_history: usize, health_interval: Duration) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(MonitorState::default()),
            max_history,
            health_interval,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Create a monitor with default limits.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(
            DEFAULT_MAX_HISTORY,
            Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
        )
    }

    /// Spawn the background health sampler.
    ///
    /// The task samples system health each interval and exits within one
    /// tick after [`shutdown`](Self::shutdown).
    pub fn start_health_sampler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut sys = System::new();
            let mut disks = Disks::new_with_refreshed_list();
            let mut networks = Networks::new_with_refreshed_list();
            let mut ticker = tokio::time::interval(monitor.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sample = collect_health(&mut sys, &mut disks, &mut networks);
                        if sample.memory_pct > 90.0 {
                            tracing::warn!(memory_pct = sample.memory_pct, "high memory usage");
                        }
                        if sample.cpu_pct > 80.0 {
                            tracing::warn!(cpu_pct = sample.cpu_pct, "high CPU usage");
                        }
                        let mut state = monitor.state.lock().expect("monitor lock");
                        push_capped(&mut state.health_history, sample, HEALTH_HISTORY_SIZE);
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("health sampler stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Signal the health sampler to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Register the start of an execution.
    ///
    /// The correlation id becomes the execution id when supplied; otherwise
    /// a fresh UUID is used.
    pub fn begin(&self, user_id: Option<String>, correlation_id: Option<String>) -> String {
        let id = correlation_id
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let start_time = Utc::now();
        let memory_start_mb = current_process_memory_mb();

        tracing::info!(execution_id = %id, user_id = ?user_id, "execution started");

        let mut state = self.state.lock().expect("monitor lock");
        state.active.insert(
            id.clone(),
            ActiveState {
                user_id,
                start_time,
                memory_start_mb,
                signals_count: 0,
                parameters: serde_json::Value::Null,
                performance_metrics: None,
                trades_count: 0,
                cache_hit: false,
            },
        );
        id
    }

    /// Attach request parameters and the input signal count.
    pub fn log_run_start(&self, id: &str, parameters: serde_json::Value, signals_count: usize) {
        let mut state = self.state.lock().expect("monitor lock");
        if let Some(active) = state.active.get_mut(id) {
            active.parameters = parameters;
            active.signals_count = signals_count;
        }
    }

    /// Attach the trade count and headline metrics.
    pub fn log_run_complete(
        &self,
        id: &str,
        trades_count: usize,
        performance_metrics: serde_json::Value,
    ) {
        let mut state = self.state.lock().expect("monitor lock");
        if let Some(active) = state.active.get_mut(id) {
            active.trades_count = trades_count;
            active.performance_metrics = Some(performance_metrics);
        }
    }

    /// Mark whether the execution was served from cache.
    pub fn set_cache_hit(&self, id: &str, hit: bool) {
        let mut state = self.state.lock().expect("monitor lock");
        if let Some(active) = state.active.get_mut(id) {
            active.cache_hit = hit;
        }
    }

    /// Record a successful completion.
    pub fn complete(&self, id: &str) {
        self.finish(id, None);
    }

    /// Record a failed completion.
    pub fn fail(&self, id: &str, error: impl Into<String>) {
        self.finish(id, Some(error.into()));
    }

    fn finish(&self, id: &str, error_message: Option<String>) {
        let end_time = Utc::now();
        let memory_mb = current_process_memory_mb();

        let mut state = self.state.lock().expect("monitor lock");
        let Some(active) = state.active.remove(id) else {
            tracing::warn!(execution_id = %id, "finish for unknown execution");
            return;
        };

        let duration = (end_time - active.start_time).num_milliseconds() as f64 / 1_000.0;
        let cpu_pct = state
            .health_history
            .back()
            .map(|h| h.cpu_pct)
            .unwrap_or(0.0);
        let success = error_message.is_none();

        if let Some(user) = &active.user_id {
            let entry = UserActivity {
                timestamp: end_time,
                execution_id: id.to_string(),
                duration_seconds: duration,
                success,
                signals_count: active.signals_count,
                trades_count: active.trades_count,
            };
            state.user_activity.entry(user.clone()).or_default().push(entry);
        }

        let record = ExecutionRecord {
            id: id.to_string(),
            user_id: active.user_id,
            start_time: active.start_time,
            end_time: Some(end_time),
            duration_seconds: Some(duration),
            signals_count: active.signals_count,
            trades_count: active.trades_count,
            parameters: active.parameters,
            performance_metrics: active.performance_metrics,
            cache_hit: active.cache_hit,
            memory_mb,
            cpu_pct,
            error_message,
        };

        if success {
            tracing::info!(
                execution_id = %id,
                duration_seconds = duration,
                signals = record.signals_count,
                trades = record.trades_count,
                "execution completed"
            );
        } else {
            tracing::error!(
                execution_id = %id,
                duration_seconds = duration,
                error = record.error_message.as_deref().unwrap_or(""),
                "execution failed"
            );
        }

        let cap = self.max_history;
        push_capped(&mut state.history, record, cap);
    }

    /// Record a cache operation's latency and (for gets) hit/miss.
    pub fn record_cache_op(&self, op: CacheOp, duration_ms: f64, hit: bool) {
        let mut state = self.state.lock().expect("monitor lock");
        let stats = &mut state.cache_stats;
        stats.total_operations += 1;
        match op {
            CacheOp::Get => {
                push_capped(&mut stats.get_times_ms, duration_ms, CACHE_TIMING_WINDOW);
                if hit {
                    stats.hits += 1;
                } else {
                    stats.misses += 1;
                }
            }
            CacheOp::Set => {
                push_capped(&mut stats.set_times_ms, duration_ms, CACHE_TIMING_WINDOW);
            }
        }
    }

    /// Snapshot of one finished or running execution.
    pub fn execution_summary(&self, id: &str) -> Option<ExecutionRecord> {
        let state = self.state.lock().expect("monitor lock");
        if let Some(active) = state.active.get(id) {
            return Some(ExecutionRecord {
                id: id.to_string(),
                user_id: active.user_id.clone(),
                start_time: active.start_time,
                end_time: None,
                duration_seconds: None,
                signals_count: active.signals_count,
                trades_count: active.trades_count,
                parameters: active.parameters.clone(),
                performance_metrics: active.performance_metrics.clone(),
                cache_hit: active.cache_hit,
                memory_mb: active.memory_start_mb,
                cpu_pct: 0.0,
                error_message: None,
            });
        }
        state.history.iter().rev().find(|r| r.id == id).cloned()
    }

    /// Currently running executions.
    pub fn active_executions(&self) -> Vec<ActiveExecution> {
        let now = Utc::now();
        let state = self.state.lock().expect("monitor lock");
        state
            .active
            .iter()
            .map(|(id, a)| ActiveExecution {
                id: id.clone(),
                user_id: a.user_id.clone(),
                start_time: a.start_time,
                elapsed_seconds: (now - a.start_time).num_milliseconds() as f64 / 1_000.0,
                memory_start_mb: a.memory_start_mb,
            })
            .collect()
    }

    /// Aggregate analytics over the last `days` days.
    pub fn aggregated(&self, days: i64) -> AnalyticsSummary {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let state = self.state.lock().expect("monitor lock");

        let recent: Vec<&ExecutionRecord> = state
            .history
            .iter()
            .filter(|r| r.start_time >= cutoff)
            .collect();

        let total = recent.len();
        if total == 0 {
            return AnalyticsSummary {
                period_days: days,
                total_executions: 0,
                successful_executions: 0,
                success_rate_pct: 0.0,
                average_duration_seconds: 0.0,
                average_signals: 0.0,
                average_trades: 0.0,
                cache_hit_rate_pct: 0.0,
                executions_by_day: HashMap::new(),
            };
        }

        let successful = recent.iter().filter(|r| r.error_message.is_none()).count();
        let durations: Vec<f64> = recent.iter().filter_map(|r| r.duration_seconds).collect();
        let average_duration_seconds = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };
        let average_signals =
            recent.iter().map(|r| r.signals_count).sum::<usize>() as f64 / total as f64;
        let average_trades =
            recent.iter().map(|r| r.trades_count).sum::<usize>() as f64 / total as f64;
        let cache_hits = recent.iter().filter(|r| r.cache_hit).count();

        let mut executions_by_day: HashMap<String, usize> = HashMap::new();
        for record in &recent {
            *executions_by_day
                .entry(record.start_time.format("%Y-%m-%d").to_string())
                .or_insert(0) += 1;
        }

        AnalyticsSummary {
            period_days: days,
            total_executions: total,
            successful_executions: successful,
            success_rate_pct: successful as f64 / total as f64 * 100.0,
            average_duration_seconds,
            average_signals,
            average_trades,
            cache_hit_rate_pct: cache_hits as f64 / total as f64 * 100.0,
            executions_by_day,
        }
    }

    /// Recent activity for one user, or for all users when `user_id` is None.
    pub fn user_activity(&self, user_id: Option<&str>, limit: usize) -> Vec<UserActivity> {
        let state = self.state.lock().expect("monitor lock");
        match user_id {
            Some(user) => {
                let entries = state.user_activity.get(user).cloned().unwrap_or_default();
                let skip = entries.len().saturating_sub(limit);
                entries.into_iter().skip(skip).collect()
            }
            None => {
                let mut all: Vec<UserActivity> = state
                    .user_activity
                    .values()
                    .flat_map(|v| v.iter().cloned())
                    .collect();
                all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                all.truncate(limit);
                all
            }
        }
    }

    /// Rolling cache performance counters.
    pub fn cache_performance(&self) -> CachePerformance {
        let state = self.state.lock().expect("monitor lock");
        let stats = &state.cache_stats;
        let lookups = stats.hits + stats.misses;
        CachePerformance {
            hits: stats.hits,
            misses: stats.misses,
            hit_rate_pct: if lookups > 0 {
                stats.hits as f64 / lookups as f64 * 100.0
            } else {
                0.0
            },
            total_operations: stats.total_operations,
            average_get_time_ms: rolling_mean(&stats.get_times_ms),
            average_set_time_ms: rolling_mean(&stats.set_times_ms),
        }
    }

    /// Latest system-health sample, if any has been collected.
    pub fn system_health(&self) -> Option<HealthSample> {
        let state = self.state.lock().expect("monitor lock");
        state.health_history.back().cloned()
    }

    /// Overview counters for the monitoring surface.
    pub fn stats(&self) -> serde_json::Value {
        let state = self.state.lock().expect("monitor lock");
        serde_json::json!({
            "active_executions": state.active.len(),
            "executions_tracked": state.history.len(),
            "health_samples": state.health_history.len(),
            "tracked_users": state.user_activity.len(),
            "cache_operations": state.cache_stats.total_operations,
        })
    }

    /// Drop execution history and user activity older than `days` days.
    ///
    /// Returns the number of execution records removed.
    pub fn cleanup(&self, days: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut state = self.state.lock().expect("monitor lock");

        let before = state.history.len();
        state.history.retain(|r| r.start_time >= cutoff);
        let removed = before - state.history.len();

        for entries in state.user_activity.values_mut() {
            entries.retain(|a| a.timestamp >= cutoff);
        }
        state.user_activity.retain(|_, v| !v.is_empty());

        tracing::info!(days, removed, "monitoring data cleaned up");
        removed
    }

    /// Export the full monitoring state as JSON.
    pub fn export_json(&self) -> serde_json::Value {
        let state = self.state.lock().expect("monitor lock");
        serde_json::json!({
            "export_timestamp": Utc::now().to_rfc3339(),
            "executions": state.history.iter().collect::<Vec<_>>(),
            "system_health": state.health_history.iter().collect::<Vec<_>>(),
            "user_activity": state.user_activity,
            "cache_stats": {
                "hits": state.cache_stats.hits,
                "misses": state.cache_stats.misses,
                "total_operations": state.cache_stats.total_operations,
            },
        })
    }
}

/// Push into a ring buffer, dropping the oldest entry at capacity.
fn push_capped<T>(buffer: &mut VecDeque<T>, value: T, cap: usize) {
    if buffer.len() >= cap {
        buffer.pop_front();
    }
    buffer.push_back(value);
}

fn rolling_mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Resident memory of this process in MB.
fn current_process_memory_mb() -> f64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0.0;
    };
    let mut sys = System::new();
    sys.refresh_process(pid);
    sys.process(pid)
        .map(|p| p.memory() as f64 / 1024.0 / 1024.0)
        .unwrap_or(0.0)
}

/// Collect one system-health sample.
fn collect_health(sys: &mut System, disks: &mut Disks, networks: &mut Networks) -> HealthSample {
    sys.refresh_memory();
    sys.refresh_cpu();
    sys.refresh_processes();
    disks.refresh();
    networks.refresh();

    let memory_pct = if sys.total_memory() > 0 {
        sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
    } else {
        0.0
    };
    let cpu_pct = sys.global_cpu_info().cpu_usage() as f64;

    let disk_pct = disks
        .iter()
        .filter(|d| d.total_space() > 0)
        .map(|d| {
            let used = d.total_space() - d.available_space();
            used as f64 / d.total_space() as f64 * 100.0
        })
        .fold(0.0, f64::max);

    let (rx, tx) = networks.iter().fold((0_u64, 0_u64), |(rx, tx), (_, data)| {
        (rx + data.total_received(), tx + data.total_transmitted())
    });

    #[cfg(target_os = "linux")]
    let thread_count: usize = sys
        .processes()
        .values()
        .filter_map(|p| p.tasks().map(|t| t.len()))
        .sum();
    #[cfg(not(target_os = "linux"))]
    let thread_count: usize = 0;

    let load = System::load_average();
    let load_average = if load.one >= 0.0 {
        Some([load.one, load.five, load.fifteen])
    } else {
        None
    };

    HealthSample {
        timestamp: Utc::now(),
        memory_pct,
        cpu_pct,
        disk_pct,
        network_rx_bytes: rx,
        network_tx_bytes: tx,
        process_count: sys.processes().len(),
        thread_count,
        load_average,
    }
}
