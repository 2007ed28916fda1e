// ABOUTME: Hang-detection watchdog fed by heartbeats from the batch loop
// ABOUTME: Runs its own timer task and raises one alert per stall, never failing the caller

use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// File name used when no watchdog log path is configured
pub const DEFAULT_WATCHDOG_LOG: &str = "watchdog.log";

/// Timing and output settings for the watchdog
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Silence longer than this is reported as a hang
    pub timeout: Duration,
    /// How often the timer checks for silence
    pub poll_interval: Duration,
    /// Append-only diagnostic log; `None` disables file logging
    pub log_path: Option<PathBuf>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            log_path: None,
        }
    }
}

/// A detected stall
#[derive(Debug, Clone)]
pub struct HangAlert {
    /// Context passed with the last heartbeat
    pub context: String,
    /// Time since that heartbeat
    pub elapsed: Duration,
    /// Wall-clock time of that heartbeat
    pub last_heartbeat: DateTime<Utc>,
}

type AlertHandler = Arc<dyn Fn(&HangAlert) + Send + Sync>;

struct Heartbeat {
    last_context: String,
    last_instant: Instant,
    last_time: DateTime<Utc>,
    alert_outstanding: bool,
}

struct Shared {
    heartbeat: Mutex<Heartbeat>,
    timeout: Duration,
    log_path: Option<PathBuf>,
    handler: Option<AlertHandler>,
    alerts: AtomicU64,
}

impl Shared {
    fn record(&self, context: &str) {
        if let Ok(mut hb) = self.heartbeat.lock() {
            hb.last_context = context.to_string();
            hb.last_instant = Instant::now();
            hb.last_time = Utc::now();
            hb.alert_outstanding = false;
        }
    }

    /// Edge-triggered: returns an alert only for the first tick past the timeout
    fn check(&self, now: Instant) -> Option<HangAlert> {
        let mut hb = self.heartbeat.lock().ok()?;
        let elapsed = now.saturating_duration_since(hb.last_instant);
        if elapsed <= self.timeout || hb.alert_outstanding {
            return None;
        }
        hb.alert_outstanding = true;
        Some(HangAlert {
            context: hb.last_context.clone(),
            elapsed,
            last_heartbeat: hb.last_time,
        })
    }

    fn poll(&self) {
        let Some(alert) = self.check(Instant::now()) else {
            return;
        };
        self.alerts.fetch_add(1, Ordering::SeqCst);

        tracing::warn!(
            "⚠ No progress for {}s (last activity: {} at {})",
            alert.elapsed.as_secs(),
            alert.context,
            alert.last_heartbeat.format("%H:%M:%S")
        );
        self.log(&format!(
            "HANG DETECTED: no heartbeat for {}s, last context '{}' at {}",
            alert.elapsed.as_secs(),
            alert.context,
            alert.last_heartbeat.to_rfc3339()
        ));
        self.log(&process_diagnostics());

        if let Some(handler) = &self.handler {
            if catch_unwind(AssertUnwindSafe(|| handler(&alert))).is_err() {
                tracing::debug!("Watchdog alert handler panicked; ignored");
            }
        }
    }

    fn log(&self, line: &str) {
        if let Some(path) = &self.log_path {
            append_log(path, line);
        }
    }
}

/// Detects stalled operations from the gap between heartbeats
///
/// The timer runs on its own task, independent of how long a batch takes. Once the gap
/// exceeds the timeout a single [`HangAlert`] fires; the next heartbeat re-arms it.
pub struct Watchdog {
    shared: Arc<Shared>,
    poll_interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self::build(config, None)
    }

    /// Watchdog that also hands every alert to `handler`
    pub fn with_alert_handler<F>(config: WatchdogConfig, handler: F) -> Self
    where
        F: Fn(&HangAlert) + Send + Sync + 'static,
    {
        Self::build(config, Some(Arc::new(handler)))
    }

    fn build(config: WatchdogConfig, handler: Option<AlertHandler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                heartbeat: Mutex::new(Heartbeat {
                    last_context: String::new(),
                    last_instant: Instant::now(),
                    last_time: Utc::now(),
                    alert_outstanding: false,
                }),
                timeout: config.timeout,
                log_path: config.log_path,
                handler,
                alerts: AtomicU64::new(0),
            }),
            poll_interval: config.poll_interval.max(Duration::from_millis(1)),
            task: Mutex::new(None),
        }
    }

    /// Arm the timer; must be called from within a tokio runtime
    pub fn start(&self, context: &str) {
        self.stop_task();
        self.shared.record(context);
        self.shared.log(&format!("started: {}", context));

        let shared = Arc::clone(&self.shared);
        let period = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.poll();
            }
        });

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    /// Report liveness; clears any outstanding alert
    pub fn heartbeat(&self, context: &str) {
        self.shared.record(context);
    }

    /// Disarm the timer; safe to call repeatedly
    pub fn stop(&self) {
        if self.stop_task() {
            self.shared.log("stopped");
        }
    }

    /// Number of alerts raised since construction
    pub fn alert_count(&self) -> u64 {
        self.shared.alerts.load(Ordering::SeqCst)
    }

    fn stop_task(&self) -> bool {
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop_task();
    }
}

/// Default log location beside the running executable
pub fn default_log_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_WATCHDOG_LOG)
}

fn append_log(path: &Path, line: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{} {}", Utc::now().to_rfc3339(), line));
    if let Err(e) = result {
        tracing::debug!("Watchdog log write to {} failed: {}", path.display(), e);
    }
}

const MIB: u64 = 1024 * 1024;

/// Resident memory and thread count of this process, plus overall system memory
fn process_diagnostics() -> String {
    let mut sys = System::new();
    sys.refresh_memory();
    let pid = sysinfo::get_current_pid().ok();
    if let Some(pid) = pid {
        sys.refresh_process(pid);
    }
    let process = pid.and_then(|pid| sys.process(pid));

    let memory = process
        .map(|p| format!("{} MiB", p.memory() / MIB))
        .unwrap_or_else(|| "unavailable".to_string());
    // Per-thread listing is only reported on some platforms
    let threads = process
        .and_then(|p| p.tasks())
        .map(|tasks| tasks.len().max(1).to_string())
        .unwrap_or_else(|| "unavailable".to_string());

    format!(
        "diagnostics: resident memory {}, threads {}, system memory {}/{} MiB used",
        memory,
        threads,
        sys.used_memory() / MIB,
        sys.total_memory() / MIB
    )
}
