use crate::engine::UploadEngine;
use crate::models::DrainReport;
use crate::remote::AuthProvider;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const CYCLE_LOG_CAP: usize = 500;

/// In-memory session log entry (lost on restart)
#[derive(Debug, Clone, PartialEq)]
pub struct CycleLogEntry {
    pub ts_ms: i64,
    pub processed: usize,
    pub failed: usize,
}

struct RunnerState {
    running: AtomicBool,
    /// epoch ms of the next planned cycle, 0 when unknown
    next_cycle_at: AtomicI64,
    log: Mutex<Vec<CycleLogEntry>>,
    stop: Notify,
}

impl RunnerState {
    fn append_log(&self, report: &DrainReport) {
        if let Ok(mut guard) = self.log.lock() {
            guard.push(CycleLogEntry {
                ts_ms: Utc::now().timestamp_millis(),
                processed: report.processed,
                failed: report.failed,
            });
            let len = guard.len();
            if len > CYCLE_LOG_CAP {
                guard.drain(0..len - CYCLE_LOG_CAP);
            }
        }
    }
}

/// Keeps drain cycles going without an interactive view.
///
/// A cycle runs on every timer tick, when connectivity comes back and when
/// the queue's drain trigger fires. Cycles are skipped while offline or when
/// no credential can be obtained.
pub struct BackgroundRunner;

impl BackgroundRunner {
    /// Spawns the runner loop on the current tokio runtime
    pub fn start(engine: Arc<UploadEngine>, auth: Arc<dyn AuthProvider>) -> RunnerHandle {
        let state = Arc::new(RunnerState {
            running: AtomicBool::new(true),
            next_cycle_at: AtomicI64::new(0),
            log: Mutex::new(Vec::new()),
            stop: Notify::new(),
        });
        let trigger = engine.queue().drain_trigger();
        let interval = engine.queue().config().drain_interval();
        log::info!(
            "Starting background runner with {} second interval",
            interval.as_secs()
        );

        let task = tokio::spawn(run_loop(
            engine,
            auth,
            Arc::clone(&state),
            Arc::clone(&trigger),
            interval,
        ));

        RunnerHandle {
            state,
            trigger,
            interval,
            task: Mutex::new(Some(task)),
        }
    }
}

async fn run_loop(
    engine: Arc<UploadEngine>,
    auth: Arc<dyn AuthProvider>,
    state: Arc<RunnerState>,
    trigger: Arc<Notify>,
    interval: Duration,
) {
    let connectivity = engine.queue().connectivity().clone();
    let mut online_rx = connectivity.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = state.stop.notified() => break,
            _ = ticker.tick() => {}
            _ = trigger.notified() => {
                log::debug!("Drain requested");
            }
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *online_rx.borrow_and_update();
                engine.queue().status().refresh();
                if !online {
                    log::info!("Offline, pausing uploads");
                    continue;
                }
                log::info!("Back online, draining queue");
            }
        }

        run_cycle(&engine, auth.as_ref(), &state).await;
        state.next_cycle_at.store(
            Utc::now().timestamp_millis() + interval.as_millis() as i64,
            Ordering::SeqCst,
        );
    }

    state.running.store(false, Ordering::SeqCst);
    log::info!("Background runner stopped");
}

async fn run_cycle(engine: &Arc<UploadEngine>, auth: &dyn AuthProvider, state: &RunnerState) {
    if !engine.queue().connectivity().is_online() {
        log::debug!("Offline, skipping drain cycle");
        return;
    }
    let token = match auth.auth_token().await {
        Some(t) => t,
        None => {
            log::debug!("No credential available, skipping drain cycle");
            return;
        }
    };
    let report = engine.drain(&token).await;
    state.append_log(&report);
}

/// Control surface of a started runner
pub struct RunnerHandle {
    state: Arc<RunnerState>,
    trigger: Arc<Notify>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RunnerHandle {
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Asks for a cycle as soon as the current one (if any) is done
    pub fn request_drain(&self) {
        self.trigger.notify_one();
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time until the next timer-driven cycle, `None` once stopped
    pub fn next_cycle_eta(&self) -> Option<Duration> {
        if !self.is_running() {
            return None;
        }
        let target = self.state.next_cycle_at.load(Ordering::SeqCst);
        let now = Utc::now().timestamp_millis();
        if target <= now {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_millis((target - now) as u64))
        }
    }

    pub fn cycle_log(&self) -> Vec<CycleLogEntry> {
        self.state
            .log
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Stops the loop after the cycle in progress
    pub fn stop(&self) {
        if self.is_running() {
            log::info!("Stopping background runner");
        }
        self.state.stop.notify_one();
    }

    /// Stops the loop and waits for it to exit
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Background runner ended abnormally: {}", e);
            }
        }
        self.state.running.store(false, Ordering::SeqCst);
    }
}
