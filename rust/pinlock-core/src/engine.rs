//! Policy sync and foreground gate engine.
//!
//! Three background tasks run while the engine is started:
//!   - a listener rebuilding the policy cache from every snapshot of the
//!     active-policy collection
//!   - the foreground sampler, starting a gate session when a restricted
//!     target has focus
//!   - the signal channel poll
//!
//! Passcode input arrives from the host through `press_digit`, `backspace`,
//! `confirm` and `cancel`. A grant removes the target from the local cache
//! and fires one removal per collection without waiting for either.

use crate::config::PinlockConfig;
use crate::gate::{Gate, GateError, GatePhase, Verdict};
use crate::platform::{FocusHandle, IndicatorHandle, LauncherHandle, SurfaceHandle};
use crate::policy::{Policy, PolicyCache, TARGET_FIELD};
use crate::remote::{StoreError, StoreHandle};
use crate::sampler::ForegroundSampler;
use crate::signal::{SignalChannel, SignalOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine: not available - {0}")]
    NotAvailable(String),

    #[error("engine: already running")]
    AlreadyRunning,

    #[error("engine: not running")]
    NotRunning,

    #[error("engine: invalid configuration - {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gate(#[from] GateError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Everything the engine talks to outside itself.
#[derive(Clone)]
pub struct Collaborators {
    pub store: StoreHandle,
    pub focus: FocusHandle,
    pub surface: SurfaceHandle,
    pub launcher: LauncherHandle,
    pub indicator: IndicatorHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateEventKind {
    Prompted,
    Denied,
    Granted,
    Cancelled,
    RemovalFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateEvent {
    pub kind: GateEventKind,
    pub target_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub policy_size: usize,
    pub gate_phase: GatePhase,
    pub active_target: Option<String>,
}

pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: PinlockConfig,
    collaborators: Collaborators,
    cache: PolicyCache,
    gate: Mutex<Gate>,
    sampler: ForegroundSampler,
    signal: SignalChannel,
    running: AtomicBool,
    runtime: Mutex<Option<Handle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    removals: Mutex<Vec<JoinHandle<()>>>,
    events_tx: broadcast::Sender<GateEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Engine {
    pub fn new(config: PinlockConfig, collaborators: Collaborators) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        let sampler = ForegroundSampler::new(
            Arc::clone(&collaborators.focus),
            config.sampler.lookback(),
        );
        let signal = SignalChannel::new(
            Arc::clone(&collaborators.store),
            Arc::clone(&collaborators.launcher),
            config.store.signal_path(),
            config.launcher_component.clone(),
        );
        let (events_tx, _) = broadcast::channel(100);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                collaborators,
                cache: PolicyCache::new(),
                gate: Mutex::new(Gate::new()),
                sampler,
                signal,
                running: AtomicBool::new(false),
                runtime: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                removals: Mutex::new(Vec::new()),
                events_tx,
            }),
        })
    }

    /// Subscribe to the active-policy collection, show the status indicator
    /// and start the periodic tasks.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        let (available, reason) = inner.sampler.available();
        if !available {
            inner.running.store(false, Ordering::SeqCst);
            return Err(EngineError::NotAvailable(reason));
        }

        let locked = inner.config.store.locked_collection.clone();
        let mut subscription = match inner.collaborators.store.subscribe(&locked).await {
            Ok(sub) => sub,
            Err(e) => {
                inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        *lock(&inner.runtime) = Some(Handle::current());
        inner
            .collaborators
            .indicator
            .start(&inner.config.status_notice);

        let listener = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                while let Some(snapshot) = subscription.next().await {
                    let size = inner.cache.rebuild(&snapshot);
                    log::debug!("engine: policy now restricts {size} targets");
                }
                log::debug!("engine: policy subscription closed");
            })
        };

        let sampler = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let period = inner.config.sampler.poll_interval();
                let mut timer = interval_at(Instant::now() + period, period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    timer.tick().await;
                    if !inner.running.load(Ordering::SeqCst) {
                        break;
                    }
                    inner.sample_tick();
                }
            })
        };

        let signal = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let period = inner.config.signal.poll_interval();
                let mut timer = interval_at(Instant::now() + period, period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    timer.tick().await;
                    if !inner.running.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = inner.signal.poll().await {
                        log::warn!("engine: signal poll failed: {e}");
                    }
                }
            })
        };

        lock(&inner.tasks).extend([listener, sampler, signal]);
        log::info!(
            "engine: started (store {}, watching {locked})",
            inner.collaborators.store.name()
        );
        Ok(())
    }

    /// Stop both periodic tasks, detach the subscription and abandon any
    /// session in progress. Outstanding removals are allowed to finish.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let tasks: Vec<JoinHandle<()>> = lock(&inner.tasks).drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            // Cancelled tasks drop their state, the subscription included.
            let _ = task.await;
        }

        let abandoned = lock(&inner.gate).cancel();
        if let Some(session) = abandoned {
            log::debug!("engine: abandoning session for {}", session.target_id);
            inner.collaborators.surface.dismiss();
        }

        inner.collaborators.indicator.stop();
        self.flush_removals().await;
        log::info!("engine: stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run one sampler tick now. Returns the target a new session was opened
    /// for, if any.
    pub fn sample_now(&self) -> Result<Option<String>> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        Ok(self.inner.sample_tick())
    }

    /// Run one signal channel poll now.
    pub async fn poll_signal_now(&self) -> Result<SignalOutcome> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        Ok(self.inner.signal.poll().await?)
    }

    pub fn press_digit(&self, digit: char) -> Result<()> {
        let mut gate = lock(&self.inner.gate);
        let entered = gate.push_digit(digit)?;
        self.inner.collaborators.surface.update_entry(&entered);
        Ok(())
    }

    pub fn backspace(&self) -> Result<()> {
        let mut gate = lock(&self.inner.gate);
        let entered = gate.backspace()?;
        self.inner.collaborators.surface.update_entry(&entered);
        Ok(())
    }

    pub fn confirm(&self) -> Result<Verdict> {
        let inner = &self.inner;
        let surface = &inner.collaborators.surface;
        let verdict = {
            let mut gate = lock(&inner.gate);
            let verdict = gate.confirm()?;
            surface.update_entry("");
            match &verdict {
                Verdict::Granted { target_id, .. } => {
                    // Forget before the gate lock drops so no tick can see
                    // the target still restricted while the gate is Idle.
                    inner.cache.forget(target_id);
                    surface.dismiss();
                }
                Verdict::Denied { target_id, .. } => surface.notify_mismatch(target_id),
            }
            verdict
        };

        match &verdict {
            Verdict::Granted {
                target_id,
                session_id,
            } => {
                log::info!("engine: access granted to {target_id}");
                inner.emit(GateEventKind::Granted, target_id, session_id);
                inner.spawn_removals(target_id, session_id);
            }
            Verdict::Denied {
                target_id,
                session_id,
                failed_attempts,
            } => {
                log::info!("engine: wrong passcode for {target_id} (attempt {failed_attempts})");
                inner.emit(GateEventKind::Denied, target_id, session_id);
            }
        }
        Ok(verdict)
    }

    /// Back out of the gate. The restriction stays in force.
    pub fn cancel(&self) -> Option<String> {
        let session = lock(&self.inner.gate).cancel()?;
        self.inner.collaborators.surface.dismiss();
        log::info!("engine: gate for {} cancelled", session.target_id);
        self.inner
            .emit(GateEventKind::Cancelled, &session.target_id, &session.session_id);
        Some(session.target_id)
    }

    /// Wait for every removal fired so far.
    pub async fn flush_removals(&self) {
        let pending: Vec<JoinHandle<()>> = lock(&self.inner.removals).drain(..).collect();
        for handle in pending {
            if let Err(e) = handle.await {
                log::warn!("engine: removal task ended abnormally: {e}");
            }
        }
    }

    pub fn policy(&self) -> Policy {
        self.inner.cache.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn status(&self) -> EngineStatus {
        let gate = lock(&self.inner.gate);
        EngineStatus {
            running: self.is_running(),
            policy_size: self.inner.cache.len(),
            gate_phase: gate.phase(),
            active_target: gate.active_target().map(str::to_string),
        }
    }

    pub fn config(&self) -> &PinlockConfig {
        &self.inner.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
    }
}

impl EngineInner {
    fn sample_tick(&self) -> Option<String> {
        let current = self.sampler.sample()?;

        let session_id = {
            let mut gate = lock(&self.gate);
            // The policy is read under the gate lock; a grant forgets its
            // target while holding the same lock.
            let policy = self.cache.snapshot();
            let expected = policy.get(&current)?;
            let session_id = gate.begin(&current, expected)?.session_id.clone();
            self.collaborators.surface.present(&current);
            session_id
        };

        log::info!("engine: {current} is restricted, prompting for passcode");
        self.emit(GateEventKind::Prompted, &current, &session_id);
        Some(current)
    }

    fn spawn_removals(&self, target_id: &str, session_id: &str) {
        let Some(runtime) = lock(&self.runtime).clone() else {
            log::warn!("engine: no runtime to remove {target_id}; policy left in place");
            return;
        };

        let collections = [
            self.config.store.locked_collection.clone(),
            self.config.store.staging_collection.clone(),
        ];
        let mut removals = lock(&self.removals);
        removals.retain(|handle| !handle.is_finished());

        for collection in collections {
            let store = Arc::clone(&self.collaborators.store);
            let events_tx = self.events_tx.clone();
            let target_id = target_id.to_string();
            let session_id = session_id.to_string();

            removals.push(runtime.spawn(async move {
                match store
                    .remove_matching(&collection, TARGET_FIELD, &target_id)
                    .await
                {
                    Ok(count) => {
                        log::debug!("engine: removed {count} record(s) for {target_id} from {collection}");
                    }
                    Err(e) => {
                        log::warn!("engine: failed to remove {target_id} from {collection}: {e}");
                        let _ = events_tx.send(GateEvent {
                            kind: GateEventKind::RemovalFailed,
                            target_id,
                            session_id,
                            timestamp: Utc::now(),
                        });
                    }
                }
            }));
        }
    }

    fn emit(&self, kind: GateEventKind, target_id: &str, session_id: &str) {
        // No receivers is fine.
        let _ = self.events_tx.send(GateEvent {
            kind,
            target_id: target_id.to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        });
    }
}
