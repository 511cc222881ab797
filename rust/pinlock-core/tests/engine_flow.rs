use pinlock_core::config::StatusNotice;
use pinlock_core::remote::RemovalCall;
use pinlock_core::{
    Collaborators, Engine, EngineError, FocusProvider, GateEvent, GateEventKind, GatePhase,
    LauncherControl, LockSurface, MemoryStore, PinlockConfig, RemoteStore, SignalOutcome,
    StatusIndicator, StubFocusProvider, UsageRecord, Verdict,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::sync::broadcast;

// =============================================================================
// Recording collaborators
// =============================================================================

/// Usage history with a single, settable foreground target.
#[derive(Default)]
struct ScriptedFocus {
    current: Mutex<Option<String>>,
}

impl ScriptedFocus {
    fn focus(&self, target: &str) {
        *self.current.lock().unwrap() = Some(target.to_string());
    }
}

impl FocusProvider for ScriptedFocus {
    fn recent_usage(&self, _window: Duration) -> Vec<UsageRecord> {
        let now = SystemTime::now();
        let mut records = vec![UsageRecord::new(
            "com.android.launcher",
            now - Duration::from_secs(60),
        )];
        if let Some(target) = self.current.lock().unwrap().clone() {
            records.push(UsageRecord::new(target, now));
        }
        records
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SurfaceCall {
    Present(String),
    Entry(String),
    Mismatch(String),
    Dismiss,
}

#[derive(Default)]
struct RecordingSurface {
    calls: Mutex<Vec<SurfaceCall>>,
}

impl RecordingSurface {
    fn calls(&self) -> Vec<SurfaceCall> {
        self.calls.lock().unwrap().clone()
    }

    fn presented(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, SurfaceCall::Present(_)))
            .count()
    }
}

impl LockSurface for RecordingSurface {
    fn present(&self, target_id: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(SurfaceCall::Present(target_id.to_string()));
    }

    fn update_entry(&self, entered: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(SurfaceCall::Entry(entered.to_string()));
    }

    fn notify_mismatch(&self, target_id: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(SurfaceCall::Mismatch(target_id.to_string()));
    }

    fn dismiss(&self) {
        self.calls.lock().unwrap().push(SurfaceCall::Dismiss);
    }
}

#[derive(Default)]
struct RecordingLauncher {
    calls: Mutex<Vec<(String, bool)>>,
}

impl LauncherControl for RecordingLauncher {
    fn set_launcher_visible(&self, component: &str, visible: bool) {
        self.calls
            .lock()
            .unwrap()
            .push((component.to_string(), visible));
    }
}

#[derive(Default)]
struct RecordingIndicator {
    started: Mutex<Vec<String>>,
    stopped: Mutex<usize>,
}

impl StatusIndicator for RecordingIndicator {
    fn start(&self, notice: &StatusNotice) {
        self.started.lock().unwrap().push(notice.title.clone());
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap() += 1;
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    _tmp: TempDir,
    store: Arc<MemoryStore>,
    focus: Arc<ScriptedFocus>,
    surface: Arc<RecordingSurface>,
    launcher: Arc<RecordingLauncher>,
    indicator: Arc<RecordingIndicator>,
    engine: Engine,
}

/// Config whose periodic tasks never fire during a test; ticks are driven by
/// hand through `sample_now` and `poll_signal_now`.
fn quiet_config(tmp: &TempDir) -> PinlockConfig {
    let mut config = PinlockConfig::default_with_dir(tmp.path());
    config.sampler.poll_interval_ms = 3_600_000;
    config.signal.poll_interval_ms = 3_600_000;
    config
}

fn policy_tree() -> Value {
    json!({
        "childApp": {
            "Game": {"package_name": "com.x.game", "icon": "iVBORw==",
                     "interval": "30", "pin_code": "7412"},
            "Chat": {"package_name": "com.y.chat", "icon": "iVBORw==",
                     "interval": "10", "pin_code": "0000"}
        },
        "Apps": {
            "k1": {"package_name": "com.x.game", "name": "Game", "icon": "iVBORw==",
                   "interval": "30", "pin_code": "7412"},
            "k2": {"package_name": "com.y.chat", "name": "Chat", "icon": "iVBORw==",
                   "interval": "10", "pin_code": "0000"},
            "type": "old data"
        }
    })
}

fn harness_with(tree: Value, configure: impl FnOnce(&mut PinlockConfig)) -> Harness {
    let tmp = TempDir::new().unwrap();
    let mut config = quiet_config(&tmp);
    configure(&mut config);

    let store = Arc::new(MemoryStore::with_tree(tree));
    let focus = Arc::new(ScriptedFocus::default());
    let surface = Arc::new(RecordingSurface::default());
    let launcher = Arc::new(RecordingLauncher::default());
    let indicator = Arc::new(RecordingIndicator::default());

    let engine = Engine::new(
        config,
        Collaborators {
            store: store.clone(),
            focus: focus.clone(),
            surface: surface.clone(),
            launcher: launcher.clone(),
            indicator: indicator.clone(),
        },
    )
    .unwrap();

    Harness {
        _tmp: tmp,
        store,
        focus,
        surface,
        launcher,
        indicator,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(policy_tree(), |_| {})
}

/// Wait until the listener has folded the store's snapshot into the cache.
async fn wait_for_policy(engine: &Engine, size: usize) {
    for _ in 0..200 {
        if engine.policy().len() == size {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "policy never reached {size} entries (have {})",
        engine.policy().len()
    );
}

fn drain(rx: &mut broadcast::Receiver<GateEvent>) -> Vec<GateEventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

fn type_passcode(engine: &Engine, digits: &str) {
    for d in digits.chars() {
        engine.press_digit(d).unwrap();
    }
}

fn removal(path: &str, value: &str) -> RemovalCall {
    RemovalCall {
        path: path.to_string(),
        field: "package_name".to_string(),
        value: value.to_string(),
    }
}

// =============================================================================
// Gate flow
// =============================================================================

#[tokio::test]
async fn test_grant_removes_restriction_everywhere() {
    let h = harness();
    let mut events = h.engine.subscribe();
    h.engine.start().await.unwrap();
    wait_for_policy(&h.engine, 2).await;

    h.focus.focus("com.x.game");
    assert_eq!(h.engine.sample_now().unwrap().as_deref(), Some("com.x.game"));
    assert_eq!(h.engine.status().gate_phase, GatePhase::Prompting);
    assert_eq!(h.surface.presented(), 1);

    type_passcode(&h.engine, "7412");
    match h.engine.confirm().unwrap() {
        Verdict::Granted { target_id, .. } => assert_eq!(target_id, "com.x.game"),
        other => panic!("expected grant, got {other:?}"),
    }
    assert_eq!(h.engine.status().gate_phase, GatePhase::Idle);
    assert!(!h.engine.policy().contains_key("com.x.game"));
    assert_eq!(h.surface.calls().last(), Some(&SurfaceCall::Dismiss));

    h.engine.flush_removals().await;
    let mut calls = h.store.removal_calls();
    calls.sort_by(|a, b| a.path.cmp(&b.path));
    assert_eq!(
        calls,
        vec![removal("Apps", "com.x.game"), removal("childApp", "com.x.game")]
    );

    let active = h.store.snapshot("childApp");
    assert!(!active.children.contains_key("Game"));
    assert!(active.children.contains_key("Chat"));
    let staging = h.store.snapshot("Apps");
    assert!(!staging.children.contains_key("k1"));
    assert_eq!(staging.children.get("type"), Some(&json!("old data")));

    // Still in the foreground, but no longer restricted.
    assert_eq!(h.engine.sample_now().unwrap(), None);
    assert_eq!(h.surface.presented(), 1);

    assert_eq!(
        drain(&mut events),
        vec![GateEventKind::Prompted, GateEventKind::Granted]
    );
    h.engine.stop().await.unwrap();
}

/// Surface that, on dismissal, starts a sampler tick on another thread while
/// the grant is still in progress.
#[derive(Default)]
struct RacingSurface {
    engine: OnceLock<Arc<Engine>>,
    armed: AtomicBool,
    presented: Mutex<usize>,
    racer: Mutex<Option<thread::JoinHandle<Option<String>>>>,
}

impl LockSurface for RacingSurface {
    fn present(&self, _target_id: &str) {
        *self.presented.lock().unwrap() += 1;
    }

    fn update_entry(&self, _entered: &str) {}

    fn notify_mismatch(&self, _target_id: &str) {}

    fn dismiss(&self) {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(engine) = self.engine.get().cloned() else {
            return;
        };
        let racer = thread::spawn(move || engine.sample_now().unwrap());
        // Give the tick time to reach the engine before the grant finishes.
        thread::sleep(Duration::from_millis(50));
        *self.racer.lock().unwrap() = Some(racer);
    }
}

#[tokio::test]
async fn test_tick_during_grant_does_not_reprompt() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::with_tree(policy_tree()));
    let focus = Arc::new(ScriptedFocus::default());
    let surface = Arc::new(RacingSurface::default());

    let engine = Arc::new(
        Engine::new(
            quiet_config(&tmp),
            Collaborators {
                store: store.clone(),
                focus: focus.clone(),
                surface: surface.clone(),
                launcher: Arc::new(RecordingLauncher::default()),
                indicator: Arc::new(RecordingIndicator::default()),
            },
        )
        .unwrap(),
    );
    assert!(surface.engine.set(Arc::clone(&engine)).is_ok());

    engine.start().await.unwrap();
    wait_for_policy(&engine, 2).await;

    focus.focus("com.x.game");
    assert_eq!(engine.sample_now().unwrap().as_deref(), Some("com.x.game"));
    type_passcode(&engine, "7412");

    surface.armed.store(true, Ordering::SeqCst);
    assert!(matches!(engine.confirm().unwrap(), Verdict::Granted { .. }));

    let racer = surface.racer.lock().unwrap().take().unwrap();
    assert_eq!(racer.join().unwrap(), None);
    assert_eq!(engine.status().gate_phase, GatePhase::Idle);
    assert_eq!(*surface.presented.lock().unwrap(), 1);

    engine.flush_removals().await;
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_single_prompt_while_session_active() {
    let h = harness();
    h.engine.start().await.unwrap();
    wait_for_policy(&h.engine, 2).await;

    h.focus.focus("com.x.game");
    assert!(h.engine.sample_now().unwrap().is_some());
    assert_eq!(h.engine.sample_now().unwrap(), None);

    // Another restricted target coming forward is ignored, not queued.
    h.focus.focus("com.y.chat");
    assert_eq!(h.engine.sample_now().unwrap(), None);
    assert_eq!(h.surface.presented(), 1);
    assert_eq!(
        h.engine.status().active_target.as_deref(),
        Some("com.x.game")
    );
    h.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_wrong_passcode_retries() {
    let h = harness();
    let mut events = h.engine.subscribe();
    h.engine.start().await.unwrap();
    wait_for_policy(&h.engine, 2).await;

    h.focus.focus("com.x.game");
    h.engine.sample_now().unwrap();

    type_passcode(&h.engine, "741");
    assert!(matches!(
        h.engine.confirm().unwrap(),
        Verdict::Denied {
            failed_attempts: 1,
            ..
        }
    ));
    assert_eq!(h.engine.status().gate_phase, GatePhase::Prompting);
    assert!(h
        .surface
        .calls()
        .contains(&SurfaceCall::Mismatch("com.x.game".to_string())));
    assert!(h.engine.policy().contains_key("com.x.game"));

    type_passcode(&h.engine, "7412");
    assert!(matches!(
        h.engine.confirm().unwrap(),
        Verdict::Granted { .. }
    ));
    h.engine.flush_removals().await;

    assert_eq!(
        drain(&mut events),
        vec![
            GateEventKind::Prompted,
            GateEventKind::Denied,
            GateEventKind::Granted
        ]
    );
    h.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_entry_mirrors_digits_and_backspace() {
    let h = harness();
    h.engine.start().await.unwrap();
    wait_for_policy(&h.engine, 2).await;

    h.focus.focus("com.y.chat");
    h.engine.sample_now().unwrap();
    h.engine.press_digit('1').unwrap();
    h.engine.press_digit('2').unwrap();
    h.engine.backspace().unwrap();
    assert!(matches!(
        h.engine.press_digit('x'),
        Err(EngineError::Gate(_))
    ));

    let entries: Vec<SurfaceCall> = h
        .surface
        .calls()
        .into_iter()
        .filter(|c| matches!(c, SurfaceCall::Entry(_)))
        .collect();
    assert_eq!(
        entries,
        vec![
            SurfaceCall::Entry("1".to_string()),
            SurfaceCall::Entry("12".to_string()),
            SurfaceCall::Entry("1".to_string()),
        ]
    );
    h.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancel_keeps_restriction() {
    let h = harness();
    let mut events = h.engine.subscribe();
    h.engine.start().await.unwrap();
    wait_for_policy(&h.engine, 2).await;

    h.focus.focus("com.x.game");
    h.engine.sample_now().unwrap();
    type_passcode(&h.engine, "74");

    assert_eq!(h.engine.cancel().as_deref(), Some("com.x.game"));
    assert_eq!(h.engine.cancel(), None);
    assert_eq!(h.engine.status().gate_phase, GatePhase::Idle);
    assert!(h.store.removal_calls().is_empty());
    assert!(h.engine.policy().contains_key("com.x.game"));

    // Back in the foreground on the next tick: prompted again.
    assert_eq!(h.engine.sample_now().unwrap().as_deref(), Some("com.x.game"));
    assert_eq!(h.surface.presented(), 2);

    assert_eq!(
        drain(&mut events),
        vec![
            GateEventKind::Prompted,
            GateEventKind::Cancelled,
            GateEventKind::Prompted
        ]
    );
    h.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_input_without_session_is_rejected() {
    let h = harness();
    h.engine.start().await.unwrap();
    assert!(matches!(
        h.engine.press_digit('1'),
        Err(EngineError::Gate(_))
    ));
    assert!(matches!(h.engine.confirm(), Err(EngineError::Gate(_))));
    h.engine.stop().await.unwrap();
}

// =============================================================================
// Removals
// =============================================================================

#[tokio::test]
async fn test_removal_failure_does_not_block_the_other() {
    let h = harness();
    let mut events = h.engine.subscribe();
    h.store.fail_removals_on("childApp");
    h.engine.start().await.unwrap();
    wait_for_policy(&h.engine, 2).await;

    h.focus.focus("com.x.game");
    h.engine.sample_now().unwrap();
    type_passcode(&h.engine, "7412");
    h.engine.confirm().unwrap();
    h.engine.flush_removals().await;

    assert_eq!(h.store.removal_calls().len(), 2);
    assert!(h.store.snapshot("childApp").children.contains_key("Game"));
    assert!(!h.store.snapshot("Apps").children.contains_key("k1"));
    assert_eq!(h.engine.status().gate_phase, GatePhase::Idle);

    let kinds = drain(&mut events);
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == GateEventKind::RemovalFailed)
            .count(),
        1
    );
    h.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_removal_with_no_matching_records() {
    let tree = json!({
        "childApp": {
            "Game": {"package_name": "com.x.game", "pin_code": "7412"}
        }
    });
    let h = harness_with(tree, |_| {});
    h.engine.start().await.unwrap();
    wait_for_policy(&h.engine, 1).await;

    h.focus.focus("com.x.game");
    h.engine.sample_now().unwrap();
    type_passcode(&h.engine, "7412");
    h.engine.confirm().unwrap();
    h.engine.flush_removals().await;

    assert_eq!(h.store.removal_calls().len(), 2);
    assert!(h.store.snapshot("childApp").is_empty());
    h.engine.stop().await.unwrap();
}

// =============================================================================
// Policy sync
// =============================================================================

#[tokio::test]
async fn test_cache_follows_remote_changes() {
    let h = harness();
    h.engine.start().await.unwrap();
    wait_for_policy(&h.engine, 2).await;

    h.store
        .write_value(
            "childApp/Video",
            json!({"package_name": "com.z.video", "pin_code": "1111"}),
        )
        .await
        .unwrap();
    wait_for_policy(&h.engine, 3).await;
    assert_eq!(
        h.engine.policy().get("com.z.video").map(String::as_str),
        Some("1111")
    );

    h.store
        .write_value("childApp/Game", Value::Null)
        .await
        .unwrap();
    wait_for_policy(&h.engine, 2).await;

    h.focus.focus("com.x.game");
    assert_eq!(h.engine.sample_now().unwrap(), None);
    h.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_offline_store_keeps_last_policy() {
    let h = harness();
    h.engine.start().await.unwrap();
    wait_for_policy(&h.engine, 2).await;

    h.store.set_offline(true);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.engine.policy().len(), 2);

    h.focus.focus("com.y.chat");
    assert_eq!(h.engine.sample_now().unwrap().as_deref(), Some("com.y.chat"));
    h.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_empty_policy_never_prompts() {
    let h = harness_with(json!({}), |_| {});
    h.engine.start().await.unwrap();

    h.focus.focus("com.x.game");
    assert_eq!(h.engine.sample_now().unwrap(), None);
    assert_eq!(h.surface.presented(), 0);
    h.engine.stop().await.unwrap();
}

// =============================================================================
// Signal channel
// =============================================================================

#[tokio::test]
async fn test_signal_shows_launcher_once() {
    let h = harness();
    h.engine.start().await.unwrap();

    assert_eq!(h.engine.poll_signal_now().await.unwrap(), SignalOutcome::Idle);

    h.store
        .write_value("Apps/type", json!("new data"))
        .await
        .unwrap();
    assert_eq!(
        h.engine.poll_signal_now().await.unwrap(),
        SignalOutcome::Consumed
    );
    assert_eq!(
        h.store.read_value("Apps/type").await.unwrap(),
        Some(json!("old data"))
    );
    assert_eq!(h.engine.poll_signal_now().await.unwrap(), SignalOutcome::Idle);

    let calls = h.launcher.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![("com.app.lockcomposeChild.MainActivity".to_string(), true)]
    );
    h.engine.stop().await.unwrap();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_start_requires_usage_history() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::new(
        quiet_config(&tmp),
        Collaborators {
            store: Arc::new(MemoryStore::new()),
            focus: Arc::new(StubFocusProvider),
            surface: Arc::new(RecordingSurface::default()),
            launcher: Arc::new(RecordingLauncher::default()),
            indicator: Arc::new(RecordingIndicator::default()),
        },
    )
    .unwrap();

    assert!(matches!(
        engine.start().await,
        Err(EngineError::NotAvailable(_))
    ));
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_start_twice_and_stop_twice() {
    let h = harness();
    h.engine.start().await.unwrap();
    assert!(matches!(
        h.engine.start().await,
        Err(EngineError::AlreadyRunning)
    ));

    h.engine.stop().await.unwrap();
    h.engine.stop().await.unwrap();
    assert!(!h.engine.is_running());
    assert!(matches!(h.engine.sample_now(), Err(EngineError::NotRunning)));
    assert!(matches!(
        h.engine.poll_signal_now().await,
        Err(EngineError::NotRunning)
    ));
}

#[tokio::test]
async fn test_stop_detaches_and_abandons_session() {
    let h = harness();
    h.engine.start().await.unwrap();
    wait_for_policy(&h.engine, 2).await;
    assert_eq!(h.store.subscriber_count(), 1);
    assert_eq!(
        *h.indicator.started.lock().unwrap(),
        vec!["App Lock Service".to_string()]
    );

    h.focus.focus("com.x.game");
    h.engine.sample_now().unwrap();
    h.engine.stop().await.unwrap();

    assert_eq!(h.store.subscriber_count(), 0);
    assert_eq!(*h.indicator.stopped.lock().unwrap(), 1);
    assert_eq!(h.engine.status().gate_phase, GatePhase::Idle);
    assert_eq!(h.surface.calls().last(), Some(&SurfaceCall::Dismiss));
    assert!(h.store.removal_calls().is_empty());

    // Restartable.
    h.engine.start().await.unwrap();
    assert_eq!(h.engine.sample_now().unwrap().as_deref(), Some("com.x.game"));
    h.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut config = quiet_config(&tmp);
    config.sampler.poll_interval_ms = 0;

    let result = Engine::new(
        config,
        Collaborators {
            store: Arc::new(MemoryStore::new()),
            focus: Arc::new(ScriptedFocus::default()),
            surface: Arc::new(RecordingSurface::default()),
            launcher: Arc::new(RecordingLauncher::default()),
            indicator: Arc::new(RecordingIndicator::default()),
        },
    );
    assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_periodic_sampler_prompts() {
    let h = harness_with(policy_tree(), |config| {
        config.sampler.poll_interval_ms = 20;
    });
    let mut events = h.engine.subscribe();
    h.engine.start().await.unwrap();
    wait_for_policy(&h.engine, 2).await;
    h.focus.focus("com.y.chat");

    for _ in 0..200 {
        if h.engine.status().gate_phase == GatePhase::Prompting {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        h.engine.status().active_target.as_deref(),
        Some("com.y.chat")
    );

    // Further ticks while prompting never present again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.surface.presented(), 1);
    assert_eq!(drain(&mut events), vec![GateEventKind::Prompted]);
    h.engine.stop().await.unwrap();
}
