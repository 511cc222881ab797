pub mod activation;
pub mod config;
pub mod engine;
pub mod gate;
pub mod platform;
pub mod policy;
pub mod remote;
pub mod sampler;
pub mod signal;

// Re-export common types
pub use crate::activation::{activate, activate_staged, staged_apps, ActivationReport, StagedApp};
pub use crate::config::{PinlockConfig, SamplerConfig, SignalConfig, StatusNotice, StoreConfig};
pub use crate::engine::{
    Collaborators, Engine, EngineError, EngineStatus, GateEvent, GateEventKind,
};
pub use crate::gate::{Gate, GateError, GatePhase, GateSession, GateState, Verdict};
pub use crate::platform::{
    FocusProvider, LauncherControl, LockSurface, StatusIndicator, StubFocusProvider, UsageRecord,
};
pub use crate::policy::{ingest, Policy, PolicyCache, PolicyEntry};
pub use crate::remote::{MemoryStore, RemoteStore, RestStore, Snapshot, StoreError, Subscription};
pub use crate::sampler::{select_current, ForegroundSampler};
pub use crate::signal::{SignalChannel, SignalFlag, SignalOutcome};
