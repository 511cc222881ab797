//! Foreground gate state machine.
//!
//! One session at most. A session starts when the sampler reports a restricted
//! target in focus, collects digits, and on confirm is verified against the
//! expected passcode:
//!
//! ```text
//! Idle ──match──▶ Prompting ──confirm──▶ Verifying ──equal──▶ Granted ──▶ Idle
//!                    ▲                       │
//!                    └──────── Denied ◀──────┘ (digits cleared, retry)
//! ```
//!
//! `cancel` collapses any state back to Idle without touching the policy.
//! The machine is synchronous and side-effect free; the engine performs the
//! surface updates and remote removals a verdict calls for.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("gate: no active session")]
    NoSession,

    #[error("gate: session for {0} is not awaiting input")]
    NotPrompting(String),

    #[error("gate: '{0}' is not a digit")]
    InvalidDigit(char),
}

pub type Result<T> = std::result::Result<T, GateError>;

/// A single prompt-and-verify flow guarding one target.
#[derive(Clone)]
pub struct GateSession {
    pub session_id: String,
    pub target_id: String,
    expected_passcode: String,
    entered: Vec<char>,
    pub started_at: DateTime<Utc>,
    pub failed_attempts: u32,
}

impl GateSession {
    pub fn new(target_id: impl Into<String>, expected_passcode: impl Into<String>) -> Self {
        Self {
            session_id: generate_session_id(),
            target_id: target_id.into(),
            expected_passcode: expected_passcode.into(),
            entered: Vec::new(),
            started_at: Utc::now(),
            failed_attempts: 0,
        }
    }

    pub fn entered(&self) -> String {
        self.entered.iter().collect()
    }

    pub fn entered_len(&self) -> usize {
        self.entered.len()
    }

    fn matches(&self) -> bool {
        self.entered() == self.expected_passcode
    }
}

impl std::fmt::Debug for GateSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateSession")
            .field("session_id", &self.session_id)
            .field("target_id", &self.target_id)
            .field("entered_len", &self.entered.len())
            .field("failed_attempts", &self.failed_attempts)
            .finish()
    }
}

fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 8] = rng.random();
    hex::encode(bytes)
}

#[derive(Debug, Clone)]
pub enum GateState {
    Idle,
    Prompting(GateSession),
    Verifying(GateSession),
    Granted(GateSession),
    Denied(GateSession),
}

/// State name without the session payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePhase {
    Idle,
    Prompting,
    Verifying,
    Granted,
    Denied,
}

impl GateState {
    pub fn phase(&self) -> GatePhase {
        match self {
            GateState::Idle => GatePhase::Idle,
            GateState::Prompting(_) => GatePhase::Prompting,
            GateState::Verifying(_) => GatePhase::Verifying,
            GateState::Granted(_) => GatePhase::Granted,
            GateState::Denied(_) => GatePhase::Denied,
        }
    }

    pub fn session(&self) -> Option<&GateSession> {
        match self {
            GateState::Idle => None,
            GateState::Prompting(s)
            | GateState::Verifying(s)
            | GateState::Granted(s)
            | GateState::Denied(s) => Some(s),
        }
    }
}

/// Outcome of a confirm action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Passcode matched; the session is closed and the gate is Idle again.
    Granted { target_id: String, session_id: String },
    /// Mismatch; digits were cleared and the session is prompting again.
    Denied {
        target_id: String,
        session_id: String,
        failed_attempts: u32,
    },
}

#[derive(Debug)]
pub struct Gate {
    state: GateState,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            state: GateState::Idle,
        }
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn phase(&self) -> GatePhase {
        self.state.phase()
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, GateState::Idle)
    }

    pub fn active_target(&self) -> Option<&str> {
        self.state.session().map(|s| s.target_id.as_str())
    }

    /// Idle → Prompting. Returns the new session, or `None` when a session is
    /// already active (the match is ignored, not queued).
    pub fn begin(
        &mut self,
        target_id: &str,
        expected_passcode: &str,
    ) -> Option<&GateSession> {
        if self.is_active() {
            return None;
        }
        self.state = GateState::Prompting(GateSession::new(target_id, expected_passcode));
        self.state.session()
    }

    /// Append a digit while prompting. Returns the entry so far.
    pub fn push_digit(&mut self, digit: char) -> Result<String> {
        if !digit.is_ascii_digit() {
            return Err(GateError::InvalidDigit(digit));
        }
        let session = self.prompting_mut()?;
        session.entered.push(digit);
        Ok(session.entered())
    }

    /// Remove the last digit, if any. Returns the entry so far.
    pub fn backspace(&mut self) -> Result<String> {
        let session = self.prompting_mut()?;
        session.entered.pop();
        Ok(session.entered())
    }

    /// Prompting → Verifying → Granted → Idle, or
    /// Prompting → Verifying → Denied → Prompting.
    pub fn confirm(&mut self) -> Result<Verdict> {
        self.prompting_mut()?;

        self.state = match std::mem::replace(&mut self.state, GateState::Idle) {
            GateState::Prompting(session) => GateState::Verifying(session),
            other => other,
        };

        self.state = match std::mem::replace(&mut self.state, GateState::Idle) {
            GateState::Verifying(session) if session.matches() => GateState::Granted(session),
            GateState::Verifying(session) => GateState::Denied(session),
            other => other,
        };

        match std::mem::replace(&mut self.state, GateState::Idle) {
            GateState::Granted(mut session) => {
                session.entered.clear();
                Ok(Verdict::Granted {
                    target_id: session.target_id,
                    session_id: session.session_id,
                })
            }
            GateState::Denied(mut session) => {
                session.entered.clear();
                session.failed_attempts += 1;
                let verdict = Verdict::Denied {
                    target_id: session.target_id.clone(),
                    session_id: session.session_id.clone(),
                    failed_attempts: session.failed_attempts,
                };
                self.state = GateState::Prompting(session);
                Ok(verdict)
            }
            other => {
                self.state = other;
                Err(GateError::NoSession)
            }
        }
    }

    /// Collapse any state back to Idle. Returns the abandoned session.
    pub fn cancel(&mut self) -> Option<GateSession> {
        match std::mem::replace(&mut self.state, GateState::Idle) {
            GateState::Idle => None,
            GateState::Prompting(s)
            | GateState::Verifying(s)
            | GateState::Granted(s)
            | GateState::Denied(s) => Some(s),
        }
    }

    fn prompting_mut(&mut self) -> Result<&mut GateSession> {
        match &mut self.state {
            GateState::Prompting(session) => Ok(session),
            GateState::Idle => Err(GateError::NoSession),
            other => Err(GateError::NotPrompting(
                other
                    .session()
                    .map(|s| s.target_id.clone())
                    .unwrap_or_default(),
            )),
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
