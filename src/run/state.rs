//! Run lifecycle state machine with crash-safe persistence.
//!
//! Phases advance IDLE → SETUP → RUNNING → ANALYZING → LEARNING → IDLE, with
//! an error edge from any non-IDLE phase back to IDLE. Every transition is
//! persisted atomically before it is considered committed. A [`PhaseGuard`]
//! pairs any entry into a non-IDLE phase with a guaranteed restore to IDLE
//! on every exit path; callers disarm it on clean completion.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::schema::ModelSlot;
use crate::errors::{StateError, StoreError};
use crate::run::episode::{now_timestamp, Episode};
use crate::run::store::RunStore;

/// Run lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Setup,
    Running,
    Analyzing,
    Learning,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Setup => "setup",
            Phase::Running => "running",
            Phase::Analyzing => "analyzing",
            Phase::Learning => "learning",
        };
        f.write_str(s)
    }
}

impl Phase {
    /// Legal transition table. Any non-IDLE phase may drop back to IDLE
    /// (the error edge, and the skip edge for optional post-processing).
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Idle, Setup) => true,
            (Setup, Running) => true,
            (Running, Analyzing) => true,
            (Analyzing, Learning) => true,
            (from, Idle) => from != Idle,
            _ => false,
        }
    }
}

/// A named execution of one solver against one benchmark.
///
/// Mutable only while in RUNNING/ANALYZING; read-only once the phase returns
/// to IDLE after completion. Episodes are persisted separately in an
/// append-only log and re-attached on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub benchmark: String,
    pub solver: String,
    pub model_config: Vec<ModelSlot>,
    pub phase: Phase,
    #[serde(skip)]
    pub episodes: Vec<Episode>,
    pub n_total: usize,
    pub n_passed: usize,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Keep run ids filesystem-safe.
fn sanitize_id_part(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

impl Run {
    pub fn new(benchmark: &str, solver: &str, model_config: Vec<ModelSlot>) -> Self {
        // Microsecond fraction keeps ids distinct for back-to-back runs.
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%6f");
        let id = format!(
            "{}_{}_{}",
            stamp,
            sanitize_id_part(benchmark),
            sanitize_id_part(solver)
        );
        Self {
            id,
            benchmark: benchmark.to_string(),
            solver: solver.to_string(),
            model_config,
            phase: Phase::Idle,
            episodes: Vec::new(),
            n_total: 0,
            n_passed: 0,
            started_at: now_timestamp(),
            completed_at: None,
        }
    }
}

/// Governs one run's phase transitions and persists after every mutation.
pub struct RunStateMachine {
    run: Run,
    store: RunStore,
}

impl RunStateMachine {
    pub fn new(run: Run, store: RunStore) -> Self {
        Self { run, store }
    }

    pub fn phase(&self) -> Phase {
        self.run.phase
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    /// Advance to `next`, persisting atomically. An illegal edge is a typed
    /// error; a persistence failure is fatal to the run.
    pub fn transition(&mut self, next: Phase) -> anyhow::Result<()> {
        let from = self.run.phase;
        if !from.can_transition_to(next) {
            return Err(StateError::IllegalTransition { from, to: next }.into());
        }
        self.run.phase = next;
        if next == Phase::Idle && self.run.completed_at.is_none() {
            self.run.completed_at = Some(now_timestamp());
        }
        self.store.save_state(&self.run)?;
        Ok(())
    }

    /// Error edge: force the phase back to IDLE from wherever we are.
    /// Persistence here is best-effort; already-written episodes stay intact.
    pub fn force_idle(&mut self) {
        if self.run.phase == Phase::Idle {
            return;
        }
        warn!(
            "run {} forced from {} back to idle",
            self.run.id, self.run.phase
        );
        self.run.phase = Phase::Idle;
        if self.run.completed_at.is_none() {
            self.run.completed_at = Some(now_timestamp());
        }
        if let Err(e) = self.store.save_state(&self.run) {
            error!("failed to persist forced idle for {}: {}", self.run.id, e);
        }
    }

    /// Append one completed episode to the durable log and update counters.
    /// Only legal while RUNNING.
    pub fn append_episode(&mut self, episode: Episode) -> Result<(), StoreError> {
        debug_assert_eq!(self.run.phase, Phase::Running);
        self.store.append_episode(&self.run.id, &episode)?;
        self.run.n_total += 1;
        if episode.outcome.passed {
            self.run.n_passed += 1;
        }
        self.run.episodes.push(episode);
        self.store.save_state(&self.run)?;
        Ok(())
    }
}

/// Drop guard that restores IDLE on any exit path. Disarmed on clean
/// completion so the normal transition sequence is the one persisted.
pub struct PhaseGuard {
    sm: Arc<Mutex<RunStateMachine>>,
    armed: bool,
}

impl PhaseGuard {
    pub fn arm(sm: Arc<Mutex<RunStateMachine>>) -> Self {
        Self { sm, armed: true }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.sm.lock() {
            Ok(mut sm) => sm.force_idle(),
            Err(poisoned) => poisoned.into_inner().force_idle(),
        }
    }
}
