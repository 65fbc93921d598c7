//! Session domain type
//!
//! One record per worker session. Only the owning session writes it; every
//! other process reads it for status reporting.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sessionstore::Record;

use super::phase::Phase;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    /// Idle longer than the pause threshold
    Paused,
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// How a phase change came about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Forward by one with gates satisfied
    Advance,
    /// Forward over skippable phases
    Skip,
    /// Forced: backward, or forward past failing gates
    Override,
    /// Terminal phase completed
    Complete,
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Advance => write!(f, "advance"),
            Self::Skip => write!(f, "skip"),
            Self::Override => write!(f, "override"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// One entry in a session's phase history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    pub kind: TransitionKind,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Per-session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub commands_run: u64,
    pub transitions: u64,
    pub forced_transitions: u64,
    pub gate_runs: u64,
    pub gate_failures: u64,
}

/// A worker session's persistent context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,

    /// Branch the session is working on
    #[serde(default)]
    pub current_branch: Option<String>,

    pub current_phase: Phase,

    #[serde(default)]
    pub status: SessionStatus,

    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,

    #[serde(default)]
    pub metrics: SessionMetrics,

    /// Gates passed per phase at the time the phase was left
    #[serde(default)]
    pub passed_gates: BTreeMap<Phase, Vec<String>>,

    #[serde(default)]
    pub phase_history: Vec<PhaseChange>,

    /// Set when the terminal phase was completed
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, phase: Phase, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            current_branch: None,
            current_phase: phase,
            status: SessionStatus::Active,
            created_at: now,
            last_active_at: now,
            metrics: SessionMetrics::default(),
            passed_gates: BTreeMap::new(),
            phase_history: Vec::new(),
            completed_at: None,
        }
    }

    /// Record activity by the owning session
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active_at = now;
        self.metrics.commands_run += 1;
        if self.status == SessionStatus::Paused {
            self.status = SessionStatus::Active;
        }
    }

    /// Status as other sessions should display it
    pub fn effective_status(&self, now: DateTime<Utc>, pause_after: chrono::Duration) -> SessionStatus {
        if self.status == SessionStatus::Active && now - self.last_active_at > pause_after {
            SessionStatus::Paused
        } else {
            self.status
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_active_at
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Session ids become file names and branch-name segments
pub fn validate_session_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.len() > 32 {
        return Err(format!("session id '{}' must be 1 to 32 characters", id));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(format!(
            "session id '{}' may only contain letters, digits, '-' and '_'",
            id
        ));
    }
    if id.starts_with('-') || id.starts_with('_') {
        return Err(format!("session id '{}' must start with a letter or digit", id));
    }
    Ok(())
}

impl Record for Session {
    fn id(&self) -> &str {
        &self.session_id
    }

    fn collection_name() -> &'static str {
        "sessions"
    }

    fn validate(&self) -> Result<(), String> {
        validate_session_id(&self.session_id)?;
        if self.last_active_at < self.created_at {
            return Err("last_active_at precedes created_at".to_string());
        }
        if let Some(last) = self.phase_history.last()
            && last.to != self.current_phase
        {
            return Err(format!(
                "phase history ends at {} but current phase is {}",
                last.to, self.current_phase
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{assert_corrupt_on_disk, at, temp_store};
    use proptest::prelude::*;

    #[test]
    fn test_new_session() {
        let now = Utc::now();
        let s = Session::new("t1", Phase::P0, now);
        assert_eq!(s.status, SessionStatus::Active);
        assert!(s.validate().is_ok());
        assert!(!s.is_complete());
    }

    #[test]
    fn test_effective_status_pauses_when_idle() {
        let now = Utc::now();
        let s = Session::new("t1", Phase::P0, now);
        let later = now + chrono::Duration::minutes(61);
        assert_eq!(s.effective_status(now, chrono::Duration::minutes(60)), SessionStatus::Active);
        assert_eq!(s.effective_status(later, chrono::Duration::minutes(60)), SessionStatus::Paused);
    }

    #[test]
    fn test_touch_reactivates() {
        let now = Utc::now();
        let mut s = Session::new("t1", Phase::P0, now);
        s.status = SessionStatus::Paused;
        s.touch(now + chrono::Duration::minutes(5));
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.metrics.commands_run, 1);
    }

    #[test]
    fn test_session_id_rules() {
        assert!(validate_session_id("t1").is_ok());
        assert!(validate_session_id("alice_2").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("-x").is_err());
    }

    #[test]
    fn test_validate_rejects_inconsistent_history() {
        let now = Utc::now();
        let mut s = Session::new("t1", Phase::P2, now);
        s.phase_history.push(PhaseChange {
            from: Phase::P0,
            to: Phase::P1,
            at: now,
            kind: TransitionKind::Advance,
            actor: "t1".to_string(),
            reason: None,
        });
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_passed_gates_serialize_with_phase_keys() {
        let now = Utc::now();
        let mut s = Session::new("t1", Phase::P4, now);
        s.passed_gates.insert(Phase::P3, vec!["score".to_string(), "coverage".to_string()]);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"P3\""));
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    fn session_strategy() -> impl Strategy<Value = Session> {
        (
            "[a-z0-9][a-z0-9_-]{0,15}",
            0u8..8,
            proptest::collection::vec(0u8..8, 0..5),
            0i64..100_000,
            0i64..100_000,
            0u64..1_000,
            proptest::option::of("[a-z0-9]{2,12}"),
        )
            .prop_map(|(id, start, moves, created, idle, commands, branch)| {
                let mut session = Session::new(id, Phase::from_index(start).unwrap(), at(created));
                session.last_active_at = at(created + idle);
                session.metrics.commands_run = commands;
                session.current_branch = branch.map(|b| format!("feature/{}", b));
                for (i, to) in moves.into_iter().enumerate() {
                    let to = Phase::from_index(to).unwrap();
                    session
                        .passed_gates
                        .insert(session.current_phase, vec!["score".to_string()]);
                    session.phase_history.push(PhaseChange {
                        from: session.current_phase,
                        to,
                        at: at(created + i as i64),
                        kind: TransitionKind::Override,
                        actor: "t1".to_string(),
                        reason: Some("rework".to_string()),
                    });
                    session.current_phase = to;
                }
                session
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_session_round_trips_through_store(session in session_strategy()) {
            let (_temp, store) = temp_store();
            let id = session.session_id.clone();
            store.save(&session).unwrap();
            prop_assert_eq!(store.load::<Session>(&id).unwrap(), Some(session));
        }

        #[test]
        fn prop_session_with_diverging_history_is_corrupt(session in session_strategy(), shift in 1u8..8) {
            let mut broken = session.clone();
            broken.phase_history.push(PhaseChange {
                from: session.current_phase,
                to: session.current_phase,
                at: session.last_active_at,
                kind: TransitionKind::Override,
                actor: "t1".to_string(),
                reason: None,
            });
            broken.current_phase = Phase::from_index((session.current_phase.index() + shift) % 8).unwrap();
            prop_assert!(broken.validate().is_err());

            let (_temp, store) = temp_store();
            assert_corrupt_on_disk(&store, &broken, &session);
        }
    }
}
