//! Poll cycle state machine
//!
//! A driver is `Idle` between cycles, `Polling` while a request is out and
//! the response is awaited, and `Publishing` while a completed reading is
//! pushed to the sinks. Every cycle ends back in `Idle`, whatever happened.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Poll cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PollState {
    /// Waiting for the next tick
    #[default]
    Idle,
    /// Request sent, response outstanding
    Polling,
    /// Reading complete, sinks being updated
    Publishing,
}

impl PollState {
    /// Whether a cycle is in flight
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Polling => write!(f, "polling"),
            Self::Publishing => write!(f, "publishing"),
        }
    }
}

/// Rejected state change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid transition from {from} to {to}")]
pub struct TransitionError {
    /// State at the time of the request
    pub from: PollState,
    /// Requested state
    pub to: PollState,
}

/// Recorded state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: PollState,
    /// New state
    pub to: PollState,
    /// Timestamp
    pub timestamp: DateTime<Local>,
    /// Reason for transition
    pub reason: Option<String>,
}

/// Poll state machine with bounded history
#[derive(Debug)]
pub struct PollStateMachine {
    state: PollState,
    history: VecDeque<StateTransition>,
    max_history: usize,
    last_transition: Option<Instant>,
    state_durations: HashMap<PollState, Duration>,
    cycles_started: u64,
}

impl Default for PollStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PollStateMachine {
    /// Create a new state machine in `Idle`
    pub fn new() -> Self {
        Self::with_history(64)
    }

    /// Create with a custom history bound
    pub fn with_history(max_history: usize) -> Self {
        Self {
            state: PollState::Idle,
            history: VecDeque::new(),
            max_history,
            last_transition: None,
            state_durations: HashMap::new(),
            cycles_started: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> PollState {
        self.state
    }

    /// Get recorded transitions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    /// Number of cycles begun
    pub fn cycles_started(&self) -> u64 {
        self.cycles_started
    }

    /// Time spent in the current state
    pub fn time_in_state(&self) -> Option<Duration> {
        self.last_transition.map(|t| t.elapsed())
    }

    /// Total time spent in a state
    pub fn total_time_in_state(&self, state: PollState) -> Duration {
        self.state_durations.get(&state).copied().unwrap_or_default()
    }

    /// Begin a cycle
    pub fn begin_cycle(&mut self) -> Result<(), TransitionError> {
        self.transition(PollState::Polling, None)
    }

    /// Move a completed reading on to publishing
    pub fn begin_publish(&mut self) -> Result<(), TransitionError> {
        self.transition(PollState::Publishing, None)
    }

    /// End the cycle, for whatever `reason`
    ///
    /// Always succeeds; ending while already idle records nothing.
    pub fn finish(&mut self, reason: Option<&str>) {
        if self.state != PollState::Idle {
            self.apply(PollState::Idle, reason);
        }
    }

    /// Transition to a new state
    pub fn transition(
        &mut self,
        new_state: PollState,
        reason: Option<&str>,
    ) -> Result<(), TransitionError> {
        if !self.is_valid_transition(new_state) {
            return Err(TransitionError {
                from: self.state,
                to: new_state,
            });
        }
        self.apply(new_state, reason);
        Ok(())
    }

    fn apply(&mut self, new_state: PollState, reason: Option<&str>) {
        if let Some(last) = self.last_transition {
            *self.state_durations.entry(self.state).or_default() += last.elapsed();
        }

        self.history.push_back(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Local::now(),
            reason: reason.map(String::from),
        });
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }

        if self.state == PollState::Idle && new_state == PollState::Polling {
            self.cycles_started += 1;
        }
        self.state = new_state;
        self.last_transition = Some(Instant::now());
    }

    fn is_valid_transition(&self, new_state: PollState) -> bool {
        use PollState::*;

        matches!(
            (self.state, new_state),
            (Idle, Polling) | (Polling, Publishing) | (Polling, Idle) | (Publishing, Idle)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let mut sm = PollStateMachine::new();
        assert_eq!(sm.state(), PollState::Idle);

        sm.begin_cycle().unwrap();
        assert!(sm.state().is_busy());
        sm.begin_publish().unwrap();
        assert_eq!(sm.state(), PollState::Publishing);
        sm.finish(Some("published"));

        assert_eq!(sm.state(), PollState::Idle);
        assert_eq!(sm.cycles_started(), 1);
        assert_eq!(sm.history().count(), 3);
    }

    #[test]
    fn test_one_cycle_in_flight() {
        let mut sm = PollStateMachine::new();
        sm.begin_cycle().unwrap();

        let err = sm.begin_cycle().unwrap_err();
        assert_eq!(err.from, PollState::Polling);
        assert_eq!(err.to, PollState::Polling);
    }

    #[test]
    fn test_cannot_publish_without_polling() {
        let mut sm = PollStateMachine::new();
        assert!(sm.begin_publish().is_err());
    }

    #[test]
    fn test_failed_cycle_returns_to_idle() {
        let mut sm = PollStateMachine::new();
        sm.begin_cycle().unwrap();
        sm.finish(Some("timeout"));
        assert_eq!(sm.state(), PollState::Idle);
        assert_eq!(
            sm.history().last().and_then(|t| t.reason.as_deref()),
            Some("timeout")
        );

        // Finishing twice is harmless
        sm.finish(None);
        assert_eq!(sm.history().count(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sm = PollStateMachine::with_history(4);
        for _ in 0..10 {
            sm.begin_cycle().unwrap();
            sm.finish(None);
        }
        assert_eq!(sm.history().count(), 4);
        assert_eq!(sm.cycles_started(), 10);
    }
}
