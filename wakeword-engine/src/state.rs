//! Detection state machine
//!
//! The engine state lives behind its own narrow lock so the event dispatcher
//! can check it without waiting on long-running client operations that hold
//! the primary engine lock.

use parking_lot::Mutex;
use std::fmt;
use tracing::{debug, info};

/// Engine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// No sound model loaded
    Idle,

    /// Model loaded, recognition not started
    Loaded,

    /// Recognition running, waiting for a detection
    Active,

    /// Replay and real-time audio being drained into the ring buffer
    Buffering,

    /// Detection received, capture loop not yet running
    Detected,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "Idle"),
            EngineState::Loaded => write!(f, "Loaded"),
            EngineState::Active => write!(f, "Active"),
            EngineState::Buffering => write!(f, "Buffering"),
            EngineState::Detected => write!(f, "Detected"),
        }
    }
}

impl EngineState {
    /// Active, Buffering and Detected all count as a running engine
    pub fn is_active(self) -> bool {
        matches!(
            self,
            EngineState::Active | EngineState::Buffering | EngineState::Detected
        )
    }

    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: EngineState) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (EngineState::Idle, EngineState::Loaded)
                | (EngineState::Loaded, EngineState::Active)
                | (EngineState::Loaded, EngineState::Idle)
                | (EngineState::Active, EngineState::Detected)
                | (EngineState::Active, EngineState::Buffering)
                | (EngineState::Detected, EngineState::Buffering)
                // client notified without capture, or reset path
                | (EngineState::Detected, EngineState::Active)
                | (EngineState::Buffering, EngineState::Active)
                | (EngineState::Active, EngineState::Loaded)
                | (EngineState::Buffering, EngineState::Loaded)
                | (EngineState::Detected, EngineState::Loaded)
        )
    }
}

/// Sub-state of a listener as tracked by the layer that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    Idle,
    Loaded,
    Active,
    Detected,
    Buffering,
}

impl ListenerState {
    /// Listener is armed or consuming a detection
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ListenerState::Active | ListenerState::Detected | ListenerState::Buffering
        )
    }
}

/// Engine state guarded by its own lock
pub struct StateCell {
    state: Mutex<EngineState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::Idle),
        }
    }

    /// Current state (short lock, never held across a wait)
    pub fn get(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.get().is_active()
    }

    /// Attempt a transition. Invalid transitions leave the state untouched
    /// and return false; callers treat them as a no-op.
    pub fn transition(&self, next: EngineState) -> bool {
        let mut state = self.state.lock();
        let current = *state;

        if !current.can_transition_to(next) {
            debug!("Ignoring engine state transition {} -> {}", current, next);
            return false;
        }

        *state = next;
        if current != next {
            info!("Engine state transitioned from {} to {}", current, next);
        }
        true
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(EngineState::Idle, EngineState::Loaded, true ; "load")]
    #[test_case(EngineState::Loaded, EngineState::Active, true ; "start")]
    #[test_case(EngineState::Active, EngineState::Detected, true ; "detect")]
    #[test_case(EngineState::Detected, EngineState::Buffering, true ; "capture")]
    #[test_case(EngineState::Buffering, EngineState::Active, true ; "buffering done")]
    #[test_case(EngineState::Buffering, EngineState::Loaded, true ; "stop while buffering")]
    #[test_case(EngineState::Loaded, EngineState::Idle, true ; "unload")]
    #[test_case(EngineState::Idle, EngineState::Active, false ; "start without model")]
    #[test_case(EngineState::Idle, EngineState::Buffering, false ; "buffer without model")]
    #[test_case(EngineState::Loaded, EngineState::Buffering, false ; "buffer while stopped")]
    #[test_case(EngineState::Buffering, EngineState::Detected, false ; "detect while buffering")]
    #[test_case(EngineState::Active, EngineState::Idle, false ; "unload while running")]
    fn test_transition_table(from: EngineState, to: EngineState, valid: bool) {
        assert_eq!(from.can_transition_to(to), valid);
    }

    #[test]
    fn test_same_state_is_allowed() {
        for state in [
            EngineState::Idle,
            EngineState::Loaded,
            EngineState::Active,
            EngineState::Buffering,
            EngineState::Detected,
        ] {
            assert!(state.can_transition_to(state));
        }
    }

    #[test]
    fn test_is_active() {
        assert!(!EngineState::Idle.is_active());
        assert!(!EngineState::Loaded.is_active());
        assert!(EngineState::Active.is_active());
        assert!(EngineState::Buffering.is_active());
        assert!(EngineState::Detected.is_active());
    }

    #[test]
    fn test_invalid_transition_is_noop() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), EngineState::Idle);

        assert!(!cell.transition(EngineState::Active));
        assert_eq!(cell.get(), EngineState::Idle);

        assert!(cell.transition(EngineState::Loaded));
        assert!(cell.transition(EngineState::Active));
        assert!(cell.is_active());
    }

    #[test]
    fn test_listener_running() {
        assert!(ListenerState::Active.is_running());
        assert!(ListenerState::Buffering.is_running());
        assert!(!ListenerState::Loaded.is_running());
    }
}
