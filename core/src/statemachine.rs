//! Role state tracking with legal-transition enforcement
//!
//! Each role defines its state enum and the transitions it allows; the
//! tracker logs every change and turns an illegal transition into a typed
//! error instead of silent corruption.

use std::fmt::Debug;

use thiserror::Error;
use tracing::debug;

/// A role's state enum.
pub trait RoleState: Copy + Eq + Debug {
    fn name(&self) -> &'static str;
    /// Whether moving from `self` to `to` is legal.
    fn can_transition(&self, to: &Self) -> bool;
}

/// State machine error types
#[derive(Debug, Error)]
#[error("{entity}: illegal transition {from} -> {to}")]
pub struct StateError {
    pub entity: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

/// Tracks one role's current state.
pub struct StateMachine<S: RoleState> {
    entity: &'static str,
    current: S,
}

impl<S: RoleState> StateMachine<S> {
    pub fn new(entity: &'static str, initial: S) -> Self {
        StateMachine {
            entity,
            current: initial,
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn state_name(&self) -> &'static str {
        self.current.name()
    }

    pub fn is(&self, state: S) -> bool {
        self.current == state
    }

    /// Move to `to`, or fail if the role does not allow that edge.
    pub fn transition(&mut self, to: S) -> Result<(), StateError> {
        if !self.current.can_transition(&to) {
            return Err(StateError {
                entity: self.entity,
                from: self.current.name(),
                to: to.name(),
            });
        }
        debug!(
            entity = self.entity,
            from = self.current.name(),
            to = to.name(),
            "state transition"
        );
        self.current = to;
        Ok(())
    }
}
