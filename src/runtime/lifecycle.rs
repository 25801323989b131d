//! Component lifecycle state machine
//!
//! Only the transitions listed here are legal; anything else is a
//! programming error surfaced as `LifecycleError::InvalidTransition` and
//! bubbled to the registry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a registered component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    /// Constructed, not yet known to the registry
    Uninitialized,
    /// Known to the registry, resources not yet acquired
    Registered,
    /// `init` in progress
    Initializing,
    /// `init` completed
    Initialized,
    /// `start` in progress
    Starting,
    /// Serving traffic
    Running,
    /// `stop` in progress
    Stopping,
    /// Stopped cleanly
    Stopped,
    /// Teardown in progress
    Disposing,
    /// Terminal: resources released
    Disposed,
    /// Failed; terminal unless recovered
    Failed,
    /// Recovery in progress
    Recovering,
    /// Recovered, ready to start again
    Recovered,
}

impl ComponentState {
    /// States reachable from this one
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Uninitialized => vec![Self::Registered, Self::Failed],
            Self::Registered => vec![Self::Initializing, Self::Disposing, Self::Failed],
            Self::Initializing => vec![Self::Initialized, Self::Failed],
            Self::Initialized => vec![Self::Starting, Self::Disposing, Self::Failed],
            Self::Starting => vec![Self::Running, Self::Failed],
            Self::Running => vec![Self::Stopping, Self::Failed],
            Self::Stopping => vec![Self::Stopped, Self::Failed],
            Self::Stopped => vec![Self::Disposing, Self::Failed],
            Self::Disposing => vec![Self::Disposed, Self::Failed],
            Self::Disposed => vec![],
            Self::Failed => vec![Self::Recovering],
            Self::Recovering => vec![Self::Recovered, Self::Failed],
            Self::Recovered => vec![Self::Starting, Self::Failed],
        }
    }

    /// Validates a transition to `next`
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disposed)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Registered => "registered",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Disposing => "disposing",
            Self::Disposed => "disposed",
            Self::Failed => "failed",
            Self::Recovering => "recovering",
            Self::Recovered => "recovered",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        let chain = [
            ComponentState::Uninitialized,
            ComponentState::Registered,
            ComponentState::Initializing,
            ComponentState::Initialized,
            ComponentState::Starting,
            ComponentState::Running,
            ComponentState::Stopping,
            ComponentState::Stopped,
            ComponentState::Disposing,
            ComponentState::Disposed,
        ];
        for pair in chain.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn skipping_states_is_illegal() {
        assert!(!ComponentState::Registered.can_transition_to(ComponentState::Running));
        assert!(!ComponentState::Uninitialized.can_transition_to(ComponentState::Starting));
        assert!(!ComponentState::Stopped.can_transition_to(ComponentState::Running));
    }

    #[test]
    fn failed_is_reachable_from_non_terminal_states() {
        for state in [
            ComponentState::Registered,
            ComponentState::Initializing,
            ComponentState::Running,
            ComponentState::Stopping,
        ] {
            assert!(state.can_transition_to(ComponentState::Failed));
        }
        assert!(!ComponentState::Disposed.can_transition_to(ComponentState::Failed));
    }

    #[test]
    fn recovery_leads_back_to_starting() {
        assert!(ComponentState::Failed.can_transition_to(ComponentState::Recovering));
        assert!(ComponentState::Recovering.can_transition_to(ComponentState::Recovered));
        assert!(ComponentState::Recovered.can_transition_to(ComponentState::Starting));
    }

    #[test]
    fn disposed_is_the_only_terminal_state() {
        assert!(ComponentState::Disposed.is_terminal());
        assert!(!ComponentState::Failed.is_terminal());
        assert!(ComponentState::Disposed.valid_transitions().is_empty());
    }
}
