//! Run-state machine for [`AsyncResult`](crate::task::AsyncResult).
//!
//! Transitions are one-way; `Completing` and `Interrupting` are
//! transient and always followed by their paired terminal state:
//!
//! ```text
//! Pending -> Completing -> Completed
//! Pending -> Completing -> Failed
//! Pending -> Cancelled
//! Pending -> Interrupting -> Interrupted
//! ```

/// Lifecycle state of an `AsyncResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RunState {
    /// Created; the work has not finished and no cancel has won.
    Pending = 0,
    /// Transient: the outcome write is in flight.
    Completing = 1,
    /// The work produced a value.
    Completed = 2,
    /// The work returned an error or panicked.
    Failed = 3,
    /// Cancelled before completion, without interruption.
    Cancelled = 4,
    /// Transient: a cancel is signaling the running thread.
    Interrupting = 5,
    /// Cancelled before completion, with the interrupt delivered.
    Interrupted = 6,
}

impl RunState {
    pub(crate) const fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Completing,
            2 => Self::Completed,
            3 => Self::Failed,
            4 => Self::Cancelled,
            5 => Self::Interrupting,
            6 => Self::Interrupted,
            _ => unreachable!("invalid run state {raw}"),
        }
    }

    /// True once the state can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Interrupted
        )
    }

    /// True for every state in the cancelled family, including the
    /// transient `Interrupting`.
    #[must_use]
    pub const fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelled | Self::Interrupting | Self::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_raw() {
        for state in [
            RunState::Pending,
            RunState::Completing,
            RunState::Completed,
            RunState::Failed,
            RunState::Cancelled,
            RunState::Interrupting,
            RunState::Interrupted,
        ] {
            assert_eq!(RunState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn cancelled_family_ordering() {
        // Waiter loops rely on the numeric order: anything above
        // Completing is settled from a joiner's perspective.
        assert!(RunState::Completed.as_u8() > RunState::Completing.as_u8());
        assert!(RunState::Cancelled.as_u8() > RunState::Completing.as_u8());
        assert!(RunState::Interrupting.is_cancelled());
        assert!(!RunState::Interrupting.is_terminal());
    }
}
