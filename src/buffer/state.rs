//! The per-buffer swap state machine.
//!
//! A buffer cycles through exactly one sequence of states:
//!
//! ```text
//! FREE ──Stage──► STAGED ──Submit──► PENDING ──Activate──► ACTIVE ──Retire──► RETIRED ──Release──► FREE
//! ```
//!
//! Every transition is a compare-and-swap against the single legal
//! predecessor of its target. A transition that observes any other state is
//! a protocol violation: it fails, changes nothing and is never retried.
//! Keeping the state in one atomic rather than behind a lock leaves the
//! compositor callback paths lock-free and makes illegal transitions
//! directly observable.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a content buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferState {
    /// Idle, owned by the allocator pool.
    Free = 0,
    /// Locked by the client with finished content, not yet submitted.
    Staged = 1,
    /// Submitted to the compositor, awaiting the rendered signal.
    Pending = 2,
    /// Currently composited / scanned out.
    Active = 3,
    /// Displaced by a newer active buffer, awaiting the next published
    /// signal to be released.
    Retired = 4,
}

impl BufferState {
    fn from_raw(raw: u8) -> BufferState {
        match raw {
            0 => BufferState::Free,
            1 => BufferState::Staged,
            2 => BufferState::Pending,
            3 => BufferState::Active,
            4 => BufferState::Retired,
            _ => unreachable!("state cell only ever stores valid states"),
        }
    }

    /// The single state a transition into `self` may start from.
    pub fn predecessor(self) -> BufferState {
        match self {
            BufferState::Free => BufferState::Retired,
            BufferState::Staged => BufferState::Free,
            BufferState::Pending => BufferState::Staged,
            BufferState::Active => BufferState::Pending,
            BufferState::Retired => BufferState::Active,
        }
    }
}

impl std::fmt::Display for BufferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BufferState::Free => "FREE",
            BufferState::Staged => "STAGED",
            BufferState::Pending => "PENDING",
            BufferState::Active => "ACTIVE",
            BufferState::Retired => "RETIRED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell(AtomicU8::new(BufferState::Free as u8))
    }

    pub(crate) fn load(&self) -> BufferState {
        BufferState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Move to `target` from its predecessor.
    ///
    /// Returns the state actually observed when it differs from the
    /// predecessor, leaving the cell untouched.
    pub(crate) fn advance(&self, target: BufferState) -> Result<(), BufferState> {
        let expected = target.predecessor();
        self.0
            .compare_exchange(
                expected as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(drop)
            .map_err(BufferState::from_raw)
    }
}
