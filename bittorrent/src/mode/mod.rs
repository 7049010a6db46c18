//! The mode-driven lifecycle. A `Torrent` owns exactly one `Mode` at a time;
//! replacing it disposes the old one's `Cancellation` so any fire-and-forget
//! task it started (piece writes, the pending-file hash pass) observes the
//! cancellation before touching shared state. Grounded on the `ConnState`
//! enum in `p2p::state.rs`, generalized from per-peer connection phase to
//! per-torrent lifecycle phase.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub mod bootstrap;
pub mod completion;
pub mod dispatch;
pub mod tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModeState {
    #[default]
    Stopped,
    Hashing,
    Starting,
    Downloading,
    Seeding,
    Error,
}

/// A cheap shared cancellation flag, the same "cheap shared flag" idiom the
/// teacher uses for `SessionState::changed`, just promoted to an `Arc` so
/// fire-and-forget tasks spawned by a Mode can observe it after the Mode
/// itself has been replaced.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Capability record (spec's "polymorphic handle" design note): rather than
/// a trait object with overridable virtual handlers, a Mode is a plain
/// struct of flags and a state tag; the dispatcher and tick loop branch on
/// `state` and the flags directly instead of calling through vtable slots.
#[derive(Debug, Clone)]
pub struct Mode {
    pub state: ModeState,
    pub can_accept_connections: bool,
    pub can_handle_messages: bool,
    pub can_hash_check: bool,
    pub cancellation: Cancellation,
}

impl Mode {
    fn new(state: ModeState, can_accept_connections: bool, can_handle_messages: bool, can_hash_check: bool) -> Self {
        Self {
            state,
            can_accept_connections,
            can_handle_messages,
            can_hash_check,
            cancellation: Cancellation::new(),
        }
    }

    pub fn stopped() -> Self {
        Self::new(ModeState::Stopped, false, false, false)
    }

    pub fn hashing() -> Self {
        Self::new(ModeState::Hashing, false, false, true)
    }

    pub fn starting() -> Self {
        Self::new(ModeState::Starting, true, true, false)
    }

    pub fn downloading() -> Self {
        Self::new(ModeState::Downloading, true, true, true)
    }

    pub fn seeding() -> Self {
        Self::new(ModeState::Seeding, true, true, true)
    }

    pub fn error() -> Self {
        Self::new(ModeState::Error, false, false, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replacing_mode_cancels_the_old_one() {
        let old = Mode::downloading();
        let old_cancellation = old.cancellation.clone();
        assert!(!old_cancellation.is_cancelled());

        // Simulates `Torrent::set_mode`: dispose the old cancellation when
        // swapping in a new Mode.
        let _new = Mode::seeding();
        old.cancellation.cancel();
        assert!(old_cancellation.is_cancelled());
    }

    #[test]
    fn test_hashing_mode_forbids_messages_and_connections() {
        let mode = Mode::hashing();
        assert!(!mode.can_handle_messages);
        assert!(!mode.can_accept_connections);
        assert!(mode.can_hash_check);
    }
}
