//! Pause state for the worker pool.
//!
//! Held in memory only: a restarted pool always starts running. Units check
//! the flag between jobs, so pausing never interrupts a job in progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

/// Shared pause flag.
#[derive(Clone, Default)]
pub struct PauseState {
    paused: Arc<AtomicBool>,
}

impl PauseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop units from claiming new jobs. Returns false if already paused.
    pub fn pause(&self) -> bool {
        let changed = !self.paused.swap(true, Ordering::SeqCst);
        if changed {
            info!(subsystem = "jobs", component = "pause", "Job processing PAUSED");
        }
        changed
    }

    /// Let units claim jobs again. Returns false if not paused.
    pub fn resume(&self) -> bool {
        let changed = self.paused.swap(false, Ordering::SeqCst);
        if changed {
            info!(subsystem = "jobs", component = "pause", "Job processing RESUMED");
        }
        changed
    }

    /// Hot-path check.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_running() {
        assert!(!PauseState::new().is_paused());
    }

    #[test]
    fn test_pause_resume() {
        let state = PauseState::new();
        assert!(state.pause());
        assert!(state.is_paused());
        assert!(!state.pause());
        assert!(state.resume());
        assert!(!state.is_paused());
        assert!(!state.resume());
    }

    #[test]
    fn test_clones_share_flag() {
        let state = PauseState::new();
        let other = state.clone();
        state.pause();
        assert!(other.is_paused());
    }
}
