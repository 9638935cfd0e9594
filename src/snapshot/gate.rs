//! Persistence Gate
//!
//! One phase word shared by the coordinator and the loader, so a save and a
//! load can never overlap.
//!
//! ```text
//!            enter(Saving)             enter(Loading)
//!   Idle ─────────────────▶ Saving    Idle ─────────────────▶ Loading
//!    ▲                        │        ▲                        │
//!    └──── guard dropped ─────┘        └──── guard dropped ─────┘
//! ```
//!
//! A failed `enter` reports the phase that holds the gate: `Busy` while a
//! save runs, `Loading` while a load runs.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{EmberError, Result};

const IDLE: u8 = 0;
const SAVING: u8 = 1;
const LOADING: u8 = 2;

/// What the gate is held for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Saving,
    Loading,
}

impl Phase {
    fn tag(self) -> u8 {
        match self {
            Phase::Saving => SAVING,
            Phase::Loading => LOADING,
        }
    }
}

/// Mutual exclusion between saves and loads
#[derive(Debug)]
pub struct PersistenceGate {
    phase: AtomicU8,
}

impl PersistenceGate {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(IDLE),
        }
    }

    /// Take the gate for `phase` without waiting
    pub fn enter(&self, phase: Phase) -> Result<PhaseGuard<'_>> {
        match self
            .phase
            .compare_exchange(IDLE, phase.tag(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(PhaseGuard { gate: self }),
            Err(LOADING) => Err(EmberError::Loading),
            Err(_) => Err(EmberError::Busy),
        }
    }

    pub fn is_saving(&self) -> bool {
        self.phase.load(Ordering::Acquire) == SAVING
    }

    pub fn is_loading(&self) -> bool {
        self.phase.load(Ordering::Acquire) == LOADING
    }
}

impl Default for PersistenceGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the gate until dropped
pub struct PhaseGuard<'a> {
    gate: &'a PersistenceGate,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.gate.phase.store(IDLE, Ordering::Release);
    }
}
