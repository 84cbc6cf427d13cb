//! Flywheel Core
//!
//! This crate contains the reactor building blocks:
//! - Thin binding over a level-triggered readiness multiplexer (`poller`)
//! - Typed watcher handles bridging backend events to callbacks (`watcher`)
//! - The dispatch loop with deferred calls, one-shot timeouts and signal
//!   hooks (`reactor`)
//! - Event bitmask and dispatch priorities (`event`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod event;
mod poller;
pub mod reactor;
pub mod watcher;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::event::{Event, Priority};
    pub use crate::reactor::{default_reactor, Reactor, WeakReactor};
    pub use crate::watcher::{
        CleanupWatcher, IdleWatcher, IoWatcher, SignalWatcher, TimerWatcher, Watcher,
    };
}
