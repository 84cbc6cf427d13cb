//! # Flywheel
//!
//! An event-driven framework for TCP servers and clients on a
//! single-threaded reactor.
//!
//! ## Architecture
//!
//! Flywheel is structured as a small reactor kernel with clean layering:
//!
//! - **`flywheel-core`**: level-triggered poll backend, watchers, the
//!   dispatch loop with deferred calls, timeouts and signal hooks
//! - **`flywheel-tcp`**: buffered TCP transport with flow control and idle
//!   timeouts, accept loop, protocol contract
//! - **`flywheel`**: public API surface (this crate)
//!
//! ## Quick Start
//!
//! An echo server is a protocol that writes back whatever arrives:
//!
//! ```rust,no_run
//! use flywheel::{Protocol, Reactor, Result, TcpListener, TcpTransport};
//!
//! struct Echo {
//!     transport: Option<TcpTransport>,
//! }
//!
//! impl Protocol for Echo {
//!     fn connection_made(&mut self, transport: &TcpTransport) -> Result<()> {
//!         self.transport = Some(transport.clone());
//!         Ok(())
//!     }
//!
//!     fn data_received(&mut self, data: &[u8]) -> Result<()> {
//!         match &self.transport {
//!             Some(transport) => transport.write(data),
//!             None => Ok(()),
//!         }
//!     }
//!
//!     fn connection_lost(&mut self, _error: Option<std::io::Error>) {}
//! }
//!
//! fn main() -> Result<()> {
//!     let reactor = Reactor::new();
//!     let listener = TcpListener::new(&reactor, |reactor, socket| {
//!         TcpTransport::new(reactor, socket, Box::new(Echo { transport: None }))
//!     });
//!     let addr = "127.0.0.1:7777".parse().expect("listen address");
//!     listener.start(addr)?;
//!     reactor.start()
//! }
//! ```
//!
//! ## Model
//!
//! - **Single-threaded cooperative**: every callback runs on the reactor
//!   thread, serially; handles are `!Send` by construction
//! - **Level-triggered**: one `recv`/`send` per readiness event, no
//!   spin-draining
//! - **Exactly-once teardown**: every connection that saw
//!   `connection_made` sees `connection_lost` exactly once, on all paths

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

// Re-export core types
pub use bytes::Bytes;
pub use flywheel_core::error::{Error, Result};
pub use flywheel_core::event::{Event, Priority};
pub use flywheel_core::reactor::{default_reactor, Reactor, WeakReactor};
pub use flywheel_core::watcher::{
    CleanupWatcher, IdleWatcher, IoWatcher, SignalWatcher, TimerWatcher, Watcher,
};
pub use flywheel_tcp::buffer::WriteQueue;
pub use flywheel_tcp::listener::{TcpListener, DEFAULT_BACKLOG};
pub use flywheel_tcp::protocol::{Capabilities, Protocol, TransportFactory};
pub use flywheel_tcp::transport::{TcpTransport, DEFAULT_WRITE_LIMIT, MIN_WRITE_LIMIT};

/// Development helpers (tests/examples)
pub mod dev_tracing;
