//! The protocol contract.
//!
//! A protocol is the user-owned object consuming transport events. Optional
//! behavior is declared up front through [`Capabilities`]; the transport
//! snapshots the descriptor when the connection is made and never probes
//! again.

use std::io;
use std::net::TcpStream;

use flywheel_core::error::Result;
use flywheel_core::reactor::Reactor;

use crate::transport::TcpTransport;

/// Optional protocol capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Wants `pause_writing` / `resume_writing` flow-control notifications.
    pub flow_control: bool,
    /// Wants `connection_timeout` when the idle timer elapses.
    pub timeout: bool,
}

impl Capabilities {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flow_control: false,
            timeout: false,
        }
    }

    #[must_use]
    pub const fn with_flow_control(mut self) -> Self {
        self.flow_control = true;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self) -> Self {
        self.timeout = true;
        self
    }
}

/// A connection protocol driven by a [`TcpTransport`].
///
/// `connection_made` happens-before any `data_received`; `connection_lost`
/// happens-after every earlier callback for the connection and is delivered
/// exactly once. Callbacks are never re-entered: delivery for one
/// connection is strictly sequential.
pub trait Protocol {
    /// The transport is ready. The handle may be cloned and stored.
    fn connection_made(&mut self, transport: &TcpTransport) -> Result<()>;

    /// Bytes arrived from the peer. The view is only valid for this call.
    fn data_received(&mut self, data: &[u8]) -> Result<()>;

    /// The connection is gone. `error` is present iff the transport was
    /// torn down by an I/O error.
    fn connection_lost(&mut self, error: Option<io::Error>);

    /// Declared optional capabilities; checked once, at connection time.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// The write buffer crossed above the high-water mark.
    fn pause_writing(&mut self) -> Result<()> {
        Ok(())
    }

    /// The write buffer drained below the low-water mark.
    fn resume_writing(&mut self) -> Result<()> {
        Ok(())
    }

    /// The idle timer elapsed. The transport never closes on its own;
    /// call `close` here if that is the policy.
    fn connection_timeout(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Connection constructor stored on the listener, called once per accepted
/// socket.
pub type TransportFactory = Box<dyn FnMut(&Reactor, TcpStream) -> Result<TcpTransport>>;
