//! TCP listener.
//!
//! Accepts connections on a nonblocking socket, builds one transport per
//! accept through the stored factory, and tracks the live set so teardown
//! reaches every connection before the listening socket goes away.

use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use hashbrown::HashMap;
use socket2::{Domain, Socket, Type};
use tracing::{debug, error, trace, warn};

use flywheel_core::error::{Error, Result};
use flywheel_core::event::Event;
use flywheel_core::reactor::{Reactor, WeakReactor};
use flywheel_core::watcher::{IoWatcher, Watcher};

use crate::protocol::TransportFactory;
use crate::transport::TcpTransport;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 64;

struct State {
    reactor: WeakReactor,
    socket: Option<std::net::TcpListener>,
    local: Option<SocketAddr>,
    watcher: Option<IoWatcher>,
    factory: Option<TransportFactory>,
    connections: HashMap<RawFd, TcpTransport>,
}

/// Handle to a listening socket and the connections accepted from it.
#[derive(Clone)]
pub struct TcpListener {
    state: Rc<RefCell<State>>,
}

impl TcpListener {
    /// Create a listener that builds one transport per accepted socket via
    /// `factory`. Factory failures are configuration errors and propagate
    /// out of [`Reactor::start`].
    pub fn new(
        reactor: &Reactor,
        factory: impl FnMut(&Reactor, TcpStream) -> Result<TcpTransport> + 'static,
    ) -> TcpListener {
        TcpListener {
            state: Rc::new(RefCell::new(State {
                reactor: reactor.downgrade(),
                socket: None,
                local: None,
                watcher: None,
                factory: Some(Box::new(factory)),
                connections: HashMap::new(),
            })),
        }
    }

    /// Bind `addr` with address reuse and start accepting with the default
    /// backlog. Returns the bound address.
    pub fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.start_with_backlog(addr, DEFAULT_BACKLOG)
    }

    /// Bind `addr` and start accepting. Bind and listen errors are fatal to
    /// the listener and propagate to the caller.
    pub fn start_with_backlog(&self, addr: SocketAddr, backlog: u32) -> Result<SocketAddr> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;
        socket.set_nonblocking(true)?;
        let socket: std::net::TcpListener = socket.into();
        let local = socket.local_addr()?;

        let reactor = self
            .state
            .borrow()
            .reactor
            .upgrade()
            .ok_or(Error::LoopClosed)?;
        let watcher = {
            let listener = self.clone();
            IoWatcher::new(
                &reactor,
                socket.as_raw_fd(),
                Event::READ,
                move |watcher, events| listener.on_ready(watcher, events),
            )?
        };
        watcher.start()?;

        debug!(%local, "listening");
        let mut state = self.state.borrow_mut();
        state.socket = Some(socket);
        state.local = Some(local);
        state.watcher = Some(watcher);
        Ok(local)
    }

    /// Bound address while listening.
    #[must_use]
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.state.borrow().local
    }

    /// Number of live accepted connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.borrow().connections.len()
    }

    /// Stop accepting and gracefully close every live connection.
    /// Idempotent.
    pub fn stop(&self) -> Result<()> {
        let (watcher, connections) = {
            let mut state = self.state.borrow_mut();
            if state.socket.is_none() && state.watcher.is_none() {
                return Ok(());
            }
            (
                state.watcher.take(),
                state.connections.values().cloned().collect::<Vec<_>>(),
            )
        };
        debug!(connections = connections.len(), "stopping listener");
        if let Some(watcher) = watcher {
            watcher.cancel();
        }
        let mut result = Ok(());
        for connection in connections {
            if let Err(err) = connection.close() {
                error!(%err, "error closing connection");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        let mut state = self.state.borrow_mut();
        state.socket = None;
        state.local = None;
        result
    }

    fn on_ready(&self, _watcher: &Watcher, events: Event) -> Result<()> {
        if events.intersects(Event::CLEANUP | Event::ERROR) {
            return self.stop();
        }
        // One accept per readiness event; the level-triggered backend
        // reports again while the queue is non-empty.
        let accepted = {
            let state = self.state.borrow();
            let Some(socket) = state.socket.as_ref() else {
                return Ok(());
            };
            socket.accept()
        };
        match accepted {
            Ok((socket, peer)) => self.register(socket, peer),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) if is_transient(&err) => {
                warn!(%err, "transient accept error");
                Ok(())
            }
            Err(err) => {
                error!(%err, "accept failed, stopping listener");
                self.stop()
            }
        }
    }

    fn register(&self, socket: TcpStream, peer: SocketAddr) -> Result<()> {
        trace!(%peer, "accepting connection");
        let Some(reactor) = self.state.borrow().reactor.upgrade() else {
            return Ok(());
        };
        let Some(mut factory) = self.state.borrow_mut().factory.take() else {
            return Ok(());
        };
        let built = factory(&reactor, socket);
        self.state.borrow_mut().factory = Some(factory);
        let transport = built?;
        if transport.is_closed() {
            // Torn down during its own connection_made; nothing to track.
            return Ok(());
        }
        let fd = transport.raw_fd();
        let weak = Rc::downgrade(&self.state);
        transport.set_on_close(Box::new(move |fd| {
            deregister(&weak, fd);
        }));
        self.state.borrow_mut().connections.insert(fd, transport);
        Ok(())
    }
}

fn deregister(state: &Weak<RefCell<State>>, fd: RawFd) {
    if let Some(state) = state.upgrade() {
        state.borrow_mut().connections.remove(&fd);
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
