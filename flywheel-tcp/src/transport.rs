//! TCP transport.
//!
//! One transport == one nonblocking TCP connection.
//!
//! Responsibilities:
//! - Own the socket and its read/write and idle-timer watchers
//! - Move bytes between the kernel and the protocol
//! - Enforce write flow control (high/low watermarks with hysteresis)
//! - Drive the close/abort lifecycle, delivering `connection_lost` exactly
//!   once per connection
//!
//! Protocol callbacks run synchronously on the reactor thread. While one is
//! on the stack the protocol box is taken out of the transport, so transport
//! methods called from inside a callback can never re-enter the protocol;
//! notifications that become due in the meantime are delivered right after
//! the callback returns.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use bytes::Bytes;
use tracing::{debug, trace};

use flywheel_core::error::Result;
use flywheel_core::event::Event;
use flywheel_core::reactor::Reactor;
use flywheel_core::watcher::{IoWatcher, TimerWatcher, Watcher};

use crate::buffer::WriteQueue;
use crate::protocol::{Capabilities, Protocol};

/// Default write limit (high-water mark).
pub const DEFAULT_WRITE_LIMIT: usize = 384 * 1024;
/// Smallest accepted write limit.
pub const MIN_WRITE_LIMIT: usize = 64 * 1024;
/// Low-water mark as a fraction of the high-water mark.
const LOW_WATER_FACTOR: f64 = 0.67;
/// Bytes read per readiness event. Since the backend is level-triggered
/// there is no use in looping; a partially drained socket reports ready
/// again on the next iteration.
const READ_CHUNK: usize = 8 * 1024;

pub(crate) type OnClose = Box<dyn FnMut(RawFd)>;

fn low_water(high: usize) -> usize {
    (high as f64 * LOW_WATER_FACTOR) as usize
}

struct State {
    socket: Option<TcpStream>,
    fd: RawFd,
    peer: Option<SocketAddr>,
    io: Option<IoWatcher>,
    timer: Option<TimerWatcher>,
    protocol: Option<Box<dyn Protocol>>,
    caps: Capabilities,
    buffer: WriteQueue,
    closing: bool,
    closed: bool,
    paused_reading: bool,
    paused_writing: bool,
    /// High-water notification sent to the protocol but not yet rescinded.
    protocol_paused: bool,
    flush_callback: Option<Box<dyn FnOnce() -> Result<()>>>,
    high: usize,
    low: usize,
    timeout: f64,
    on_close: Option<OnClose>,
    teardown_pending: bool,
    teardown_error: Option<io::Error>,
}

impl State {
    /// Re-derive the io watcher's interest mask from the pause flags.
    fn sync_interest(&self) {
        let Some(io) = &self.io else { return };
        let mut mask = Event::NONE;
        if !self.paused_reading {
            mask |= Event::READ;
        }
        if !self.paused_writing {
            mask |= Event::WRITE;
        }
        if mask.is_empty() {
            io.stop();
        } else {
            io.set_events(mask);
            let _ = io.start();
        }
    }
}

enum Settle {
    Lost(Box<dyn Protocol>, Option<io::Error>),
    Pause(Box<dyn Protocol>),
    Resume(Box<dyn Protocol>),
    Flush(Box<dyn FnOnce() -> Result<()>>),
}

/// Cloneable handle to one connection. Every method is a no-op once the
/// transport reached its terminal state.
#[derive(Clone)]
pub struct TcpTransport {
    state: Rc<RefCell<State>>,
}

impl TcpTransport {
    /// Wrap a connected socket: switch it to nonblocking, register the read
    /// watcher and the dormant idle timer, and invoke `connection_made`.
    pub fn new(
        reactor: &Reactor,
        socket: TcpStream,
        protocol: Box<dyn Protocol>,
    ) -> Result<TcpTransport> {
        socket.set_nonblocking(true)?;
        let peer = socket.peer_addr().ok();
        let fd = socket.as_raw_fd();
        let caps = protocol.capabilities();

        let state = Rc::new(RefCell::new(State {
            socket: Some(socket),
            fd,
            peer,
            io: None,
            timer: None,
            protocol: Some(protocol),
            caps,
            buffer: WriteQueue::new(),
            closing: false,
            closed: false,
            paused_reading: false,
            paused_writing: true,
            protocol_paused: false,
            flush_callback: None,
            high: DEFAULT_WRITE_LIMIT,
            low: low_water(DEFAULT_WRITE_LIMIT),
            timeout: 0.0,
            on_close: None,
            teardown_pending: false,
            teardown_error: None,
        }));
        let transport = TcpTransport { state };

        let io = {
            let t = transport.clone();
            IoWatcher::new(reactor, fd, Event::READ, move |watcher, events| {
                t.on_io(watcher, events)
            })?
        };
        io.start()?;
        let timer = {
            let t = transport.clone();
            TimerWatcher::new(reactor, 0.0, move |watcher, events| {
                t.on_timer(watcher, events)
            })?
        };
        {
            let mut state = transport.state.borrow_mut();
            state.io = Some(io);
            state.timer = Some(timer);
        }

        debug!(?peer, "connection made");
        let handle = transport.clone();
        transport.with_protocol(move |protocol| protocol.connection_made(&handle))?;
        Ok(transport)
    }

    /// Dial `addr` and wrap the resulting socket.
    pub fn connect(
        reactor: &Reactor,
        addr: SocketAddr,
        protocol: Box<dyn Protocol>,
    ) -> Result<TcpTransport> {
        let socket = TcpStream::connect(addr)?;
        TcpTransport::new(reactor, socket, protocol)
    }

    /// Queue bytes for sending. Callable from any protocol callback.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.write_bytes(Bytes::copy_from_slice(data))
    }

    /// Queue refcounted bytes for sending without copying.
    pub fn write_bytes(&self, data: Bytes) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if state.closed || state.closing {
                return Ok(());
            }
            state.buffer.push(data);
        }
        self.reconcile()
    }

    /// Run `callback` once the write buffer has fully drained; immediately
    /// if it already is empty.
    pub fn flush(&self, callback: impl FnOnce() -> Result<()> + 'static) -> Result<()> {
        let mut pending: Option<Box<dyn FnOnce() -> Result<()>>> = Some(Box::new(callback));
        let run_now = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Ok(());
            }
            if state.buffer.is_empty() {
                true
            } else {
                state.flush_callback = pending.take();
                false
            }
        };
        match pending {
            Some(callback) if run_now => callback(),
            _ => Ok(()),
        }
    }

    /// Drop read interest until [`TcpTransport::resume_reading`].
    pub fn pause_reading(&self) {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return;
        }
        state.paused_reading = true;
        state.sync_interest();
    }

    /// Restore read interest. No-op while closing.
    pub fn resume_reading(&self) {
        let mut state = self.state.borrow_mut();
        if state.closed || state.closing {
            return;
        }
        state.paused_reading = false;
        state.sync_interest();
    }

    /// Current high-water mark for the write buffer.
    #[must_use]
    pub fn write_limit(&self) -> usize {
        self.state.borrow().high
    }

    /// Set the high-water mark, floored at 64 KiB. The low-water mark is
    /// re-derived and hysteresis crossings are re-evaluated immediately.
    pub fn set_write_limit(&self, limit: usize) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Ok(());
            }
            let high = limit.max(MIN_WRITE_LIMIT);
            state.high = high;
            state.low = low_water(high);
        }
        self.reconcile()
    }

    /// Idle timeout in seconds; zero when disabled.
    #[must_use]
    pub fn timeout(&self) -> f64 {
        self.state.borrow().timeout
    }

    /// Arm (or, with a non-positive value, disarm) the idle timer. The timer
    /// is single-shot: it fires `connection_timeout` once and stays off
    /// until the timeout is set again.
    pub fn set_timeout(&self, seconds: f64) {
        let timer = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return;
            }
            state.timeout = if seconds > 0.0 { seconds } else { 0.0 };
            state.timer.clone()
        };
        if let Some(timer) = timer {
            timer.set_seconds(seconds);
        }
    }

    /// Peer address of the socket.
    #[must_use]
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.state.borrow().peer
    }

    /// Bytes currently queued for sending.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Request a graceful close: stop reading, finish draining the write
    /// buffer, then tear down. Idempotent.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if state.closing || state.closed {
                return Ok(());
            }
            state.closing = true;
        }
        self.pause_reading();
        self.reconcile()
    }

    /// Immediate teardown: `connection_lost` is delivered with no error.
    /// Idempotent.
    pub fn abort(&self) -> Result<()> {
        self.abort_with(None)
    }

    pub(crate) fn set_on_close(&self, callback: OnClose) {
        self.state.borrow_mut().on_close = Some(callback);
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.state.borrow().fd
    }

    fn on_io(&self, _watcher: &Watcher, events: Event) -> Result<()> {
        if events.contains(Event::CLEANUP) {
            return self.abort_with(None);
        }
        if events.contains(Event::ERROR) {
            let error = self.take_socket_error();
            trace!(%error, "socket error event");
            return self.abort_with(Some(error));
        }
        if events.contains(Event::WRITE) {
            self.on_writable()?;
        }
        if events.contains(Event::READ) {
            self.on_readable()?;
        }
        Ok(())
    }

    fn on_timer(&self, watcher: &Watcher, events: Event) -> Result<()> {
        if events.contains(Event::CLEANUP) {
            return self.abort_with(None);
        }
        let timeout_capable = {
            let state = self.state.borrow();
            if state.closed {
                return Ok(());
            }
            state.caps.timeout
        };
        // Single-shot: the protocol re-arms by setting the timeout again.
        watcher.stop();
        if timeout_capable {
            trace!("idle timeout");
            self.with_protocol(|protocol| protocol.connection_timeout())
        } else {
            Ok(())
        }
    }

    fn on_readable(&self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let received = {
            let mut state = self.state.borrow_mut();
            if state.closed || state.paused_reading {
                return Ok(());
            }
            let Some(socket) = state.socket.as_mut() else {
                return Ok(());
            };
            socket.read(&mut chunk)
        };
        match received {
            Ok(0) => {
                trace!("closed while reading");
                self.abort_with(None)
            }
            Ok(n) => {
                trace!(bytes = n, "data received");
                self.with_protocol(|protocol| protocol.data_received(&chunk[..n]))
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(())
            }
            Err(err) => {
                trace!(%err, "error while reading");
                self.abort_with(Some(err))
            }
        }
    }

    fn on_writable(&self) -> Result<()> {
        let sent = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Ok(());
            }
            let state = &mut *state;
            match (state.socket.as_mut(), state.buffer.front()) {
                (Some(socket), Some(front)) => Some(socket.write(front)),
                _ => None,
            }
        };
        match sent {
            None => self.reconcile(),
            Some(Ok(n)) => {
                trace!(bytes = n, "data sent");
                self.state.borrow_mut().buffer.advance(n);
                self.reconcile()
            }
            Some(Err(err))
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(())
            }
            Some(Err(err)) => {
                trace!(%err, "error while writing");
                self.abort_with(Some(err))
            }
        }
    }

    /// Executed after every buffer mutation: finish a drained graceful
    /// close, toggle write-side interest, then deliver whatever
    /// notifications fell due.
    fn reconcile(&self) -> Result<()> {
        let finish = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Ok(());
            }
            if state.closing && state.buffer.is_empty() {
                true
            } else {
                state.paused_writing = state.buffer.is_empty();
                state.sync_interest();
                false
            }
        };
        if finish {
            return self.abort_with(None);
        }
        self.settle()
    }

    fn abort_with(&self, error: Option<io::Error>) -> Result<()> {
        let (io, timer) = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Ok(());
            }
            debug!(peer = ?state.peer, error = ?error, "aborting connection");
            state.closed = true;
            state.teardown_pending = true;
            state.teardown_error = error;
            state.flush_callback = None;
            (state.io.take(), state.timer.take())
        };
        if let Some(io) = io {
            io.cancel();
        }
        if let Some(timer) = timer {
            timer.cancel();
        }
        self.settle()
    }

    fn take_socket_error(&self) -> io::Error {
        let state = self.state.borrow();
        state
            .socket
            .as_ref()
            .and_then(|socket| socket.take_error().ok().flatten())
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error"))
    }

    /// Run a protocol callback with the protocol box taken out of the
    /// state, then deliver whatever notifications became due while it was
    /// out.
    fn with_protocol(&self, f: impl FnOnce(&mut dyn Protocol) -> Result<()>) -> Result<()> {
        let proto = self.state.borrow_mut().protocol.take();
        let Some(mut proto) = proto else {
            return Ok(());
        };
        let result = f(proto.as_mut());
        self.state.borrow_mut().protocol = Some(proto);
        let settled = self.settle();
        result.and(settled)
    }

    /// Deliver due notifications one at a time until none is left. Breaks
    /// instead of blocking when the protocol box is out on the stack; the
    /// frame that holds it settles again after putting it back.
    fn settle(&self) -> Result<()> {
        loop {
            let action = {
                let mut state = self.state.borrow_mut();
                if state.closed {
                    if !state.teardown_pending {
                        break;
                    }
                    match state.protocol.take() {
                        Some(protocol) => {
                            state.teardown_pending = false;
                            let error = state.teardown_error.take();
                            Settle::Lost(protocol, error)
                        }
                        None => break,
                    }
                } else if state.caps.flow_control
                    && !state.protocol_paused
                    && state.buffer.len() > state.high
                {
                    match state.protocol.take() {
                        Some(protocol) => {
                            state.protocol_paused = true;
                            Settle::Pause(protocol)
                        }
                        None => break,
                    }
                } else if state.caps.flow_control
                    && state.protocol_paused
                    && state.buffer.len() < state.low
                {
                    match state.protocol.take() {
                        Some(protocol) => {
                            state.protocol_paused = false;
                            Settle::Resume(protocol)
                        }
                        None => break,
                    }
                } else if state.buffer.is_empty() {
                    match state.flush_callback.take() {
                        Some(callback) => Settle::Flush(callback),
                        None => break,
                    }
                } else {
                    break;
                }
            };

            match action {
                Settle::Lost(mut protocol, error) => {
                    debug!(error = ?error, "connection lost");
                    protocol.connection_lost(error);
                    let (on_close, socket, fd) = {
                        let mut state = self.state.borrow_mut();
                        (state.on_close.take(), state.socket.take(), state.fd)
                    };
                    if let Some(mut on_close) = on_close {
                        on_close(fd);
                    }
                    if let Some(socket) = socket {
                        let _ = socket.shutdown(Shutdown::Both);
                    }
                }
                Settle::Pause(mut protocol) => {
                    trace!("write buffer above high-water mark");
                    let result = protocol.pause_writing();
                    self.state.borrow_mut().protocol = Some(protocol);
                    result?;
                }
                Settle::Resume(mut protocol) => {
                    trace!("write buffer below low-water mark");
                    let result = protocol.resume_writing();
                    self.state.borrow_mut().protocol = Some(protocol);
                    result?;
                }
                Settle::Flush(callback) => callback()?,
            }
        }
        Ok(())
    }
}
