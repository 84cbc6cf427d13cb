//! Backend binding over a level-triggered readiness multiplexer.
//!
//! Wraps `popol` (`poll(2)`) with the two extensions the reactor needs: io
//! sources keyed by watcher id with mutable interest masks, and POSIX signal
//! delivery bridged through per-signal wake pipes. Since `poll` is
//! level-triggered, a source stays ready until it is drained; nothing here
//! needs to loop on a single readiness event.

use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use hashbrown::HashMap;
use signal_hook::low_level;
use smallvec::SmallVec;
use tracing::trace;

use crate::error::Result;
use crate::event::Event;
use crate::reactor::WatcherId;

/// Maximum amount of time to wait for i/o when no timer bounds the sleep.
const WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Eq, PartialEq)]
enum Token {
    Io(WatcherId),
    Signal(i32),
}

/// Raw fd wrapper so sources can be registered without borrowing the fd's
/// owner for the lifetime of the registration.
struct Fd(RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct SignalPipe {
    reader: UnixStream,
    // The write end must stay open for as long as the hook is registered.
    _writer: UnixStream,
    hook: signal_hook::SigId,
    watchers: usize,
}

/// One unit of readiness out of a poll wakeup.
pub(crate) enum Ready {
    Io(WatcherId, Event),
    Signal(i32),
}

pub(crate) struct Poller {
    sources: popol::Sources<Token>,
    events: Vec<popol::Event<Token>>,
    signals: HashMap<i32, SignalPipe>,
}

impl Poller {
    pub fn new() -> Poller {
        Poller {
            sources: popol::Sources::new(),
            events: Vec::new(),
            signals: HashMap::new(),
        }
    }

    pub fn register_io(&mut self, id: WatcherId, fd: RawFd, mask: Event) {
        self.sources
            .register(Token::Io(id), &Fd(fd), popol::interest::ALL);
        self.set_io(id, mask);
    }

    pub fn unregister_io(&mut self, id: WatcherId) {
        self.sources.unregister(&Token::Io(id));
    }

    pub fn set_io(&mut self, id: WatcherId, mask: Event) {
        if let Some(source) = self.sources.get_mut(&Token::Io(id)) {
            source.unset(popol::interest::ALL);
            if mask.contains(Event::READ) {
                source.set(popol::interest::READ);
            }
            if mask.contains(Event::WRITE) {
                source.set(popol::interest::WRITE);
            }
        }
    }

    /// Hook `signo` into the poll loop. Registrations are refcounted per
    /// signal number.
    pub fn watch_signal(&mut self, signo: i32) -> Result<()> {
        if let Some(pipe) = self.signals.get_mut(&signo) {
            pipe.watchers += 1;
            return Ok(());
        }
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        let hook = low_level::pipe::register_raw(signo, writer.as_raw_fd())?;
        self.sources
            .register(Token::Signal(signo), &reader, popol::interest::READ);
        self.signals.insert(
            signo,
            SignalPipe {
                reader,
                _writer: writer,
                hook,
                watchers: 1,
            },
        );
        trace!(signo, "signal hooked");
        Ok(())
    }

    pub fn unwatch_signal(&mut self, signo: i32) {
        let drained = match self.signals.get_mut(&signo) {
            Some(pipe) => {
                pipe.watchers -= 1;
                pipe.watchers == 0
            }
            None => false,
        };
        if drained {
            if let Some(pipe) = self.signals.remove(&signo) {
                low_level::unregister(pipe.hook);
                self.sources.unregister(&Token::Signal(signo));
                trace!(signo, "signal unhooked");
            }
        }
    }

    /// Wait for readiness. `TimedOut` and `Interrupted` yield an empty
    /// batch; any other backend error is fatal to the reactor.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<SmallVec<[Ready; 8]>> {
        let timeout = timeout.unwrap_or(WAIT_TIMEOUT);
        let mut ready = SmallVec::new();

        match self.sources.wait_timeout(&mut self.events, timeout) {
            Ok(_) => {}
            Err(err)
                if err.kind() == io::ErrorKind::TimedOut
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(ready);
            }
            Err(err) => return Err(err.into()),
        }

        for event in self.events.drain(..) {
            match &event.key {
                Token::Io(id) => {
                    if event.is_invalid() {
                        // Stale fd; the owning watcher gets disarmed lazily.
                        continue;
                    }
                    let mut mask = Event::NONE;
                    if event.is_readable() || event.is_hangup() {
                        mask |= Event::READ;
                    }
                    if event.is_writable() {
                        mask |= Event::WRITE;
                    }
                    if event.is_error() {
                        mask |= Event::ERROR;
                    }
                    if !mask.is_empty() {
                        ready.push(Ready::Io(*id, mask));
                    }
                }
                Token::Signal(signo) => {
                    if let Some(pipe) = self.signals.get(signo) {
                        drain(&pipe.reader);
                        ready.push(Ready::Signal(*signo));
                    }
                }
            }
        }
        Ok(ready)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        for (_, pipe) in self.signals.drain() {
            low_level::unregister(pipe.hook);
        }
    }
}

fn drain(mut reader: &UnixStream) {
    let mut buf = [0u8; 64];
    while let Ok(n) = reader.read(&mut buf) {
        if n == 0 {
            break;
        }
    }
}
