//! Watcher handles.
//!
//! A watcher is a subscription to one event kind on a reactor. Handles are
//! cheap clones holding a non-owning reference into the reactor's slot
//! registry; reactor teardown reaches every watcher that was not cancelled,
//! armed or not. Once cancelled (or once the reactor is gone) a handle is
//! permanently dead: `start` fails and everything else is a no-op.

use std::cell::RefCell;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::event::{Event, Priority};
use crate::reactor::{Callback, Inner, Kind, Reactor, WatcherId};

/// Untyped watcher handle; the typed wrappers deref to this.
#[derive(Clone)]
pub struct Watcher {
    inner: Weak<RefCell<Inner>>,
    id: WatcherId,
}

impl Watcher {
    pub(crate) fn from_parts(inner: Weak<RefCell<Inner>>, id: WatcherId) -> Watcher {
        Watcher { inner, id }
    }

    fn register(
        reactor: &Reactor,
        kind: Kind,
        callback: impl FnMut(&Watcher, Event) -> Result<()> + 'static,
    ) -> Result<Watcher> {
        let callback: Callback = Rc::new(RefCell::new(callback));
        let id = reactor.register(kind, callback)?;
        Ok(Watcher::from_parts(reactor.weak_inner(), id))
    }

    /// Arm the watcher. Fails with [`Error::WatcherCancelled`] once the
    /// watcher was cancelled or its reactor is gone.
    pub fn start(&self) -> Result<&Self> {
        let inner = self.inner.upgrade().ok_or(Error::WatcherCancelled)?;
        inner.borrow_mut().arm(self.id)?;
        Ok(self)
    }

    /// Disarm the watcher. Returns whether it was previously armed.
    pub fn stop(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.borrow_mut().disarm(self.id),
            None => false,
        }
    }

    /// Disarm and permanently deregister the watcher. Idempotent.
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().remove(self.id);
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.borrow().is_armed(self.id),
            None => false,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => !inner.borrow().is_registered(self.id),
            None => true,
        }
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        match self.inner.upgrade() {
            Some(inner) => inner.borrow().priority(self.id),
            None => Priority::NORMAL,
        }
    }

    /// Change the dispatch priority; an armed watcher is transparently
    /// re-armed so the change takes effect.
    pub fn set_priority(&self, priority: Priority) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().set_priority(self.id, priority);
        }
    }
}

/// I/O readiness watcher over a raw file descriptor.
#[derive(Clone)]
pub struct IoWatcher(Watcher);

impl IoWatcher {
    /// Subscribe `fd` with the given READ/WRITE interest mask. The watcher
    /// is created disarmed.
    pub fn new(
        reactor: &Reactor,
        fd: RawFd,
        mask: Event,
        callback: impl FnMut(&Watcher, Event) -> Result<()> + 'static,
    ) -> Result<IoWatcher> {
        let mask = mask & (Event::READ | Event::WRITE);
        Ok(IoWatcher(Watcher::register(
            reactor,
            Kind::Io { fd, mask },
            callback,
        )?))
    }

    #[must_use]
    pub fn events(&self) -> Event {
        match self.0.inner.upgrade() {
            Some(inner) => inner.borrow().io_mask(self.0.id),
            None => Event::NONE,
        }
    }

    /// Replace the interest mask; an armed watcher is transparently
    /// re-armed with the new mask.
    pub fn set_events(&self, mask: Event) {
        if let Some(inner) = self.0.inner.upgrade() {
            inner.borrow_mut().set_io_mask(self.0.id, mask);
        }
    }
}

impl Deref for IoWatcher {
    type Target = Watcher;

    fn deref(&self) -> &Watcher {
        &self.0
    }
}

/// Repeating timer watcher. A non-positive period leaves the timer inert
/// even while armed.
#[derive(Clone)]
pub struct TimerWatcher(Watcher);

impl TimerWatcher {
    pub fn new(
        reactor: &Reactor,
        seconds: f64,
        callback: impl FnMut(&Watcher, Event) -> Result<()> + 'static,
    ) -> Result<TimerWatcher> {
        Ok(TimerWatcher(Watcher::register(
            reactor,
            Kind::Timer {
                period: seconds,
                seq: 0,
            },
            callback,
        )?))
    }

    #[must_use]
    pub fn seconds(&self) -> f64 {
        match self.0.inner.upgrade() {
            Some(inner) => inner.borrow().timer_seconds(self.0.id),
            None => 0.0,
        }
    }

    /// Re-time the watcher: a positive value stops the timer, re-initialises
    /// it to repeat every `seconds`, and starts it; a non-positive value
    /// stops it without restarting. No-op once cancelled.
    pub fn set_seconds(&self, seconds: f64) {
        self.0.stop();
        if let Some(inner) = self.0.inner.upgrade() {
            inner.borrow_mut().set_timer_seconds(self.0.id, seconds);
        }
        if seconds > 0.0 {
            let _ = self.0.start();
        }
    }
}

impl Deref for TimerWatcher {
    type Target = Watcher;

    fn deref(&self) -> &Watcher {
        &self.0
    }
}

/// POSIX signal watcher (one signal number per watcher).
#[derive(Clone)]
pub struct SignalWatcher(Watcher);

impl SignalWatcher {
    pub fn new(
        reactor: &Reactor,
        signo: i32,
        callback: impl FnMut(&Watcher, Event) -> Result<()> + 'static,
    ) -> Result<SignalWatcher> {
        Ok(SignalWatcher(Watcher::register(
            reactor,
            Kind::Signal { signo },
            callback,
        )?))
    }
}

impl Deref for SignalWatcher {
    type Target = Watcher;

    fn deref(&self) -> &Watcher {
        &self.0
    }
}

/// Fires whenever a dispatch iteration has nothing of equal or higher
/// priority pending.
#[derive(Clone)]
pub struct IdleWatcher(Watcher);

impl IdleWatcher {
    pub fn new(
        reactor: &Reactor,
        callback: impl FnMut(&Watcher, Event) -> Result<()> + 'static,
    ) -> Result<IdleWatcher> {
        Ok(IdleWatcher(Watcher::register(reactor, Kind::Idle, callback)?))
    }
}

impl Deref for IdleWatcher {
    type Target = Watcher;

    fn deref(&self) -> &Watcher {
        &self.0
    }
}

/// Fires once, when the reactor is torn down.
#[derive(Clone)]
pub struct CleanupWatcher(Watcher);

impl CleanupWatcher {
    pub fn new(
        reactor: &Reactor,
        callback: impl FnMut(&Watcher, Event) -> Result<()> + 'static,
    ) -> Result<CleanupWatcher> {
        Ok(CleanupWatcher(Watcher::register(
            reactor,
            Kind::Cleanup,
            callback,
        )?))
    }
}

impl Deref for CleanupWatcher {
    type Target = Watcher;

    fn deref(&self) -> &Watcher {
        &self.0
    }
}
