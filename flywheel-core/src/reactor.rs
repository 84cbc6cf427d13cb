//! The reactor: a single-threaded event dispatcher.
//!
//! One reactor owns one thread of execution. Watcher callbacks and deferred
//! calls all run on that thread, serially; the only suspension point is
//! returning from a callback into the dispatch loop.
//!
//! Watchers hold a non-owning handle into the reactor's slot registry. Slot
//! ids are never reused, so an event collected for a watcher that was
//! cancelled in the meantime is dropped at dispatch time.

use std::cell::RefCell;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::event::{Event, Priority};
use crate::poller::{Poller, Ready};
use crate::watcher::{IdleWatcher, SignalWatcher, TimerWatcher, Watcher};

pub(crate) type WatcherId = u64;

pub(crate) type Callback = Rc<RefCell<dyn FnMut(&Watcher, Event) -> Result<()>>>;
type Deferred = Box<dyn FnOnce() -> Result<()>>;

pub(crate) enum Kind {
    Io { fd: RawFd, mask: Event },
    Timer { period: f64, seq: u64 },
    Signal { signo: i32 },
    Idle,
    Cleanup,
}

pub(crate) struct Slot {
    pub kind: Kind,
    pub priority: Priority,
    pub active: bool,
    pub callback: Callback,
}

struct TimerEntry {
    deadline: Instant,
    id: WatcherId,
    seq: u64,
}

// `BinaryHeap` is a max-heap; order entries so the nearest deadline wins and
// ties resolve to the earliest-created watcher.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

struct Pending {
    id: WatcherId,
    events: Event,
    priority: Priority,
}

enum ArmAction {
    Io(RawFd, Event),
    Timer(f64),
    Signal(i32),
    Nothing,
}

enum DisarmAction {
    Io,
    Timer,
    Signal(i32),
    Nothing,
}

pub(crate) struct Inner {
    slots: HashMap<WatcherId, Slot>,
    next_id: WatcherId,
    timers: BinaryHeap<TimerEntry>,
    next_seq: u64,
    deferred: VecDeque<Deferred>,
    idle_pump: Option<IdleWatcher>,
    poller: Poller,
    origin: Instant,
    running: bool,
    stop_requested: bool,
    closed: bool,
}

impl Inner {
    fn new() -> Inner {
        Inner {
            slots: HashMap::new(),
            next_id: 1,
            timers: BinaryHeap::new(),
            next_seq: 0,
            deferred: VecDeque::new(),
            idle_pump: None,
            poller: Poller::new(),
            origin: Instant::now(),
            running: false,
            stop_requested: false,
            closed: false,
        }
    }

    fn time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub(crate) fn register(&mut self, kind: Kind, callback: Callback) -> Result<WatcherId> {
        if self.closed {
            return Err(Error::LoopClosed);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(
            id,
            Slot {
                kind,
                priority: Priority::NORMAL,
                active: false,
                callback,
            },
        );
        Ok(id)
    }

    pub(crate) fn arm(&mut self, id: WatcherId) -> Result<()> {
        let action = {
            let slot = self.slots.get(&id).ok_or(Error::WatcherCancelled)?;
            if slot.active {
                return Ok(());
            }
            match slot.kind {
                Kind::Io { fd, mask } => ArmAction::Io(fd, mask),
                Kind::Timer { period, .. } => ArmAction::Timer(period),
                Kind::Signal { signo } => ArmAction::Signal(signo),
                Kind::Idle | Kind::Cleanup => ArmAction::Nothing,
            }
        };
        match action {
            ArmAction::Io(fd, mask) => self.poller.register_io(id, fd, mask),
            ArmAction::Timer(period) => {
                let seq = self.bump_seq();
                if let Some(Slot {
                    kind: Kind::Timer { seq: slot_seq, .. },
                    ..
                }) = self.slots.get_mut(&id)
                {
                    *slot_seq = seq;
                }
                if period > 0.0 {
                    self.timers.push(TimerEntry {
                        deadline: Instant::now() + Duration::from_secs_f64(period),
                        id,
                        seq,
                    });
                }
            }
            ArmAction::Signal(signo) => self.poller.watch_signal(signo)?,
            ArmAction::Nothing => {}
        }
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.active = true;
        }
        Ok(())
    }

    pub(crate) fn disarm(&mut self, id: WatcherId) -> bool {
        let action = {
            let Some(slot) = self.slots.get_mut(&id) else {
                return false;
            };
            if !slot.active {
                return false;
            }
            slot.active = false;
            match slot.kind {
                Kind::Io { .. } => DisarmAction::Io,
                Kind::Timer { .. } => DisarmAction::Timer,
                Kind::Signal { signo } => DisarmAction::Signal(signo),
                Kind::Idle | Kind::Cleanup => DisarmAction::Nothing,
            }
        };
        match action {
            DisarmAction::Io => self.poller.unregister_io(id),
            DisarmAction::Timer => {
                // Lazily invalidate any scheduled heap entries.
                let seq = self.bump_seq();
                if let Some(Slot {
                    kind: Kind::Timer { seq: slot_seq, .. },
                    ..
                }) = self.slots.get_mut(&id)
                {
                    *slot_seq = seq;
                }
            }
            DisarmAction::Signal(signo) => self.poller.unwatch_signal(signo),
            DisarmAction::Nothing => {}
        }
        true
    }

    pub(crate) fn remove(&mut self, id: WatcherId) {
        self.disarm(id);
        self.slots.remove(&id);
    }

    pub(crate) fn is_registered(&self, id: WatcherId) -> bool {
        self.slots.contains_key(&id)
    }

    pub(crate) fn is_armed(&self, id: WatcherId) -> bool {
        self.slots.get(&id).map_or(false, |slot| slot.active)
    }

    pub(crate) fn priority(&self, id: WatcherId) -> Priority {
        self.slots
            .get(&id)
            .map_or(Priority::NORMAL, |slot| slot.priority)
    }

    pub(crate) fn set_priority(&mut self, id: WatcherId, priority: Priority) {
        let was_armed = self.disarm(id);
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.priority = priority;
        }
        if was_armed {
            if let Err(err) = self.arm(id) {
                error!(%err, "failed to re-arm watcher after priority change");
            }
        }
    }

    pub(crate) fn io_mask(&self, id: WatcherId) -> Event {
        match self.slots.get(&id) {
            Some(Slot {
                kind: Kind::Io { mask, .. },
                ..
            }) => *mask,
            _ => Event::NONE,
        }
    }

    pub(crate) fn set_io_mask(&mut self, id: WatcherId, mask: Event) {
        let mask = mask & (Event::READ | Event::WRITE);
        let armed = match self.slots.get_mut(&id) {
            Some(slot) => {
                if let Kind::Io { mask: slot_mask, .. } = &mut slot.kind {
                    *slot_mask = mask;
                }
                slot.active
            }
            None => return,
        };
        if armed {
            self.poller.set_io(id, mask);
        }
    }

    pub(crate) fn timer_seconds(&self, id: WatcherId) -> f64 {
        match self.slots.get(&id) {
            Some(Slot {
                kind: Kind::Timer { period, .. },
                ..
            }) => *period,
            _ => 0.0,
        }
    }

    pub(crate) fn set_timer_seconds(&mut self, id: WatcherId, seconds: f64) {
        if let Some(Slot {
            kind: Kind::Timer { period, .. },
            ..
        }) = self.slots.get_mut(&id)
        {
            *period = seconds;
        }
    }

    /// Whether anything armed can still produce an event. Cleanup watchers
    /// only fire at teardown and do not keep the loop alive.
    fn has_work(&self) -> bool {
        !self.deferred.is_empty()
            || self
                .slots
                .values()
                .any(|slot| slot.active && !matches!(slot.kind, Kind::Cleanup))
    }

    fn timer_entry_valid(slots: &HashMap<WatcherId, Slot>, entry: &TimerEntry) -> bool {
        matches!(
            slots.get(&entry.id),
            Some(Slot {
                active: true,
                kind: Kind::Timer { seq, .. },
                ..
            }) if *seq == entry.seq
        )
    }

    fn poll_timeout(&mut self) -> Option<Duration> {
        if self
            .slots
            .values()
            .any(|slot| slot.active && matches!(slot.kind, Kind::Idle))
        {
            return Some(Duration::ZERO);
        }
        let now = Instant::now();
        loop {
            let deadline = match self.timers.peek() {
                None => return None,
                Some(entry) if Self::timer_entry_valid(&self.slots, entry) => Some(entry.deadline),
                Some(_) => None,
            };
            match deadline {
                Some(deadline) => return Some(deadline.saturating_duration_since(now)),
                None => {
                    self.timers.pop();
                }
            }
        }
    }

    fn collect_batch(&mut self, ready: SmallVec<[Ready; 8]>) -> SmallVec<[Pending; 8]> {
        let mut batch: SmallVec<[Pending; 8]> = SmallVec::new();

        for item in ready {
            match item {
                Ready::Io(id, events) => {
                    if let Some(Slot {
                        active: true,
                        kind: Kind::Io { mask, .. },
                        priority,
                        ..
                    }) = self.slots.get(&id)
                    {
                        // Deliver only requested readiness, plus errors.
                        let delivered = events & (*mask | Event::ERROR);
                        if !delivered.is_empty() {
                            batch.push(Pending {
                                id,
                                events: delivered,
                                priority: *priority,
                            });
                        }
                    }
                }
                Ready::Signal(signo) => {
                    let mut hooked: SmallVec<[(WatcherId, Priority); 4]> = self
                        .slots
                        .iter()
                        .filter(|(_, slot)| {
                            slot.active && matches!(slot.kind, Kind::Signal { signo: s } if s == signo)
                        })
                        .map(|(&id, slot)| (id, slot.priority))
                        .collect();
                    hooked.sort_by_key(|&(id, _)| id);
                    for (id, priority) in hooked {
                        batch.push(Pending {
                            id,
                            events: Event::SIGNAL,
                            priority,
                        });
                    }
                }
            }
        }

        // Expired timers, in deadline order; repeating timers reschedule at
        // `deadline + period`, so a late wakeup replays missed ticks in
        // schedule order instead of silently dropping them.
        let now = Instant::now();
        loop {
            let expired = match self.timers.peek() {
                Some(entry) if entry.deadline <= now => (entry.id, entry.seq, entry.deadline),
                _ => break,
            };
            self.timers.pop();
            let (id, seq, deadline) = expired;
            let period = match self.slots.get(&id) {
                Some(Slot {
                    active: true,
                    kind: Kind::Timer { period, seq: s },
                    priority,
                    ..
                }) if *s == seq => {
                    batch.push(Pending {
                        id,
                        events: Event::TIMER,
                        priority: *priority,
                    });
                    *period
                }
                _ => continue,
            };
            if period > 0.0 {
                self.timers.push(TimerEntry {
                    deadline: deadline + Duration::from_secs_f64(period),
                    id,
                    seq,
                });
            }
        }

        // Idle watchers fire when nothing of equal or higher priority is
        // pending in this iteration.
        let max_priority = batch.iter().map(|pending| pending.priority).max();
        let mut idles: SmallVec<[(WatcherId, Priority); 2]> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.active && matches!(slot.kind, Kind::Idle))
            .map(|(&id, slot)| (id, slot.priority))
            .collect();
        idles.sort_by_key(|&(id, _)| id);
        for (id, priority) in idles {
            if max_priority.map_or(true, |max| max < priority) {
                batch.push(Pending {
                    id,
                    events: Event::IDLE,
                    priority,
                });
            }
        }

        batch.sort_by_key(|pending| Reverse(pending.priority));
        batch
    }
}

/// A single-threaded event dispatcher bound to one poll backend.
///
/// Handles are cheap clones of the same reactor; they are `!Send`, which
/// pins every reactor to the thread that created it. When the last handle
/// is dropped the reactor closes: every live watcher receives a CLEANUP
/// event and is then cancelled.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<Inner>>,
}

/// Non-owning reactor reference for callbacks that must not keep the
/// reactor alive.
#[derive(Clone)]
pub struct WeakReactor {
    inner: Weak<RefCell<Inner>>,
}

impl WeakReactor {
    pub fn upgrade(&self) -> Option<Reactor> {
        self.inner.upgrade().map(|inner| Reactor { inner })
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    #[must_use]
    pub fn new() -> Reactor {
        Reactor {
            inner: Rc::new(RefCell::new(Inner::new())),
        }
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakReactor {
        WeakReactor {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn weak_inner(&self) -> Weak<RefCell<Inner>> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn register(&self, kind: Kind, callback: Callback) -> Result<WatcherId> {
        self.inner.borrow_mut().register(kind, callback)
    }

    /// Enter the dispatch loop. Returns after [`Reactor::stop`], when no
    /// armed watcher is left that could produce an event, or with the first
    /// error: backend failures and user-callback errors both propagate out
    /// of here.
    pub fn start(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(Error::LoopClosed);
            }
            if inner.running {
                return Err(Error::Busy);
            }
            inner.running = true;
            inner.stop_requested = false;
        }
        let result = self.dispatch();
        let mut inner = self.inner.borrow_mut();
        inner.running = false;
        inner.stop_requested = false;
        result
    }

    fn dispatch(&self) -> Result<()> {
        loop {
            let timeout = {
                let mut inner = self.inner.borrow_mut();
                if inner.stop_requested {
                    trace!("dispatch: stop requested");
                    return Ok(());
                }
                if !inner.has_work() {
                    trace!("dispatch: nothing left to wait for");
                    return Ok(());
                }
                inner.poll_timeout()
            };

            let batch = {
                let mut inner = self.inner.borrow_mut();
                let inner = &mut *inner;
                let ready = inner.poller.wait(timeout)?;
                inner.collect_batch(ready)
            };

            for pending in batch {
                if self.inner.borrow().stop_requested {
                    return Ok(());
                }
                let callback = {
                    let inner = self.inner.borrow();
                    match inner.slots.get(&pending.id) {
                        Some(slot) if slot.active => slot.callback.clone(),
                        _ => continue,
                    }
                };
                let watcher = Watcher::from_parts(self.weak_inner(), pending.id);
                (&mut *callback.borrow_mut())(&watcher, pending.events)?;
                if pending.events.contains(Event::CLEANUP) {
                    watcher.cancel();
                }
            }
        }
    }

    /// Request dispatch to exit at the next safe point.
    pub fn stop(&self) {
        self.inner.borrow_mut().stop_requested = true;
    }

    /// Queue `f` for deferred execution at the next idle pass. Deferred
    /// calls run in FIFO order, one per pass, and never before the current
    /// callback returns.
    pub fn call(&self, f: impl FnOnce() -> Result<()> + 'static) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(Error::LoopClosed);
            }
            inner.deferred.push_back(Box::new(f));
        }
        self.ensure_idle_pump()
    }

    fn ensure_idle_pump(&self) -> Result<()> {
        let existing = self.inner.borrow().idle_pump.clone();
        let pump = match existing {
            Some(pump) => pump,
            None => {
                let weak = self.weak_inner();
                let pump = IdleWatcher::new(self, move |watcher, events| {
                    if events.contains(Event::CLEANUP) {
                        return Ok(());
                    }
                    let Some(inner) = weak.upgrade() else {
                        return Ok(());
                    };
                    let (item, disarm) = {
                        let mut inner = inner.borrow_mut();
                        // Self-disarm when this pass empties the queue.
                        let disarm = inner.deferred.len() <= 1;
                        (inner.deferred.pop_front(), disarm)
                    };
                    if disarm {
                        watcher.stop();
                    }
                    match item {
                        Some(item) => item(),
                        None => Ok(()),
                    }
                })?;
                // Deferred work runs ahead of same-iteration io and timers.
                pump.set_priority(Priority::HIGHEST);
                self.inner.borrow_mut().idle_pump = Some(pump.clone());
                pump
            }
        };
        pump.start()?;
        Ok(())
    }

    /// Register a one-shot timeout `delay` seconds from now. The watcher is
    /// cancelled after it fires; the returned handle can cancel it earlier.
    pub fn on_timeout(
        &self,
        delay: f64,
        f: impl FnOnce() -> Result<()> + 'static,
    ) -> Result<TimerWatcher> {
        let mut f = Some(f);
        let watcher = TimerWatcher::new(self, delay, move |watcher, events| {
            if events.contains(Event::CLEANUP) {
                return Ok(());
            }
            let result = match f.take() {
                Some(f) => f(),
                None => Ok(()),
            };
            watcher.cancel();
            result
        })?;
        watcher.start()?;
        Ok(watcher)
    }

    /// Register a one-shot hook for POSIX signal `signo`; semantics
    /// otherwise identical to [`Reactor::on_timeout`].
    pub fn on_signal(
        &self,
        signo: i32,
        f: impl FnOnce() -> Result<()> + 'static,
    ) -> Result<SignalWatcher> {
        let mut f = Some(f);
        let watcher = SignalWatcher::new(self, signo, move |watcher, events| {
            if events.contains(Event::CLEANUP) {
                return Ok(());
            }
            let result = match f.take() {
                Some(f) => f(),
                None => Ok(()),
            };
            watcher.cancel();
            result
        })?;
        watcher.start()?;
        Ok(watcher)
    }

    /// Current monotonic timestamp in seconds.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.inner.borrow().time()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Tear the reactor down: deliver CLEANUP to every live watcher in
    /// priority order, cancel it, and release the backend. Idempotent; also
    /// runs when the last handle is dropped. Pending deferred calls are
    /// abandoned. Callback errors during teardown are logged, not raised.
    pub fn close(&self) {
        let cascade = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.deferred.clear();
            inner.idle_pump = None;
            let mut live: Vec<(WatcherId, Priority)> = inner
                .slots
                .iter()
                .map(|(&id, slot)| (id, slot.priority))
                .collect();
            live.sort_by_key(|&(id, priority)| (Reverse(priority), id));
            live
        };
        debug!(watchers = cascade.len(), "reactor teardown");
        for (id, _) in cascade {
            let callback = {
                let inner = self.inner.borrow();
                match inner.slots.get(&id) {
                    Some(slot) => slot.callback.clone(),
                    None => continue,
                }
            };
            let watcher = Watcher::from_parts(self.weak_inner(), id);
            match callback.try_borrow_mut() {
                Ok(mut callback) => {
                    if let Err(err) = (&mut *callback)(&watcher, Event::CLEANUP) {
                        error!(%err, "cleanup callback failed");
                    }
                }
                // The callback is on the stack right now; cancelling is all
                // that is left to do for it.
                Err(_) => {}
            }
            watcher.cancel();
        }
        let mut inner = self.inner.borrow_mut();
        inner.slots.clear();
        inner.timers.clear();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            self.close();
        }
    }
}

thread_local! {
    static DEFAULT: RefCell<Option<Reactor>> = const { RefCell::new(None) };
}

/// The default reactor of the current thread, created on first access and
/// torn down when the thread exits. Reactor handles are `!Send`, so every
/// thread gets its own.
#[must_use]
pub fn default_reactor() -> Reactor {
    DEFAULT.with(|cell| {
        let mut slot = cell.borrow_mut();
        match &*slot {
            Some(reactor) if !reactor.is_closed() => reactor.clone(),
            _ => {
                let reactor = Reactor::new();
                *slot = Some(reactor.clone());
                reactor
            }
        }
    })
}
