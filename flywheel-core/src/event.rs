//! Event bitmask and dispatch priorities.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bitmask of event kinds delivered to watcher callbacks.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Event(u32);

impl Event {
    /// Empty mask.
    pub const NONE: Event = Event(0);
    /// File descriptor is readable.
    pub const READ: Event = Event(0x1);
    /// File descriptor is writable.
    pub const WRITE: Event = Event(0x2);
    /// A timer period elapsed.
    pub const TIMER: Event = Event(0x4);
    /// A watched signal was delivered.
    pub const SIGNAL: Event = Event(0x8);
    /// The reactor had nothing of equal or higher priority to dispatch.
    pub const IDLE: Event = Event(0x10);
    /// The reactor is being torn down; the watcher cancels itself after the
    /// callback returns.
    pub const CLEANUP: Event = Event(0x20);
    /// The event source reported an error condition.
    pub const ERROR: Event = Event(0x40);

    /// Whether all bits of `other` are set in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set in `self`.
    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Event) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `self` with the bits of `other` removed.
    #[inline]
    #[must_use]
    pub const fn remove(self, other: Event) -> Event {
        Event(self.0 & !other.0)
    }
}

impl BitOr for Event {
    type Output = Event;

    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;

    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Event, &str); 7] = [
            (Event::READ, "READ"),
            (Event::WRITE, "WRITE"),
            (Event::TIMER, "TIMER"),
            (Event::SIGNAL, "SIGNAL"),
            (Event::IDLE, "IDLE"),
            (Event::CLEANUP, "CLEANUP"),
            (Event::ERROR, "ERROR"),
        ];
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Watcher dispatch priority.
///
/// Five levels; within one dispatch batch, higher-priority watchers fire
/// before lower ones. Constructors clamp to the valid range.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Priority(i8);

impl Priority {
    pub const LOWEST: Priority = Priority(-2);
    pub const LOW: Priority = Priority(-1);
    pub const NORMAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(1);
    pub const HIGHEST: Priority = Priority(2);

    /// Build a priority from a raw level, clamped to `-2..=2`.
    #[must_use]
    pub fn new(level: i8) -> Priority {
        Priority(level.clamp(Self::LOWEST.0, Self::HIGHEST.0))
    }

    #[must_use]
    pub const fn level(self) -> i8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bit_ops() {
        let mask = Event::READ | Event::WRITE;
        assert!(mask.contains(Event::READ));
        assert!(mask.contains(Event::WRITE));
        assert!(!mask.contains(Event::TIMER));
        assert!(mask.intersects(Event::READ | Event::TIMER));
        assert!(!mask.intersects(Event::TIMER | Event::SIGNAL));
        assert_eq!(mask.remove(Event::WRITE), Event::READ);
        assert_eq!(mask & Event::READ, Event::READ);
        assert!(Event::NONE.is_empty());
    }

    #[test]
    fn test_event_debug_lists_bits() {
        assert_eq!(format!("{:?}", Event::NONE), "NONE");
        assert_eq!(format!("{:?}", Event::READ | Event::CLEANUP), "READ|CLEANUP");
    }

    #[test]
    fn test_priority_clamps() {
        assert_eq!(Priority::new(7), Priority::HIGHEST);
        assert_eq!(Priority::new(-7), Priority::LOWEST);
        assert_eq!(Priority::new(1), Priority::HIGH);
        assert_eq!(Priority::default(), Priority::NORMAL);
        assert!(Priority::HIGH > Priority::LOW);
    }
}
