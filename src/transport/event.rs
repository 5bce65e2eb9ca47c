//! Link events and the observer list that delivers them.

use heapless::Vec;

use crate::transport::{LinkError, config::MAX_OBSERVERS};

/// Bit set selecting which events an observer receives.
///
/// Bits 0-7 are reserved for events every link produces. Device drivers
/// built on a link use [`EventMask::device`] for their own bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EventMask(pub u32);

impl EventMask {
    pub const NONE: Self = Self(0);
    /// Interrupt-register overlay observed an interrupt; `value` holds the flags.
    pub const INTERRUPT: Self = Self(1 << 0);
    /// A transfer failed or the device reported an error.
    pub const ERROR: Self = Self(1 << 1);
    /// A register value in the table was updated from the wire.
    pub const REGISTER_CHANGED: Self = Self(1 << 2);
    /// The device reset; cached register values are stale.
    pub const DEVICE_RESET: Self = Self(1 << 3);
    pub const ALL: Self = Self(u32::MAX);

    /// Device-specific event bit `n`, mapped above the reserved range.
    pub const fn device(n: u8) -> Self {
        Self(1 << (8 + (n as u32 % 24)))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl core::ops::BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One event delivered to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEvent<'e> {
    /// Single event bit.
    pub kind: EventMask,
    pub register: Option<u8>,
    /// Scalar view of `data`, or event-specific value (interrupt flags).
    pub value: u32,
    pub data: &'e [u8],
    pub error: Option<LinkError>,
}

impl<'e> LinkEvent<'e> {
    pub fn new(kind: EventMask) -> Self {
        Self {
            kind,
            register: None,
            value: 0,
            data: &[],
            error: None,
        }
    }

    pub fn with_register(mut self, register: u8) -> Self {
        self.register = Some(register);
        self
    }

    pub fn with_value(mut self, value: u32) -> Self {
        self.value = value;
        self
    }

    pub fn with_data(mut self, data: &'e [u8]) -> Self {
        self.data = data;
        self
    }

    pub fn with_error(mut self, error: LinkError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Returned by an observer that could not handle an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("observer failed to handle event")]
pub struct ObserverError;

/// Observer callback.
pub type Observer = fn(&LinkEvent<'_>) -> Result<(), ObserverError>;

/// Snapshot of the observers matching one event.
pub type ObserverSet = Vec<Observer, MAX_OBSERVERS>;

#[derive(Clone, Copy)]
struct Registration {
    observer: Observer,
    mask: EventMask,
    id: u16,
}

/// Ordered observer registrations.
///
/// Identifier 0 is anonymous and may repeat. A non-zero identifier is
/// unique: registering it again replaces the previous callback and mask in
/// place, keeping its position in the delivery order.
#[derive(Default)]
pub struct ObserverList {
    entries: Vec<Registration, MAX_OBSERVERS>,
}

impl ObserverList {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(&mut self, observer: Observer, mask: EventMask, id: u16) -> Result<(), LinkError> {
        let registration = Registration { observer, mask, id };
        if id != 0 {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
                *entry = registration;
                return Ok(());
            }
        }
        self.entries
            .push(registration)
            .map_err(|_| LinkError::ObserverTableFull)
    }

    /// Removes the registration with identifier `id`. Returns whether one existed.
    pub fn unregister(&mut self, id: u16) -> bool {
        if id == 0 {
            return false;
        }
        match self.entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Observers subscribed to `kind`, in registration order.
    pub fn matching(&self, kind: EventMask) -> ObserverSet {
        let mut set = ObserverSet::new();
        for entry in self.entries.iter().filter(|e| e.mask.intersects(kind)) {
            // capacities are equal, cannot overflow
            let _ = set.push(entry.observer);
        }
        set
    }
}

/// Calls every observer in order. A failing observer is logged and skipped.
pub(crate) fn deliver(observers: &[Observer], event: &LinkEvent<'_>) {
    for observer in observers {
        if let Err(err) = observer(event) {
            log::warn!("observer failed for event {:#x}: {}", event.kind.bits(), err);
        }
    }
}
