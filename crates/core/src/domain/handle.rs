//! Handles for outstanding asynchronous actions
//!
//! A [`Handle`] pairs the action kind with a 12-bit sequence number. The
//! [`HandleTable`] hands out sequences in `1..=4095`, wrapping around and
//! skipping values still held by an outstanding action, and refuses new work
//! once its capacity is reached.

use crate::domain::error::{Result, RoutingError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Largest sequence number a handle can carry
pub const MAX_SEQUENCE: u16 = 0x0FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Connect,
    Disconnect,
    SetSourceState,
    SetSinkVolume,
    SetSourceVolume,
    SetVolumes,
    SetSinkSoundProperty,
    SetSinkSoundProperties,
    SetSourceSoundProperty,
    SetSourceSoundProperties,
    CrossFade,
}

impl HandleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleKind::Connect => "connect",
            HandleKind::Disconnect => "disconnect",
            HandleKind::SetSourceState => "set_source_state",
            HandleKind::SetSinkVolume => "set_sink_volume",
            HandleKind::SetSourceVolume => "set_source_volume",
            HandleKind::SetVolumes => "set_volumes",
            HandleKind::SetSinkSoundProperty => "set_sink_sound_property",
            HandleKind::SetSinkSoundProperties => "set_sink_sound_properties",
            HandleKind::SetSourceSoundProperty => "set_source_sound_property",
            HandleKind::SetSourceSoundProperties => "set_source_sound_properties",
            HandleKind::CrossFade => "cross_fade",
        }
    }
}

/// Correlation token for one outstanding action
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle {
    kind: HandleKind,
    sequence: u16,
}

impl Handle {
    /// Build a handle from its parts; the sequence is masked to 12 bits
    pub const fn new(kind: HandleKind, sequence: u16) -> Self {
        Self {
            kind,
            sequence: sequence & MAX_SEQUENCE,
        }
    }

    pub const fn kind(&self) -> HandleKind {
        self.kind
    }

    pub const fn sequence(&self) -> u16 {
        self.sequence
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind.as_str(), self.sequence)
    }
}

#[derive(Debug)]
struct Slot<T> {
    kind: HandleKind,
    value: T,
}

/// Bounded table of outstanding handles and their bookkeeping
#[derive(Debug)]
pub struct HandleTable<T> {
    capacity: usize,
    last_sequence: u16,
    slots: BTreeMap<u16, Slot<T>>,
}

impl<T> HandleTable<T> {
    /// Create a table admitting at most `capacity` outstanding handles
    ///
    /// The capacity is clamped to the sequence space.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.min(usize::from(MAX_SEQUENCE)),
            last_sequence: 0,
            slots: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.slots.len())
    }

    pub fn is_full(&self) -> bool {
        self.free_slots() == 0
    }

    /// Allocate a handle of `kind` holding `value`
    ///
    /// Fails with [`RoutingError::NotPossible`] when the table is full.
    pub fn insert(&mut self, kind: HandleKind, value: T) -> Result<Handle> {
        if self.is_full() {
            return Err(RoutingError::NotPossible);
        }

        let mut sequence = self.last_sequence;
        loop {
            sequence = if sequence >= MAX_SEQUENCE { 1 } else { sequence + 1 };
            if !self.slots.contains_key(&sequence) {
                break;
            }
        }

        self.last_sequence = sequence;
        self.slots.insert(sequence, Slot { kind, value });
        Ok(Handle::new(kind, sequence))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(&handle.sequence)
            .filter(|slot| slot.kind == handle.kind)
            .map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(&handle.sequence)
            .filter(|slot| slot.kind == handle.kind)
            .map(|slot| &mut slot.value)
    }

    /// Retire a handle, returning its bookkeeping
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        match self.slots.get(&handle.sequence) {
            Some(slot) if slot.kind == handle.kind => {
                self.slots.remove(&handle.sequence).map(|slot| slot.value)
            }
            _ => None,
        }
    }

    /// Outstanding handles in sequence order
    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .map(|(sequence, slot)| Handle::new(slot.kind, *sequence))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots
            .iter()
            .map(|(sequence, slot)| (Handle::new(slot.kind, *sequence), &slot.value))
    }
}
