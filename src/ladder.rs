// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The redundancy / ladder layer (C7, spec.md §4.7): two sessions, one per
//! subnet, sharing a single Traffic Store. Each subscription writes its
//! payload at a fixed offset; one subnet is the writer at a time, chosen by
//! a link-up/down signal and swapped atomically on failover. Publishers
//! duplicate onto both subnets; the far-side reader deduplicates by
//! sequence number.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Which physical subnet currently owns the writer role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subnet {
    A,
    B,
}

impl Subnet {
    fn other(self) -> Subnet {
        match self {
            Subnet::A => Subnet::B,
            Subnet::B => Subnet::A,
        }
    }
}

/// A fixed-offset reservation inside the Traffic Store, one per
/// subscription/publication the ladder tracks.
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: usize,
    len: usize,
    last_sequence: Option<u32>,
}

struct Inner {
    buffer: Vec<u8>,
    slots: HashMap<u32, Slot>,
    writer: Subnet,
    /// Bumped every time the writer role or a slot's addressing changes;
    /// `republish`/`resubscribe` on both sessions must land in the same
    /// epoch (spec.md §4.7 invariant) before any reader sees either side's
    /// update alone.
    epoch: u64,
}

/// The named, mutex-guarded contiguous region both ladder sessions share.
/// Modelled as an in-process region (SPEC_FULL.md §1 Non-goals: no true
/// cross-process shared memory), but the locking discipline — scoped
/// acquisition, guaranteed release — is the real cross-process contract.
pub struct TrafficStore {
    inner: Mutex<Inner>,
}

impl TrafficStore {
    pub fn new(capacity: usize) -> TrafficStore {
        TrafficStore {
            inner: Mutex::new(Inner {
                buffer: vec![0u8; capacity],
                slots: HashMap::new(),
                writer: Subnet::A,
                epoch: 0,
            }),
        }
    }

    /// Reserve `len` bytes at `offset` for `com_id`. Must happen before any
    /// write/read against that comId (spec.md §4.7 invariant: no session
    /// writes into an offset it hasn't reserved).
    pub fn reserve(&self, com_id: u32, offset: usize, len: usize) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| Error::Mutex)?;
        if offset + len > inner.buffer.len() {
            return Err(Error::Param("slot exceeds traffic store capacity"));
        }
        inner.slots.insert(com_id, Slot { offset, len, last_sequence: None });
        Ok(())
    }

    /// The writer subnet writes its snapshot. A write from the non-writer
    /// subnet is accepted too (both sessions "emit the same snapshot";
    /// spec.md §4.7), but only a write from the current writer — or a
    /// first-ever write after a failover — advances the dedup cursor so
    /// the non-writer's stale copy can't resurrect an old sequence number.
    pub fn write(
        &self,
        from: Subnet,
        com_id: u32,
        sequence_counter: u32,
        payload: &[u8],
    ) -> Result<bool> {
        let mut inner = self.inner.lock().map_err(|_| Error::Mutex)?;
        let is_writer = inner.writer == from;
        let slot = *inner.slots.get(&com_id).ok_or(Error::Param("unreserved comId"))?;
        if payload.len() > slot.len {
            return Err(Error::Param("payload exceeds reserved slot"));
        }
        let is_duplicate = match inner.slots[&com_id].last_sequence {
            Some(last) => sequence_counter <= last,
            None => false,
        };
        if is_duplicate && !is_writer {
            return Ok(false);
        }
        inner.buffer[slot.offset..slot.offset + payload.len()].copy_from_slice(payload);
        if let Some(stored) = inner.slots.get_mut(&com_id) {
            stored.last_sequence = Some(sequence_counter);
        }
        Ok(true)
    }

    /// Read the current snapshot for `com_id`, regardless of which subnet
    /// wrote it last — the application always reads one logical value.
    pub fn read(&self, com_id: u32) -> Result<Vec<u8>> {
        let inner = self.inner.lock().map_err(|_| Error::Mutex)?;
        let slot = *inner.slots.get(&com_id).ok_or(Error::Param("unreserved comId"))?;
        Ok(inner.buffer[slot.offset..slot.offset + slot.len].to_vec())
    }

    pub fn writer(&self) -> Subnet {
        self.inner.lock().map(|inner| inner.writer).unwrap_or(Subnet::A)
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().map(|inner| inner.epoch).unwrap_or(0)
    }

    /// Link-down on the current writer's subnet: the other subnet becomes
    /// the writer atomically, under the same lock that guards every read/
    /// write, and the epoch is bumped so the next `republish`/`resubscribe`
    /// pair is recognisably a fresh inauguration.
    pub fn fail_over(&self) -> Result<Subnet> {
        let mut inner = self.inner.lock().map_err(|_| Error::Mutex)?;
        inner.writer = inner.writer.other();
        inner.epoch += 1;
        Ok(inner.writer)
    }
}

/// One physical link's up/down state, as reported by the OS to the ladder
/// layer. A pure signal the caller feeds in — this crate has no NIC polling
/// of its own (SPEC_FULL.md §1 Non-goals: OS-specific wrappers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// Binds two application sessions — one per subnet — to a shared Traffic
/// Store, and drives failover from link-state signals.
pub struct Ladder {
    pub subnet_a: Ipv4Addr,
    pub subnet_b: Ipv4Addr,
    pub store: TrafficStore,
    link_a: LinkState,
    link_b: LinkState,
}

impl Ladder {
    pub fn new(subnet_a: Ipv4Addr, subnet_b: Ipv4Addr, store_capacity: usize) -> Ladder {
        Ladder {
            subnet_a,
            subnet_b,
            store: TrafficStore::new(store_capacity),
            link_a: LinkState::Up,
            link_b: LinkState::Up,
        }
    }

    /// Feed a link-state change for one subnet. Only a transition on the
    /// *current writer's* subnet to `Down` triggers a failover; every other
    /// transition just updates the tracked state.
    pub fn on_link_state(&mut self, subnet: Subnet, state: LinkState) -> Option<Subnet> {
        match subnet {
            Subnet::A => self.link_a = state,
            Subnet::B => self.link_b = state,
        }
        let writer = self.store.writer();
        let writer_down = match writer {
            Subnet::A => self.link_a == LinkState::Down,
            Subnet::B => self.link_b == LinkState::Down,
        };
        if subnet == writer && writer_down {
            self.store.fail_over().ok()
        } else {
            None
        }
    }

    pub fn writer_address(&self) -> Ipv4Addr {
        match self.store.writer() {
            Subnet::A => self.subnet_a,
            Subnet::B => self.subnet_b,
        }
    }
}
