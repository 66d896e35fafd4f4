// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The publisher scheduler (C3): cyclic emission, `put`/`put_immediate`,
//! redundancy-group leadership, and pull-mode publications (spec.md §4.3).

use crate::clock::Clock;
use crate::dataset::marshal::DatasetValue;
use crate::dataset::registry::Registry as DatasetRegistry;
use crate::dataset::{self};
use crate::error::{Error, Result};
use crate::handle::{Arena, Handle};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublicationFlags {
    pub tsn: bool,
    pub tcp: bool,
    pub marshalled: bool,
    pub callback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub com_id: u32,
    pub service_id: u32,
    pub source: Ipv4Addr,
    pub dest: Ipv4Addr,
    pub etb_topo_cnt: u32,
    pub op_trn_topo_cnt: u32,
}

/// An emission ready to go out: a snapshot of a due publication's state at
/// the moment `process_send` picked it up.
#[derive(Debug, Clone)]
pub struct Emission {
    pub identity: Identity,
    pub payload: Vec<u8>,
    pub sequence_counter: u32,
    pub flags: PublicationFlags,
    pub qos: u8,
    pub ttl: u8,
}

pub struct Publication {
    pub identity: Identity,
    /// `Duration::ZERO` marks a pull-mode publication (spec.md §4.3).
    pub interval: Duration,
    pub redundancy_group: Option<u32>,
    pub is_leader: bool,
    pub flags: PublicationFlags,
    pub qos: u8,
    pub ttl: u8,
    payload: Vec<u8>,
    sequence_counter: u32,
    next_emit: Instant,
    emit_now: bool,
}

impl Publication {
    fn is_pull_mode(&self) -> bool {
        self.interval.is_zero()
    }

    fn snapshot(&self) -> Emission {
        Emission {
            identity: self.identity,
            payload: self.payload.clone(),
            sequence_counter: self.sequence_counter,
            flags: self.flags,
            qos: self.qos,
            ttl: self.ttl,
        }
    }
}

pub struct Table {
    publications: Arena<Publication>,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table { publications: Arena::new() }
    }

    /// `qos`/`ttl` come from the caller (normally a session's `PdConfig`
    /// defaults — see `Session::publish`); this table has no config of its
    /// own to fall back on.
    pub fn publish(
        &mut self,
        identity: Identity,
        interval: Duration,
        redundancy_group: Option<u32>,
        flags: PublicationFlags,
        qos: u8,
        ttl: u8,
        initial_payload: Vec<u8>,
        clock: &dyn Clock,
    ) -> Handle<Publication> {
        self.publications.insert(Publication {
            identity,
            interval,
            redundancy_group,
            is_leader: true,
            flags,
            qos,
            ttl,
            payload: initial_payload,
            sequence_counter: 0,
            next_emit: clock.now() + interval,
            emit_now: false,
        })
    }

    pub fn unpublish(&mut self, handle: Handle<Publication>) -> Result<()> {
        self.publications.remove(handle).ok_or(Error::InvalidHandle)?;
        Ok(())
    }

    pub fn get(&self, handle: Handle<Publication>) -> Option<&Publication> {
        self.publications.get(handle)
    }

    /// Atomically swap the staged payload; the next due tick sends this
    /// snapshot (spec.md §4.3).
    pub fn put(&mut self, handle: Handle<Publication>, payload: Vec<u8>) -> Result<()> {
        let pub_ = self.publications.get_mut(handle).ok_or(Error::InvalidHandle)?;
        pub_.payload = payload;
        pub_.sequence_counter = pub_.sequence_counter.wrapping_add(1);
        Ok(())
    }

    /// Like `put`, but also forces emission on the current tick regardless
    /// of phase.
    pub fn put_immediate(&mut self, handle: Handle<Publication>, payload: Vec<u8>) -> Result<()> {
        self.put(handle, payload)?;
        let pub_ = self.publications.get_mut(handle).ok_or(Error::InvalidHandle)?;
        pub_.emit_now = true;
        Ok(())
    }

    /// Marshal `value` through `registry` and stage the result exactly as
    /// [`Table::put`] would. Requires `flags.marshalled` — a publication not
    /// flagged for dataset marshalling has no declared dataset to validate
    /// `value` against.
    pub fn put_dataset(
        &mut self,
        handle: Handle<Publication>,
        registry: &DatasetRegistry,
        value: &DatasetValue,
    ) -> Result<()> {
        let com_id = {
            let pub_ = self.publications.get(handle).ok_or(Error::InvalidHandle)?;
            if !pub_.flags.marshalled {
                return Err(Error::State("publication is not flagged for dataset marshalling"));
            }
            pub_.identity.com_id
        };
        let mut bytes = Vec::new();
        dataset::marshal(registry, com_id, value, &mut bytes)?;
        self.put(handle, bytes)
    }

    /// Like [`Table::put_dataset`], but also forces emission this tick.
    pub fn put_dataset_immediate(
        &mut self,
        handle: Handle<Publication>,
        registry: &DatasetRegistry,
        value: &DatasetValue,
    ) -> Result<()> {
        self.put_dataset(handle, registry, value)?;
        let pub_ = self.publications.get_mut(handle).ok_or(Error::InvalidHandle)?;
        pub_.emit_now = true;
        Ok(())
    }

    /// The inauguration hook: re-point a publication at a new destination
    /// (primary case) and, optionally, a new source. See DESIGN.md Open
    /// Question 1: destination swap is the default; source is only changed
    /// when explicitly supplied.
    pub fn republish(
        &mut self,
        handle: Handle<Publication>,
        new_dest: Ipv4Addr,
        new_source: Option<Ipv4Addr>,
    ) -> Result<()> {
        let pub_ = self.publications.get_mut(handle).ok_or(Error::InvalidHandle)?;
        pub_.identity.dest = new_dest;
        if let Some(source) = new_source {
            pub_.identity.source = source;
        }
        Ok(())
    }

    pub fn set_leader(&mut self, handle: Handle<Publication>, is_leader: bool) -> Result<()> {
        let pub_ = self.publications.get_mut(handle).ok_or(Error::InvalidHandle)?;
        pub_.is_leader = is_leader;
        Ok(())
    }

    /// The scheduler's due-time, for `get_interval`: `min(next_emit)` over
    /// every non-pull publication.
    pub fn next_due(&self) -> Option<Instant> {
        self.publications
            .values()
            .filter(|p| !p.is_pull_mode())
            .map(|p| p.next_emit)
            .min()
    }

    /// Advance every due publication by exactly one interval and collect
    /// the emissions for the leaders; followers in a redundancy group
    /// still advance their sequence counter in lockstep but stay silent.
    pub fn process_send(&mut self, now: Instant) -> Vec<Emission> {
        let mut emissions = Vec::new();
        for (_, pub_) in self.publications.iter_mut() {
            if pub_.is_pull_mode() {
                continue;
            }
            let due = pub_.next_emit <= now || pub_.emit_now;
            if !due {
                continue;
            }
            if pub_.next_emit <= now {
                // Advance by one interval rather than resetting to
                // `now + interval`, so long-run cadence stays true even if
                // a cycle slipped (spec.md §4.3).
                pub_.next_emit += pub_.interval;
            }
            pub_.emit_now = false;
            let should_emit = pub_.redundancy_group.is_none() || pub_.is_leader;
            if should_emit {
                emissions.push(pub_.snapshot());
            }
        }
        emissions
    }

    /// A pull-mode publication emits exactly one response to an incoming
    /// PD-pull request.
    pub fn emit_pull_response(&self, handle: Handle<Publication>) -> Result<Emission> {
        let pub_ = self.publications.get(handle).ok_or(Error::InvalidHandle)?;
        if !pub_.is_pull_mode() {
            return Err(Error::State("publication is not pull-mode"));
        }
        Ok(pub_.snapshot())
    }

    pub fn find_by_com_id(&self, com_id: u32) -> Option<Handle<Publication>> {
        self.publications.iter().find(|(_, p)| p.identity.com_id == com_id).map(|(h, _)| h)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<Publication>, &Publication)> {
        self.publications.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn identity(com_id: u32) -> Identity {
        Identity {
            com_id,
            service_id: 0,
            source: Ipv4Addr::new(10, 0, 0, 1),
            dest: Ipv4Addr::new(239, 0, 0, 1),
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
        }
    }

    #[test]
    fn emits_on_cadence_without_drifting() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        table.publish(
            identity(1000),
            Duration::from_millis(100),
            None,
            PublicationFlags::default(),
            5,
            64,
            b"Hello".to_vec(),
            &clock,
        );
        let mut emitted = 0;
        for _ in 0..20 {
            clock.advance(Duration::from_millis(100));
            emitted += table.process_send(clock.now()).len();
        }
        assert_eq!(emitted, 20);
    }

    #[test]
    fn put_immediate_forces_emission_this_tick() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        let handle = table.publish(
            identity(1000),
            Duration::from_millis(100),
            None,
            PublicationFlags::default(),
            5,
            64,
            vec![],
            &clock,
        );
        table.put_immediate(handle, b"now".to_vec()).unwrap();
        let emissions = table.process_send(clock.now());
        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].payload, b"now");
    }

    #[test]
    fn only_leader_emits_within_redundancy_group() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        let leader = table.publish(
            identity(1000),
            Duration::from_millis(100),
            Some(1),
            PublicationFlags::default(),
            5,
            64,
            vec![1],
            &clock,
        );
        let follower = table.publish(
            identity(1000),
            Duration::from_millis(100),
            Some(1),
            PublicationFlags::default(),
            5,
            64,
            vec![1],
            &clock,
        );
        table.set_leader(follower, false).unwrap();
        clock.advance(Duration::from_millis(100));
        let emissions = table.process_send(clock.now());
        assert_eq!(emissions.len(), 1);
        assert!(table.get(leader).unwrap().is_leader);
        assert!(!table.get(follower).unwrap().is_leader);
    }

    #[test]
    fn pull_mode_never_emits_on_its_own() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        table.publish(
            identity(2000),
            Duration::ZERO,
            None,
            PublicationFlags::default(),
            5,
            64,
            vec![],
            &clock,
        );
        clock.advance(Duration::from_secs(10));
        assert!(table.process_send(clock.now()).is_empty());
    }

    #[test]
    fn pull_mode_emits_exactly_once_on_request() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        let handle = table.publish(
            identity(2000),
            Duration::ZERO,
            None,
            PublicationFlags::default(),
            5,
            64,
            b"pulled".to_vec(),
            &clock,
        );
        let emission = table.emit_pull_response(handle).unwrap();
        assert_eq!(emission.payload, b"pulled");
    }

    #[test]
    fn republish_swaps_destination_by_default() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        let handle = table.publish(
            identity(1000),
            Duration::from_millis(100),
            None,
            PublicationFlags::default(),
            5,
            64,
            vec![],
            &clock,
        );
        table.republish(handle, Ipv4Addr::new(239, 0, 0, 9), None).unwrap();
        assert_eq!(table.get(handle).unwrap().identity.dest, Ipv4Addr::new(239, 0, 0, 9));
        assert_eq!(table.get(handle).unwrap().identity.source, Ipv4Addr::new(10, 0, 0, 1));
    }

    fn dataset_registry() -> DatasetRegistry {
        use crate::dataset::types::{Count, Dataset, Element, ElementKind, Primitive};
        let mut registry = DatasetRegistry::new();
        registry.define(Dataset {
            id: 1,
            elements: vec![Element { kind: ElementKind::Primitive(Primitive::Uint16), count: Count::Fixed(1) }],
        });
        registry.bind_com_id(1000, 1).unwrap();
        registry
    }

    #[test]
    fn put_dataset_marshals_through_registry() {
        use crate::dataset::marshal::{Field, Value};
        let clock = ManualClock::new();
        let registry = dataset_registry();
        let mut table = Table::new();
        let handle = table.publish(
            identity(1000),
            Duration::from_millis(100),
            None,
            PublicationFlags { marshalled: true, ..PublicationFlags::default() },
            5,
            64,
            vec![],
            &clock,
        );
        let value = DatasetValue { dataset_id: 1, fields: vec![Field::Scalar(Value::U16(42))] };
        table.put_dataset(handle, &registry, &value).unwrap();
        let emissions = {
            clock.advance(Duration::from_millis(100));
            table.process_send(clock.now())
        };
        assert_eq!(emissions[0].payload, vec![0, 42]);
    }

    #[test]
    fn put_dataset_rejects_publication_not_flagged_marshalled() {
        use crate::dataset::marshal::{Field, Value};
        let clock = ManualClock::new();
        let registry = dataset_registry();
        let mut table = Table::new();
        let handle = table.publish(
            identity(1000),
            Duration::from_millis(100),
            None,
            PublicationFlags::default(),
            5,
            64,
            vec![],
            &clock,
        );
        let value = DatasetValue { dataset_id: 1, fields: vec![Field::Scalar(Value::U16(42))] };
        assert!(matches!(table.put_dataset(handle, &registry, &value), Err(Error::State(_))));
    }
}
