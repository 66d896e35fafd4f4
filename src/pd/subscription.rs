// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The subscription table (C2): matching, timeout tracking and delivery
//! (spec.md §4.2).

use crate::clock::Clock;
use crate::codec::header::Header;
use crate::error::{Error, Result};
use crate::handle::{Arena, Handle};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What happens to the cached payload once a subscription's deadline fires
/// with nothing received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutBehaviour {
    /// Keep the last-received payload, flagged stale.
    Keep,
    /// Wipe the cached payload.
    ZeroOnTimeout,
}

/// `FORCE_CB`: accept a repeated sequence number as a duplicate delivery
/// instead of silently dropping it (spec.md §4.2 "Sequence policy").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionFlags {
    pub force_cb: bool,
    /// Validate every delivered payload against the matching comId's
    /// dataset descriptor before the callback runs (spec.md §4.8); a frame
    /// that fails to unmarshal is dropped like a CRC error instead of
    /// reaching the callback.
    pub marshalled: bool,
}

/// A subscription's matching identity (spec.md §3 "Subscription element").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub com_id: u32,
    pub service_id: u32,
    pub src_ip1: Option<Ipv4Addr>,
    pub src_ip2: Option<Ipv4Addr>,
    pub dest: Ipv4Addr,
    pub etb_topo_cnt: u32,
    pub op_trn_topo_cnt: u32,
}

impl Identity {
    fn is_wildcard_source(&self) -> bool {
        self.src_ip1.is_none() && self.src_ip2.is_none()
    }

    fn source_matches(&self, incoming: Ipv4Addr) -> bool {
        self.src_ip1 == Some(incoming) || self.src_ip2 == Some(incoming)
    }
}

/// What a subscriber callback is told on each event.
#[derive(Debug, Clone)]
pub enum Event {
    Delivered { payload: Vec<u8>, sequence_counter: u32 },
    Timeout,
}

pub type Callback = Arc<dyn Fn(Handle<Subscription>, Event) + Send + Sync>;

pub struct Subscription {
    pub identity: Identity,
    pub timeout: Duration,
    pub behaviour: TimeoutBehaviour,
    pub flags: SubscriptionFlags,
    pub cached_payload: Option<Vec<u8>>,
    pub last_sequence: Option<u32>,
    pub deadline: Instant,
    /// Latched the first time a deadline fires with nothing received;
    /// cleared only by [`Table::deliver`] seeing a fresh frame. Keeps
    /// `check_timeouts` from re-firing every subsequent sweep while the
    /// publisher stays silent (spec.md §4.2 property: exactly one timeout
    /// callback per silence, not one per sweep).
    timed_out: bool,
    /// Bumped on subscribe/resubscribe; breaks ties among several
    /// matching subscriptions in favour of the most recently updated one.
    epoch: u64,
    callback: Callback,
}

impl Subscription {
    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

pub struct Table {
    subscriptions: Arena<Subscription>,
    next_epoch: u64,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table { subscriptions: Arena::new(), next_epoch: 0 }
    }

    pub fn subscribe(
        &mut self,
        identity: Identity,
        flags: SubscriptionFlags,
        timeout: Duration,
        behaviour: TimeoutBehaviour,
        callback: Callback,
        clock: &dyn Clock,
    ) -> Handle<Subscription> {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.subscriptions.insert(Subscription {
            identity,
            timeout,
            behaviour,
            flags,
            cached_payload: None,
            last_sequence: None,
            deadline: clock.now() + timeout,
            timed_out: false,
            epoch,
            callback,
        })
    }

    /// Swap the source filter (and optionally destination/topo) of an
    /// existing subscription — the inauguration hook (spec.md §4.2).
    pub fn resubscribe(&mut self, handle: Handle<Subscription>, new_identity: Identity) -> Result<()> {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let sub = self.subscriptions.get_mut(handle).ok_or(Error::InvalidHandle)?;
        sub.identity = new_identity;
        sub.epoch = epoch;
        sub.timed_out = false;
        Ok(())
    }

    pub fn unsubscribe(&mut self, handle: Handle<Subscription>) -> Result<()> {
        self.subscriptions.remove(handle).ok_or(Error::InvalidHandle)?;
        Ok(())
    }

    pub fn get(&self, handle: Handle<Subscription>) -> Option<&Subscription> {
        self.subscriptions.get(handle)
    }

    /// Find the best-matching subscription for an incoming PD telegram,
    /// applying the ordered rules of spec.md §4.2.
    pub fn match_incoming(
        &self,
        header: &Header,
        incoming_source: Ipv4Addr,
        incoming_dest: Ipv4Addr,
    ) -> Option<Handle<Subscription>> {
        let mut best: Option<(Handle<Subscription>, &Subscription, bool)> = None;
        for (handle, sub) in self.subscriptions.iter() {
            if sub.identity.etb_topo_cnt != header.etb_topo_cnt
                || sub.identity.op_trn_topo_cnt != header.op_trn_topo_cnt
            {
                continue;
            }
            if sub.identity.com_id != header.com_id || sub.identity.service_id != header.service_id {
                continue;
            }
            if sub.identity.dest != incoming_dest {
                continue;
            }
            let exact_source = sub.identity.source_matches(incoming_source);
            if !exact_source && !sub.identity.is_wildcard_source() {
                continue;
            }
            let is_better = match &best {
                None => true,
                Some((_, _, best_exact)) => {
                    // Rule 3: an exact-source match always beats a wildcard
                    // one; among ties, rule 5: highest epoch (most recent).
                    (exact_source && !best_exact)
                        || (exact_source == *best_exact && sub.epoch > best.as_ref().unwrap().1.epoch)
                }
            };
            if is_better {
                best = Some((handle, sub, exact_source));
            }
        }
        best.map(|(handle, _, _)| handle)
    }

    /// Deliver a payload to `handle`, applying the sequence policy and
    /// refreshing the arrival deadline. Returns `Ok(false)` if the packet
    /// was a stale/duplicate sequence number and was silently dropped.
    pub fn deliver(
        &mut self,
        handle: Handle<Subscription>,
        payload: Vec<u8>,
        sequence_counter: u32,
        clock: &dyn Clock,
    ) -> Result<bool> {
        let sub = self.subscriptions.get_mut(handle).ok_or(Error::InvalidHandle)?;
        if let Some(last) = sub.last_sequence {
            let is_duplicate_or_stale = sequence_counter < last
                || (sequence_counter == last && !sub.flags.force_cb);
            if is_duplicate_or_stale {
                return Ok(false);
            }
        }
        sub.last_sequence = Some(sequence_counter);
        sub.cached_payload = Some(payload.clone());
        sub.deadline = clock.now() + sub.timeout;
        sub.timed_out = false;
        (sub.callback)(handle, Event::Delivered { payload, sequence_counter });
        Ok(true)
    }

    /// Fire a timeout callback for every subscription past its deadline that
    /// hasn't already fired one since its last delivery. A timeout never
    /// removes the subscription, and never repeats on its own — only a fresh
    /// delivery re-arms it (spec.md §4.2).
    pub fn check_timeouts(&mut self, clock: &dyn Clock) {
        let now = clock.now();
        for (handle, sub) in self.subscriptions.iter_mut() {
            if !sub.is_stale(now) || sub.timed_out {
                continue;
            }
            if sub.behaviour == TimeoutBehaviour::ZeroOnTimeout {
                sub.cached_payload = None;
            }
            sub.timed_out = true;
            (sub.callback)(handle, Event::Timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity(com_id: u32, dest: Ipv4Addr) -> Identity {
        Identity {
            com_id,
            service_id: 0,
            src_ip1: None,
            src_ip2: None,
            dest,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
        }
    }

    #[test]
    fn wildcard_source_matches_any_sender() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        let dest = Ipv4Addr::new(239, 0, 0, 1);
        let handle = table.subscribe(
            identity(1000, dest),
            SubscriptionFlags::default(),
            Duration::from_millis(300),
            TimeoutBehaviour::ZeroOnTimeout,
            Arc::new(|_, _| {}),
            &clock,
        );
        let header = Header {
            msg_type: crate::constant::MsgType::Pd,
            com_id: 1000,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            service_id: 0,
            sequence_counter: 1,
            payload_length: 0,
            tail: crate::codec::header::Tail::Pd {
                reply_com_id: 0,
                reply_ip: Ipv4Addr::UNSPECIFIED,
            },
        };
        let matched = table.match_incoming(&header, Ipv4Addr::new(10, 0, 0, 5), dest);
        assert_eq!(matched, Some(handle));
    }

    #[test]
    fn exact_source_beats_wildcard() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        let dest = Ipv4Addr::new(239, 0, 0, 1);
        let wildcard = identity(1000, dest);
        let mut exact = identity(1000, dest);
        exact.src_ip1 = Some(Ipv4Addr::new(10, 0, 0, 5));
        table.subscribe(
            wildcard,
            SubscriptionFlags::default(),
            Duration::from_millis(300),
            TimeoutBehaviour::Keep,
            Arc::new(|_, _| {}),
            &clock,
        );
        let exact_handle = table.subscribe(
            exact,
            SubscriptionFlags::default(),
            Duration::from_millis(300),
            TimeoutBehaviour::Keep,
            Arc::new(|_, _| {}),
            &clock,
        );
        let header = Header {
            msg_type: crate::constant::MsgType::Pd,
            com_id: 1000,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            service_id: 0,
            sequence_counter: 1,
            payload_length: 0,
            tail: crate::codec::header::Tail::Pd {
                reply_com_id: 0,
                reply_ip: Ipv4Addr::UNSPECIFIED,
            },
        };
        let matched = table.match_incoming(&header, Ipv4Addr::new(10, 0, 0, 5), dest);
        assert_eq!(matched, Some(exact_handle));
    }

    #[test]
    fn duplicate_sequence_is_dropped_unless_force_cb() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        let dest = Ipv4Addr::new(239, 0, 0, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let handle = table.subscribe(
            identity(1000, dest),
            SubscriptionFlags::default(),
            Duration::from_millis(300),
            TimeoutBehaviour::Keep,
            Arc::new(move |_, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
            &clock,
        );
        assert!(table.deliver(handle, vec![1], 5, &clock).unwrap());
        assert!(!table.deliver(handle, vec![2], 5, &clock).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn force_cb_accepts_repeated_sequence() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        let dest = Ipv4Addr::new(239, 0, 0, 1);
        let handle = table.subscribe(
            identity(1000, dest),
            SubscriptionFlags { force_cb: true, ..SubscriptionFlags::default() },
            Duration::from_millis(300),
            TimeoutBehaviour::Keep,
            Arc::new(|_, _| {}),
            &clock,
        );
        assert!(table.deliver(handle, vec![1], 5, &clock).unwrap());
        assert!(table.deliver(handle, vec![2], 5, &clock).unwrap());
    }

    #[test]
    fn timeout_wipes_cache_when_zero_on_timeout() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        let dest = Ipv4Addr::new(239, 0, 0, 1);
        let handle = table.subscribe(
            identity(1000, dest),
            SubscriptionFlags::default(),
            Duration::from_millis(100),
            TimeoutBehaviour::ZeroOnTimeout,
            Arc::new(|_, _| {}),
            &clock,
        );
        table.deliver(handle, vec![9, 9], 1, &clock).unwrap();
        clock.advance(Duration::from_millis(150));
        table.check_timeouts(&clock);
        assert_eq!(table.get(handle).unwrap().cached_payload, None);
    }

    #[test]
    fn timeout_keeps_cache_when_keep_behaviour() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        let dest = Ipv4Addr::new(239, 0, 0, 1);
        let handle = table.subscribe(
            identity(1000, dest),
            SubscriptionFlags::default(),
            Duration::from_millis(100),
            TimeoutBehaviour::Keep,
            Arc::new(|_, _| {}),
            &clock,
        );
        table.deliver(handle, vec![9, 9], 1, &clock).unwrap();
        clock.advance(Duration::from_millis(150));
        table.check_timeouts(&clock);
        assert_eq!(table.get(handle).unwrap().cached_payload, Some(vec![9, 9]));
    }

    #[test]
    fn timeout_fires_exactly_once_until_new_data_arrives() {
        let clock = ManualClock::new();
        let mut table = Table::new();
        let dest = Ipv4Addr::new(239, 0, 0, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let handle = table.subscribe(
            identity(1000, dest),
            SubscriptionFlags::default(),
            Duration::from_millis(100),
            TimeoutBehaviour::ZeroOnTimeout,
            Arc::new(move |_, event| {
                if matches!(event, Event::Timeout) {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                }
            }),
            &clock,
        );
        table.deliver(handle, vec![1], 1, &clock).unwrap();

        // The publisher never resumes: three full timeout windows pass with
        // `check_timeouts` swept repeatedly in each, but only the first
        // sweep past the deadline should ever fire.
        clock.advance(Duration::from_millis(150));
        table.check_timeouts(&clock);
        table.check_timeouts(&clock);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_millis(100));
        table.check_timeouts(&clock);
        clock.advance(Duration::from_millis(100));
        table.check_timeouts(&clock);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "timeout must not re-fire while silence continues");

        // A fresh delivery re-arms the latch for the next silence.
        table.deliver(handle, vec![2], 2, &clock).unwrap();
        clock.advance(Duration::from_millis(150));
        table.check_timeouts(&clock);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
