// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The MD session engine (C4): notify / request-reply / request-reply-confirm
//! state machines (spec.md §4.4).
//!
//! ```text
//!     IDLE
//!       │ send Mn (notify)
//!       └─▶ DONE
//!       │ send Mr (request)
//!       └─▶ AWAITING_REPLY ──timeout──▶ FAILED(reply_timeout)
//!                 │ receive Mp
//!                 └─▶ DONE
//!                 │ receive Mq (reply-query)
//!                 └─▶ AWAITING_CONFIRM ──timeout──▶ FAILED(confirm_timeout)
//!                           │ send Mc
//!                           └─▶ DONE
//!                 │ receive Me
//!                 └─▶ FAILED(peer_error)
//! ```
//!
//! `Table` holds sessions on both the requester and replier side, keyed by
//! UUID (the session's wire identity, spec.md §3). UDP retransmission
//! spacing and the retry budget are resolved in DESIGN.md Open Question 4.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    ReplyTimeout,
    ConfirmTimeout,
    PeerError,
    /// The owning session was closed while this MD session was in flight
    /// (spec.md §4.5 "Cancellation": `close_session` fires `SESSION_ABORT`
    /// for any pending MD session).
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingReply,
    AwaitingConfirm,
}

#[derive(Debug, Clone)]
pub enum Event {
    Reply { payload: Vec<u8> },
    Failed(FailReason),
}

pub type Callback = Arc<dyn Fn(Uuid, Event) + Send + Sync>;

/// A frame the caller must actually put on the wire; the session engine
/// never touches sockets itself (spec.md §5: work functions do no I/O of
/// their own besides what the caller's `process_send` performs).
#[derive(Debug, Clone)]
pub struct Outbound {
    pub msg_type: crate::constant::MsgType,
    pub com_id: u32,
    pub peer: Ipv4Addr,
    pub session_tag: u64,
    pub payload: Vec<u8>,
}

struct Session {
    com_id: u32,
    peer: Ipv4Addr,
    protocol: Protocol,
    state: State,
    expected_replies: u32,
    received_replies: u32,
    deadline: Instant,
    retry_counter: u32,
    max_retries: u32,
    retry_interval: Duration,
    payload: Vec<u8>,
    callback: Callback,
}

pub struct Table {
    sessions: HashMap<Uuid, Session>,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table { sessions: HashMap::new() }
    }

    /// Fire-and-forget; no session is kept after the frame is built
    /// (spec.md §4.4 `notify`).
    pub fn notify(com_id: u32, peer: Ipv4Addr, payload: Vec<u8>) -> Outbound {
        Outbound {
            msg_type: crate::constant::MsgType::Mn,
            com_id,
            peer,
            session_tag: 0,
            payload,
        }
    }

    /// Requester side: open a session awaiting `expected_replies` replies
    /// within `reply_timeout`, retransmitting up to `max_retries` times at
    /// `reply_timeout / (max_retries + 1)` spacing (DESIGN.md Open
    /// Question 4).
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        &mut self,
        com_id: u32,
        peer: Ipv4Addr,
        payload: Vec<u8>,
        expected_replies: u32,
        reply_timeout: Duration,
        max_retries: u32,
        protocol: Protocol,
        callback: Callback,
        now: Instant,
    ) -> (Uuid, Outbound) {
        let uuid = Uuid::new_v4();
        let retry_interval = reply_timeout / (max_retries + 1);
        self.sessions.insert(
            uuid,
            Session {
                com_id,
                peer,
                protocol,
                state: State::AwaitingReply,
                expected_replies,
                received_replies: 0,
                deadline: now + retry_interval,
                retry_counter: 0,
                max_retries,
                retry_interval,
                payload: payload.clone(),
                callback,
            },
        );
        let outbound = Outbound {
            msg_type: crate::constant::MsgType::Mr,
            com_id,
            peer,
            session_tag: crate::codec::header::session_tag(uuid),
            payload,
        };
        (uuid, outbound)
    }

    /// Replier side, plain reply: closes the interaction with no state kept
    /// (spec.md §4.4 `reply`).
    pub fn reply(com_id: u32, peer: Ipv4Addr, session_tag: u64, payload: Vec<u8>) -> Outbound {
        Outbound { msg_type: crate::constant::MsgType::Mp, com_id, peer, session_tag, payload }
    }

    /// Replier side, reply-query: opens a session awaiting `confirm`
    /// within `confirm_timeout`.
    pub fn reply_query(
        &mut self,
        uuid: Uuid,
        com_id: u32,
        peer: Ipv4Addr,
        payload: Vec<u8>,
        confirm_timeout: Duration,
        protocol: Protocol,
        callback: Callback,
        now: Instant,
    ) -> Outbound {
        self.sessions.insert(
            uuid,
            Session {
                com_id,
                peer,
                protocol,
                state: State::AwaitingConfirm,
                expected_replies: 0,
                received_replies: 0,
                deadline: now + confirm_timeout,
                retry_counter: 0,
                max_retries: 0,
                retry_interval: confirm_timeout,
                payload: payload.clone(),
                callback,
            },
        );
        Outbound {
            msg_type: crate::constant::MsgType::Mq,
            com_id,
            peer,
            session_tag: crate::codec::header::session_tag(uuid),
            payload,
        }
    }

    /// Requester side: close a reply-query (spec.md §4.4 `confirm`).
    pub fn confirm(&mut self, uuid: Uuid) -> Result<Outbound> {
        let session = self.sessions.remove(&uuid).ok_or(Error::NoSession)?;
        if session.state != State::AwaitingConfirm {
            return Err(Error::State("confirm called outside AWAITING_CONFIRM"));
        }
        Ok(Outbound {
            msg_type: crate::constant::MsgType::Mc,
            com_id: session.com_id,
            peer: session.peer,
            session_tag: 0,
            payload: Vec::new(),
        })
    }

    /// Requester side: an Mp/Mq arrived for `uuid`. Returns the event the
    /// caller should deliver, if the session reached a terminal or
    /// confirm-pending state.
    pub fn on_reply(&mut self, uuid: Uuid, payload: Vec<u8>) -> Result<()> {
        let session = self.sessions.get_mut(&uuid).ok_or(Error::NoSession)?;
        if session.state != State::AwaitingReply {
            return Err(Error::State("reply received outside AWAITING_REPLY"));
        }
        session.received_replies += 1;
        let done = session.received_replies >= session.expected_replies;
        let callback = session.callback.clone();
        if done {
            self.sessions.remove(&uuid);
        }
        callback(uuid, Event::Reply { payload });
        Ok(())
    }

    /// Requester side: an Mq arrived — move from AWAITING_REPLY into
    /// AWAITING_CONFIRM.
    pub fn on_reply_query(&mut self, uuid: Uuid, confirm_timeout: Duration, now: Instant) -> Result<()> {
        let session = self.sessions.get_mut(&uuid).ok_or(Error::NoSession)?;
        if session.state != State::AwaitingReply {
            return Err(Error::State("reply-query received outside AWAITING_REPLY"));
        }
        session.state = State::AwaitingConfirm;
        session.deadline = now + confirm_timeout;
        Ok(())
    }

    /// Replier side: an Mc arrived for `uuid`, closing an outstanding
    /// reply-query.
    pub fn on_confirm(&mut self, uuid: Uuid) -> Result<()> {
        let session = self.sessions.remove(&uuid).ok_or(Error::NoSession)?;
        if session.state != State::AwaitingConfirm {
            return Err(Error::State("confirm received outside AWAITING_CONFIRM"));
        }
        Ok(())
    }

    /// An Me (peer error) arrived for `uuid` — terminal in either state.
    pub fn on_error(&mut self, uuid: Uuid) -> Result<()> {
        let session = self.sessions.remove(&uuid).ok_or(Error::NoSession)?;
        (session.callback)(uuid, Event::Failed(FailReason::PeerError));
        Ok(())
    }

    /// Advance every session's retransmission/expiry clock. UDP sessions
    /// past their deadline retransmit up to `max_retries` times before
    /// failing; TCP relies on the transport's own reliability, so it never
    /// retransmits at this layer (spec.md §4.4 "UDP vs TCP").
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<Outbound> {
        let mut retransmits = Vec::new();
        let mut to_remove = Vec::new();
        for (&uuid, session) in self.sessions.iter_mut() {
            if now < session.deadline {
                continue;
            }
            match session.state {
                State::AwaitingReply if session.protocol == Protocol::Udp
                    && session.retry_counter < session.max_retries =>
                {
                    session.retry_counter += 1;
                    session.deadline = now + session.retry_interval;
                    retransmits.push(Outbound {
                        msg_type: crate::constant::MsgType::Mr,
                        com_id: session.com_id,
                        peer: session.peer,
                        session_tag: session_tag_for(uuid),
                        payload: session.payload.clone(),
                    });
                }
                State::AwaitingReply => {
                    (session.callback)(uuid, Event::Failed(FailReason::ReplyTimeout));
                    to_remove.push(uuid);
                }
                State::AwaitingConfirm => {
                    (session.callback)(uuid, Event::Failed(FailReason::ConfirmTimeout));
                    to_remove.push(uuid);
                }
            }
        }
        for uuid in to_remove {
            self.sessions.remove(&uuid);
        }
        retransmits
    }

    /// `close_session`'s hook: fire `SESSION_ABORT` for every in-flight
    /// session and drop them all.
    pub fn abort_all(&mut self) {
        for (uuid, session) in self.sessions.drain() {
            (session.callback)(uuid, Event::Failed(FailReason::Aborted));
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Recover the full session UUID from the truncated wire tag (spec.md
    /// §3's "session-UUID (MD only)" field, compacted per the header's
    /// `Tail` layout). A linear scan is fine: sessions in flight at once
    /// number in the tens, not thousands.
    pub fn find_by_tag(&self, session_tag: u64) -> Option<Uuid> {
        self.sessions.keys().find(|&&uuid| session_tag_for(uuid) == session_tag).copied()
    }
}

fn session_tag_for(uuid: Uuid) -> u64 {
    crate::codec::header::session_tag(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn peer() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 2)
    }

    #[test]
    fn request_reply_completes_session() {
        let mut table = Table::new();
        let now = Instant::now();
        let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let (uuid, outbound) = table.request(
            5000,
            peer(),
            b"hi".to_vec(),
            1,
            Duration::from_secs(1),
            5,
            Protocol::Udp,
            Arc::new(move |_, event| events_clone.lock().unwrap().push(event)),
            now,
        );
        assert_eq!(outbound.msg_type, crate::constant::MsgType::Mr);
        table.on_reply(uuid, b"ok".to_vec()).unwrap();
        assert_eq!(table.len(), 0);
        let recorded = events.lock().unwrap();
        assert!(matches!(&recorded[0], Event::Reply { payload } if payload == b"ok"));
    }

    #[test]
    fn reply_query_then_confirm_completes() {
        let mut table = Table::new();
        let now = Instant::now();
        let uuid = Uuid::new_v4();
        table.reply_query(
            uuid,
            5000,
            peer(),
            b"query".to_vec(),
            Duration::from_millis(500),
            Protocol::Udp,
            Arc::new(|_, _| {}),
            now,
        );
        let outbound = table.confirm(uuid).unwrap();
        assert_eq!(outbound.msg_type, crate::constant::MsgType::Mc);
        assert!(table.is_empty());
    }

    #[test]
    fn reply_query_timeout_without_confirm_fires_once() {
        let mut table = Table::new();
        let now = Instant::now();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let uuid = Uuid::new_v4();
        table.reply_query(
            uuid,
            5000,
            peer(),
            b"query".to_vec(),
            Duration::from_millis(500),
            Protocol::Udp,
            Arc::new(move |_, event| {
                if matches!(event, Event::Failed(FailReason::ConfirmTimeout)) {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                }
            }),
            now,
        );
        let later = now + Duration::from_millis(600);
        let retransmits = table.check_timeouts(later);
        assert!(retransmits.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn udp_request_retransmits_before_failing() {
        let mut table = Table::new();
        let now = Instant::now();
        let (uuid, _) = table.request(
            5000,
            peer(),
            b"hi".to_vec(),
            1,
            Duration::from_millis(600),
            2,
            Protocol::Udp,
            Arc::new(|_, _| {}),
            now,
        );
        // retry_interval = 600ms / 3 = 200ms.
        let first = table.check_timeouts(now + Duration::from_millis(200));
        assert_eq!(first.len(), 1);
        assert!(table.sessions.contains_key(&uuid));
        let second = table.check_timeouts(now + Duration::from_millis(400));
        assert_eq!(second.len(), 1);
        let third = table.check_timeouts(now + Duration::from_millis(600));
        assert_eq!(third.len(), 1);
        // Budget exhausted: the next deadline fails the session outright.
        let fourth = table.check_timeouts(now + Duration::from_millis(800));
        assert!(fourth.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn tcp_request_never_retransmits_and_fails_at_deadline() {
        let mut table = Table::new();
        let now = Instant::now();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        table.request(
            5000,
            peer(),
            b"hi".to_vec(),
            1,
            Duration::from_millis(500),
            5,
            Protocol::Tcp,
            Arc::new(move |_, event| {
                if matches!(event, Event::Failed(FailReason::ReplyTimeout)) {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                }
            }),
            now,
        );
        let retransmits = table.check_timeouts(now + Duration::from_millis(600));
        assert!(retransmits.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replier_side_on_confirm_closes_session() {
        let mut table = Table::new();
        let now = Instant::now();
        let uuid = Uuid::new_v4();
        table.reply_query(
            uuid,
            5000,
            peer(),
            b"query".to_vec(),
            Duration::from_millis(500),
            Protocol::Udp,
            Arc::new(|_, _| {}),
            now,
        );
        table.on_confirm(uuid).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn abort_all_fires_aborted_for_every_in_flight_session() {
        let mut table = Table::new();
        let now = Instant::now();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        table.request(
            5000,
            peer(),
            b"hi".to_vec(),
            1,
            Duration::from_secs(1),
            5,
            Protocol::Udp,
            Arc::new(move |_, event| {
                if matches!(event, Event::Failed(FailReason::Aborted)) {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                }
            }),
            now,
        );
        table.abort_all();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn peer_error_fails_session_immediately() {
        let mut table = Table::new();
        let now = Instant::now();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let (uuid, _) = table.request(
            5000,
            peer(),
            b"hi".to_vec(),
            1,
            Duration::from_secs(1),
            5,
            Protocol::Udp,
            Arc::new(move |_, event| {
                if matches!(event, Event::Failed(FailReason::PeerError)) {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                }
            }),
            now,
        );
        table.on_error(uuid).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }
}
