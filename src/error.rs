// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The error taxonomy shared by every component of the runtime.
//!
//! Errors raised inside the work cycle (`process_receive`/`process_send`) are
//! never fatal to a session: they are reported through callbacks on the
//! affected handle and counted in statistics, and the session keeps running.
//! `open_session`, `publish` and `subscribe` return errors synchronously and
//! never hand back a handle on failure.

use std::fmt;
use std::io;

/// Abstract error kinds from the protocol's error taxonomy.
#[derive(Debug)]
pub enum Error {
    /// Caller-supplied argument out of range or null where required.
    Param(&'static str),
    /// An operation was attempted before `init()`.
    NotInitialised,
    /// A handle was stale (already unpublished/unsubscribed/closed) or from
    /// the wrong arena generation.
    InvalidHandle,
    /// A PD subscription or MD reply/confirm deadline fired.
    Timeout,
    /// Transport-level failure (bind, send, recv).
    Io(io::ErrorKind),
    /// A socket-specific failure not covered by `Io` (e.g. multicast join).
    Socket(String),
    /// The header or payload CRC did not verify.
    Crc,
    /// The packet failed a structural check other than CRC (bad version,
    /// length mismatch, wrong type for the service).
    Wire(&'static str),
    /// Topo-count mismatch between peers ("different epoch, discard").
    Topo,
    /// No subscriber was found for the addressed comId/serviceId.
    NoSubscriber,
    /// No publisher was found for the addressed identity.
    NoPublisher,
    /// No listener was found for the addressed comId/URI.
    NoListener,
    /// No MD session matches the given UUID.
    NoSession,
    /// A dataset descriptor and the payload in hand disagree.
    Marshalling(&'static str),
    /// An MD operation was called while the session was in an incompatible
    /// state.
    State(&'static str),
    /// Local resource exhaustion: allocator, bounded queue, semaphore.
    Memory,
    /// A bounded send/receive queue is full.
    QueueFull,
    /// A guarded resource's lock was poisoned or otherwise unavailable.
    Mutex,
    /// The dataset registry detected a cycle among nested dataset references.
    DatasetCycle,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Param(what) => write!(f, "invalid parameter: {what}"),
            Error::NotInitialised => write!(f, "runtime not initialised"),
            Error::InvalidHandle => write!(f, "stale or unknown handle"),
            Error::Timeout => write!(f, "timeout"),
            Error::Io(kind) => write!(f, "I/O error: {kind:?}"),
            Error::Socket(msg) => write!(f, "socket error: {msg}"),
            Error::Crc => write!(f, "CRC check failed"),
            Error::Wire(reason) => write!(f, "malformed packet: {reason}"),
            Error::Topo => write!(f, "topo count mismatch"),
            Error::NoSubscriber => write!(f, "no matching subscriber"),
            Error::NoPublisher => write!(f, "no matching publisher"),
            Error::NoListener => write!(f, "no matching listener"),
            Error::NoSession => write!(f, "no matching MD session"),
            Error::Marshalling(reason) => write!(f, "marshalling error: {reason}"),
            Error::State(reason) => write!(f, "invalid state transition: {reason}"),
            Error::Memory => write!(f, "out of memory"),
            Error::QueueFull => write!(f, "queue full"),
            Error::Mutex => write!(f, "lock error"),
            Error::DatasetCycle => write!(f, "cyclic dataset reference"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

// Important for other errors to wrap this one.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

pub type Result<T> = std::result::Result<T, Error>;
