#![allow(unsafe_code)]
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The socket multiplexer (C5): `get_interval` / `process_receive` /
//! `process_send`, built directly on `select(2)` rather than an
//! async-runtime reactor — spec.md §4.5 requires a synchronous,
//! caller-driven work cycle with no suspension points inside the three
//! functions, which is exactly what a raw `select` call gives for free.
//! This is the one module in the crate that needs `unsafe`, confined here
//! behind the workspace's `unsafe_code = "deny"` lint.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// A set of file descriptors to watch or that came back readable from
/// `select`. Kept as a `BTreeSet` host-side for simple iteration; converted
/// to/from a raw `libc::fd_set` only at the `select` call boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdSet {
    fds: BTreeSet<RawFd>,
}

impl FdSet {
    pub fn new() -> Self {
        FdSet { fds: BTreeSet::new() }
    }

    pub fn insert(&mut self, fd: RawFd) {
        self.fds.insert(fd);
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.contains(&fd)
    }

    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.fds.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    fn to_raw(&self) -> libc::fd_set {
        unsafe {
            let mut raw: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut raw);
            for &fd in &self.fds {
                libc::FD_SET(fd, &mut raw);
            }
            raw
        }
    }

    fn highest(&self) -> RawFd {
        self.fds.iter().copied().max().unwrap_or(-1)
    }
}

/// `get_interval`: the select timeout is `min(next scheduled event,
/// default)`, clamped to zero if the deadline already passed.
pub fn select_timeout(next_event: Option<Duration>, default: Duration) -> Duration {
    match next_event {
        Some(remaining) => remaining.min(default),
        None => default,
    }
}

/// Block in `select(2)` over `readable` for up to `timeout`, returning the
/// subset that became readable. Per spec.md's Open Question resolution
/// (DESIGN.md), `nfds` is always exactly `highest_fd + 1`, recomputed from
/// the live set on every call rather than cached, since publications and
/// subscriptions may add or remove sockets between ticks.
pub fn select_readable(readable: &FdSet, timeout: Duration) -> Result<FdSet> {
    if readable.is_empty() {
        return Ok(FdSet::new());
    }
    let mut raw_read = readable.to_raw();
    let nfds = readable.highest() + 1;
    let mut tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    loop {
        let rc = unsafe {
            libc::select(
                nfds,
                &mut raw_read,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            )
        };
        if rc >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(Error::Socket(format!("select failed: {err}")));
    }
    let mut result = FdSet::new();
    for fd in readable.iter() {
        if unsafe { libc::FD_ISSET(fd, &raw_read) } {
            result.insert(fd);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn select_timeout_picks_the_sooner_deadline() {
        assert_eq!(
            select_timeout(Some(Duration::from_millis(10)), Duration::from_secs(1)),
            Duration::from_millis(10)
        );
        assert_eq!(
            select_timeout(Some(Duration::from_secs(5)), Duration::from_secs(1)),
            Duration::from_secs(1)
        );
        assert_eq!(select_timeout(None, Duration::from_millis(50)), Duration::from_millis(50));
    }

    #[test]
    fn select_readable_times_out_with_no_traffic() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut set = FdSet::new();
        set.insert(sock.as_raw_fd());
        let ready = select_readable(&set, Duration::from_millis(20)).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn select_readable_reports_a_writable_pair() {
        let (a, b) = UnixDatagram::pair().unwrap();
        b.send(b"hi").unwrap();
        let mut set = FdSet::new();
        set.insert(a.as_raw_fd());
        let ready = select_readable(&set, Duration::from_millis(200)).unwrap();
        assert!(ready.contains(a.as_raw_fd()));
    }

    #[test]
    fn select_readable_on_empty_set_returns_empty() {
        let ready = select_readable(&FdSet::new(), Duration::from_millis(1)).unwrap();
        assert!(ready.is_empty());
    }
}
