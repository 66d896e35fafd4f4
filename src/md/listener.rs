// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! MD listeners (spec.md §4.4 `add_listener`/`del_listener`): a listener is
//! distinct from a PD subscription in that it accepts stateful MD traffic
//! and spawns MD sessions on receipt, rather than caching a payload.

use crate::error::{Error, Result};
use crate::handle::{Arena, Handle};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// An incoming MD request or notify handed to a listener's callback.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub com_id: u32,
    pub source: Ipv4Addr,
    pub session_tag: u64,
    pub payload: Vec<u8>,
}

pub type Callback = Arc<dyn Fn(Incoming) + Send + Sync>;

pub struct Listener {
    pub com_id: u32,
    /// `None` accepts from any source; `Some` restricts to one URI-resolved
    /// or literal address.
    pub accept_filter: Option<Ipv4Addr>,
    callback: Callback,
}

pub struct Table {
    listeners: Arena<Listener>,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table { listeners: Arena::new() }
    }

    pub fn add_listener(
        &mut self,
        com_id: u32,
        accept_filter: Option<Ipv4Addr>,
        callback: Callback,
    ) -> Handle<Listener> {
        self.listeners.insert(Listener { com_id, accept_filter, callback })
    }

    pub fn del_listener(&mut self, handle: Handle<Listener>) -> Result<()> {
        self.listeners.remove(handle).ok_or(Error::InvalidHandle)?;
        Ok(())
    }

    /// Replace a listener's accept filter in place, keeping its handle and
    /// callback (`readd_listener`).
    pub fn readd_listener(
        &mut self,
        handle: Handle<Listener>,
        accept_filter: Option<Ipv4Addr>,
    ) -> Result<()> {
        let listener = self.listeners.get_mut(handle).ok_or(Error::InvalidHandle)?;
        listener.accept_filter = accept_filter;
        Ok(())
    }

    pub fn dispatch(&self, com_id: u32, source: Ipv4Addr, incoming: Incoming) -> Result<()> {
        let matched = self.listeners.values().find(|listener| {
            let source_accepted = match listener.accept_filter {
                None => true,
                Some(filter) => filter == source,
            };
            listener.com_id == com_id && source_accepted
        });
        let listener = matched.ok_or(Error::NoListener)?;
        (listener.callback)(incoming);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn incoming(com_id: u32) -> Incoming {
        Incoming { com_id, source: Ipv4Addr::new(10, 0, 0, 1), session_tag: 1, payload: vec![] }
    }

    #[test]
    fn dispatch_invokes_matching_listener() {
        let mut table = Table::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        table.add_listener(5000, None, Arc::new(move |_| { calls_clone.fetch_add(1, Ordering::SeqCst); }));
        table.dispatch(5000, Ipv4Addr::new(10, 0, 0, 1), incoming(5000)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_rejects_source_outside_filter() {
        let mut table = Table::new();
        table.add_listener(5000, Some(Ipv4Addr::new(10, 0, 0, 9)), Arc::new(|_| {}));
        let result = table.dispatch(5000, Ipv4Addr::new(10, 0, 0, 1), incoming(5000));
        assert!(matches!(result, Err(Error::NoListener)));
    }

    #[test]
    fn readd_listener_updates_filter_in_place() {
        let mut table = Table::new();
        let handle = table.add_listener(5000, Some(Ipv4Addr::new(10, 0, 0, 9)), Arc::new(|_| {}));
        table.readd_listener(handle, None).unwrap();
        assert!(table.dispatch(5000, Ipv4Addr::new(10, 0, 0, 1), incoming(5000)).is_ok());
    }
}
