// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The URI→IP resolution hook (spec.md §1: "no discovery or naming service
//! beyond the URI→IP hook exposed to callers"). `republish`, `resubscribe`
//! and `request` accept either a literal address or a URI resolved through
//! a caller-supplied [`UriResolver`] — the engine never resolves names
//! itself.

use std::net::{IpAddr, Ipv4Addr};

/// A caller-supplied name resolver. The engine calls this synchronously from
/// within `republish`/`resubscribe`/`request`; it must not block for long,
/// since those calls happen on the session's single worker thread.
pub trait UriResolver: Send + Sync {
    fn resolve(&self, uri: &str) -> Option<IpAddr>;
}

/// A resolver over a fixed, caller-populated table — the common case for a
/// train consist with a static addressing plan.
#[derive(Debug, Clone, Default)]
pub struct StaticTable {
    entries: std::collections::HashMap<String, IpAddr>,
}

impl StaticTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uri: impl Into<String>, addr: IpAddr) {
        self.entries.insert(uri.into(), addr);
    }
}

impl UriResolver for StaticTable {
    fn resolve(&self, uri: &str) -> Option<IpAddr> {
        self.entries.get(uri).copied()
    }
}

/// Either a literal address or a name to resolve through a [`UriResolver`].
#[derive(Debug, Clone)]
pub enum Destination {
    Addr(IpAddr),
    Uri(String),
}

impl Destination {
    pub fn resolve(&self, resolver: &dyn UriResolver) -> Option<IpAddr> {
        match self {
            Destination::Addr(a) => Some(*a),
            Destination::Uri(u) => resolver.resolve(u),
        }
    }

    /// Like [`Destination::resolve`], narrowed to `Ipv4Addr` — this crate's
    /// wire format is IPv4-only (spec.md §3), so every caller of `resolve`
    /// that feeds a socket address needs this instead.
    pub fn resolve_v4(&self, resolver: &dyn UriResolver) -> Option<Ipv4Addr> {
        match self.resolve(resolver)? {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_resolves_known_uri() {
        let mut table = StaticTable::new();
        table.insert("dev.trn", IpAddr::from([10, 0, 0, 1]));
        assert_eq!(table.resolve("dev.trn"), Some(IpAddr::from([10, 0, 0, 1])));
        assert_eq!(table.resolve("unknown.trn"), None);
    }

    #[test]
    fn destination_addr_resolves_without_table() {
        let dest = Destination::Addr(IpAddr::from([1, 2, 3, 4]));
        let table = StaticTable::new();
        assert_eq!(dest.resolve(&table), Some(IpAddr::from([1, 2, 3, 4])));
    }

    #[test]
    fn resolve_v4_narrows_uri_lookup() {
        let mut table = StaticTable::new();
        table.insert("dev.trn", IpAddr::from([10, 0, 0, 1]));
        let dest = Destination::Uri("dev.trn".to_string());
        assert_eq!(dest.resolve_v4(&table), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn resolve_v4_rejects_ipv6() {
        let dest = Destination::Addr(IpAddr::from(std::net::Ipv6Addr::LOCALHOST));
        let table = StaticTable::new();
        assert_eq!(dest.resolve_v4(&table), None);
    }
}
