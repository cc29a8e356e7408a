//! `AggFlowMap`: the open-addressed, seeded-hash hashmap specialized to 5-tuple flow keys and
//! four-counter values (§4.1).
//!
//! The top-level map is a pair of independent [`Table`]s — primary (IPv4) and secondary (IPv6) —
//! dispatched on the [`FlowKey`] variant (the data model's invariant that IP version is carried
//! by which sub-map holds the entry, never by an in-key flag, is upheld by construction: the
//! key's own type already tells us the destination table). `iter()` concatenates primary then
//! secondary, matching the spec's meta-iterator ordering.

mod table;

use crate::flowkey::{FlowCounters, FlowKey};
use rand::RngCore;
use table::Table;

pub struct AggFlowMap {
    primary: Table,
    secondary: Table,
}

impl Default for AggFlowMap {
    fn default() -> Self {
        Self::new()
    }
}

impl AggFlowMap {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        AggFlowMap {
            primary: Table::new(rng.next_u64()),
            secondary: Table::new(rng.next_u64()),
        }
    }

    fn table_for(&self, key: &FlowKey) -> &Table {
        if key.is_v4() {
            &self.primary
        } else {
            &self.secondary
        }
    }

    fn table_for_mut(&mut self, key: &FlowKey) -> &mut Table {
        if key.is_v4() {
            &mut self.primary
        } else {
            &mut self.secondary
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<FlowCounters> {
        self.table_for(key).get(key.persisted_bytes())
    }

    pub fn set(&mut self, key: &FlowKey, value: FlowCounters) {
        let bytes = key.persisted_bytes().to_vec();
        self.table_for_mut(key).set(&bytes, value);
    }

    /// Atomic upsert-add; the hot path on the capture side (§4.1).
    pub fn set_or_update(&mut self, key: &FlowKey, delta: FlowCounters) {
        let bytes = key.persisted_bytes().to_vec();
        self.table_for_mut(key).set_or_update(&bytes, delta);
    }

    pub fn merge(&mut self, other: &AggFlowMap) {
        self.primary.merge(&other.primary);
        self.secondary.merge(&other.secondary);
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.secondary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Yields `(persisted_key_bytes, is_v4, counters)` for every live entry, primary (IPv4) then
    /// secondary (IPv6), each exactly once. `filter` is applied lazily on the counters.
    pub fn iter<'a>(
        &'a self,
        filter: Option<&'a dyn Fn(&FlowCounters) -> bool>,
    ) -> impl Iterator<Item = (&'a [u8], bool, FlowCounters)> + 'a {
        self.primary
            .iter()
            .map(|(k, v)| (k, true, v))
            .chain(self.secondary.iter().map(|(k, v)| (k, false, v)))
            .filter(move |(_, _, v)| filter.map(|f| f(v)).unwrap_or(true))
    }

    pub fn clear(&mut self) {
        self.primary.clear();
        self.secondary.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn dispatches_to_v4_subtable() {
        let mut m = AggFlowMap::new();
        let k = FlowKey::v4(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), 80, 6, 0);
        m.set_or_update(
            &k,
            FlowCounters {
                packets_rcvd: 1,
                ..Default::default()
            },
        );
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&k).unwrap().packets_rcvd, 1);
    }

    #[test]
    fn merge_bounds_hold() {
        let mut a = AggFlowMap::new();
        let mut b = AggFlowMap::new();
        let k1 = FlowKey::v4(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), 80, 6, 0);
        let k2 = FlowKey::v4(Ipv4Addr::new(3, 3, 3, 3), Ipv4Addr::new(4, 4, 4, 4), 443, 6, 0);
        a.set_or_update(&k1, FlowCounters::default());
        b.set_or_update(&k1, FlowCounters::default());
        b.set_or_update(&k2, FlowCounters::default());
        let (len_a, len_b) = (a.len(), b.len());
        a.merge(&b);
        assert!(a.len() >= len_a.max(len_b));
        assert!(a.len() <= len_a + len_b);
    }

    #[test]
    fn iter_concatenates_primary_then_secondary() {
        use std::net::Ipv6Addr;
        let mut m = AggFlowMap::new();
        let k4 = FlowKey::v4(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), 80, 6, 0);
        let k6 = FlowKey::v6(Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST, 80, 6, 0);
        m.set_or_update(&k6, FlowCounters::default());
        m.set_or_update(&k4, FlowCounters::default());
        let order: Vec<bool> = m.iter(None).map(|(_, is_v4, _)| is_v4).collect();
        assert_eq!(order, vec![true, false]);
    }
}
