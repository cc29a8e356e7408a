//! A single open-addressed sub-map: one IP-version-homogeneous table of flow keys to counters.
//!
//! Keys are variable-length byte slices (11 or 35 persisted bytes, see [`crate::flowkey`]) that
//! are copied once into an arena the table owns; slots store only an (offset, len) pointer into
//! that arena plus the counter value, so the hot `set_or_update` path never allocates once the
//! arena has spare capacity. Growth doubles the slot table and rehashes existing entries in
//! place; the arena itself is never rewritten, only appended to (it doubles when exhausted).

use crate::flowkey::FlowCounters;
use xxhash_rust::xxh3::xxh3_64_with_seed;

#[derive(Clone)]
struct Slot {
    used: bool,
    key_offset: u32,
    key_len: u16,
    value: FlowCounters,
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            used: false,
            key_offset: 0,
            key_len: 0,
            value: FlowCounters::default(),
        }
    }
}

const INITIAL_CAPACITY: usize = 64;
const LOAD_FACTOR_NUM: usize = 3;
const LOAD_FACTOR_DEN: usize = 4;

pub struct Table {
    slots: Vec<Slot>,
    arena: Vec<u8>,
    seed: u64,
    len: usize,
}

impl Table {
    pub fn new(seed: u64) -> Self {
        Table {
            slots: vec![Slot::default(); INITIAL_CAPACITY],
            arena: Vec::new(),
            seed,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn hash(&self, key: &[u8]) -> u64 {
        xxh3_64_with_seed(key, self.seed)
    }

    fn key_at(&self, slot: &Slot) -> &[u8] {
        &self.arena[slot.key_offset as usize..(slot.key_offset as usize + slot.key_len as usize)]
    }

    fn find_slot(&self, key: &[u8]) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let mut idx = (self.hash(key) as usize) & mask;
        for _ in 0..self.slots.len() {
            let slot = &self.slots[idx];
            if !slot.used {
                return None;
            }
            if slot.key_len as usize == key.len() && self.key_at(slot) == key {
                return Some(idx);
            }
            idx = (idx + 1) & mask;
        }
        None
    }

    pub fn get(&self, key: &[u8]) -> Option<FlowCounters> {
        self.find_slot(key).map(|idx| self.slots[idx].value)
    }

    pub fn set(&mut self, key: &[u8], value: FlowCounters) {
        self.maybe_grow();
        self.insert_raw(key, value, false);
    }

    /// Insert-or-add: if `key` is present, adds `delta` component-wise; else inserts `delta`
    /// as a fresh entry. This is the hot path on the capture side (§4.1).
    pub fn set_or_update(&mut self, key: &[u8], delta: FlowCounters) {
        self.maybe_grow();
        self.insert_raw(key, delta, true);
    }

    fn insert_raw(&mut self, key: &[u8], value: FlowCounters, accumulate: bool) {
        let mask = self.slots.len() - 1;
        let mut idx = (self.hash(key) as usize) & mask;
        loop {
            let slot = &mut self.slots[idx];
            if !slot.used {
                let offset = self.arena.len() as u32;
                self.arena.extend_from_slice(key);
                *slot = Slot {
                    used: true,
                    key_offset: offset,
                    key_len: key.len() as u16,
                    value,
                };
                self.len += 1;
                return;
            }
            if slot.key_len as usize == key.len()
                && self.arena[slot.key_offset as usize
                    ..(slot.key_offset as usize + slot.key_len as usize)]
                    == *key
            {
                if accumulate {
                    slot.value.add(&value);
                } else {
                    slot.value = value;
                }
                return;
            }
            idx = (idx + 1) & mask;
        }
    }

    fn maybe_grow(&mut self) {
        if self.len + 1 > (self.slots.len() * LOAD_FACTOR_NUM) / LOAD_FACTOR_DEN {
            self.grow(self.slots.len() * 2);
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let old_slots = std::mem::replace(&mut self.slots, vec![Slot::default(); new_capacity]);
        for slot in old_slots.into_iter().filter(|s| s.used) {
            let mask = self.slots.len() - 1;
            let key =
                self.arena[slot.key_offset as usize..(slot.key_offset as usize + slot.key_len as usize)]
                    .to_vec();
            let mut idx = (xxh3_64_with_seed(&key, self.seed) as usize) & mask;
            loop {
                if !self.slots[idx].used {
                    self.slots[idx] = slot;
                    break;
                }
                idx = (idx + 1) & mask;
            }
        }
    }

    /// Merges every entry of `other` into `self` via [`Table::set_or_update`].
    pub fn merge(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.set_or_update(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], FlowCounters)> {
        self.slots
            .iter()
            .filter(|s| s.used)
            .map(move |s| (self.key_at(s), s.value))
    }

    pub fn clear(&mut self) {
        self.slots = vec![Slot::default(); INITIAL_CAPACITY];
        self.arena.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> Vec<u8> {
        vec![n; 11]
    }

    #[test]
    fn set_or_update_inserts_then_accumulates() {
        let mut t = Table::new(42);
        t.set_or_update(
            &key(1),
            FlowCounters {
                bytes_rcvd: 10,
                ..Default::default()
            },
        );
        t.set_or_update(
            &key(1),
            FlowCounters {
                bytes_rcvd: 5,
                ..Default::default()
            },
        );
        assert_eq!(t.get(&key(1)).unwrap().bytes_rcvd, 15);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn grows_past_load_factor_without_losing_entries() {
        let mut t = Table::new(7);
        for i in 0..500u32 {
            let k = i.to_be_bytes().to_vec();
            t.set_or_update(
                &k,
                FlowCounters {
                    packets_rcvd: 1,
                    ..Default::default()
                },
            );
        }
        assert_eq!(t.len(), 500);
        for i in 0..500u32 {
            let k = i.to_be_bytes().to_vec();
            assert_eq!(t.get(&k).unwrap().packets_rcvd, 1);
        }
    }

    #[test]
    fn merge_is_componentwise_sum_on_common_keys() {
        let mut a = Table::new(1);
        let mut b = Table::new(2);
        a.set_or_update(
            &key(9),
            FlowCounters {
                bytes_sent: 3,
                ..Default::default()
            },
        );
        b.set_or_update(
            &key(9),
            FlowCounters {
                bytes_sent: 4,
                ..Default::default()
            },
        );
        b.set_or_update(
            &key(3),
            FlowCounters {
                bytes_sent: 1,
                ..Default::default()
            },
        );
        a.merge(&b);
        assert_eq!(a.get(&key(9)).unwrap().bytes_sent, 7);
        assert_eq!(a.get(&key(3)).unwrap().bytes_sent, 1);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn iter_yields_each_entry_exactly_once() {
        let mut t = Table::new(3);
        for i in 0..50u8 {
            t.set_or_update(&key(i), FlowCounters::default());
        }
        assert_eq!(t.iter().count(), t.len());
    }
}
