//! The flow key (5-tuple) and counter value types that key and populate [`crate::aggmap::AggFlowMap`].
//!
//! Two physical layouts exist, selected by which sub-map an entry lives in (§3): a narrow one
//! for IPv4 and a wide one for IPv6. Both carry a trailing transient source-port byte pair used
//! only by the capture-time classifier (`capture::classify`); it is always zero in a key that
//! has been handed to storage or to a query predicate.

use std::net::{Ipv4Addr, Ipv6Addr};

/// `src(4) + dst(4) + dport(2) + proto(1) + transient_sport(2)`.
pub const V4_KEY_LEN: usize = 13;
/// `src(16) + dst(16) + dport(2) + proto(1) + transient_sport(2)`.
pub const V6_KEY_LEN: usize = 37;

/// Byte offset immediately after the persisted portion of a key (sport bytes start here).
pub const V4_PERSIST_LEN: usize = V4_KEY_LEN - 2;
pub const V6_PERSIST_LEN: usize = V6_KEY_LEN - 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One of the four stored 5-tuple attributes a query can group by or filter on (§4.3, §4.4).
/// `Time` is handled separately (it groups by block start timestamp, not a stored column).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Attribute {
    Sip,
    Dip,
    Dport,
    Proto,
}

impl Attribute {
    pub fn column_name(self) -> &'static str {
        match self {
            Attribute::Sip => "sip",
            Attribute::Dip => "dip",
            Attribute::Dport => "dport",
            Attribute::Proto => "proto",
        }
    }

    /// Canonical ordering used everywhere a group key or sort tie-break concatenates attributes
    /// (§4.4: "by (SrcIP, DstIP, DstPort, Protocol) lexicographically").
    pub const CANONICAL_ORDER: [Attribute; 4] = [
        Attribute::Sip,
        Attribute::Dip,
        Attribute::Dport,
        Attribute::Proto,
    ];
}

/// A flow key, owning its bytes. IP version is carried by the variant, never inferred from a
/// flag byte inside the buffer (§3: "IP-version is encoded by which sub-map holds the entry").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowKey {
    V4([u8; V4_KEY_LEN]),
    V6([u8; V6_KEY_LEN]),
}

impl FlowKey {
    pub fn v4(src: Ipv4Addr, dst: Ipv4Addr, dport: u16, proto: u8, transient_sport: u16) -> Self {
        let mut buf = [0u8; V4_KEY_LEN];
        buf[0..4].copy_from_slice(&src.octets());
        buf[4..8].copy_from_slice(&dst.octets());
        buf[8..10].copy_from_slice(&dport.to_be_bytes());
        buf[10] = proto;
        buf[11..13].copy_from_slice(&transient_sport.to_be_bytes());
        FlowKey::V4(buf)
    }

    pub fn v6(src: Ipv6Addr, dst: Ipv6Addr, dport: u16, proto: u8, transient_sport: u16) -> Self {
        let mut buf = [0u8; V6_KEY_LEN];
        buf[0..16].copy_from_slice(&src.octets());
        buf[16..32].copy_from_slice(&dst.octets());
        buf[32..34].copy_from_slice(&dport.to_be_bytes());
        buf[34] = proto;
        buf[35..37].copy_from_slice(&transient_sport.to_be_bytes());
        FlowKey::V6(buf)
    }

    pub fn is_v4(&self) -> bool {
        matches!(self, FlowKey::V4(_))
    }

    /// Raw bytes including the transient source-port suffix (used only for the live capture map).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FlowKey::V4(b) => b.as_slice(),
            FlowKey::V6(b) => b.as_slice(),
        }
    }

    /// The bytes that are persisted to storage / used as a query predicate key: the transient
    /// source-port suffix is excluded (§3: "zeroed before persistence").
    pub fn persisted_bytes(&self) -> &[u8] {
        match self {
            FlowKey::V4(b) => &b[..V4_PERSIST_LEN],
            FlowKey::V6(b) => &b[..V6_PERSIST_LEN],
        }
    }

    /// Returns a copy of this key with the transient source-port suffix zeroed.
    pub fn zeroed_for_storage(&self) -> Self {
        match self {
            FlowKey::V4(b) => {
                let mut out = *b;
                out[V4_PERSIST_LEN..].fill(0);
                FlowKey::V4(out)
            }
            FlowKey::V6(b) => {
                let mut out = *b;
                out[V6_PERSIST_LEN..].fill(0);
                FlowKey::V6(out)
            }
        }
    }

    pub fn src_ip(&self) -> std::net::IpAddr {
        match self {
            FlowKey::V4(b) => Ipv4Addr::new(b[0], b[1], b[2], b[3]).into(),
            FlowKey::V6(b) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[0..16]);
                Ipv6Addr::from(octets).into()
            }
        }
    }

    pub fn dst_ip(&self) -> std::net::IpAddr {
        match self {
            FlowKey::V4(b) => Ipv4Addr::new(b[4], b[5], b[6], b[7]).into(),
            FlowKey::V6(b) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[16..32]);
                Ipv6Addr::from(octets).into()
            }
        }
    }

    pub fn dport(&self) -> u16 {
        match self {
            FlowKey::V4(b) => u16::from_be_bytes([b[8], b[9]]),
            FlowKey::V6(b) => u16::from_be_bytes([b[32], b[33]]),
        }
    }

    pub fn proto(&self) -> u8 {
        match self {
            FlowKey::V4(b) => b[10],
            FlowKey::V6(b) => b[34],
        }
    }
}

/// The four-counter aggregation value (§3). All updates are additive; counters never decrease.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FlowCounters {
    pub bytes_rcvd: u64,
    pub bytes_sent: u64,
    pub packets_rcvd: u64,
    pub packets_sent: u64,
}

impl FlowCounters {
    pub fn add(&mut self, other: &FlowCounters) {
        self.bytes_rcvd += other.bytes_rcvd;
        self.bytes_sent += other.bytes_sent;
        self.packets_rcvd += other.packets_rcvd;
        self.packets_sent += other.packets_sent;
    }

    pub fn add_observation(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Inbound => {
                self.bytes_rcvd += bytes;
                self.packets_rcvd += 1;
            }
            Direction::Outbound => {
                self.bytes_sent += bytes;
                self.packets_sent += 1;
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self == &FlowCounters::default()
    }

    /// Sent-fields zero, rcvd-fields non-zero.
    pub fn is_only_inbound(&self) -> bool {
        self.bytes_sent == 0
            && self.packets_sent == 0
            && (self.bytes_rcvd != 0 || self.packets_rcvd != 0)
    }

    /// Rcvd-fields zero, sent-fields non-zero.
    pub fn is_only_outbound(&self) -> bool {
        self.bytes_rcvd == 0
            && self.packets_rcvd == 0
            && (self.bytes_sent != 0 || self.packets_sent != 0)
    }

    pub fn is_unidirectional(&self) -> bool {
        self.is_only_inbound() || self.is_only_outbound()
    }

    /// Non-empty and not unidirectional.
    pub fn is_bidirectional(&self) -> bool {
        !self.is_zero() && !self.is_unidirectional()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_roundtrip_fields() {
        let k = FlowKey::v4(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            443,
            6,
            51000,
        );
        assert!(k.is_v4());
        assert_eq!(k.src_ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(k.dst_ip(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(k.dport(), 443);
        assert_eq!(k.proto(), 6);
    }

    #[test]
    fn zeroed_for_storage_drops_transient_port() {
        let k = FlowKey::v4(
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(2, 2, 2, 2),
            80,
            6,
            12345,
        );
        let stored = k.zeroed_for_storage();
        assert_ne!(k.as_bytes(), stored.as_bytes());
        assert_eq!(k.persisted_bytes(), stored.persisted_bytes());
        assert_eq!(stored.as_bytes()[V4_PERSIST_LEN..], [0, 0]);
    }

    #[test]
    fn direction_disjointness() {
        let zero = FlowCounters::default();
        assert!(zero.is_zero());
        assert!(!zero.is_only_inbound());
        assert!(!zero.is_only_outbound());
        assert!(!zero.is_bidirectional());

        let mut inbound = FlowCounters::default();
        inbound.add_observation(Direction::Inbound, 100);
        assert!(inbound.is_only_inbound());
        assert!(inbound.is_unidirectional());
        assert!(!inbound.is_bidirectional());

        let mut both = FlowCounters::default();
        both.add_observation(Direction::Inbound, 100);
        both.add_observation(Direction::Outbound, 50);
        assert!(both.is_bidirectional());
        assert!(!both.is_unidirectional());
    }

    #[test]
    fn counters_add_is_componentwise() {
        let mut a = FlowCounters {
            bytes_rcvd: 1,
            bytes_sent: 2,
            packets_rcvd: 3,
            packets_sent: 4,
        };
        let b = FlowCounters {
            bytes_rcvd: 10,
            bytes_sent: 20,
            packets_rcvd: 30,
            packets_sent: 40,
        };
        a.add(&b);
        assert_eq!(a.bytes_rcvd, 11);
        assert_eq!(a.bytes_sent, 22);
        assert_eq!(a.packets_rcvd, 33);
        assert_eq!(a.packets_sent, 44);
    }
}
