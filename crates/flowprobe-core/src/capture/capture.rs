//! `Capture`: one capture instance per interface, owning a packet source, a live
//! `AggFlowMap`, and the single-writer parsing loop (§3, §4.6).

use super::classify::DirectionClassifier;
use super::parser::parse_ip_packet;
use super::source::PacketSource;
use crate::aggmap::AggFlowMap;
use crate::flowkey::{FlowCounters, FlowKey};
use chrono::{DateTime, Utc};
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Initializing,
    Capturing,
    Error,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    pub promiscuous: bool,
    pub ring_buffer_size: usize,
    pub capture_length: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            promiscuous: false,
            ring_buffer_size: 1 << 20,
            capture_length: 1 << 16,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CaptureStats {
    pub packets_read: u64,
    pub packets_parse_errors: u64,
}

/// Invariant (§3): only the owning `Capture` mutates `live`; all other access goes through
/// [`Capture::rotate`] (a swap) or [`Capture::snapshot`] (a copy).
pub struct Capture {
    name: String,
    config: CaptureConfig,
    source: Box<dyn PacketSource>,
    live: AggFlowMap,
    classifier: DirectionClassifier,
    state: CaptureState,
    stats: CaptureStats,
    started_at: DateTime<Utc>,
}

impl Capture {
    pub fn new(name: impl Into<String>, config: CaptureConfig, source: Box<dyn PacketSource>) -> Self {
        Capture {
            name: name.into(),
            config,
            source,
            live: AggFlowMap::new(),
            classifier: DirectionClassifier::new(),
            state: CaptureState::Initializing,
            stats: CaptureStats::default(),
            started_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn active_flow_count(&self) -> usize {
        self.live.len()
    }

    /// Reads and classifies exactly one packet. Returns `Ok(true)` if a packet was processed
    /// (whether or not it parsed), `Ok(false)` when the source is exhausted.
    pub fn poll_once(&mut self, scratch: &mut [u8]) -> std::io::Result<bool> {
        let Some(view) = self.source.next_packet(scratch)? else {
            return Ok(false);
        };
        self.state = CaptureState::Capturing;
        self.stats.packets_read += 1;

        match parse_ip_packet(&scratch[..view.len]) {
            Ok(parsed) => {
                let classified = self.classifier.classify(
                    parsed.src,
                    parsed.dst,
                    parsed.sport,
                    parsed.dport,
                    parsed.proto,
                    view.direction_hint,
                );
                let is_v4 = matches!(classified.src, IpAddr::V4(_));
                let key = build_key(is_v4, classified.src, classified.dst, classified.dport, parsed.proto, parsed.sport);
                let mut delta = FlowCounters::default();
                delta.add_observation(classified.direction, parsed.total_len as u64);
                self.live.set_or_update(&key, delta);
            }
            Err(_) => {
                self.stats.packets_parse_errors += 1;
            }
        }
        Ok(true)
    }

    /// Runs [`Capture::poll_once`] until the source signals exhaustion. Used by tests and by the
    /// mock-backed end-to-end scenarios; a real capture daemon instead polls in a dedicated
    /// thread forever.
    pub fn drain(&mut self) -> std::io::Result<()> {
        let mut scratch = vec![0u8; self.config.capture_length.max(65536)];
        while self.poll_once(&mut scratch)? {}
        Ok(())
    }

    /// Atomically swaps the live map for a fresh empty one, returning the rotated-out map for
    /// the writeout worker (§3, §4.2).
    pub fn rotate(&mut self) -> AggFlowMap {
        std::mem::replace(&mut self.live, AggFlowMap::new())
    }

    /// A point-in-time copy of the live map for hybrid live+on-disk queries (§4.4), obtained
    /// without disturbing the capture's own writes.
    pub fn snapshot(&self) -> AggFlowMap {
        let mut copy = AggFlowMap::new();
        copy.merge(&self.live);
        copy
    }

    pub fn mark_error(&mut self) {
        self.state = CaptureState::Error;
    }

    pub fn close(&mut self) {
        let _ = self.source.close();
        self.state = CaptureState::Closed;
    }
}

fn build_key(is_v4: bool, src: IpAddr, dst: IpAddr, dport: u16, proto: u8, transient_sport: u16) -> FlowKey {
    match (is_v4, src, dst) {
        (true, IpAddr::V4(s), IpAddr::V4(d)) => FlowKey::v4(s, d, dport, proto, transient_sport),
        (false, IpAddr::V6(s), IpAddr::V6(d)) => FlowKey::v6(s, d, dport, proto, transient_sport),
        _ => unreachable!("classifier never mixes address families within one session"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::MockPacketSource;

    fn ipv4_udp_packet(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let total_len: u16 = 20 + 8;
        let mut buf = vec![0u8; total_len as usize];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&total_len.to_be_bytes());
        buf[9] = 17;
        buf[12..16].copy_from_slice(&src);
        buf[16..20].copy_from_slice(&dst);
        buf[20..22].copy_from_slice(&sport.to_be_bytes());
        buf[22..24].copy_from_slice(&dport.to_be_bytes());
        buf
    }

    #[test]
    fn drain_counts_packets_and_builds_flow() {
        let frames = vec![
            (ipv4_udp_packet([10, 0, 0, 1], [10, 0, 0, 2], 5000, 53), None),
            (ipv4_udp_packet([10, 0, 0, 2], [10, 0, 0, 1], 53, 5000), None),
            (vec![0xff, 0xff], None), // malformed
        ];
        let mut capture = Capture::new(
            "eth0",
            CaptureConfig::default(),
            Box::new(MockPacketSource::new(frames)),
        );
        capture.drain().unwrap();
        let stats = capture.stats();
        assert_eq!(stats.packets_read, 3);
        assert_eq!(stats.packets_parse_errors, 1);
        assert_eq!(capture.active_flow_count(), 1);
        assert_eq!(capture.state(), CaptureState::Capturing);
    }

    #[test]
    fn rotate_yields_rotated_map_and_resets_live() {
        let frames = vec![(ipv4_udp_packet([1, 1, 1, 1], [2, 2, 2, 2], 1, 2), None)];
        let mut capture = Capture::new(
            "eth0",
            CaptureConfig::default(),
            Box::new(MockPacketSource::new(frames)),
        );
        capture.drain().unwrap();
        let rotated = capture.rotate();
        assert_eq!(rotated.len(), 1);
        assert_eq!(capture.active_flow_count(), 0);
    }
}
