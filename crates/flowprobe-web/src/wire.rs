//! JSON wire types for the HTTP surface (§6): request/response DTOs that convert to and from the
//! core crate's internal types, which themselves carry no serde derives beyond what the `api`
//! feature already turns on for `query::types`.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flowprobe_core::capture::{CaptureConfig, CaptureState, CaptureStatus};
use flowprobe_core::error::FlowError;
use flowprobe_core::flowkey::{Attribute, FlowCounters};
use flowprobe_core::query::{Query, SortBy};

#[derive(Debug, Deserialize)]
pub(crate) struct QueryRequest {
    pub ifaces: Vec<String>,
    pub first_ts: i64,
    pub last_ts: i64,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub group_by_time: bool,
    #[serde(default = "default_sort_by")]
    pub sort_by: String,
    #[serde(default)]
    pub ascending: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub live: bool,
    #[serde(default = "default_resolve_dns_secs")]
    pub resolve_dns_secs: u64,
    #[serde(default)]
    pub max_mem_pct: Option<f64>,
}

fn default_sort_by() -> String {
    "bytes".to_string()
}

fn default_resolve_dns_secs() -> u64 {
    2
}

impl QueryRequest {
    pub(crate) fn into_query(self) -> Result<Query, FlowError> {
        let sort_by = match self.sort_by.to_ascii_lowercase().as_str() {
            "bytes" => SortBy::Bytes,
            "packets" => SortBy::Packets,
            "time" => SortBy::Time,
            other => return Err(FlowError::invalid_argument(format!("unknown sort_by '{other}'"))),
        };
        let mut group_by = HashSet::new();
        for name in &self.group_by {
            let attr = match name.to_ascii_lowercase().as_str() {
                "sip" => Attribute::Sip,
                "dip" => Attribute::Dip,
                "dport" => Attribute::Dport,
                "proto" => Attribute::Proto,
                other => return Err(FlowError::invalid_argument(format!("unknown group_by attribute '{other}'"))),
            };
            group_by.insert(attr);
        }
        Ok(Query {
            ifaces: self.ifaces,
            first_ts: self.first_ts,
            last_ts: self.last_ts,
            condition: self.condition,
            group_by,
            group_by_time: self.group_by_time,
            sort_by,
            ascending: self.ascending,
            limit: self.limit,
            live: self.live,
            resolve_dns: Duration::from_secs(self.resolve_dns_secs),
            max_mem_pct: self.max_mem_pct,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub(crate) struct CaptureConfigDto {
    pub promiscuous: bool,
    pub ring_buffer_size: usize,
    pub capture_length: usize,
}

impl From<&CaptureConfig> for CaptureConfigDto {
    fn from(c: &CaptureConfig) -> Self {
        CaptureConfigDto {
            promiscuous: c.promiscuous,
            ring_buffer_size: c.ring_buffer_size,
            capture_length: c.capture_length,
        }
    }
}

impl From<CaptureConfigDto> for CaptureConfig {
    fn from(d: CaptureConfigDto) -> Self {
        CaptureConfig {
            promiscuous: d.promiscuous,
            ring_buffer_size: d.ring_buffer_size,
            capture_length: d.capture_length,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConfigUpdateRequest {
    pub ifaces: Vec<String>,
    pub config: CaptureConfigDto,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub(crate) struct StatusDto {
    pub name: String,
    pub state: String,
    pub config: CaptureConfigDto,
    pub packets_read: u64,
    pub packets_parse_errors: u64,
    pub started_at: String,
    pub active_flows: usize,
}

fn state_name(state: CaptureState) -> &'static str {
    match state {
        CaptureState::Initializing => "initializing",
        CaptureState::Capturing => "capturing",
        CaptureState::Error => "error",
        CaptureState::Closed => "closed",
    }
}

impl From<&CaptureStatus> for StatusDto {
    fn from(s: &CaptureStatus) -> Self {
        StatusDto {
            name: s.name.clone(),
            state: state_name(s.state).to_string(),
            config: CaptureConfigDto::from(&s.config),
            packets_read: s.stats.packets_read,
            packets_parse_errors: s.stats.packets_parse_errors,
            started_at: s.started_at.to_rfc3339(),
            active_flows: s.active_flows,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct FlowRowDto {
    pub iface: String,
    pub sip: IpAddr,
    pub dip: IpAddr,
    pub dport: u16,
    pub proto: u8,
    pub counters: FlowCounters,
}

/// Decodes the persisted-key byte layout shared by `capture::manager` and the aggregator's live
/// snapshot path into its four flat fields.
pub(crate) fn decode_flow_key(bytes: &[u8], is_v4: bool) -> (IpAddr, IpAddr, u16, u8) {
    if is_v4 {
        let sip = IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
        let dip = IpAddr::V4(Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]));
        let dport = u16::from_be_bytes([bytes[8], bytes[9]]);
        let proto = bytes[10];
        (sip, dip, dport, proto)
    } else {
        let mut s = [0u8; 16];
        s.copy_from_slice(&bytes[0..16]);
        let mut d = [0u8; 16];
        d.copy_from_slice(&bytes[16..32]);
        let sip = IpAddr::V6(Ipv6Addr::from(s));
        let dip = IpAddr::V6(Ipv6Addr::from(d));
        let dport = u16::from_be_bytes([bytes[32], bytes[33]]);
        let proto = bytes[34];
        (sip, dip, dport, proto)
    }
}
