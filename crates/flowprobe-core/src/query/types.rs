//! Public query request/response wire types (§4.4, §6).

use crate::flowkey::{Attribute, FlowCounters};
use std::collections::HashSet;
use std::net::IpAddr;

#[cfg(feature = "api")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "api", derive(Serialize, Deserialize))]
pub enum SortBy {
    Bytes,
    Packets,
    Time,
}

/// One query's parameters: which interfaces, which time window, which condition, how to group
/// and sort the result (§4.4, §6 `goquery` flags).
#[derive(Clone, Debug)]
pub struct Query {
    pub ifaces: Vec<String>,
    pub first_ts: i64,
    pub last_ts: i64,
    pub condition: String,
    pub group_by: HashSet<Attribute>,
    /// Group by block start timestamp in addition to `group_by` (§3's "extended key").
    pub group_by_time: bool,
    pub sort_by: SortBy,
    pub ascending: bool,
    pub limit: Option<usize>,
    pub live: bool,
    pub resolve_dns: Duration,
    pub max_mem_pct: Option<f64>,
}

use std::time::Duration;

impl Query {
    pub fn required_attributes(&self, predicate_attrs: &HashSet<Attribute>) -> HashSet<Attribute> {
        self.group_by.union(predicate_attrs).copied().collect()
    }
}

#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "api", derive(Serialize, Deserialize))]
pub struct Hits {
    pub total: u64,
    pub displayed: u64,
}

#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "api", derive(Serialize, Deserialize))]
pub struct Summary {
    pub totals: FlowCounters,
    pub hits: Hits,
}

/// Per-query execution statistics, accumulated across every workload (§4.4).
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "api", derive(Serialize, Deserialize))]
pub struct QueryStats {
    pub bytes_loaded: u64,
    pub bytes_decompressed: u64,
    pub blocks_processed: u64,
    pub blocks_corrupted: u64,
    pub directories_processed: u64,
}

impl QueryStats {
    pub fn merge(&mut self, other: &QueryStats) {
        self.bytes_loaded += other.bytes_loaded;
        self.bytes_decompressed += other.bytes_decompressed;
        self.blocks_processed += other.blocks_processed;
        self.blocks_corrupted += other.blocks_corrupted;
        self.directories_processed += other.directories_processed;
    }
}

/// One output row: attributes not in the query's `group_by` are `None` (§4.4's column-selective
/// grouping — only requested attributes are materialized per row).
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "api", derive(Serialize, Deserialize))]
pub struct ResultRow {
    pub iface: String,
    pub sip: Option<IpAddr>,
    pub dip: Option<IpAddr>,
    pub dport: Option<u16>,
    pub proto: Option<u8>,
    /// Block start timestamp, set only when the query's `group_by_time` is set.
    pub time: Option<i64>,
    pub counters: FlowCounters,
}

#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "api", derive(Serialize, Deserialize))]
pub struct QueryResult {
    pub rows: Vec<ResultRow>,
    pub summary: Summary,
    pub stats: QueryStats,
}
