//! Work discovery and per-block evaluation (§4.4).
//!
//! Grounded in the teacher's `storage/manager.rs` chunk-enumeration pass (list candidate
//! directories, open each once, iterate its blocks) generalized from a single combined snapshot
//! file to this crate's per-interface, per-day `GPDir` layout. One [`Workload`] covers every
//! block of one interface's one day directory that intersects the query window, so a worker
//! opens that directory's column files exactly once no matter how many blocks it must read.

use super::condition::{CompiledCondition, EvalKey};
use super::types::QueryStats;
use crate::error::{FlowError, FlowResult};
use crate::flowkey::{Attribute, FlowCounters};
use crate::storage::{list_day_dirs, GPDir};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

const UNSET_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

#[derive(Clone, Debug)]
pub struct Workload {
    pub iface: String,
    pub day_epoch: i64,
    pub block_indices: Vec<usize>,
}

/// One output row's group identity: attributes excluded from the query's `group_by` collapse to
/// `None` so rows differing only in an unrequested attribute merge together.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub iface: String,
    pub sip: Option<IpAddr>,
    pub dip: Option<IpAddr>,
    pub dport: Option<u16>,
    pub proto: Option<u8>,
    pub time: Option<i64>,
}

/// Enumerates every `(interface, day, blocks)` unit of work whose window intersects
/// `[first_ts, last_ts]`. A day directory with no matching meta is simply skipped — absent
/// storage is not an error (§4.4, §9).
pub fn build_workloads(
    db_root: &Path,
    ifaces: &[String],
    first_ts: i64,
    last_ts: i64,
) -> FlowResult<Vec<Workload>> {
    let mut workloads = Vec::new();
    for iface in ifaces {
        let days = list_day_dirs(db_root, iface, first_ts, last_ts).map_err(FlowError::from)?;
        for day in days {
            let dir = match GPDir::open_read(db_root, iface, day) {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(FlowError::from(e)),
            };
            let indices = dir.blocks_in_range(first_ts, last_ts);
            if !indices.is_empty() {
                workloads.push(Workload {
                    iface: iface.clone(),
                    day_epoch: day,
                    block_indices: indices,
                });
            }
        }
    }
    Ok(workloads)
}

/// Evaluates one workload: opens its `GPDir` once, decodes only the required columns for each
/// matching block, applies the compiled predicate row-by-row, and folds surviving rows into a
/// local group accumulator (§4.3, §4.4). The direction filter, if any, is deliberately NOT
/// applied here: it is a post-aggregation row/display filter (§4.4), so every predicate-matching
/// row must still contribute to the aggregated totals; only the final iteration pass
/// ([`super::aggregator::finish`]) consults it. A block that fails to decode is counted
/// corrupted and skipped rather than aborting the whole query (§4.2, §8).
pub fn run_workload(
    db_root: &Path,
    workload: &Workload,
    compiled: &CompiledCondition,
    required: &HashSet<Attribute>,
    group_by: &HashSet<Attribute>,
    group_by_time: bool,
) -> FlowResult<(HashMap<GroupKey, FlowCounters>, QueryStats)> {
    let mut dir = GPDir::open_read(db_root, &workload.iface, workload.day_epoch).map_err(FlowError::from)?;
    let mut acc: HashMap<GroupKey, FlowCounters> = HashMap::new();
    let mut stats = QueryStats::default();
    stats.directories_processed = 1;

    for &idx in &workload.block_indices {
        let Some(block_meta) = dir.meta.blocks.get(idx).cloned() else {
            continue;
        };
        for col in block_meta.columns.values() {
            stats.bytes_loaded += col.compressed_len as u64;
            stats.bytes_decompressed += col.raw_len as u64;
        }

        let cols = match dir.read_block(idx, required) {
            Ok(cols) => cols,
            Err(_) => {
                stats.blocks_corrupted += 1;
                continue;
            }
        };
        stats.blocks_processed += 1;

        for i in 0..cols.num_rows {
            let sip = cols.sip.as_ref().map(|v| v[i]).unwrap_or(UNSET_IP);
            let dip = cols.dip.as_ref().map(|v| v[i]).unwrap_or(UNSET_IP);
            let dport = cols.dport.as_ref().map(|v| v[i]).unwrap_or(0);
            let proto = cols.proto.as_ref().map(|v| v[i]).unwrap_or(0);

            if !compiled.eval(&EvalKey { sip, dip, dport, proto }) {
                continue;
            }

            let key = GroupKey {
                iface: workload.iface.clone(),
                sip: group_by.contains(&Attribute::Sip).then_some(sip),
                dip: group_by.contains(&Attribute::Dip).then_some(dip),
                dport: group_by.contains(&Attribute::Dport).then_some(dport),
                proto: group_by.contains(&Attribute::Proto).then_some(proto),
                time: group_by_time.then_some(block_meta.start),
            };
            acc.entry(key).or_default().add(&cols.counters[i]);
        }
    }

    Ok((acc, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::condition::{compile, StubHostResolver};
    use crate::storage::{PersistedBlock, PersistedRow};
    use std::time::Duration;

    fn row(a: u8, b: u8, port: u16, proto: u8, pkts: u64) -> PersistedRow {
        PersistedRow {
            sip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)),
            dip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, b)),
            dport: port,
            proto,
            counters: FlowCounters {
                packets_rcvd: pkts,
                ..Default::default()
            },
        }
    }

    #[test]
    fn build_workloads_finds_intersecting_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = GPDir::open_write(dir.path(), "eth0", 0).unwrap();
        w.append(PersistedBlock { start: 10, end: 20, rows: vec![row(1, 2, 80, 6, 1)] }).unwrap();
        w.close().unwrap();

        let workloads = build_workloads(dir.path(), &["eth0".to_string()], 0, 100).unwrap();
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].block_indices, vec![0]);
    }

    #[test]
    fn run_workload_groups_by_requested_attributes_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = GPDir::open_write(dir.path(), "eth0", 0).unwrap();
        w.append(PersistedBlock {
            start: 10,
            end: 20,
            rows: vec![row(1, 2, 80, 6, 1), row(1, 3, 443, 6, 2)],
        })
        .unwrap();
        w.close().unwrap();

        let compiled = compile("", &StubHostResolver::new(), Duration::from_secs(1)).unwrap();
        let required: HashSet<Attribute> = [Attribute::Sip].into_iter().collect();
        let group_by: HashSet<Attribute> = [Attribute::Sip].into_iter().collect();
        let workloads = build_workloads(dir.path(), &["eth0".to_string()], 0, 100).unwrap();
        let (acc, stats) = run_workload(dir.path(), &workloads[0], &compiled, &required, &group_by, false).unwrap();

        assert_eq!(acc.len(), 1);
        let only = acc.values().next().unwrap();
        assert_eq!(only.packets_rcvd, 3);
        assert_eq!(stats.blocks_processed, 1);
    }

    #[test]
    fn corrupt_block_is_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = GPDir::open_write(dir.path(), "eth0", 0).unwrap();
        w.append(PersistedBlock { start: 10, end: 20, rows: vec![row(1, 2, 80, 6, 1)] }).unwrap();
        w.close().unwrap();

        // Corrupt the dport column file's frame body (past the magic/version header and length
        // prefix) so the file still opens but its zstd frame fails to decompress.
        let dport_path = dir.path().join("eth0").join("0").join("dport.gpf");
        let mut raw = std::fs::read(&dport_path).unwrap();
        let body_start = (crate::storage::GPFile::HEADER_LEN as usize) + 4;
        for byte in &mut raw[body_start..] {
            *byte ^= 0xFF;
        }
        std::fs::write(&dport_path, raw).unwrap();

        let compiled = compile("", &StubHostResolver::new(), Duration::from_secs(1)).unwrap();
        let required: HashSet<Attribute> = [Attribute::Dport].into_iter().collect();
        let group_by: HashSet<Attribute> = HashSet::new();
        let workloads = build_workloads(dir.path(), &["eth0".to_string()], 0, 100).unwrap();
        let (acc, stats) = run_workload(dir.path(), &workloads[0], &compiled, &required, &group_by, false).unwrap();

        assert!(acc.is_empty());
        assert_eq!(stats.blocks_corrupted, 1);
        assert_eq!(stats.blocks_processed, 0);
    }
}
