//! Parallel execution and streaming aggregation (§4.4, §4.5).
//!
//! Grounded in the teacher's collection loop's worker/channel shape (bounded
//! `mpsc::sync_channel`, a fixed worker pool draining a shared queue) applied here to fan a
//! query's workloads out across a thread pool and fan per-workload partial results back into one
//! merge point. Workers run inside a scoped thread block so they can borrow the compiled
//! condition directly instead of needing an `Arc` per call. The watchdog is polled once per
//! worker result rather than per-row: per §4.5 the granularity only needs to catch growth across
//! whole blocks, and polling every row would dominate the hot loop.

use super::condition::{CompiledCondition, EvalKey};
use super::types::{Hits, Query, QueryResult, QueryStats, ResultRow, Summary};
use super::workmanager::{build_workloads, run_workload, GroupKey};
use crate::capture::CaptureManager;
use crate::error::{FlowError, FlowResult};
use crate::flowkey::{Attribute, FlowCounters};
use crate::watchdog::HeapWatchdog;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

struct WorkerOutput {
    groups: HashMap<GroupKey, FlowCounters>,
    stats: QueryStats,
}

/// Runs `query` against on-disk storage (and, when `query.live`, the manager's in-memory
/// snapshot) and returns the merged, unsorted result (§4.4). Sorting/top-N is a separate pass
/// ([`crate::query::sort::sort_and_truncate`]) so callers can apply it after merge without
/// re-running the scan.
pub fn execute_query(
    db_root: &Path,
    query: &Query,
    compiled: &CompiledCondition,
    capture_manager: Option<&CaptureManager>,
    watchdog: Option<&HeapWatchdog>,
) -> FlowResult<QueryResult> {
    let required = query.required_attributes(compiled.attributes());
    let workloads = build_workloads(db_root, &query.ifaces, query.first_ts, query.last_ts)?;

    let n_workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(workloads.len().max(1));

    let work_queue = Mutex::new(workloads.into_iter());
    let (out_tx, out_rx) = mpsc::sync_channel::<FlowResult<WorkerOutput>>(64);

    let merged = thread::scope(|scope| {
        for _ in 0..n_workers.max(1) {
            let work_queue = &work_queue;
            let out_tx = out_tx.clone();
            let required = &required;
            let group_by = &query.group_by;
            let group_by_time = query.group_by_time;
            scope.spawn(move || loop {
                let workload = work_queue.lock().expect("work queue mutex poisoned").next();
                let Some(workload) = workload else {
                    break;
                };
                let result = run_workload(db_root, &workload, compiled, required, group_by, group_by_time)
                    .map(|(groups, stats)| WorkerOutput { groups, stats });
                if out_tx.send(result).is_err() {
                    break;
                }
            });
        }
        drop(out_tx);

        let mut merged: HashMap<GroupKey, FlowCounters> = HashMap::new();
        let mut stats = QueryStats::default();
        let mut first_error = None;

        for output in out_rx {
            if let Some(watchdog) = watchdog {
                if watchdog.breached() {
                    first_error.get_or_insert(FlowError::resource_exhausted(
                        "query aborted: memory watchdog threshold exceeded",
                    ));
                    continue;
                }
            }
            match output {
                Ok(worker_output) => {
                    for (key, counters) in worker_output.groups {
                        merged.entry(key).or_default().add(&counters);
                    }
                    stats.merge(&worker_output.stats);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok((merged, stats)),
        }
    })?;

    let (mut merged, stats) = merged;

    if query.live {
        if let Some(manager) = capture_manager {
            fold_live_snapshot(manager, query, compiled, &mut merged);
        }
    }

    Ok(finish(merged, stats, compiled.direction_filter))
}

/// Folds the capture manager's current in-memory flows into `merged`, applying the same
/// predicate and grouping as the on-disk pass (§4.4 "hybrid live+on-disk queries"). The
/// direction filter is intentionally not applied here either (see `run_workload`'s doc comment)
/// so live and on-disk sources contribute identically to `summary.totals`.
fn fold_live_snapshot(
    manager: &CaptureManager,
    query: &Query,
    compiled: &CompiledCondition,
    merged: &mut HashMap<GroupKey, FlowCounters>,
) {
    let snapshots = manager.snapshot_flows(&query.ifaces);
    for (iface, map) in snapshots {
        for (key_bytes, is_v4, counters) in map.iter(None) {
            let (sip, dip, dport, proto) = decode_eval_fields(key_bytes, is_v4);
            if !compiled.eval(&EvalKey { sip, dip, dport, proto }) {
                continue;
            }
            let key = GroupKey {
                iface: iface.clone(),
                sip: query.group_by.contains(&Attribute::Sip).then_some(sip),
                dip: query.group_by.contains(&Attribute::Dip).then_some(dip),
                dport: query.group_by.contains(&Attribute::Dport).then_some(dport),
                proto: query.group_by.contains(&Attribute::Proto).then_some(proto),
                time: None,
            };
            merged.entry(key).or_default().add(&counters);
        }
    }
}

fn decode_eval_fields(bytes: &[u8], is_v4: bool) -> (IpAddr, IpAddr, u16, u8) {
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

/// Computes `summary.totals` over every aggregated group, then applies the direction filter (if
/// any) while emitting the row list (§4.4: the filter "reduces both the row set and the
/// displayed-hits counter but NOT the summary totals").
fn finish(
    merged: HashMap<GroupKey, FlowCounters>,
    stats: QueryStats,
    direction_filter: Option<crate::query::condition::DirectionFilter>,
) -> QueryResult {
    let mut totals = FlowCounters::default();
    let total_hits = merged.len() as u64;
    let rows: Vec<ResultRow> = merged
        .into_iter()
        .filter_map(|(key, counters)| {
            totals.add(&counters);
            match direction_filter {
                Some(filter) if !filter.matches(&counters) => None,
                _ => Some(ResultRow {
                    iface: key.iface,
                    sip: key.sip,
                    dip: key.dip,
                    dport: key.dport,
                    proto: key.proto,
                    time: key.time,
                    counters,
                }),
            }
        })
        .collect();

    let displayed_hits = rows.len() as u64;
    QueryResult {
        rows,
        summary: Summary {
            totals,
            hits: Hits {
                total: total_hits,
                displayed: displayed_hits,
            },
        },
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::condition::{compile, StubHostResolver};
    use crate::query::types::SortBy;
    use crate::storage::{GPDir, PersistedBlock, PersistedRow};
    use std::collections::HashSet;
    use std::time::Duration;

    fn row(a: u8, b: u8, port: u16, proto: u8, pkts: u64) -> PersistedRow {
        PersistedRow {
            sip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)),
            dip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, b)),
            dport: port,
            proto,
            counters: FlowCounters { packets_rcvd: pkts, ..Default::default() },
        }
    }

    #[test]
    fn execute_query_merges_across_days() {
        let dir = tempfile::tempdir().unwrap();
        let mut w0 = GPDir::open_write(dir.path(), "eth0", 0).unwrap();
        w0.append(PersistedBlock { start: 10, end: 20, rows: vec![row(1, 2, 80, 6, 1)] }).unwrap();
        w0.close().unwrap();
        let mut w1 = GPDir::open_write(dir.path(), "eth0", 86_400).unwrap();
        w1.append(PersistedBlock { start: 86_410, end: 86_420, rows: vec![row(1, 2, 80, 6, 4)] }).unwrap();
        w1.close().unwrap();

        let compiled = compile("", &StubHostResolver::new(), Duration::from_secs(1)).unwrap();
        let query = Query {
            ifaces: vec!["eth0".to_string()],
            first_ts: 0,
            last_ts: 200_000,
            condition: String::new(),
            group_by: HashSet::new(),
            group_by_time: false,
            sort_by: SortBy::Packets,
            ascending: false,
            limit: None,
            live: false,
            resolve_dns: Duration::from_secs(1),
            max_mem_pct: None,
        };
        let result = execute_query(dir.path(), &query, &compiled, None, None).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].counters.packets_rcvd, 5);
        assert_eq!(result.stats.directories_processed, 2);
    }

    #[test]
    fn no_matching_storage_yields_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let compiled = compile("", &StubHostResolver::new(), Duration::from_secs(1)).unwrap();
        let query = Query {
            ifaces: vec!["eth0".to_string()],
            first_ts: 0,
            last_ts: 100,
            condition: String::new(),
            group_by: HashSet::new(),
            group_by_time: false,
            sort_by: SortBy::Bytes,
            ascending: false,
            limit: None,
            live: false,
            resolve_dns: Duration::from_secs(1),
            max_mem_pct: None,
        };
        let result = execute_query(dir.path(), &query, &compiled, None, None).unwrap();
        assert!(result.rows.is_empty());
        assert!(result.summary.totals.is_zero());
    }

    #[test]
    fn direction_filter_shrinks_rows_but_not_totals() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = GPDir::open_write(dir.path(), "eth0", 0).unwrap();
        w.append(PersistedBlock {
            start: 10,
            end: 20,
            rows: vec![
                PersistedRow {
                    sip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                    dip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                    dport: 80,
                    proto: 6,
                    counters: FlowCounters { packets_rcvd: 3, ..Default::default() },
                },
                PersistedRow {
                    sip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                    dip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
                    dport: 443,
                    proto: 6,
                    counters: FlowCounters { packets_sent: 7, ..Default::default() },
                },
            ],
        })
        .unwrap();
        w.close().unwrap();

        let query = Query {
            ifaces: vec!["eth0".to_string()],
            first_ts: 0,
            last_ts: 100,
            condition: String::new(),
            group_by: [Attribute::Sip, Attribute::Dip].into_iter().collect(),
            group_by_time: false,
            sort_by: SortBy::Packets,
            ascending: false,
            limit: None,
            live: false,
            resolve_dns: Duration::from_secs(1),
            max_mem_pct: None,
        };

        let unfiltered = compile("", &StubHostResolver::new(), Duration::from_secs(1)).unwrap();
        let baseline = execute_query(dir.path(), &query, &unfiltered, None, None).unwrap();
        assert_eq!(baseline.rows.len(), 2);
        assert_eq!(baseline.summary.hits.total, 2);
        assert_eq!(baseline.summary.hits.displayed, 2);

        let filtered = compile("dir = in", &StubHostResolver::new(), Duration::from_secs(1)).unwrap();
        let result = execute_query(dir.path(), &query, &filtered, None, None).unwrap();

        // Only the inbound-only flow survives the display filter...
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].counters.packets_rcvd, 3);
        assert_eq!(result.summary.hits.total, 2);
        assert_eq!(result.summary.hits.displayed, 1);
        // ...but the totals are identical to the unfiltered query (§4.4, §8 scenario 4).
        assert_eq!(result.summary.totals, baseline.summary.totals);
    }
}
