//! Result sorting and top-N selection (§4.4).
//!
//! Sort key is the requested [`SortBy`] column; ties break by (sip, dip, dport, proto)
//! lexicographically, then by interface name, giving every query a fully deterministic row
//! order regardless of which worker produced a given group first (§4.4, §8).

use super::types::{Query, QueryResult, ResultRow, SortBy};
use std::cmp::Ordering;
use std::net::IpAddr;

fn ip_sort_key(ip: Option<IpAddr>) -> (u8, Vec<u8>) {
    match ip {
        None => (0, Vec::new()),
        Some(IpAddr::V4(v4)) => (1, v4.octets().to_vec()),
        Some(IpAddr::V6(v6)) => (2, v6.octets().to_vec()),
    }
}

fn tie_break(a: &ResultRow, b: &ResultRow) -> Ordering {
    ip_sort_key(a.sip)
        .cmp(&ip_sort_key(b.sip))
        .then_with(|| ip_sort_key(a.dip).cmp(&ip_sort_key(b.dip)))
        .then_with(|| a.dport.cmp(&b.dport))
        .then_with(|| a.proto.cmp(&b.proto))
        .then_with(|| a.iface.cmp(&b.iface))
}

fn primary_key(row: &ResultRow, sort_by: SortBy) -> u64 {
    match sort_by {
        SortBy::Bytes => row.counters.bytes_rcvd + row.counters.bytes_sent,
        SortBy::Packets => row.counters.packets_rcvd + row.counters.packets_sent,
        SortBy::Time => row.time.unwrap_or(0) as u64,
    }
}

/// Sorts `rows` in place by `sort_by` (descending unless `ascending`), tie-breaking
/// deterministically, then truncates to `limit` — or, when `limit` is `None`, to the smallest
/// prefix whose displayed total reaches at least 95% of the grand total (§4.4's default
/// "top talkers" behavior), recording the true totals in `hits`/`summary` either way.
///
/// When the query groups by the `time` attribute, §4.4 forces the sort to time-ascending
/// regardless of the requested `sort_by`/`ascending` (a time-series result must read in time
/// order, not by whichever column the caller happened to ask for).
pub fn sort_and_truncate(mut result: QueryResult, query: &Query) -> QueryResult {
    let (sort_by, ascending) =
        if query.group_by_time { (SortBy::Time, true) } else { (query.sort_by, query.ascending) };

    result.rows.sort_by(|a, b| {
        let ord = primary_key(a, sort_by).cmp(&primary_key(b, sort_by));
        let ord = if ascending { ord } else { ord.reverse() };
        ord.then_with(|| tie_break(a, b))
    });

    result.summary.hits.total = result.rows.len() as u64;

    let keep = match query.limit {
        Some(limit) => limit.min(result.rows.len()),
        None => default_prefix_len(&result.rows, sort_by),
    };
    result.rows.truncate(keep);
    result.summary.hits.displayed = result.rows.len() as u64;
    result
}

/// The smallest prefix whose cumulative `sort_by` value reaches 95% of the column's grand total,
/// never fewer than 1 row when any rows exist (§4.4).
fn default_prefix_len(rows: &[ResultRow], sort_by: SortBy) -> usize {
    if rows.is_empty() {
        return 0;
    }
    let grand_total: u64 = rows.iter().map(|r| primary_key(r, sort_by)).sum();
    if grand_total == 0 {
        return rows.len();
    }
    let threshold = (grand_total as f64 * 0.95).ceil() as u64;
    let mut running = 0u64;
    for (i, row) in rows.iter().enumerate() {
        running += primary_key(row, sort_by);
        if running >= threshold {
            return i + 1;
        }
    }
    rows.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowkey::FlowCounters;
    use crate::query::types::{Hits, QueryStats, Summary};
    use std::collections::HashSet;
    use std::time::Duration;

    fn base_query() -> Query {
        Query {
            ifaces: vec!["eth0".to_string()],
            first_ts: 0,
            last_ts: 1,
            condition: String::new(),
            group_by: HashSet::new(),
            group_by_time: false,
            sort_by: SortBy::Bytes,
            ascending: false,
            limit: None,
            live: false,
            resolve_dns: Duration::from_secs(1),
            max_mem_pct: None,
        }
    }

    fn row(bytes: u64) -> ResultRow {
        ResultRow {
            iface: "eth0".to_string(),
            sip: None,
            dip: None,
            dport: None,
            proto: None,
            time: None,
            counters: FlowCounters { bytes_rcvd: bytes, ..Default::default() },
        }
    }

    fn result(rows: Vec<ResultRow>) -> QueryResult {
        QueryResult { rows, summary: Summary { totals: FlowCounters::default(), hits: Hits::default() }, stats: QueryStats::default() }
    }

    #[test]
    fn sorts_descending_by_bytes_by_default() {
        let query = base_query();
        let sorted = sort_and_truncate(result(vec![row(10), row(100), row(1)]), &query);
        let values: Vec<u64> = sorted.rows.iter().map(|r| r.counters.bytes_rcvd).collect();
        assert_eq!(values, vec![100, 10, 1]);
    }

    #[test]
    fn explicit_limit_truncates() {
        let mut query = base_query();
        query.limit = Some(2);
        let sorted = sort_and_truncate(result(vec![row(10), row(100), row(1)]), &query);
        assert_eq!(sorted.rows.len(), 2);
        assert_eq!(sorted.summary.hits.total, 3);
        assert_eq!(sorted.summary.hits.displayed, 2);
    }

    #[test]
    fn default_limit_stops_at_95_percent_of_total() {
        let query = base_query();
        // total = 100; first row alone is 96% of it.
        let sorted = sort_and_truncate(result(vec![row(1), row(1), row(2), row(96)]), &query);
        assert_eq!(sorted.rows.len(), 1);
        assert_eq!(sorted.summary.hits.total, 4);
    }

    #[test]
    fn ties_break_on_attribute_tuple_then_iface() {
        let query = base_query();
        let mut a = row(5);
        a.sip = Some("10.0.0.2".parse().unwrap());
        let mut b = row(5);
        b.sip = Some("10.0.0.1".parse().unwrap());
        let sorted = sort_and_truncate(result(vec![a, b]), &query);
        assert_eq!(sorted.rows[0].sip, Some("10.0.0.1".parse().unwrap()));
    }
}
