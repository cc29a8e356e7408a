//! flowquery - query CLI against the on-disk flow store, or a remote `flowprobe-web` server
//! over the `POST /_query` wire contract (§6).

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn, Level};
use tracing_subscriber::EnvFilter;

use flowprobe_core::error::{FlowError, FlowResult};
use flowprobe_core::flowkey::Attribute;
use flowprobe_core::query::condition::{compile, StdHostResolver, StubHostResolver};
use flowprobe_core::query::{execute_query, sort_and_truncate, Query, QueryResult, SortBy};
use flowprobe_core::storage::{clean_before, list_day_dirs, parse_day_epoch};
use flowprobe_core::time_parse::{default_first, default_last, now_epoch, parse_time};

#[derive(Parser)]
#[command(name = "flowquery", about = "Network flow query tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    query: QueryArgs,
}

#[derive(Subcommand)]
enum Command {
    /// List interfaces with stats.
    List,
    /// Print version information.
    Version,
    /// Administrative operations on the on-disk store.
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand)]
enum AdminAction {
    /// Remove day directories strictly older than the given date.
    Clean {
        /// Cutoff date, any `-f/-l` time format.
        date: String,
    },
    /// Remove the entire on-disk store under `db-path`.
    Wipe,
}

#[derive(Parser, Clone, Default, Serialize, Deserialize)]
struct QueryArgs {
    /// `talk_src|talk_dst|talk_conv|apps_port|agg_talk_port|raw`, or a comma-separated
    /// attribute list (`sip,dip,dport,proto`).
    #[arg(value_name = "QUERY_TYPE")]
    query_type: Option<String>,

    /// Interfaces: comma list; `!name` negates, `/regex/` matches by pattern, `ANY` selects all.
    #[arg(short = 'i', long, default_value = "ANY")]
    ifaces: String,

    /// Condition expression (§4.3 grammar).
    #[arg(short = 'c', long, default_value = "")]
    condition: String,

    /// Sort key: bytes, packets, or time.
    #[arg(short = 's', long, default_value = "bytes")]
    sort: String,

    /// Sort ascending instead of descending.
    #[arg(short = 'a', long)]
    ascending: bool,

    /// Top-N rows to keep after sorting.
    #[arg(short = 'n', long)]
    limit: Option<usize>,

    /// Restrict to inbound-only flows.
    #[arg(long = "in")]
    r#in: bool,

    /// Restrict to outbound-only flows.
    #[arg(long = "out")]
    out: bool,

    /// Collapse the result into a single summary row.
    #[arg(long)]
    sum: bool,

    /// Start of the time range (see §6 time formats).
    #[arg(short = 'f', long)]
    first: Option<String>,

    /// End of the time range (see §6 time formats).
    #[arg(short = 'l', long)]
    last: Option<String>,

    /// Output encoding: txt, csv, or json.
    #[arg(short = 'e', long, default_value = "txt")]
    format: String,

    /// On-disk flow store root.
    #[arg(short = 'd', long)]
    db_path: Option<PathBuf>,

    /// Resolve sip/dip to hostnames via DNS.
    #[arg(short = 'r', long)]
    resolve: bool,

    /// Cap the number of rows DNS-resolved (0 = unlimited).
    #[arg(long)]
    resolve_rows: Option<usize>,

    /// Per-lookup DNS resolve timeout in seconds.
    #[arg(long)]
    resolve_timeout: Option<u64>,

    /// Abort the query if resident memory exceeds this percentage.
    #[arg(long)]
    max_mem_pct: Option<f64>,

    /// Shorthand for a conservative memory cap.
    #[arg(long)]
    low_mem: bool,

    /// Remote `flowprobe-web` server address; when set, the query runs remotely over HTTP.
    #[arg(long = "query.server.addr")]
    query_server_addr: Option<String>,

    /// Remote query request timeout in seconds.
    #[arg(long = "query.timeout", default_value = "30")]
    query_timeout: u64,

    /// Load a canned query definition (YAML) instead of reading individual flags.
    #[arg(long)]
    stored_query: Option<PathBuf>,

    /// Log level (overrides config file).
    #[arg(long)]
    log_level: Option<String>,

    /// Path to a YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_logging(level: &str) {
    let level = match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("flowquery={level}").parse().unwrap())
        .add_directive(format!("flowprobe_core={level}").parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.query.log_level.as_deref().unwrap_or("info"));

    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> FlowResult<()> {
    match cli.command {
        Some(Command::List) => run_list(&cli.query),
        Some(Command::Version) => {
            println!("flowquery {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Command::Admin { action }) => run_admin(&cli.query, action),
        None => run_query(cli.query),
    }
}

fn db_root(args: &QueryArgs) -> FlowResult<PathBuf> {
    if let Some(p) = &args.db_path {
        return Ok(p.clone());
    }
    let config = flowprobe_core::config::Config::load_or_default(args.config.as_deref())?;
    Ok(PathBuf::from(config.db_path))
}

fn available_ifaces(root: &Path) -> FlowResult<Vec<String>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
    }
    out.sort();
    Ok(out)
}

fn run_list(args: &QueryArgs) -> FlowResult<()> {
    let root = db_root(args)?;
    let ifaces = available_ifaces(&root)?;
    if ifaces.is_empty() {
        println!("no interfaces");
        return Ok(());
    }
    for iface in &ifaces {
        let days = list_day_dirs(&root, iface, i64::MIN, i64::MAX).unwrap_or_default();
        println!("{iface}: {} day(s)", days.len());
    }
    Ok(())
}

fn run_admin(args: &QueryArgs, action: AdminAction) -> FlowResult<()> {
    let root = db_root(args)?;
    match action {
        AdminAction::Clean { date } => {
            let now = chrono::Utc::now();
            let cutoff_ts = parse_time(&date, now)?;
            let cutoff_day = flowprobe_core::time_parse::day_epoch_containing(cutoff_ts);
            let ifaces = available_ifaces(&root)?;
            let mut removed = 0usize;
            for iface in &ifaces {
                removed += clean_before(&root, iface, cutoff_day)?;
            }
            println!("removed {removed} day director{}", if removed == 1 { "y" } else { "ies" });
            Ok(())
        }
        AdminAction::Wipe => {
            if root.exists() {
                std::fs::remove_dir_all(&root)?;
            }
            println!("wiped {}", root.display());
            Ok(())
        }
    }
}

/// Resolves the `-i` selector syntax against the set of interfaces actually present on disk.
fn resolve_ifaces(spec: &str, available: &[String]) -> FlowResult<Vec<String>> {
    let mut positive: HashSet<String> = HashSet::new();
    let mut negative: HashSet<String> = HashSet::new();
    let mut saw_any = false;
    let mut saw_positive_token = false;

    for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if token.eq_ignore_ascii_case("ANY") {
            saw_any = true;
            continue;
        }
        let (negated, body) = match token.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        if !negated {
            saw_positive_token = true;
        }
        if let Some(pattern) = body.strip_prefix('/').and_then(|s| s.strip_suffix('/')) {
            let re = Regex::new(pattern)
                .map_err(|e| FlowError::invalid_argument(format!("bad interface regex '{pattern}': {e}")))?;
            for name in available.iter().filter(|n| re.is_match(n)) {
                if negated {
                    negative.insert(name.clone());
                } else {
                    positive.insert(name.clone());
                }
            }
        } else if negated {
            negative.insert(body.to_string());
        } else {
            positive.insert(body.to_string());
        }
    }

    let base: Vec<String> = if saw_any || !saw_positive_token {
        available.to_vec()
    } else {
        positive.into_iter().collect()
    };
    Ok(base.into_iter().filter(|n| !negative.contains(n)).collect())
}

/// Translates the positional `QUERY_TYPE` into a `group_by` attribute set plus whether the
/// result should also be bucketed by time (§6: canned query types, or a raw attribute list).
fn query_type_to_group_by(query_type: &str) -> FlowResult<(HashSet<Attribute>, bool)> {
    let set = |attrs: &[Attribute]| attrs.iter().copied().collect();
    match query_type {
        "talk_src" => Ok((set(&[Attribute::Sip]), false)),
        "talk_dst" => Ok((set(&[Attribute::Dip]), false)),
        "talk_conv" => Ok((set(&[Attribute::Sip, Attribute::Dip]), false)),
        "apps_port" => Ok((set(&[Attribute::Dport]), false)),
        "agg_talk_port" => Ok((set(&[Attribute::Sip, Attribute::Dip, Attribute::Dport]), false)),
        "raw" => Ok((set(&[Attribute::Sip, Attribute::Dip, Attribute::Dport, Attribute::Proto]), true)),
        list => {
            let mut attrs = HashSet::new();
            for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let attr = match name {
                    "sip" => Attribute::Sip,
                    "dip" => Attribute::Dip,
                    "dport" => Attribute::Dport,
                    "proto" => Attribute::Proto,
                    other => return Err(FlowError::invalid_argument(format!("unknown query type or attribute '{other}'"))),
                };
                attrs.insert(attr);
            }
            if attrs.is_empty() {
                return Err(FlowError::invalid_argument(format!("unrecognized QUERY_TYPE '{list}'")));
            }
            Ok((attrs, false))
        }
    }
}

fn parse_sort_by(s: &str) -> FlowResult<SortBy> {
    match s.to_ascii_lowercase().as_str() {
        "bytes" => Ok(SortBy::Bytes),
        "packets" => Ok(SortBy::Packets),
        "time" => Ok(SortBy::Time),
        other => Err(FlowError::invalid_argument(format!("unknown sort key '{other}'"))),
    }
}

fn build_condition(args: &QueryArgs) -> String {
    let direction = match (args.r#in, args.out) {
        (true, false) => Some("dir = in"),
        (false, true) => Some("dir = out"),
        _ => None,
    };
    match direction {
        Some(d) if args.condition.trim().is_empty() => d.to_string(),
        Some(d) => format!("({}) & ({d})", args.condition),
        None => args.condition.clone(),
    }
}

fn build_query(args: &QueryArgs, ifaces: Vec<String>) -> FlowResult<Query> {
    let query_type = args
        .query_type
        .as_deref()
        .ok_or_else(|| FlowError::invalid_argument("QUERY_TYPE is required"))?;
    let (group_by, group_by_time) = query_type_to_group_by(query_type)?;

    let now = chrono::Utc::now();
    let first = match &args.first {
        Some(s) => parse_time(s, now)?,
        None => default_first(now, group_by_time),
    };
    let last = match &args.last {
        Some(s) => parse_time(s, now)?,
        None => default_last(now),
    };

    let resolve_timeout = Duration::from_secs(args.resolve_timeout.unwrap_or(2));
    let max_mem_pct = if args.low_mem {
        Some(args.max_mem_pct.unwrap_or(20.0))
    } else {
        args.max_mem_pct
    };

    Ok(Query {
        ifaces,
        first_ts: first,
        last_ts: last,
        condition: build_condition(args),
        group_by,
        group_by_time,
        sort_by: parse_sort_by(&args.sort)?,
        ascending: args.ascending,
        limit: args.limit,
        live: false,
        resolve_dns: resolve_timeout,
        max_mem_pct,
    })
}

fn load_stored_query(path: &Path, cli: &QueryArgs) -> FlowResult<QueryArgs> {
    let text = std::fs::read_to_string(path)?;
    let mut stored: QueryArgs = serde_yaml::from_str(&text)
        .map_err(|e| FlowError::invalid_argument(format!("bad stored query '{}': {e}", path.display())))?;
    // Connection/runtime flags always come from the live invocation, never the canned file.
    stored.db_path = cli.db_path.clone();
    stored.config = cli.config.clone();
    stored.log_level = cli.log_level.clone();
    stored.query_server_addr = cli.query_server_addr.clone();
    stored.query_timeout = cli.query_timeout;
    Ok(stored)
}

fn run_query(args: QueryArgs) -> FlowResult<()> {
    let args = match &args.stored_query {
        Some(path) => load_stored_query(path, &args)?,
        None => args,
    };

    let result = if let Some(addr) = args.query_server_addr.clone() {
        run_remote(&args, &addr)?
    } else {
        run_local(&args)?
    };

    print_result(&result, &args)
}

fn run_local(args: &QueryArgs) -> FlowResult<QueryResult> {
    let root = db_root(args)?;
    let available = available_ifaces(&root)?;
    let ifaces = resolve_ifaces(&args.ifaces, &available)?;
    if ifaces.is_empty() {
        warn!("no interfaces matched selector '{}'", args.ifaces);
    }
    let query = build_query(args, ifaces)?;

    let compiled = if args.resolve {
        compile(&query.condition, &StdHostResolver, query.resolve_dns)?
    } else {
        compile(&query.condition, &StubHostResolver::default(), query.resolve_dns)?
    };

    let raw = execute_query(&root, &query, &compiled, None, None)?;
    Ok(sort_and_truncate(raw, &query))
}

#[derive(Serialize)]
struct RemoteQueryRequest {
    ifaces: Vec<String>,
    first_ts: i64,
    last_ts: i64,
    condition: String,
    group_by: Vec<String>,
    group_by_time: bool,
    sort_by: String,
    ascending: bool,
    limit: Option<usize>,
    live: bool,
    resolve_dns_secs: u64,
    max_mem_pct: Option<f64>,
}

#[derive(Deserialize)]
struct RemoteEnvelope {
    #[allow(dead_code)]
    status_code: u16,
    error: Option<String>,
    data: Option<QueryResult>,
}

fn run_remote(args: &QueryArgs, addr: &str) -> FlowResult<QueryResult> {
    let available: Vec<String> = Vec::new(); // remote mode: the server resolves "ANY" itself
    let ifaces: Vec<String> = if args.ifaces.eq_ignore_ascii_case("ANY") {
        Vec::new()
    } else {
        resolve_ifaces(&args.ifaces, &available)?
    };
    let query = build_query(args, ifaces)?;

    let req = RemoteQueryRequest {
        ifaces: query.ifaces.clone(),
        first_ts: query.first_ts,
        last_ts: query.last_ts,
        condition: query.condition.clone(),
        group_by: query.group_by.iter().map(|a| a.column_name().to_string()).collect(),
        group_by_time: query.group_by_time,
        sort_by: match query.sort_by {
            SortBy::Bytes => "bytes",
            SortBy::Packets => "packets",
            SortBy::Time => "time",
        }
        .to_string(),
        ascending: query.ascending,
        limit: query.limit,
        live: query.live,
        resolve_dns_secs: query.resolve_dns.as_secs(),
        max_mem_pct: query.max_mem_pct,
    };

    let url = format!("http://{addr}/_query");
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(args.query_timeout))
        .build()
        .map_err(|e| FlowError::internal(format!("failed to build HTTP client: {e}")))?;
    let resp = client
        .post(&url)
        .json(&req)
        .send()
        .map_err(|e| FlowError::unavailable(format!("request to '{url}' failed: {e}")))?;
    let envelope: RemoteEnvelope = resp
        .json()
        .map_err(|e| FlowError::internal(format!("malformed response from '{url}': {e}")))?;
    if let Some(err) = envelope.error {
        return Err(FlowError::invalid_argument(err));
    }
    envelope
        .data
        .ok_or_else(|| FlowError::internal("server returned no data and no error"))
}

/// Builds a reverse resolver for row display when `-r` is set. Falls back to no resolution (the
/// plain IP is printed) if the system DNS config can't be read, rather than failing the query.
fn row_resolver(args: &QueryArgs) -> Option<hickory_resolver::Resolver> {
    if !args.resolve {
        return None;
    }
    match hickory_resolver::Resolver::from_system_conf() {
        Ok(r) => Some(r),
        Err(e) => {
            warn!("row hostname resolution disabled: {e}");
            None
        }
    }
}

/// Reverse-resolves `ip` to its first PTR record, stripping the trailing root dot. `_timeout` is
/// accepted for interface parity with `--resolve-timeout`, same as `StdHostResolver`: the
/// synchronous resolver has no per-call deadline, only the timeout baked into its system config.
fn reverse_resolve(resolver: &hickory_resolver::Resolver, ip: IpAddr, _timeout: Duration) -> Option<String> {
    resolver
        .reverse_lookup(ip)
        .ok()
        .and_then(|names| names.iter().next().map(|n| n.to_string().trim_end_matches('.').to_string()))
}

/// Resolves row `i`'s `ip` to a hostname when resolution is enabled, `i` is within
/// `--resolve-rows`' cap (`None`/`Some(0)` both mean unlimited, per its doc comment), and the PTR
/// lookup succeeds; otherwise returns `none_str` for an absent attribute or the plain IP text.
fn display_host(
    resolver: Option<&hickory_resolver::Resolver>,
    resolve_rows: Option<usize>,
    resolve_timeout: Duration,
    i: usize,
    ip: Option<IpAddr>,
    none_str: &str,
) -> String {
    let Some(addr) = ip else {
        return none_str.to_string();
    };
    let cap = match resolve_rows {
        None | Some(0) => usize::MAX,
        Some(n) => n,
    };
    if let Some(resolver) = resolver {
        if i < cap {
            if let Some(name) = reverse_resolve(resolver, addr, resolve_timeout) {
                return name;
            }
        }
    }
    addr.to_string()
}

fn print_result(result: &QueryResult, args: &QueryArgs) -> FlowResult<()> {
    let resolver = row_resolver(args);
    let resolve_timeout = Duration::from_secs(args.resolve_timeout.unwrap_or(2));

    match args.format.to_ascii_lowercase().as_str() {
        "json" => {
            let json = serde_json::to_string_pretty(result)
                .map_err(|e| FlowError::internal(format!("failed to serialize result: {e}")))?;
            println!("{json}");
        }
        "csv" => {
            println!("iface,sip,dip,dport,proto,time,bytes_rcvd,bytes_sent,packets_rcvd,packets_sent");
            for (i, row) in result.rows.iter().enumerate() {
                println!(
                    "{},{},{},{},{},{},{},{},{},{}",
                    row.iface,
                    display_host(resolver.as_ref(), args.resolve_rows, resolve_timeout, i, row.sip, ""),
                    display_host(resolver.as_ref(), args.resolve_rows, resolve_timeout, i, row.dip, ""),
                    row.dport.map(|v| v.to_string()).unwrap_or_default(),
                    row.proto.map(|v| v.to_string()).unwrap_or_default(),
                    row.time.map(|v| v.to_string()).unwrap_or_default(),
                    row.counters.bytes_rcvd,
                    row.counters.bytes_sent,
                    row.counters.packets_rcvd,
                    row.counters.packets_sent,
                );
            }
        }
        _ => {
            for (i, row) in result.rows.iter().enumerate() {
                println!(
                    "{:<12} {:<16} {:<16} {:<6} {:<4} bytes_rcvd={:<10} bytes_sent={:<10} packets_rcvd={:<8} packets_sent={:<8}",
                    row.iface,
                    display_host(resolver.as_ref(), args.resolve_rows, resolve_timeout, i, row.sip, "-"),
                    display_host(resolver.as_ref(), args.resolve_rows, resolve_timeout, i, row.dip, "-"),
                    row.dport.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
                    row.proto.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
                    row.counters.bytes_rcvd,
                    row.counters.bytes_sent,
                    row.counters.packets_rcvd,
                    row.counters.packets_sent,
                );
            }
            println!(
                "--\ntotal: bytes_rcvd={} bytes_sent={} packets_rcvd={} packets_sent={} (displayed {}/{})",
                result.summary.totals.bytes_rcvd,
                result.summary.totals.bytes_sent,
                result.summary.totals.packets_rcvd,
                result.summary.totals.packets_sent,
                result.summary.hits.displayed,
                result.summary.hits.total,
            );
        }
    }
    Ok(())
}
