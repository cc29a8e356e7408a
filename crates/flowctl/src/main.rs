//! flowctl - control CLI for a running `flowprobe-web` server: interface status, running
//! configuration (inspect/apply/reload), and a live-flow snapshot (§6, the `gpctl` contract).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{error, Level};
use tracing_subscriber::EnvFilter;

use flowprobe_core::error::{FlowError, FlowResult};
use flowprobe_core::flowkey::FlowCounters;

#[derive(Parser)]
#[command(name = "flowctl", about = "Control CLI for a flowprobed/flowprobe-web server", version)]
struct Cli {
    /// Server address, host:port.
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Request timeout in seconds.
    #[arg(short = 't', long, default_value = "10")]
    timeout: u64,

    /// Log level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture status per interface.
    Status {
        /// Comma-separated interface names; all interfaces if omitted.
        ifaces: Option<String>,
    },
    /// Running capture configuration per interface.
    Config {
        /// Comma-separated interface names; all interfaces if omitted.
        ifaces: Option<String>,
        /// Apply the configuration in this YAML file to the named interfaces.
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,
        /// Reload the server's on-disk configuration file.
        #[arg(short = 'r', long)]
        reload: bool,
    },
    /// Live, in-memory flow snapshot per interface.
    Flows {
        /// Comma-separated interface names; all interfaces if omitted.
        ifaces: Option<String>,
    },
    /// Print version information.
    Version,
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
        .add_directive(format!("flowctl={level}").parse().unwrap())
        .add_directive(format!("flowprobe_core={level}").parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref().unwrap_or("info"));

    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            1
        }
    };
    std::process::exit(exit_code);
}

// ── wire DTOs, mirroring flowprobe-web's `wire` module (§6 JSON contract) ───────────────

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[allow(dead_code)]
    status_code: u16,
    error: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CaptureConfigDto {
    promiscuous: bool,
    ring_buffer_size: usize,
    capture_length: usize,
}

#[derive(Debug, Deserialize)]
struct StatusDto {
    name: String,
    state: String,
    config: CaptureConfigDto,
    packets_read: u64,
    packets_parse_errors: u64,
    started_at: String,
    active_flows: usize,
}

#[derive(Debug, Deserialize)]
struct FlowRowDto {
    iface: String,
    sip: std::net::IpAddr,
    dip: std::net::IpAddr,
    dport: u16,
    proto: u8,
    counters: FlowCounters,
}

#[derive(Debug, Serialize)]
struct ConfigUpdateRequest {
    ifaces: Vec<String>,
    config: CaptureConfigDto,
}

/// A stored-on-disk config file: one block per interface, same shape as `ConfigUpdateRequest`
/// but readable as plain YAML (mirrors `flowprobe_core::config::Config`'s serde style).
#[derive(Debug, Deserialize)]
struct StoredConfigFile {
    ifaces: Vec<String>,
    config: CaptureConfigDto,
}

// ── HTTP plumbing ────────────────────────────────────────────────────────────────────

fn client(timeout_secs: u64) -> FlowResult<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| FlowError::internal(format!("failed to build HTTP client: {e}")))
}

fn get<T: serde::de::DeserializeOwned>(cli: &Cli, path: &str, ifaces: &Option<String>) -> FlowResult<Option<T>> {
    let mut url = format!("http://{}{}", cli.server, path);
    if let Some(list) = ifaces {
        url.push_str("?ifaces=");
        url.push_str(list);
    }
    let resp = client(cli.timeout)?
        .get(&url)
        .send()
        .map_err(|e| FlowError::unavailable(format!("request to '{url}' failed: {e}")))?;
    if resp.status() == reqwest::StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let envelope: Envelope<T> = resp
        .json()
        .map_err(|e| FlowError::internal(format!("malformed response from '{url}': {e}")))?;
    if let Some(err) = envelope.error {
        return Err(FlowError::invalid_argument(err));
    }
    Ok(envelope.data)
}

fn put(cli: &Cli, path: &str, body: &impl Serialize) -> FlowResult<()> {
    let url = format!("http://{}{}", cli.server, path);
    let resp = client(cli.timeout)?
        .put(&url)
        .json(body)
        .send()
        .map_err(|e| FlowError::unavailable(format!("request to '{url}' failed: {e}")))?;
    let envelope: Envelope<()> = resp
        .json()
        .map_err(|e| FlowError::internal(format!("malformed response from '{url}': {e}")))?;
    match envelope.error {
        Some(err) => Err(FlowError::invalid_argument(err)),
        None => Ok(()),
    }
}

fn post_empty(cli: &Cli, path: &str) -> FlowResult<()> {
    let url = format!("http://{}{}", cli.server, path);
    let resp = client(cli.timeout)?
        .post(&url)
        .send()
        .map_err(|e| FlowError::unavailable(format!("request to '{url}' failed: {e}")))?;
    let envelope: Envelope<()> = resp
        .json()
        .map_err(|e| FlowError::internal(format!("malformed response from '{url}': {e}")))?;
    match envelope.error {
        Some(err) => Err(FlowError::invalid_argument(err)),
        None => Ok(()),
    }
}

// ── subcommand implementations ──────────────────────────────────────────────────────

fn run(cli: Cli) -> FlowResult<()> {
    match &cli.command {
        Command::Version => {
            println!("flowctl {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Status { ifaces } => run_status(&cli, ifaces),
        Command::Config { ifaces, file, reload } => run_config(&cli, ifaces, file, *reload),
        Command::Flows { ifaces } => run_flows(&cli, ifaces),
    }
}

fn run_status(cli: &Cli, ifaces: &Option<String>) -> FlowResult<()> {
    let rows: Vec<StatusDto> = get(cli, "/status", ifaces)?.unwrap_or_default();
    if rows.is_empty() {
        println!("no interfaces");
        return Ok(());
    }
    for row in &rows {
        println!(
            "{:<12} {:<12} flows={:<8} read={:<10} parse_errors={:<6} promisc={} ring={} caplen={} started={}",
            row.name,
            row.state,
            row.active_flows,
            row.packets_read,
            row.packets_parse_errors,
            row.config.promiscuous,
            row.config.ring_buffer_size,
            row.config.capture_length,
            row.started_at,
        );
    }
    Ok(())
}

fn run_config(cli: &Cli, ifaces: &Option<String>, file: &Option<PathBuf>, reload: bool) -> FlowResult<()> {
    if reload {
        post_empty(cli, "/config/_reload")?;
        println!("configuration reloaded");
        return Ok(());
    }
    if let Some(path) = file {
        let text = std::fs::read_to_string(path)?;
        let stored: StoredConfigFile = serde_yaml::from_str(&text)
            .map_err(|e| FlowError::invalid_argument(format!("bad config file '{}': {e}", path.display())))?;
        let req = ConfigUpdateRequest { ifaces: stored.ifaces.clone(), config: stored.config };
        put(cli, "/config", &req)?;
        println!("applied configuration to {} interface(s)", req.ifaces.len());
        return Ok(());
    }
    let rows: Vec<(String, CaptureConfigDto)> = get(cli, "/config", ifaces)?.unwrap_or_default();
    if rows.is_empty() {
        println!("no interfaces");
        return Ok(());
    }
    for (name, config) in &rows {
        println!(
            "{:<12} promiscuous={} ring_buffer_size={} capture_length={}",
            name, config.promiscuous, config.ring_buffer_size, config.capture_length,
        );
    }
    Ok(())
}

fn run_flows(cli: &Cli, ifaces: &Option<String>) -> FlowResult<()> {
    let rows: Vec<FlowRowDto> = get(cli, "/flows", ifaces)?.unwrap_or_default();
    if rows.is_empty() {
        println!("no flows");
        return Ok(());
    }
    for row in &rows {
        println!(
            "{:<12} {:<16} {:<16} {:<6} {:<4} bytes_rcvd={:<10} bytes_sent={:<10} packets_rcvd={:<8} packets_sent={:<8}",
            row.iface,
            row.sip,
            row.dip,
            row.dport,
            row.proto,
            row.counters.bytes_rcvd,
            row.counters.bytes_sent,
            row.counters.packets_rcvd,
            row.counters.packets_sent,
        );
    }
    Ok(())
}
