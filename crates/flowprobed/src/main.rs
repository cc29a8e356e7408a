//! flowprobed - network flow capture daemon.
//!
//! Owns one `Capture` per configured interface, polls their packet sources, and rotates live
//! flow maps out to the on-disk column store on a fixed period.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Releases unused memory back to the operating system via jemalloc's arena purge.
fn release_memory_to_os() {
    // SAFETY: mallctl is called with a valid, null-terminated control string and no input/output
    // buffers, matching the documented no-args form of "arena.<n>.purge".
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.4096.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use flowprobe_core::capture::{CaptureConfig, CaptureManager, MockPacketSource};
use flowprobe_core::config::Config;
use flowprobe_core::storage::host_id;
use flowprobe_core::watchdog::HeapWatchdog;

/// Network flow capture daemon.
#[derive(Parser)]
#[command(name = "flowprobed", about = "Network flow capture daemon", version)]
struct Args {
    /// Path to a YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory for the on-disk flow store (overrides the config file's db_path).
    #[arg(short = 'd', long)]
    db_path: Option<PathBuf>,

    /// Interface to capture on. May be given multiple times. With no packet-capture library
    /// linked in (this crate consumes raw frames from a platform-supplied source, never
    /// captures them itself), each named interface runs against an empty mock source until a
    /// real `PacketSource` is wired in at the call site for a target platform.
    #[arg(long = "iface")]
    ifaces: Vec<String>,

    /// Rotation period in seconds (overrides the config file's rotation_period_secs).
    #[arg(long)]
    rotation_period: Option<u64>,

    /// Heap watchdog memory cap as a percentage of physical memory (overrides the config
    /// file's max_mem_pct).
    #[arg(long)]
    max_mem_pct: Option<f64>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("flowprobed={level}").parse().unwrap())
        .add_directive(format!("flowprobe_core={level}").parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let mut config = match Config::load_or_default(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(db_path) = &args.db_path {
        config.db_path = db_path.display().to_string();
    }
    if let Some(period) = args.rotation_period {
        config.rotation_period_secs = period;
    }
    if let Some(pct) = args.max_mem_pct {
        config.max_mem_pct = pct;
    }

    let db_root = PathBuf::from(&config.db_path);
    if let Err(e) = std::fs::create_dir_all(&db_root) {
        error!("failed to create db root '{}': {e}", db_root.display());
        std::process::exit(1);
    }

    match host_id(&db_root) {
        Ok(id) => info!("flowprobed {} starting, host.id={id}", env!("CARGO_PKG_VERSION")),
        Err(e) => warn!("could not determine host.id: {e}"),
    }
    info!(
        "config: db_path={}, rotation_period={}s, max_mem_pct={}",
        config.db_path, config.rotation_period_secs, config.max_mem_pct
    );

    let mut manager = CaptureManager::new(&db_root);
    for iface in &args.ifaces {
        if let Err(e) = manager.add(iface.clone(), CaptureConfig::default(), Box::new(MockPacketSource::empty())) {
            error!("failed to add interface '{iface}': {e}");
        } else {
            info!("interface '{iface}' added");
        }
    }
    if args.ifaces.is_empty() {
        warn!("no interfaces configured (--iface); daemon will idle with nothing to rotate");
    }

    let watchdog = Arc::new(HeapWatchdog::new(config.max_mem_pct, Arc::new(release_memory_to_os)));
    let watchdog_handle = watchdog.spawn_background(Duration::from_secs(1));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("failed to set Ctrl-C handler: {e}");
    }

    let rotation_period = Duration::from_secs(config.rotation_period_secs.max(1));
    let mut scratch = vec![0u8; 65536];
    let mut window_start = now_epoch();

    info!("starting capture loop");
    while running.load(Ordering::SeqCst) {
        match manager.poll_round(&mut scratch) {
            Ok(0) => {}
            Ok(n) => debug!("{n} interface(s) advanced this round"),
            Err(e) => error!("poll round failed: {e}"),
        }

        if watchdog.breached() {
            warn!("heap watchdog breached; memory cap {}% exceeded", config.max_mem_pct);
        }

        let sleep_interval = Duration::from_millis(100);
        let mut remaining = rotation_period;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let sleep_time = remaining.min(sleep_interval);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }

        let window_end = now_epoch();
        match manager.rotate_all(window_start, window_end) {
            Ok(report) => {
                if report.blocks_written > 0 {
                    info!(
                        "rotation: {} interface(s), {} block(s), {} row(s)",
                        report.interfaces_rotated, report.blocks_written, report.rows_written
                    );
                }
            }
            Err(e) => error!("rotation failed: {e}"),
        }
        window_start = window_end;
    }

    info!("shutting down...");
    let window_end = now_epoch();
    if let Err(e) = manager.rotate_all(window_start, window_end) {
        error!("final rotation failed: {e}");
    }
    watchdog.stop();
    let _ = watchdog_handle.join();
    info!("shutdown complete");
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
