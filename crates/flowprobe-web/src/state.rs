//! Shared application state: the capture manager, the live config, and the heap watchdog.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Releases unused memory back to the operating system via jemalloc's arena purge.
#[cfg(not(target_env = "msvc"))]
pub(crate) fn release_memory_to_os() {
    // SAFETY: mallctl is called with a valid, null-terminated control string and no input/output
    // buffers, matching the documented no-args form of "arena.<n>.purge".
    unsafe {
        // MALLCTL_ARENAS_ALL = 4096: purge dirty pages from ALL jemalloc arenas, including the
        // ones tokio's worker threads allocate from.
        tikv_jemalloc_sys::mallctl(
            c"arena.4096.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

#[cfg(target_env = "msvc")]
pub(crate) fn release_memory_to_os() {}

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use flowprobe_core::capture::CaptureManager;
use flowprobe_core::config::Config;
use flowprobe_core::watchdog::HeapWatchdog;

/// Bounds how many `/_query` requests run concurrently; saturating it yields a 429 (§6).
const QUERY_CONCURRENCY: usize = 8;

pub(crate) struct AppStateInner {
    pub(crate) db_root: PathBuf,
    pub(crate) config_path: Option<PathBuf>,
    pub(crate) manager: Mutex<CaptureManager>,
    pub(crate) config: Mutex<Config>,
    pub(crate) watchdog: Arc<HeapWatchdog>,
    pub(crate) query_semaphore: Semaphore,
}

pub(crate) type SharedState = Arc<AppStateInner>;

impl AppStateInner {
    pub(crate) fn new(db_root: PathBuf, config: Config, config_path: Option<PathBuf>) -> Self {
        let watchdog = Arc::new(HeapWatchdog::new(config.max_mem_pct, Arc::new(release_memory_to_os)));
        AppStateInner {
            manager: Mutex::new(CaptureManager::new(&db_root)),
            db_root,
            config_path,
            config: Mutex::new(config),
            watchdog,
            query_semaphore: Semaphore::new(QUERY_CONCURRENCY),
        }
    }
}
