//! isolate capture agent
//!
//! A tools library the HSA runtime loads into the target process. `OnLoad`
//! receives the runtime's API table, hooks the dispatch path, and from then
//! on the agent shadows kernel loads, queue creation and device-memory
//! activity. When the dispatch selected by `ISOLATE_KERNEL` /
//! `ISOLATE_DISPATCH_INDEX` is about to be submitted, the agent snapshots
//! everything needed to re-execute that kernel in isolation — binary, launch
//! arguments, geometry, and the contents of every tracked device region —
//! then lets the dispatch proceed.
//!
//! Capture is one-shot per session: after the snapshot the hooks keep
//! delegating to the runtime untouched.

pub mod hooks;
pub mod kernels;
pub mod matcher;
pub mod memory;
pub mod queues;
pub mod snapshot;

use std::env;
use std::ffi::c_char;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tracing::{error, info};

use isolate_hsa::packet::{KernelDispatchPacket, Queue, PACKET_TYPE_KERNEL_DISPATCH};
use isolate_hsa::table::ApiTable;

use crate::hooks::SavedRoutines;
use crate::kernels::{BlobTracker, KernelRegistry};
use crate::matcher::{CaptureConfig, DispatchMatcher, MatchOutcome};
use crate::memory::RegionTracker;
use crate::queues::QueueRegistry;

/// `ISOLATE_CAPTURE_DIR`: where the capture artifact is written. Relative to
/// the target process's working directory when not absolute.
pub const ENV_CAPTURE_DIR: &str = "ISOLATE_CAPTURE_DIR";
pub const DEFAULT_CAPTURE_DIR: &str = "isolate_capture";

static ENGINE: OnceCell<Engine> = OnceCell::new();

/// Session-wide state shared by every hook. One mutex per resource; no lock
/// is held across I/O or across a call back into the runtime.
pub struct Engine {
    pub kernels: KernelRegistry,
    pub blobs: BlobTracker,
    pub regions: RegionTracker,
    pub queues: QueueRegistry,
    pub matcher: Mutex<DispatchMatcher>,
    pub capture_dir: PathBuf,
    dispatches_inspected: AtomicU64,
}

impl Engine {
    fn new() -> Self {
        let capture_dir =
            PathBuf::from(env::var(ENV_CAPTURE_DIR).unwrap_or_else(|_| DEFAULT_CAPTURE_DIR.into()));
        Self {
            kernels: KernelRegistry::new(),
            blobs: BlobTracker::new(),
            regions: RegionTracker::new(),
            queues: QueueRegistry::new(),
            matcher: Mutex::new(DispatchMatcher::new(CaptureConfig::from_env())),
            capture_dir,
            dispatches_inspected: AtomicU64::new(0),
        }
    }

    pub fn get() -> Option<&'static Engine> {
        ENGINE.get()
    }

    pub fn dispatches_inspected(&self) -> u64 {
        self.dispatches_inspected.load(Ordering::Relaxed)
    }

    /// A symbol query revealed a kernel object: intern its identity on first
    /// sight and opportunistically attach the last-loaded binary.
    pub fn observe_kernel_symbol(
        &self,
        saved: &SavedRoutines,
        symbol: isolate_hsa::ExecutableSymbol,
        kernel_object: u64,
    ) {
        if !self.kernels.contains(kernel_object) {
            let kernarg_size = hooks::query_symbol_u32(
                saved,
                symbol,
                isolate_hsa::SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE,
            )
            .unwrap_or(0);
            let mangled_name = hooks::query_symbol_name(saved, symbol).unwrap_or_default();
            self.kernels.intern(kernels::KernelRecord::new(
                kernel_object,
                mangled_name,
                kernarg_size,
            ));
        }
        self.blobs.attach_last_loaded(kernel_object);
    }

    /// Decide one submitted packet. Non-dispatch packets, unknown kernel
    /// objects, and kernels without launch arguments pass through silently.
    pub fn process_packet(
        &self,
        saved: &SavedRoutines,
        pkt: &KernelDispatchPacket,
        queue: *const Queue,
    ) {
        if pkt.packet_type() != PACKET_TYPE_KERNEL_DISPATCH {
            return;
        }
        self.dispatches_inspected.fetch_add(1, Ordering::Relaxed);

        let Some(record) = self.kernels.get(pkt.kernel_object) else {
            return;
        };
        if record.kernarg_size == 0 {
            return;
        }

        let outcome = {
            let mut matcher = self.matcher.lock().unwrap();
            matcher.observe(pkt.kernel_object, record.match_name())
        };

        if let MatchOutcome::Fire { index } = outcome {
            // Off the matcher lock, still on the submit thread: the runtime
            // waits for us before forwarding the packet.
            if let Err(e) = snapshot::write_capture(self, saved, record.as_ref(), pkt, queue, index) {
                error!("capture failed: {e:#}");
            }
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Tools-library load entry. The runtime calls this with its API table
/// before the application can issue work; returning `false` detaches the
/// agent and the runtime continues without it.
///
/// # Safety
/// `table` and its sub-table pointers must be valid for the lifetime of the
/// runtime, as the tools contract guarantees.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn OnLoad(
    table: *mut ApiTable,
    runtime_version: u64,
    failed_tool_count: u64,
    _failed_tool_names: *const *const c_char,
) -> bool {
    init_tracing();

    if table.is_null() {
        error!("runtime passed a null API table; not attaching");
        return false;
    }
    if failed_tool_count != 0 {
        info!("{failed_tool_count} earlier tools failed to load");
    }

    let engine = ENGINE.get_or_init(Engine::new);
    info!(
        runtime_version,
        capture_dir = %engine.capture_dir.display(),
        enabled = engine.matcher.lock().unwrap().enabled(),
        "isolate capture agent loading"
    );

    match hooks::install(table) {
        Ok(()) => true,
        Err(e) => {
            error!("failed to install hooks: {e}");
            false
        }
    }
}

/// Tools-library unload entry; restores the API table and logs the session
/// summary.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn OnUnload() {
    hooks::uninstall();
    if let Some(engine) = Engine::get() {
        let matcher = engine.matcher.lock().unwrap();
        info!(
            dispatches_inspected = engine.dispatches_inspected(),
            captured = matcher.fired(),
            regions_dropped = engine.regions.dropped(),
            "isolate session summary"
        );
    }
}
