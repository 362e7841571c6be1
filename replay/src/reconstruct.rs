//! Strict address-space reconstruction and dispatch
//!
//! Order matters everywhere here: artifacts are parsed before the runtime
//! exists, placeholders go down before `init`, and they come back up before
//! the strict reservations that must land on the exact captured addresses.
//! Any reservation that relocates aborts the replay; pointer-bearing launch
//! arguments are only valid at the captured numeric addresses.

use std::ffi::c_void;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use isolate_hsa::packet::{
    dispatch_header, dispatch_setup, publish_header, KernelDispatchPacket,
};
use isolate_hsa::runtime::Runtime;
use isolate_hsa::{
    Agent, ExecutableSymbol, MemoryAccessDesc, MemoryPool, ACCESS_PERMISSION_RW,
    AMD_MEMORY_POOL_GLOBAL_FLAG_FINE_GRAINED, AMD_MEMORY_POOL_INFO_GLOBAL_FLAGS,
    AMD_MEMORY_POOL_INFO_RUNTIME_ALLOC_ALLOWED, AMD_MEMORY_POOL_INFO_SEGMENT,
    AMD_SEGMENT_GLOBAL, EXECUTABLE_STATE_UNFROZEN, PROFILE_FULL, QUEUE_TYPE_MULTI,
    SYMBOL_INFO_KERNEL_GROUP_SEGMENT_SIZE, SYMBOL_INFO_KERNEL_OBJECT,
    SYMBOL_INFO_KERNEL_PRIVATE_SEGMENT_SIZE, SYMBOL_INFO_TYPE, SYMBOL_KIND_KERNEL,
};

use crate::error::ReplayError;
use crate::plan::{RegionPlan, ReplayPlan};
use crate::steering::Placeholders;

/// Approximate per-wait timeout hint handed to the runtime, in timestamp
/// ticks; the wall-clock deadline is enforced around it.
const WAIT_CHUNK_TICKS: u64 = 10_000_000;

pub struct ReplayOptions {
    /// Stop after verifying every region reserves strictly.
    pub reserve_only: bool,
    /// Wall-clock bound on the completion wait.
    pub timeout_secs: u64,
}

/// Entry point: returns normally on a completed dispatch, or the first
/// strictness violation.
pub fn run(capture_dir: &Path, options: &ReplayOptions) -> Result<(), ReplayError> {
    // 1. Parse before init.
    let plan = ReplayPlan::load(capture_dir)?;
    info!(
        kernel = %plan.dispatch.mangled_name,
        regions = plan.regions.len(),
        "replaying capture from {}",
        capture_dir.display()
    );

    // 2. Steer the runtime's aperture heuristic away from captured ranges.
    let placeholders = Placeholders::reserve(&plan.regions);
    debug!(
        "{} of {} placeholder mappings placed",
        placeholders.len(),
        plan.regions.len()
    );

    // 3. Now the runtime may initialize.
    let runtime = Runtime::load().map_err(ReplayError::Runtime)?;
    runtime.init().map_err(ReplayError::Runtime)?;

    let result = reconstruct(&runtime, &plan, placeholders, options);
    runtime.shut_down();
    result
}

fn reconstruct(
    runtime: &Runtime,
    plan: &ReplayPlan,
    placeholders: Placeholders,
    options: &ReplayOptions,
) -> Result<(), ReplayError> {
    let agent = runtime
        .first_gpu_agent()
        .map_err(ReplayError::Runtime)?
        .ok_or(ReplayError::AgentMissing)?;

    let isa_name = runtime.agent_isa_name(agent).map_err(ReplayError::Runtime)?;
    info!(
        agent = %runtime.agent_name(agent).unwrap_or_default(),
        isa = %isa_name,
        "selected GPU agent"
    );
    if !plan.dispatch.isa_name.is_empty() && plan.dispatch.isa_name != isa_name {
        return Err(ReplayError::IsaMismatch {
            captured: plan.dispatch.isa_name.clone(),
            actual: isa_name,
        });
    }

    // 4. The captured ranges go back to being free VA space.
    placeholders.release();

    // 5. Backing storage comes from the first allocatable global pool,
    // fine-grained when the agent offers one.
    let pool = select_backing_pool(runtime, agent)?.ok_or(ReplayError::BackingPoolMissing)?;

    if options.reserve_only {
        return reserve_check(runtime, &plan.regions);
    }

    // 6. Strict reserve + map + restore, in artifact order.
    for region in &plan.regions {
        restore_region(runtime, plan, agent, pool, region)?;
    }

    // 7. Load the captured binary and resolve its kernel.
    let binary = plan.dir.read_binary()?;
    let reader = runtime
        .code_object_reader_from_memory(&binary)
        .map_err(ReplayError::BinaryLoadFailed)?;
    let executable = runtime
        .executable_create(PROFILE_FULL, EXECUTABLE_STATE_UNFROZEN)
        .map_err(ReplayError::BinaryLoadFailed)?;
    runtime
        .executable_load_agent_code_object(executable, agent, reader)
        .map_err(ReplayError::BinaryLoadFailed)?;
    runtime
        .executable_freeze(executable)
        .map_err(ReplayError::BinaryLoadFailed)?;

    let symbol = find_kernel_symbol(runtime, executable)?.ok_or(ReplayError::SymbolNotFound)?;
    let kernel_object = runtime
        .symbol_info_u64(symbol, SYMBOL_INFO_KERNEL_OBJECT)
        .map_err(ReplayError::BinaryLoadFailed)?;
    let group_segment_size = runtime
        .symbol_info_u32(symbol, SYMBOL_INFO_KERNEL_GROUP_SEGMENT_SIZE)
        .map_err(ReplayError::BinaryLoadFailed)?;
    let private_segment_size = runtime
        .symbol_info_u32(symbol, SYMBOL_INFO_KERNEL_PRIVATE_SEGMENT_SIZE)
        .map_err(ReplayError::BinaryLoadFailed)?;
    debug!(
        kernel_object,
        group_segment_size, private_segment_size, "kernel resolved"
    );

    // 8. Launch arguments, restored verbatim at a fresh device address.
    let kernarg_bytes = plan.dir.read_kernarg()?;
    let kernarg = runtime
        .pool_allocate(pool, kernarg_bytes.len().max(1))
        .map_err(ReplayError::KernargAllocFailed)?;
    runtime
        .agents_allow_access(&[agent], kernarg)
        .map_err(ReplayError::KernargAllocFailed)?;
    runtime
        .memory_copy(
            kernarg,
            kernarg_bytes.as_ptr() as *const c_void,
            kernarg_bytes.len(),
        )
        .map_err(ReplayError::KernargAllocFailed)?;

    // 9. One dispatch, identical geometry.
    let result = dispatch(
        runtime,
        agent,
        plan,
        kernel_object,
        group_segment_size,
        private_segment_size,
        kernarg,
        options.timeout_secs,
    );

    runtime.pool_free(kernarg);
    runtime.executable_destroy(executable);
    runtime.code_object_reader_destroy(reader);
    result
}

fn select_backing_pool(
    runtime: &Runtime,
    agent: Agent,
) -> Result<Option<MemoryPool>, ReplayError> {
    let mut fallback = None;
    for pool in runtime
        .agent_memory_pools(agent)
        .map_err(ReplayError::Runtime)?
    {
        let segment = runtime
            .pool_info_u32(pool, AMD_MEMORY_POOL_INFO_SEGMENT)
            .map_err(ReplayError::Runtime)?;
        if segment != AMD_SEGMENT_GLOBAL {
            continue;
        }
        if !runtime
            .pool_info_bool(pool, AMD_MEMORY_POOL_INFO_RUNTIME_ALLOC_ALLOWED)
            .map_err(ReplayError::Runtime)?
        {
            continue;
        }
        let flags = runtime
            .pool_info_u32(pool, AMD_MEMORY_POOL_INFO_GLOBAL_FLAGS)
            .map_err(ReplayError::Runtime)?;
        if flags & AMD_MEMORY_POOL_GLOBAL_FLAG_FINE_GRAINED != 0 {
            return Ok(Some(pool));
        }
        fallback.get_or_insert(pool);
    }
    Ok(fallback)
}

/// Dry-run mode: verify every region reserves at its captured address, and
/// report all of them before failing.
fn reserve_check(runtime: &Runtime, regions: &[RegionPlan]) -> Result<(), ReplayError> {
    let mut first_failure: Option<ReplayError> = None;
    let mut first_relocation: Option<ReplayError> = None;

    for plan in regions {
        match runtime.vmem_address_reserve(plan.aligned_size, plan.aligned_base) {
            Ok(granted) if granted == plan.aligned_base => {
                info!("region {:#x} (+{}): ok", plan.record.base, plan.record.size);
            }
            Ok(granted) => {
                info!(
                    "region {:#x} (+{}): relocated to {granted:#x}",
                    plan.record.base, plan.record.size
                );
                first_relocation.get_or_insert(ReplayError::RegionRelocated {
                    base: plan.record.base,
                    granted,
                });
            }
            Err(source) => {
                info!("region {:#x} (+{}): failed ({source})", plan.record.base, plan.record.size);
                first_failure.get_or_insert(ReplayError::RegionReserveFailed {
                    base: plan.record.base,
                    source,
                });
            }
        }
    }

    match (first_failure, first_relocation) {
        (Some(err), _) => Err(err),
        (None, Some(err)) => Err(err),
        (None, None) => Ok(()),
    }
}

fn restore_region(
    runtime: &Runtime,
    plan: &ReplayPlan,
    agent: Agent,
    pool: MemoryPool,
    region: &RegionPlan,
) -> Result<(), ReplayError> {
    let base = region.record.base;

    let granted = runtime
        .vmem_address_reserve(region.aligned_size, region.aligned_base)
        .map_err(|source| ReplayError::RegionReserveFailed { base, source })?;
    if granted != region.aligned_base {
        return Err(ReplayError::RegionRelocated { base, granted });
    }

    let handle = runtime
        .vmem_handle_create(pool, region.aligned_size)
        .map_err(|source| ReplayError::HandleCreateFailed { base, source })?;
    runtime
        .vmem_map(region.aligned_base, region.aligned_size, handle)
        .map_err(|source| ReplayError::MapFailed { base, source })?;
    runtime
        .vmem_set_access(
            region.aligned_base,
            region.aligned_size,
            &[MemoryAccessDesc {
                permissions: ACCESS_PERMISSION_RW,
                agent_handle: agent,
            }],
        )
        .map_err(|source| ReplayError::SetAccessFailed { base, source })?;

    // Contents were captured with the unaligned size, at the unaligned base.
    let contents = plan.dir.read_region_contents(base)?;
    runtime
        .memory_copy(
            (region.aligned_base + region.offset) as *mut c_void,
            contents.as_ptr() as *const c_void,
            contents.len(),
        )
        .map_err(|source| ReplayError::CopyFailed { base, source })?;

    debug!(
        "restored region {base:#x} (+{} bytes) at its captured address",
        contents.len()
    );
    Ok(())
}

fn find_kernel_symbol(
    runtime: &Runtime,
    executable: isolate_hsa::Executable,
) -> Result<Option<ExecutableSymbol>, ReplayError> {
    for symbol in runtime
        .executable_symbols(executable)
        .map_err(ReplayError::BinaryLoadFailed)?
    {
        let kind = runtime
            .symbol_info_u32(symbol, SYMBOL_INFO_TYPE)
            .map_err(ReplayError::BinaryLoadFailed)?;
        if kind == SYMBOL_KIND_KERNEL {
            return Ok(Some(symbol));
        }
    }
    Ok(None)
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    runtime: &Runtime,
    agent: Agent,
    plan: &ReplayPlan,
    kernel_object: u64,
    group_segment_size: u32,
    private_segment_size: u32,
    kernarg: *mut c_void,
    timeout_secs: u64,
) -> Result<(), ReplayError> {
    let queue = runtime
        .queue_create(agent, 128, QUEUE_TYPE_MULTI)
        .map_err(ReplayError::QueueCreateFailed)?;
    let completion = runtime
        .signal_create(1)
        .map_err(ReplayError::SignalCreateFailed)?;

    let dispatch = &plan.dispatch;
    let write_index = runtime.queue_load_write_index(queue);

    unsafe {
        let ring = (*queue).base_address as *mut KernelDispatchPacket;
        let slot = ring.add((write_index & ((*queue).size as u64 - 1)) as usize);

        let mut pkt = KernelDispatchPacket::zeroed();
        pkt.workgroup_size_x = dispatch.block.x as u16;
        pkt.workgroup_size_y = dispatch.block.y as u16;
        pkt.workgroup_size_z = dispatch.block.z as u16;
        pkt.grid_size_x = dispatch.grid.x;
        pkt.grid_size_y = dispatch.grid.y;
        pkt.grid_size_z = dispatch.grid.z;
        pkt.group_segment_size = group_segment_size;
        pkt.private_segment_size = private_segment_size;
        pkt.kernel_object = kernel_object;
        pkt.kernarg_address = kernarg;
        pkt.completion_signal = completion;
        std::ptr::write(slot, pkt);

        // Header last: publishing it hands the packet to the GPU.
        publish_header(
            slot,
            dispatch_header(),
            dispatch_setup(dispatch.grid.dimensions()),
        );

        runtime.queue_store_write_index(queue, write_index + 1);
        runtime.signal_store((*queue).doorbell_signal, write_index as i64);
    }

    info!(
        grid = ?(dispatch.grid.x, dispatch.grid.y, dispatch.grid.z),
        block = ?(dispatch.block.x, dispatch.block.y, dispatch.block.z),
        "dispatch published; waiting for completion"
    );

    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    let result = loop {
        let value = runtime.signal_wait_lt(completion, 1, WAIT_CHUNK_TICKS);
        if value < 1 {
            break Ok(());
        }
        if Instant::now() >= deadline {
            break Err(ReplayError::DispatchTimeout(timeout_secs));
        }
    };

    runtime.signal_destroy(completion);
    runtime.queue_destroy(queue);

    if result.is_ok() {
        info!("dispatch completed");
    }
    result
}
