//! API-table interposition
//!
//! `install` saves the original pointer of every intercepted slot, then
//! writes the wrappers below in their place; `uninstall` writes the saved
//! originals back. Every wrapper delegates to the saved original and returns
//! its status unchanged — side effects happen only on success, and the agent
//! never synthesizes a runtime status.
//!
//! The saved routines are published through a `OnceCell` *before* any
//! wrapper pointer reaches the table, so a wrapper can never observe them
//! unset, regardless of which thread the runtime calls it on.

use std::ffi::{c_char, c_void};
use std::slice;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::warn;

use isolate_hsa::packet::{KernelDispatchPacket, Queue};
use isolate_hsa::table::{
    AgentGetInfoFn, ApiTable, CodeObjectReaderCreateFromMemoryFn,
    ExecutableIterateSymbolsFn, ExecutableLoadAgentCodeObjectFn, IsaGetInfoAltFn, MemoryCopyFn,
    MemoryPoolAllocateFn, MemoryPoolFreeFn, PacketWriterFn, QueueCreateCallbackFn, QueueCreateFn,
    QueueInterceptCreateFn, QueueInterceptRegisterFn, SymbolGetInfoFn, VmemAddressReserveFn,
    VmemHandleCreateFn, VmemHandleReleaseFn, VmemMapFn, VmemSetAccessFn, VmemUnmapFn,
};
use isolate_hsa::{
    Agent, CodeObjectReader, Executable, ExecutableSymbol, LoadedCodeObject, MemoryAccessDesc,
    MemoryPool, Status, VmemAllocHandle, STATUS_SUCCESS, SYMBOL_INFO_KERNEL_OBJECT,
    SYMBOL_INFO_NAME, SYMBOL_INFO_NAME_LENGTH, SYMBOL_INFO_TYPE, SYMBOL_KIND_KERNEL,
};

use crate::kernels::Blob;
use crate::Engine;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("API table is missing required slot {0}")]
    MissingSlot(&'static str),

    #[error("hooks are already installed")]
    AlreadyInstalled,
}

/// Originals saved out of the API table, plus the non-intercepted entries
/// the agent calls through. Immutable after install.
pub struct SavedRoutines {
    table: *mut ApiTable,

    pub symbol_get_info: SymbolGetInfoFn,
    pub queue_create: QueueCreateFn,
    pub reader_create_from_memory: CodeObjectReaderCreateFromMemoryFn,
    pub load_agent_code_object: ExecutableLoadAgentCodeObjectFn,
    pub pool_allocate: MemoryPoolAllocateFn,
    pub pool_free: MemoryPoolFreeFn,
    pub vmem_address_reserve: VmemAddressReserveFn,
    pub vmem_handle_create: VmemHandleCreateFn,
    pub vmem_handle_release: VmemHandleReleaseFn,
    pub vmem_map: VmemMapFn,
    pub vmem_unmap: VmemUnmapFn,
    pub vmem_set_access: VmemSetAccessFn,

    pub executable_iterate_symbols: ExecutableIterateSymbolsFn,
    pub agent_get_info: AgentGetInfoFn,
    pub isa_get_info_alt: IsaGetInfoAltFn,
    pub memory_copy: MemoryCopyFn,
    pub queue_intercept_create: QueueInterceptCreateFn,
    pub queue_intercept_register: QueueInterceptRegisterFn,
}

// The raw table pointer is only written during install/uninstall, which the
// tools contract serializes against all other runtime activity.
unsafe impl Send for SavedRoutines {}
unsafe impl Sync for SavedRoutines {}

static SAVED: OnceCell<SavedRoutines> = OnceCell::new();

fn saved() -> &'static SavedRoutines {
    // Published before any wrapper pointer is written into the table.
    SAVED.get().expect("saved routines published before install")
}

macro_rules! require_slot {
    ($slot:expr, $name:literal) => {
        $slot.ok_or(InstallError::MissingSlot($name))?
    };
}

/// Save originals and write the wrappers into the table.
///
/// # Safety
/// `table`, `table.core` and `table.amd_ext` must point at the runtime's
/// live API table, and the runtime must not be dispatching through the
/// intercepted slots concurrently (the tools contract calls `OnLoad` before
/// the application can).
pub unsafe fn install(table: *mut ApiTable) -> Result<(), InstallError> {
    let core = (*table).core;
    let amd_ext = (*table).amd_ext;
    if core.is_null() {
        return Err(InstallError::MissingSlot("core table"));
    }
    if amd_ext.is_null() {
        return Err(InstallError::MissingSlot("amd_ext table"));
    }

    let routines = SavedRoutines {
        table,
        symbol_get_info: require_slot!((*core).symbol_get_info, "symbol_get_info"),
        queue_create: require_slot!((*core).queue_create, "queue_create"),
        reader_create_from_memory: require_slot!(
            (*core).code_object_reader_create_from_memory,
            "code_object_reader_create_from_memory"
        ),
        load_agent_code_object: require_slot!(
            (*core).executable_load_agent_code_object,
            "executable_load_agent_code_object"
        ),
        pool_allocate: require_slot!((*amd_ext).memory_pool_allocate, "memory_pool_allocate"),
        pool_free: require_slot!((*amd_ext).memory_pool_free, "memory_pool_free"),
        vmem_address_reserve: require_slot!(
            (*amd_ext).vmem_address_reserve,
            "vmem_address_reserve"
        ),
        vmem_handle_create: require_slot!((*amd_ext).vmem_handle_create, "vmem_handle_create"),
        vmem_handle_release: require_slot!((*amd_ext).vmem_handle_release, "vmem_handle_release"),
        vmem_map: require_slot!((*amd_ext).vmem_map, "vmem_map"),
        vmem_unmap: require_slot!((*amd_ext).vmem_unmap, "vmem_unmap"),
        vmem_set_access: require_slot!((*amd_ext).vmem_set_access, "vmem_set_access"),
        executable_iterate_symbols: require_slot!(
            (*core).executable_iterate_symbols,
            "executable_iterate_symbols"
        ),
        agent_get_info: require_slot!((*core).agent_get_info, "agent_get_info"),
        isa_get_info_alt: require_slot!((*core).isa_get_info_alt, "isa_get_info_alt"),
        memory_copy: require_slot!((*core).memory_copy, "memory_copy"),
        queue_intercept_create: require_slot!(
            (*amd_ext).queue_intercept_create,
            "queue_intercept_create"
        ),
        queue_intercept_register: require_slot!(
            (*amd_ext).queue_intercept_register,
            "queue_intercept_register"
        ),
    };

    SAVED
        .set(routines)
        .map_err(|_| InstallError::AlreadyInstalled)?;

    (*core).symbol_get_info = Some(symbol_get_info_wrapper);
    (*core).queue_create = Some(queue_create_wrapper);
    (*core).code_object_reader_create_from_memory = Some(reader_create_from_memory_wrapper);
    (*core).executable_load_agent_code_object = Some(load_agent_code_object_wrapper);
    (*amd_ext).memory_pool_allocate = Some(pool_allocate_wrapper);
    (*amd_ext).memory_pool_free = Some(pool_free_wrapper);
    (*amd_ext).vmem_address_reserve = Some(vmem_address_reserve_wrapper);
    (*amd_ext).vmem_handle_create = Some(vmem_handle_create_wrapper);
    (*amd_ext).vmem_handle_release = Some(vmem_handle_release_wrapper);
    (*amd_ext).vmem_map = Some(vmem_map_wrapper);
    (*amd_ext).vmem_unmap = Some(vmem_unmap_wrapper);
    (*amd_ext).vmem_set_access = Some(vmem_set_access_wrapper);

    Ok(())
}

/// Restore every intercepted slot to its saved original. Safe to call
/// without a prior successful install (does nothing).
pub fn uninstall() {
    let Some(saved) = SAVED.get() else {
        return;
    };
    unsafe {
        let core = (*saved.table).core;
        let amd_ext = (*saved.table).amd_ext;
        (*core).symbol_get_info = Some(saved.symbol_get_info);
        (*core).queue_create = Some(saved.queue_create);
        (*core).code_object_reader_create_from_memory = Some(saved.reader_create_from_memory);
        (*core).executable_load_agent_code_object = Some(saved.load_agent_code_object);
        (*amd_ext).memory_pool_allocate = Some(saved.pool_allocate);
        (*amd_ext).memory_pool_free = Some(saved.pool_free);
        (*amd_ext).vmem_address_reserve = Some(saved.vmem_address_reserve);
        (*amd_ext).vmem_handle_create = Some(saved.vmem_handle_create);
        (*amd_ext).vmem_handle_release = Some(saved.vmem_handle_release);
        (*amd_ext).vmem_map = Some(saved.vmem_map);
        (*amd_ext).vmem_unmap = Some(saved.vmem_unmap);
        (*amd_ext).vmem_set_access = Some(saved.vmem_set_access);
    }
}

/// Query a u32 symbol attribute through the saved original.
pub fn query_symbol_u32(
    saved: &SavedRoutines,
    symbol: ExecutableSymbol,
    attribute: u32,
) -> Option<u32> {
    let mut value: u32 = 0;
    let status =
        unsafe { (saved.symbol_get_info)(symbol, attribute, &mut value as *mut _ as *mut c_void) };
    (status == STATUS_SUCCESS).then_some(value)
}

/// Query a symbol's name through the saved original. The runtime writes
/// exactly `NAME_LENGTH` bytes, unterminated.
pub fn query_symbol_name(saved: &SavedRoutines, symbol: ExecutableSymbol) -> Option<String> {
    let len = query_symbol_u32(saved, symbol, SYMBOL_INFO_NAME_LENGTH)?;
    if len == 0 {
        return Some(String::new());
    }
    let mut buf = vec![0u8; len as usize];
    let status = unsafe {
        (saved.symbol_get_info)(symbol, SYMBOL_INFO_NAME, buf.as_mut_ptr() as *mut c_void)
    };
    (status == STATUS_SUCCESS).then(|| String::from_utf8_lossy(&buf).into_owned())
}

unsafe extern "C" fn symbol_get_info_wrapper(
    symbol: ExecutableSymbol,
    attribute: u32,
    value: *mut c_void,
) -> Status {
    let saved = saved();
    let status = (saved.symbol_get_info)(symbol, attribute, value);
    if status != STATUS_SUCCESS || attribute != SYMBOL_INFO_KERNEL_OBJECT || value.is_null() {
        return status;
    }
    if let Some(engine) = Engine::get() {
        let kernel_object = *(value as *const u64);
        engine.observe_kernel_symbol(saved, symbol, kernel_object);
    }
    status
}

unsafe extern "C" fn reader_create_from_memory_wrapper(
    code_object: *const c_void,
    size: usize,
    reader: *mut CodeObjectReader,
) -> Status {
    let saved = saved();
    let status = (saved.reader_create_from_memory)(code_object, size, reader);
    if status == STATUS_SUCCESS && !code_object.is_null() && !reader.is_null() {
        if let Some(engine) = Engine::get() {
            let bytes = slice::from_raw_parts(code_object as *const u8, size);
            engine.blobs.record_reader((*reader).handle, bytes);
        }
    }
    status
}

struct FanOutCtx<'a> {
    saved: &'static SavedRoutines,
    engine: &'a Engine,
    blob: Blob,
}

unsafe extern "C" fn fan_out_symbol(
    _executable: Executable,
    symbol: ExecutableSymbol,
    data: *mut c_void,
) -> Status {
    let ctx = &*(data as *const FanOutCtx);
    if query_symbol_u32(ctx.saved, symbol, SYMBOL_INFO_TYPE) != Some(SYMBOL_KIND_KERNEL) {
        return STATUS_SUCCESS;
    }
    let mut kernel_object: u64 = 0;
    let status = (ctx.saved.symbol_get_info)(
        symbol,
        SYMBOL_INFO_KERNEL_OBJECT,
        &mut kernel_object as *mut _ as *mut c_void,
    );
    if status != STATUS_SUCCESS {
        return STATUS_SUCCESS;
    }
    ctx.engine
        .observe_kernel_symbol(ctx.saved, symbol, kernel_object);
    ctx.engine.blobs.attach(kernel_object, ctx.blob.clone());
    STATUS_SUCCESS
}

unsafe extern "C" fn load_agent_code_object_wrapper(
    executable: Executable,
    agent: Agent,
    reader: CodeObjectReader,
    options: *const c_char,
    loaded_code_object: *mut LoadedCodeObject,
) -> Status {
    let saved = saved();
    let status =
        (saved.load_agent_code_object)(executable, agent, reader, options, loaded_code_object);
    if status != STATUS_SUCCESS {
        return status;
    }
    if let Some(engine) = Engine::get() {
        if let Some(blob) = engine.blobs.promote_reader(reader.handle, executable.handle) {
            let ctx = FanOutCtx {
                saved,
                engine,
                blob,
            };
            (saved.executable_iterate_symbols)(
                executable,
                Some(fan_out_symbol),
                &ctx as *const _ as *mut c_void,
            );
        }
    }
    status
}

/// The packet interceptor. Registered per queue with the queue pointer as
/// its data argument; called by the runtime before the packets are visible
/// to the GPU. Packets are treated as read-only and always forwarded.
unsafe extern "C" fn on_submit_packets(
    packets: *const c_void,
    count: u64,
    _user_queue_index: u64,
    data: *mut c_void,
    writer: PacketWriterFn,
) {
    if let Some(engine) = Engine::get() {
        let queue = data as *const Queue;
        let packets = packets as *const KernelDispatchPacket;
        for i in 0..count as usize {
            engine.process_packet(saved(), &*packets.add(i), queue);
        }
    }
    writer(packets as *const c_void, count);
}

unsafe extern "C" fn queue_create_wrapper(
    agent: Agent,
    size: u32,
    queue_type: u32,
    callback: Option<QueueCreateCallbackFn>,
    data: *mut c_void,
    private_segment_size: u32,
    group_segment_size: u32,
    queue: *mut *mut Queue,
) -> Status {
    let saved = saved();
    // Create an intercept queue in place of a plain one; it behaves
    // identically to the caller but lets the agent see submissions.
    let status = (saved.queue_intercept_create)(
        agent,
        size,
        queue_type,
        callback,
        data,
        private_segment_size,
        group_segment_size,
        queue,
    );
    if status != STATUS_SUCCESS {
        return status;
    }

    let created = *queue;
    if let Some(engine) = Engine::get() {
        engine.queues.register(created, agent);
    }
    let register_status = (saved.queue_intercept_register)(
        created,
        Some(on_submit_packets),
        created as *mut c_void,
    );
    if register_status != STATUS_SUCCESS {
        warn!("packet interceptor registration failed with status {register_status:#x}");
    }
    status
}

unsafe extern "C" fn pool_allocate_wrapper(
    pool: MemoryPool,
    size: usize,
    flags: u32,
    ptr: *mut *mut c_void,
) -> Status {
    let saved = saved();
    let status = (saved.pool_allocate)(pool, size, flags, ptr);
    if status == STATUS_SUCCESS && !ptr.is_null() && !(*ptr).is_null() {
        if let Some(engine) = Engine::get() {
            engine.regions.insert_pool(*ptr as u64, size);
        }
    }
    status
}

unsafe extern "C" fn pool_free_wrapper(ptr: *mut c_void) -> Status {
    let saved = saved();
    let status = (saved.pool_free)(ptr);
    if status == STATUS_SUCCESS && !ptr.is_null() {
        if let Some(engine) = Engine::get() {
            engine.regions.remove(ptr as u64);
        }
    }
    status
}

unsafe extern "C" fn vmem_address_reserve_wrapper(
    va: *mut *mut c_void,
    size: usize,
    address: u64,
    flags: u64,
) -> Status {
    let saved = saved();
    let status = (saved.vmem_address_reserve)(va, size, address, flags);
    if status == STATUS_SUCCESS && !va.is_null() {
        if let Some(engine) = Engine::get() {
            engine.regions.insert_reserved(*va as u64, size);
        }
    }
    status
}

unsafe extern "C" fn vmem_handle_create_wrapper(
    pool: MemoryPool,
    size: usize,
    memory_type: u32,
    flags: u64,
    handle: *mut VmemAllocHandle,
) -> Status {
    let saved = saved();
    let status = (saved.vmem_handle_create)(pool, size, memory_type, flags, handle);
    if status == STATUS_SUCCESS && !handle.is_null() {
        if let Some(engine) = Engine::get() {
            engine.regions.record_handle_created((*handle).handle);
        }
    }
    status
}

unsafe extern "C" fn vmem_handle_release_wrapper(handle: VmemAllocHandle) -> Status {
    let saved = saved();
    let status = (saved.vmem_handle_release)(handle);
    if status == STATUS_SUCCESS {
        if let Some(engine) = Engine::get() {
            engine.regions.record_handle_released(handle.handle);
        }
    }
    status
}

unsafe extern "C" fn vmem_map_wrapper(
    va: *mut c_void,
    size: usize,
    in_offset: usize,
    handle: VmemAllocHandle,
    flags: u64,
) -> Status {
    let saved = saved();
    let status = (saved.vmem_map)(va, size, in_offset, handle, flags);
    if status == STATUS_SUCCESS {
        if let Some(engine) = Engine::get() {
            engine.regions.attach_mapping(va as u64, size, handle.handle);
        }
    }
    status
}

unsafe extern "C" fn vmem_unmap_wrapper(va: *mut c_void, size: usize) -> Status {
    let saved = saved();
    let status = (saved.vmem_unmap)(va, size);
    if status == STATUS_SUCCESS {
        if let Some(engine) = Engine::get() {
            engine.regions.remove(va as u64);
        }
    }
    status
}

unsafe extern "C" fn vmem_set_access_wrapper(
    va: *mut c_void,
    size: usize,
    descs: *const MemoryAccessDesc,
    desc_count: usize,
) -> Status {
    let saved = saved();
    let status = (saved.vmem_set_access)(va, size, descs, desc_count);
    if status == STATUS_SUCCESS && !descs.is_null() {
        if let Some(engine) = Engine::get() {
            let mut mask = 0u32;
            for desc in slice::from_raw_parts(descs, desc_count) {
                mask |= desc.permissions;
            }
            engine.regions.grant_access(va as u64, mask);
        }
    }
    status
}
