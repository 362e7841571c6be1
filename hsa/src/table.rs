//! The tools-library API table
//!
//! When the runtime loads a tools library it hands `OnLoad` a pointer to a
//! mutable table of function pointers, split into the core API and the vendor
//! extension API. Interposition works by saving a slot's current value and
//! writing a wrapper in its place; the wrapper calls the saved original and
//! returns its status unchanged.
//!
//! Slots are `Option<fn>` so that an absent entry (an older runtime, or a
//! table already stripped by another tool) is observable as `None` rather
//! than a null-pointer call.

use std::ffi::{c_char, c_void};

use crate::{
    Agent, CodeObjectReader, Executable, ExecutableSymbol, Isa, LoadedCodeObject,
    MemoryAccessDesc, MemoryPool, Status, VmemAllocHandle,
};

pub type SymbolGetInfoFn =
    unsafe extern "C" fn(symbol: ExecutableSymbol, attribute: u32, value: *mut c_void) -> Status;

pub type QueueCreateCallbackFn =
    unsafe extern "C" fn(status: Status, queue: *mut crate::packet::Queue, data: *mut c_void);

pub type QueueCreateFn = unsafe extern "C" fn(
    agent: Agent,
    size: u32,
    queue_type: u32,
    callback: Option<QueueCreateCallbackFn>,
    data: *mut c_void,
    private_segment_size: u32,
    group_segment_size: u32,
    queue: *mut *mut crate::packet::Queue,
) -> Status;

pub type CodeObjectReaderCreateFromMemoryFn = unsafe extern "C" fn(
    code_object: *const c_void,
    size: usize,
    reader: *mut CodeObjectReader,
) -> Status;

pub type ExecutableLoadAgentCodeObjectFn = unsafe extern "C" fn(
    executable: Executable,
    agent: Agent,
    reader: CodeObjectReader,
    options: *const c_char,
    loaded_code_object: *mut LoadedCodeObject,
) -> Status;

pub type ExecutableIterateSymbolsCallbackFn = unsafe extern "C" fn(
    executable: Executable,
    symbol: ExecutableSymbol,
    data: *mut c_void,
) -> Status;

pub type ExecutableIterateSymbolsFn = unsafe extern "C" fn(
    executable: Executable,
    callback: Option<ExecutableIterateSymbolsCallbackFn>,
    data: *mut c_void,
) -> Status;

pub type AgentGetInfoFn =
    unsafe extern "C" fn(agent: Agent, attribute: u32, value: *mut c_void) -> Status;

pub type IsaGetInfoAltFn =
    unsafe extern "C" fn(isa: Isa, attribute: u32, value: *mut c_void) -> Status;

pub type MemoryCopyFn =
    unsafe extern "C" fn(dst: *mut c_void, src: *const c_void, size: usize) -> Status;

/// Core API sub-table: the slots the engine intercepts or calls through.
#[repr(C)]
pub struct CoreTable {
    pub version: ApiTableVersion,
    pub symbol_get_info: Option<SymbolGetInfoFn>,
    pub queue_create: Option<QueueCreateFn>,
    pub code_object_reader_create_from_memory: Option<CodeObjectReaderCreateFromMemoryFn>,
    pub executable_load_agent_code_object: Option<ExecutableLoadAgentCodeObjectFn>,
    pub executable_iterate_symbols: Option<ExecutableIterateSymbolsFn>,
    pub agent_get_info: Option<AgentGetInfoFn>,
    pub isa_get_info_alt: Option<IsaGetInfoAltFn>,
    pub memory_copy: Option<MemoryCopyFn>,
}

/// Writer the runtime passes to a packet interceptor; forwards packets on
/// toward the GPU.
pub type PacketWriterFn = unsafe extern "C" fn(packets: *const c_void, count: u64);

/// Packet interceptor installed on an intercept queue. Called before the
/// packets become visible to the GPU; must forward them via the writer.
pub type PacketInterceptorFn = unsafe extern "C" fn(
    packets: *const c_void,
    count: u64,
    user_queue_index: u64,
    data: *mut c_void,
    writer: PacketWriterFn,
);

pub type QueueInterceptCreateFn = unsafe extern "C" fn(
    agent: Agent,
    size: u32,
    queue_type: u32,
    callback: Option<QueueCreateCallbackFn>,
    data: *mut c_void,
    private_segment_size: u32,
    group_segment_size: u32,
    queue: *mut *mut crate::packet::Queue,
) -> Status;

pub type QueueInterceptRegisterFn = unsafe extern "C" fn(
    queue: *mut crate::packet::Queue,
    interceptor: Option<PacketInterceptorFn>,
    data: *mut c_void,
) -> Status;

pub type MemoryPoolAllocateFn = unsafe extern "C" fn(
    pool: MemoryPool,
    size: usize,
    flags: u32,
    ptr: *mut *mut c_void,
) -> Status;

pub type MemoryPoolFreeFn = unsafe extern "C" fn(ptr: *mut c_void) -> Status;

pub type VmemAddressReserveFn = unsafe extern "C" fn(
    va: *mut *mut c_void,
    size: usize,
    address: u64,
    flags: u64,
) -> Status;

pub type VmemHandleCreateFn = unsafe extern "C" fn(
    pool: MemoryPool,
    size: usize,
    memory_type: u32,
    flags: u64,
    handle: *mut VmemAllocHandle,
) -> Status;

pub type VmemHandleReleaseFn = unsafe extern "C" fn(handle: VmemAllocHandle) -> Status;

pub type VmemMapFn = unsafe extern "C" fn(
    va: *mut c_void,
    size: usize,
    in_offset: usize,
    handle: VmemAllocHandle,
    flags: u64,
) -> Status;

pub type VmemUnmapFn = unsafe extern "C" fn(va: *mut c_void, size: usize) -> Status;

pub type VmemSetAccessFn = unsafe extern "C" fn(
    va: *mut c_void,
    size: usize,
    descs: *const MemoryAccessDesc,
    desc_count: usize,
) -> Status;

/// Vendor extension sub-table.
#[repr(C)]
pub struct AmdExtTable {
    pub version: ApiTableVersion,
    pub queue_intercept_create: Option<QueueInterceptCreateFn>,
    pub queue_intercept_register: Option<QueueInterceptRegisterFn>,
    pub memory_pool_allocate: Option<MemoryPoolAllocateFn>,
    pub memory_pool_free: Option<MemoryPoolFreeFn>,
    pub vmem_address_reserve: Option<VmemAddressReserveFn>,
    pub vmem_handle_create: Option<VmemHandleCreateFn>,
    pub vmem_handle_release: Option<VmemHandleReleaseFn>,
    pub vmem_map: Option<VmemMapFn>,
    pub vmem_unmap: Option<VmemUnmapFn>,
    pub vmem_set_access: Option<VmemSetAccessFn>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiTableVersion {
    pub major_id: u32,
    pub minor_id: u32,
    pub step_id: u32,
    pub reserved: u32,
}

/// Root table handed to `OnLoad`. The engine owns the intercepted slots of
/// `core` and `amd_ext` between load and unload.
#[repr(C)]
pub struct ApiTable {
    pub version: ApiTableVersion,
    pub core: *mut CoreTable,
    pub amd_ext: *mut AmdExtTable,
}
