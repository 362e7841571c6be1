//! Mock HSA runtime for driving full capture sessions without a GPU.
//!
//! Builds an `ApiTable` whose slots are local `extern "C"` stubs, loads the
//! agent through the real `OnLoad`, and then plays the role of the host
//! application: defining kernel symbols, loading code objects, creating
//! queues, allocating "device" memory (host buffers whose addresses stand in
//! for device VAs — the memory-copy stub is a plain memcpy), and submitting
//! packets to the registered interceptor.
//!
//! The agent's globals are one-shot per process, so each integration-test
//! binary runs exactly one session.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use isolate_hsa::packet::{KernelDispatchPacket, Queue, PACKET_TYPE_KERNEL_DISPATCH};
use isolate_hsa::table::{
    AmdExtTable, ApiTable, ApiTableVersion, CoreTable, PacketInterceptorFn,
    QueueCreateCallbackFn,
};
use isolate_hsa::{
    Agent, CodeObjectReader, Executable, ExecutableSymbol, Isa, LoadedCodeObject,
    MemoryAccessDesc, MemoryPool, Signal, Status, VmemAllocHandle, AGENT_INFO_ISA,
    AGENT_INFO_NAME, AGENT_INFO_WAVEFRONT_SIZE, ISA_INFO_NAME, ISA_INFO_NAME_LENGTH,
    STATUS_ERROR, STATUS_SUCCESS, SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE,
    SYMBOL_INFO_KERNEL_OBJECT, SYMBOL_INFO_NAME, SYMBOL_INFO_NAME_LENGTH, SYMBOL_INFO_TYPE,
    SYMBOL_KIND_KERNEL,
};

pub const MOCK_AGENT: Agent = Agent { handle: 0xa6e1 };
pub const MOCK_ISA: Isa = Isa { handle: 0x15a };
pub const MOCK_AGENT_NAME: &str = "gfx90a-mock";
pub const MOCK_ISA_NAME: &str = "amdgcn-amd-amdhsa--gfx90a";
pub const MOCK_WAVEFRONT_SIZE: u32 = 64;

#[derive(Clone)]
pub struct SymbolFixture {
    pub name: String,
    pub kernarg_size: u32,
    pub kernel_object: u64,
}

fn symbols() -> &'static Mutex<HashMap<u64, SymbolFixture>> {
    static MAP: OnceLock<Mutex<HashMap<u64, SymbolFixture>>> = OnceLock::new();
    MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

fn executables() -> &'static Mutex<HashMap<u64, Vec<u64>>> {
    static MAP: OnceLock<Mutex<HashMap<u64, Vec<u64>>>> = OnceLock::new();
    MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

fn interceptors() -> &'static Mutex<Vec<(PacketInterceptorFn, usize)>> {
    static LIST: OnceLock<Mutex<Vec<(PacketInterceptorFn, usize)>>> = OnceLock::new();
    LIST.get_or_init(|| Mutex::new(Vec::new()))
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(0x100);
static FORWARDED: AtomicU64 = AtomicU64::new(0);

fn next_handle() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// Packets the writer stub has forwarded toward the (mock) GPU.
pub fn forwarded_packets() -> u64 {
    FORWARDED.load(Ordering::Relaxed)
}

unsafe extern "C" fn stub_symbol_get_info(
    symbol: ExecutableSymbol,
    attribute: u32,
    value: *mut c_void,
) -> Status {
    let map = symbols().lock().unwrap();
    let Some(fixture) = map.get(&symbol.handle) else {
        return STATUS_ERROR;
    };
    match attribute {
        SYMBOL_INFO_TYPE => *(value as *mut u32) = SYMBOL_KIND_KERNEL,
        SYMBOL_INFO_NAME_LENGTH => *(value as *mut u32) = fixture.name.len() as u32,
        SYMBOL_INFO_NAME => {
            ptr::copy_nonoverlapping(fixture.name.as_ptr(), value as *mut u8, fixture.name.len())
        }
        SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE => {
            *(value as *mut u32) = fixture.kernarg_size
        }
        SYMBOL_INFO_KERNEL_OBJECT => *(value as *mut u64) = fixture.kernel_object,
        _ => return STATUS_ERROR,
    }
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_queue_create(
    _agent: Agent,
    _size: u32,
    _queue_type: u32,
    _callback: Option<QueueCreateCallbackFn>,
    _data: *mut c_void,
    _private_segment_size: u32,
    _group_segment_size: u32,
    queue: *mut *mut Queue,
) -> Status {
    let boxed = Box::new(Queue {
        queue_type: 0,
        features: 0,
        base_address: ptr::null_mut(),
        doorbell_signal: Signal::NULL,
        size: 0,
        reserved1: 0,
        id: next_handle(),
    });
    *queue = Box::into_raw(boxed);
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_queue_intercept_register(
    _queue: *mut Queue,
    interceptor: Option<PacketInterceptorFn>,
    data: *mut c_void,
) -> Status {
    let Some(interceptor) = interceptor else {
        return STATUS_ERROR;
    };
    interceptors().lock().unwrap().push((interceptor, data as usize));
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_agent_get_info(
    _agent: Agent,
    attribute: u32,
    value: *mut c_void,
) -> Status {
    match attribute {
        AGENT_INFO_NAME => {
            let bytes = MOCK_AGENT_NAME.as_bytes();
            ptr::write_bytes(value as *mut u8, 0, 64);
            ptr::copy_nonoverlapping(bytes.as_ptr(), value as *mut u8, bytes.len());
        }
        AGENT_INFO_WAVEFRONT_SIZE => *(value as *mut u32) = MOCK_WAVEFRONT_SIZE,
        AGENT_INFO_ISA => *(value as *mut Isa) = MOCK_ISA,
        _ => return STATUS_ERROR,
    }
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_isa_get_info_alt(
    _isa: Isa,
    attribute: u32,
    value: *mut c_void,
) -> Status {
    match attribute {
        ISA_INFO_NAME_LENGTH => *(value as *mut u32) = MOCK_ISA_NAME.len() as u32,
        ISA_INFO_NAME => ptr::copy_nonoverlapping(
            MOCK_ISA_NAME.as_ptr(),
            value as *mut u8,
            MOCK_ISA_NAME.len(),
        ),
        _ => return STATUS_ERROR,
    }
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_memory_copy(
    dst: *mut c_void,
    src: *const c_void,
    size: usize,
) -> Status {
    ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size);
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_reader_create_from_memory(
    _code_object: *const c_void,
    _size: usize,
    reader: *mut CodeObjectReader,
) -> Status {
    *reader = CodeObjectReader {
        handle: next_handle(),
    };
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_load_agent_code_object(
    _executable: Executable,
    _agent: Agent,
    _reader: CodeObjectReader,
    _options: *const std::ffi::c_char,
    _loaded: *mut LoadedCodeObject,
) -> Status {
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_executable_iterate_symbols(
    executable: Executable,
    callback: Option<isolate_hsa::table::ExecutableIterateSymbolsCallbackFn>,
    data: *mut c_void,
) -> Status {
    let handles = executables()
        .lock()
        .unwrap()
        .get(&executable.handle)
        .cloned()
        .unwrap_or_default();
    let Some(callback) = callback else {
        return STATUS_ERROR;
    };
    for handle in handles {
        callback(executable, ExecutableSymbol { handle }, data);
    }
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_pool_allocate(
    _pool: MemoryPool,
    size: usize,
    _flags: u32,
    ptr_out: *mut *mut c_void,
) -> Status {
    let buffer = vec![0u8; size].into_boxed_slice();
    *ptr_out = Box::into_raw(buffer) as *mut c_void;
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_pool_free(_ptr: *mut c_void) -> Status {
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_vmem_address_reserve(
    va: *mut *mut c_void,
    _size: usize,
    address: u64,
    _flags: u64,
) -> Status {
    *va = address as *mut c_void;
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_vmem_handle_create(
    _pool: MemoryPool,
    _size: usize,
    _memory_type: u32,
    _flags: u64,
    handle: *mut VmemAllocHandle,
) -> Status {
    *handle = VmemAllocHandle {
        handle: next_handle(),
    };
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_vmem_handle_release(_handle: VmemAllocHandle) -> Status {
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_vmem_map(
    _va: *mut c_void,
    _size: usize,
    _in_offset: usize,
    _handle: VmemAllocHandle,
    _flags: u64,
) -> Status {
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_vmem_unmap(_va: *mut c_void, _size: usize) -> Status {
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_vmem_set_access(
    _va: *mut c_void,
    _size: usize,
    _descs: *const MemoryAccessDesc,
    _desc_count: usize,
) -> Status {
    STATUS_SUCCESS
}

unsafe extern "C" fn stub_packet_writer(_packets: *const c_void, count: u64) {
    FORWARDED.fetch_add(count, Ordering::Relaxed);
}

/// Build a full mock API table. Leaked: the agent holds the pointer for the
/// lifetime of the (test) process.
pub fn build_table() -> *mut ApiTable {
    let core = Box::into_raw(Box::new(CoreTable {
        version: ApiTableVersion::default(),
        symbol_get_info: Some(stub_symbol_get_info),
        queue_create: Some(stub_queue_create),
        code_object_reader_create_from_memory: Some(stub_reader_create_from_memory),
        executable_load_agent_code_object: Some(stub_load_agent_code_object),
        executable_iterate_symbols: Some(stub_executable_iterate_symbols),
        agent_get_info: Some(stub_agent_get_info),
        isa_get_info_alt: Some(stub_isa_get_info_alt),
        memory_copy: Some(stub_memory_copy),
    }));
    let amd_ext = Box::into_raw(Box::new(AmdExtTable {
        version: ApiTableVersion::default(),
        queue_intercept_create: Some(stub_queue_create),
        queue_intercept_register: Some(stub_queue_intercept_register),
        memory_pool_allocate: Some(stub_pool_allocate),
        memory_pool_free: Some(stub_pool_free),
        vmem_address_reserve: Some(stub_vmem_address_reserve),
        vmem_handle_create: Some(stub_vmem_handle_create),
        vmem_handle_release: Some(stub_vmem_handle_release),
        vmem_map: Some(stub_vmem_map),
        vmem_unmap: Some(stub_vmem_unmap),
        vmem_set_access: Some(stub_vmem_set_access),
    }));
    Box::into_raw(Box::new(ApiTable {
        version: ApiTableVersion::default(),
        core,
        amd_ext,
    }))
}

/// One loaded capture session against the mock runtime.
pub struct MockSession {
    pub table: *mut ApiTable,
}

impl MockSession {
    /// Configure the environment, build the table, and load the agent.
    pub fn load(pattern: Option<&str>, index: Option<&str>, capture_dir: &Path) -> Self {
        match pattern {
            Some(p) => std::env::set_var("ISOLATE_KERNEL", p),
            None => std::env::remove_var("ISOLATE_KERNEL"),
        }
        match index {
            Some(i) => std::env::set_var("ISOLATE_DISPATCH_INDEX", i),
            None => std::env::remove_var("ISOLATE_DISPATCH_INDEX"),
        }
        std::env::set_var("ISOLATE_CAPTURE_DIR", capture_dir);

        let table = build_table();
        let loaded = unsafe { isolate_capture::OnLoad(table, 1, 0, ptr::null()) };
        assert!(loaded, "OnLoad must accept the mock table");
        Self { table }
    }

    fn core(&self) -> &CoreTable {
        unsafe { &*(*self.table).core }
    }

    fn amd_ext(&self) -> &AmdExtTable {
        unsafe { &*(*self.table).amd_ext }
    }

    /// Define a kernel symbol fixture the stubs will answer queries for.
    pub fn define_symbol(&self, symbol: u64, name: &str, kernarg_size: u32, kernel_object: u64) {
        symbols().lock().unwrap().insert(
            symbol,
            SymbolFixture {
                name: name.to_string(),
                kernarg_size,
                kernel_object,
            },
        );
    }

    /// What the application does after `hipModuleLoad`: create a reader over
    /// the binary and load it onto the agent. The loaded executable fans the
    /// blob out to `symbol_handles`.
    pub fn load_code_object(&self, executable: u64, symbol_handles: &[u64], bytes: &[u8]) {
        executables()
            .lock()
            .unwrap()
            .insert(executable, symbol_handles.to_vec());

        let create = self.core().code_object_reader_create_from_memory.unwrap();
        let load = self.core().executable_load_agent_code_object.unwrap();
        unsafe {
            let mut reader = CodeObjectReader::NULL;
            assert_eq!(
                create(bytes.as_ptr() as *const c_void, bytes.len(), &mut reader),
                STATUS_SUCCESS
            );
            let mut loaded = LoadedCodeObject::NULL;
            assert_eq!(
                load(
                    Executable { handle: executable },
                    MOCK_AGENT,
                    reader,
                    ptr::null(),
                    &mut loaded,
                ),
                STATUS_SUCCESS
            );
        }
    }

    /// What the application does on symbol lookup: query the kernel-object
    /// attribute, which is the agent's fallback interning path.
    pub fn query_kernel_object(&self, symbol: u64) -> u64 {
        let get_info = self.core().symbol_get_info.unwrap();
        let mut kernel_object: u64 = 0;
        unsafe {
            assert_eq!(
                get_info(
                    ExecutableSymbol { handle: symbol },
                    SYMBOL_INFO_KERNEL_OBJECT,
                    &mut kernel_object as *mut _ as *mut c_void,
                ),
                STATUS_SUCCESS
            );
        }
        kernel_object
    }

    /// Create a queue through the hooked entry and return it paired with the
    /// interceptor the agent registered for it.
    pub fn create_queue(&self) -> MockQueue {
        let create = self.core().queue_create.unwrap();
        let mut queue: *mut Queue = ptr::null_mut();
        unsafe {
            assert_eq!(
                create(MOCK_AGENT, 128, 0, None, ptr::null_mut(), 0, 0, &mut queue),
                STATUS_SUCCESS
            );
        }
        let (interceptor, data) = interceptors()
            .lock()
            .unwrap()
            .last()
            .copied()
            .expect("queue creation must register an interceptor");
        MockQueue {
            queue,
            interceptor,
            data,
        }
    }

    /// Allocate "device" memory through the hooked pool entry. The returned
    /// pointer doubles as the region's device base address.
    pub fn pool_allocate(&self, size: usize) -> *mut u8 {
        let allocate = self.amd_ext().memory_pool_allocate.unwrap();
        let mut ptr_out: *mut c_void = ptr::null_mut();
        unsafe {
            assert_eq!(
                allocate(MemoryPool { handle: 1 }, size, 0, &mut ptr_out),
                STATUS_SUCCESS
            );
        }
        ptr_out as *mut u8
    }
}

/// A queue plus the packet interceptor the agent installed on it.
#[derive(Clone, Copy)]
pub struct MockQueue {
    pub queue: *mut Queue,
    interceptor: PacketInterceptorFn,
    data: usize,
}

// Tests submit from multiple threads; the queue pointer and interceptor are
// stable for the life of the process.
unsafe impl Send for MockQueue {}
unsafe impl Sync for MockQueue {}

impl MockQueue {
    /// Submit packets the way the runtime would: invoke the interceptor and
    /// let it forward through the writer.
    pub fn submit(&self, packets: &[KernelDispatchPacket]) {
        unsafe {
            (self.interceptor)(
                packets.as_ptr() as *const c_void,
                packets.len() as u64,
                0,
                self.data as *mut c_void,
                stub_packet_writer,
            );
        }
    }
}

/// A kernel-dispatch packet with the fields the agent reads.
pub fn dispatch_packet(
    kernel_object: u64,
    kernarg: *mut c_void,
    grid_x: u32,
    block_x: u16,
) -> KernelDispatchPacket {
    let mut pkt = KernelDispatchPacket::zeroed();
    pkt.header = PACKET_TYPE_KERNEL_DISPATCH as u16;
    pkt.setup = 1;
    pkt.workgroup_size_x = block_x;
    pkt.workgroup_size_y = 1;
    pkt.workgroup_size_z = 1;
    pkt.grid_size_x = grid_x;
    pkt.grid_size_y = 1;
    pkt.grid_size_z = 1;
    pkt.kernel_object = kernel_object;
    pkt.kernarg_address = kernarg;
    pkt
}

/// A packet of a non-dispatch type; the agent must ignore it.
pub fn barrier_packet() -> KernelDispatchPacket {
    let mut pkt = KernelDispatchPacket::zeroed();
    pkt.header = isolate_hsa::packet::PACKET_TYPE_BARRIER_AND as u16;
    pkt
}
