//! dlopen binding to the HSA runtime
//!
//! The replay process is an ordinary binary, so it reaches the runtime the
//! way a host application would: load the shared library, resolve the
//! exported functions, call them. Function pointers are resolved once at
//! load and kept alongside the `Library` that owns them.

use std::ffi::{c_char, c_void};
use std::ptr;

use libloading::Library;

use crate::packet::Queue;
use crate::table::{ExecutableIterateSymbolsCallbackFn, QueueCreateCallbackFn};
use crate::{
    check, Agent, CodeObjectReader, Executable, ExecutableSymbol, HsaError, Isa,
    LoadedCodeObject, MemoryAccessDesc, MemoryPool, SignalValue, Status, VmemAllocHandle,
    AGENT_INFO_DEVICE, AGENT_INFO_ISA, AGENT_INFO_NAME, DEVICE_TYPE_GPU, ISA_INFO_NAME,
    ISA_INFO_NAME_LENGTH, STATUS_SUCCESS,
};
use crate::{name_from_bytes, Signal};

const LIBRARY_CANDIDATES: &[&str] = &["libhsa-runtime64.so.1", "libhsa-runtime64.so"];

type AgentIterateCallbackFn = unsafe extern "C" fn(agent: Agent, data: *mut c_void) -> Status;
type PoolIterateCallbackFn = unsafe extern "C" fn(pool: MemoryPool, data: *mut c_void) -> Status;

#[allow(clippy::type_complexity)]
struct Api {
    init: unsafe extern "C" fn() -> Status,
    shut_down: unsafe extern "C" fn() -> Status,
    iterate_agents:
        unsafe extern "C" fn(callback: AgentIterateCallbackFn, data: *mut c_void) -> Status,
    agent_get_info: unsafe extern "C" fn(Agent, u32, *mut c_void) -> Status,
    isa_get_info_alt: unsafe extern "C" fn(Isa, u32, *mut c_void) -> Status,
    agent_iterate_memory_pools:
        unsafe extern "C" fn(Agent, PoolIterateCallbackFn, *mut c_void) -> Status,
    memory_pool_get_info: unsafe extern "C" fn(MemoryPool, u32, *mut c_void) -> Status,
    memory_pool_allocate:
        unsafe extern "C" fn(MemoryPool, usize, u32, *mut *mut c_void) -> Status,
    memory_pool_free: unsafe extern "C" fn(*mut c_void) -> Status,
    agents_allow_access:
        unsafe extern "C" fn(u32, *const Agent, *const u32, *const c_void) -> Status,
    memory_copy: unsafe extern "C" fn(*mut c_void, *const c_void, usize) -> Status,
    vmem_address_reserve:
        unsafe extern "C" fn(*mut *mut c_void, usize, u64, u64) -> Status,
    vmem_handle_create:
        unsafe extern "C" fn(MemoryPool, usize, u32, u64, *mut VmemAllocHandle) -> Status,
    vmem_map: unsafe extern "C" fn(*mut c_void, usize, usize, VmemAllocHandle, u64) -> Status,
    vmem_set_access:
        unsafe extern "C" fn(*mut c_void, usize, *const MemoryAccessDesc, usize) -> Status,
    code_object_reader_create_from_memory:
        unsafe extern "C" fn(*const c_void, usize, *mut CodeObjectReader) -> Status,
    code_object_reader_destroy: unsafe extern "C" fn(CodeObjectReader) -> Status,
    executable_create: unsafe extern "C" fn(u32, u32, *const c_char, *mut Executable) -> Status,
    executable_load_agent_code_object: unsafe extern "C" fn(
        Executable,
        Agent,
        CodeObjectReader,
        *const c_char,
        *mut LoadedCodeObject,
    ) -> Status,
    executable_freeze: unsafe extern "C" fn(Executable, *const c_char) -> Status,
    executable_destroy: unsafe extern "C" fn(Executable) -> Status,
    executable_iterate_symbols: unsafe extern "C" fn(
        Executable,
        ExecutableIterateSymbolsCallbackFn,
        *mut c_void,
    ) -> Status,
    executable_symbol_get_info:
        unsafe extern "C" fn(ExecutableSymbol, u32, *mut c_void) -> Status,
    queue_create: unsafe extern "C" fn(
        Agent,
        u32,
        u32,
        Option<QueueCreateCallbackFn>,
        *mut c_void,
        u32,
        u32,
        *mut *mut Queue,
    ) -> Status,
    queue_destroy: unsafe extern "C" fn(*mut Queue) -> Status,
    queue_load_write_index_relaxed: unsafe extern "C" fn(*const Queue) -> u64,
    queue_store_write_index_screlease: unsafe extern "C" fn(*const Queue, u64),
    signal_create: unsafe extern "C" fn(SignalValue, u32, *const Agent, *mut Signal) -> Status,
    signal_destroy: unsafe extern "C" fn(Signal) -> Status,
    signal_store_screlease: unsafe extern "C" fn(Signal, SignalValue),
    signal_wait_scacquire:
        unsafe extern "C" fn(Signal, u32, SignalValue, u64, u32) -> SignalValue,
}

macro_rules! resolve {
    ($lib:expr, $name:literal) => {
        *$lib
            .get(concat!($name, "\0").as_bytes())
            .map_err(|source| HsaError::MissingSymbol {
                name: $name,
                source,
            })?
    };
}

/// The loaded HSA runtime.
pub struct Runtime {
    api: Api,
    // Dropped last; the resolved pointers in `api` borrow from it.
    _lib: Library,
}

impl Runtime {
    /// dlopen the runtime and resolve every function the replay needs.
    pub fn load() -> Result<Self, HsaError> {
        let mut last_err = None;
        let lib = LIBRARY_CANDIDATES
            .iter()
            .find_map(|name| match unsafe { Library::new(name) } {
                Ok(lib) => Some(lib),
                Err(e) => {
                    last_err = Some(e);
                    None
                }
            })
            .ok_or_else(|| HsaError::LibraryLoad(last_err.expect("candidate list is non-empty")))?;

        let api = unsafe {
            Api {
                init: resolve!(lib, "hsa_init"),
                shut_down: resolve!(lib, "hsa_shut_down"),
                iterate_agents: resolve!(lib, "hsa_iterate_agents"),
                agent_get_info: resolve!(lib, "hsa_agent_get_info"),
                isa_get_info_alt: resolve!(lib, "hsa_isa_get_info_alt"),
                agent_iterate_memory_pools: resolve!(lib, "hsa_amd_agent_iterate_memory_pools"),
                memory_pool_get_info: resolve!(lib, "hsa_amd_memory_pool_get_info"),
                memory_pool_allocate: resolve!(lib, "hsa_amd_memory_pool_allocate"),
                memory_pool_free: resolve!(lib, "hsa_amd_memory_pool_free"),
                agents_allow_access: resolve!(lib, "hsa_amd_agents_allow_access"),
                memory_copy: resolve!(lib, "hsa_memory_copy"),
                vmem_address_reserve: resolve!(lib, "hsa_amd_vmem_address_reserve"),
                vmem_handle_create: resolve!(lib, "hsa_amd_vmem_handle_create"),
                vmem_map: resolve!(lib, "hsa_amd_vmem_map"),
                vmem_set_access: resolve!(lib, "hsa_amd_vmem_set_access"),
                code_object_reader_create_from_memory: resolve!(
                    lib,
                    "hsa_code_object_reader_create_from_memory"
                ),
                code_object_reader_destroy: resolve!(lib, "hsa_code_object_reader_destroy"),
                executable_create: resolve!(lib, "hsa_executable_create"),
                executable_load_agent_code_object: resolve!(
                    lib,
                    "hsa_executable_load_agent_code_object"
                ),
                executable_freeze: resolve!(lib, "hsa_executable_freeze"),
                executable_destroy: resolve!(lib, "hsa_executable_destroy"),
                executable_iterate_symbols: resolve!(lib, "hsa_executable_iterate_symbols"),
                executable_symbol_get_info: resolve!(lib, "hsa_executable_symbol_get_info"),
                queue_create: resolve!(lib, "hsa_queue_create"),
                queue_destroy: resolve!(lib, "hsa_queue_destroy"),
                queue_load_write_index_relaxed: resolve!(lib, "hsa_queue_load_write_index_relaxed"),
                queue_store_write_index_screlease: resolve!(
                    lib,
                    "hsa_queue_store_write_index_screlease"
                ),
                signal_create: resolve!(lib, "hsa_signal_create"),
                signal_destroy: resolve!(lib, "hsa_signal_destroy"),
                signal_store_screlease: resolve!(lib, "hsa_signal_store_screlease"),
                signal_wait_scacquire: resolve!(lib, "hsa_signal_wait_scacquire"),
            }
        };

        Ok(Self { api, _lib: lib })
    }

    pub fn init(&self) -> Result<(), HsaError> {
        check("hsa_init", unsafe { (self.api.init)() })
    }

    pub fn shut_down(&self) {
        unsafe {
            (self.api.shut_down)();
        }
    }

    pub fn agents(&self) -> Result<Vec<Agent>, HsaError> {
        unsafe extern "C" fn collect(agent: Agent, data: *mut c_void) -> Status {
            let list = &mut *(data as *mut Vec<Agent>);
            list.push(agent);
            STATUS_SUCCESS
        }

        let mut agents: Vec<Agent> = Vec::new();
        check("hsa_iterate_agents", unsafe {
            (self.api.iterate_agents)(collect, &mut agents as *mut _ as *mut c_void)
        })?;
        Ok(agents)
    }

    /// First GPU agent in enumeration order.
    pub fn first_gpu_agent(&self) -> Result<Option<Agent>, HsaError> {
        for agent in self.agents()? {
            let mut device_type: u32 = 0;
            check("hsa_agent_get_info", unsafe {
                (self.api.agent_get_info)(
                    agent,
                    AGENT_INFO_DEVICE,
                    &mut device_type as *mut _ as *mut c_void,
                )
            })?;
            if device_type == DEVICE_TYPE_GPU {
                return Ok(Some(agent));
            }
        }
        Ok(None)
    }

    pub fn agent_name(&self, agent: Agent) -> Result<String, HsaError> {
        let mut buf = [0u8; 64];
        check("hsa_agent_get_info", unsafe {
            (self.api.agent_get_info)(agent, AGENT_INFO_NAME, buf.as_mut_ptr() as *mut c_void)
        })?;
        Ok(name_from_bytes(&buf))
    }

    pub fn agent_isa_name(&self, agent: Agent) -> Result<String, HsaError> {
        let mut isa = Isa::NULL;
        check("hsa_agent_get_info", unsafe {
            (self.api.agent_get_info)(agent, AGENT_INFO_ISA, &mut isa as *mut _ as *mut c_void)
        })?;

        let mut len: u32 = 0;
        check("hsa_isa_get_info_alt", unsafe {
            (self.api.isa_get_info_alt)(isa, ISA_INFO_NAME_LENGTH, &mut len as *mut _ as *mut c_void)
        })?;
        let mut buf = vec![0u8; len as usize + 1];
        check("hsa_isa_get_info_alt", unsafe {
            (self.api.isa_get_info_alt)(isa, ISA_INFO_NAME, buf.as_mut_ptr() as *mut c_void)
        })?;
        Ok(name_from_bytes(&buf))
    }

    pub fn agent_memory_pools(&self, agent: Agent) -> Result<Vec<MemoryPool>, HsaError> {
        unsafe extern "C" fn collect(pool: MemoryPool, data: *mut c_void) -> Status {
            let list = &mut *(data as *mut Vec<MemoryPool>);
            list.push(pool);
            STATUS_SUCCESS
        }

        let mut pools: Vec<MemoryPool> = Vec::new();
        check("hsa_amd_agent_iterate_memory_pools", unsafe {
            (self.api.agent_iterate_memory_pools)(
                agent,
                collect,
                &mut pools as *mut _ as *mut c_void,
            )
        })?;
        Ok(pools)
    }

    pub fn pool_info_u32(&self, pool: MemoryPool, attribute: u32) -> Result<u32, HsaError> {
        let mut value: u32 = 0;
        check("hsa_amd_memory_pool_get_info", unsafe {
            (self.api.memory_pool_get_info)(pool, attribute, &mut value as *mut _ as *mut c_void)
        })?;
        Ok(value)
    }

    pub fn pool_info_bool(&self, pool: MemoryPool, attribute: u32) -> Result<bool, HsaError> {
        let mut value: bool = false;
        check("hsa_amd_memory_pool_get_info", unsafe {
            (self.api.memory_pool_get_info)(pool, attribute, &mut value as *mut _ as *mut c_void)
        })?;
        Ok(value)
    }

    pub fn pool_allocate(&self, pool: MemoryPool, size: usize) -> Result<*mut c_void, HsaError> {
        let mut ptr: *mut c_void = ptr::null_mut();
        check("hsa_amd_memory_pool_allocate", unsafe {
            (self.api.memory_pool_allocate)(pool, size, 0, &mut ptr)
        })?;
        Ok(ptr)
    }

    pub fn pool_free(&self, ptr: *mut c_void) {
        unsafe {
            (self.api.memory_pool_free)(ptr);
        }
    }

    pub fn agents_allow_access(&self, agents: &[Agent], ptr: *const c_void) -> Result<(), HsaError> {
        check("hsa_amd_agents_allow_access", unsafe {
            (self.api.agents_allow_access)(
                agents.len() as u32,
                agents.as_ptr(),
                ptr::null(),
                ptr,
            )
        })
    }

    /// Bidirectional copy; direction is inferred from the pointers'
    /// residency, exactly as the runtime defines it.
    pub fn memory_copy(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        size: usize,
    ) -> Result<(), HsaError> {
        check("hsa_memory_copy", unsafe {
            (self.api.memory_copy)(dst, src, size)
        })
    }

    /// Reserve a VA range, requesting `address` exactly. Returns the address
    /// the runtime actually granted.
    pub fn vmem_address_reserve(&self, size: usize, address: u64) -> Result<u64, HsaError> {
        let mut va: *mut c_void = ptr::null_mut();
        check("hsa_amd_vmem_address_reserve", unsafe {
            (self.api.vmem_address_reserve)(&mut va, size, address, 0)
        })?;
        Ok(va as u64)
    }

    pub fn vmem_handle_create(
        &self,
        pool: MemoryPool,
        size: usize,
    ) -> Result<VmemAllocHandle, HsaError> {
        let mut handle = VmemAllocHandle::NULL;
        check("hsa_amd_vmem_handle_create", unsafe {
            (self.api.vmem_handle_create)(pool, size, 0, 0, &mut handle)
        })?;
        Ok(handle)
    }

    pub fn vmem_map(
        &self,
        va: u64,
        size: usize,
        handle: VmemAllocHandle,
    ) -> Result<(), HsaError> {
        check("hsa_amd_vmem_map", unsafe {
            (self.api.vmem_map)(va as *mut c_void, size, 0, handle, 0)
        })
    }

    pub fn vmem_set_access(
        &self,
        va: u64,
        size: usize,
        descs: &[MemoryAccessDesc],
    ) -> Result<(), HsaError> {
        check("hsa_amd_vmem_set_access", unsafe {
            (self.api.vmem_set_access)(va as *mut c_void, size, descs.as_ptr(), descs.len())
        })
    }

    pub fn code_object_reader_from_memory(
        &self,
        bytes: &[u8],
    ) -> Result<CodeObjectReader, HsaError> {
        let mut reader = CodeObjectReader::NULL;
        check("hsa_code_object_reader_create_from_memory", unsafe {
            (self.api.code_object_reader_create_from_memory)(
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                &mut reader,
            )
        })?;
        Ok(reader)
    }

    pub fn code_object_reader_destroy(&self, reader: CodeObjectReader) {
        unsafe {
            (self.api.code_object_reader_destroy)(reader);
        }
    }

    pub fn executable_create(&self, profile: u32, state: u32) -> Result<Executable, HsaError> {
        let mut executable = Executable::NULL;
        check("hsa_executable_create", unsafe {
            (self.api.executable_create)(profile, state, ptr::null(), &mut executable)
        })?;
        Ok(executable)
    }

    pub fn executable_load_agent_code_object(
        &self,
        executable: Executable,
        agent: Agent,
        reader: CodeObjectReader,
    ) -> Result<(), HsaError> {
        let mut loaded = LoadedCodeObject::NULL;
        check("hsa_executable_load_agent_code_object", unsafe {
            (self.api.executable_load_agent_code_object)(
                executable,
                agent,
                reader,
                ptr::null(),
                &mut loaded,
            )
        })
    }

    pub fn executable_freeze(&self, executable: Executable) -> Result<(), HsaError> {
        check("hsa_executable_freeze", unsafe {
            (self.api.executable_freeze)(executable, ptr::null())
        })
    }

    pub fn executable_destroy(&self, executable: Executable) {
        unsafe {
            (self.api.executable_destroy)(executable);
        }
    }

    pub fn executable_symbols(
        &self,
        executable: Executable,
    ) -> Result<Vec<ExecutableSymbol>, HsaError> {
        unsafe extern "C" fn collect(
            _executable: Executable,
            symbol: ExecutableSymbol,
            data: *mut c_void,
        ) -> Status {
            let list = &mut *(data as *mut Vec<ExecutableSymbol>);
            list.push(symbol);
            STATUS_SUCCESS
        }

        let mut symbols: Vec<ExecutableSymbol> = Vec::new();
        check("hsa_executable_iterate_symbols", unsafe {
            (self.api.executable_iterate_symbols)(
                executable,
                collect,
                &mut symbols as *mut _ as *mut c_void,
            )
        })?;
        Ok(symbols)
    }

    pub fn symbol_info_u32(
        &self,
        symbol: ExecutableSymbol,
        attribute: u32,
    ) -> Result<u32, HsaError> {
        let mut value: u32 = 0;
        check("hsa_executable_symbol_get_info", unsafe {
            (self.api.executable_symbol_get_info)(
                symbol,
                attribute,
                &mut value as *mut _ as *mut c_void,
            )
        })?;
        Ok(value)
    }

    pub fn symbol_info_u64(
        &self,
        symbol: ExecutableSymbol,
        attribute: u32,
    ) -> Result<u64, HsaError> {
        let mut value: u64 = 0;
        check("hsa_executable_symbol_get_info", unsafe {
            (self.api.executable_symbol_get_info)(
                symbol,
                attribute,
                &mut value as *mut _ as *mut c_void,
            )
        })?;
        Ok(value)
    }

    pub fn queue_create(&self, agent: Agent, size: u32, queue_type: u32) -> Result<*mut Queue, HsaError> {
        let mut queue: *mut Queue = ptr::null_mut();
        check("hsa_queue_create", unsafe {
            (self.api.queue_create)(agent, size, queue_type, None, ptr::null_mut(), 0, 0, &mut queue)
        })?;
        Ok(queue)
    }

    pub fn queue_destroy(&self, queue: *mut Queue) {
        unsafe {
            (self.api.queue_destroy)(queue);
        }
    }

    pub fn queue_load_write_index(&self, queue: *const Queue) -> u64 {
        unsafe { (self.api.queue_load_write_index_relaxed)(queue) }
    }

    pub fn queue_store_write_index(&self, queue: *const Queue, value: u64) {
        unsafe { (self.api.queue_store_write_index_screlease)(queue, value) }
    }

    pub fn signal_create(&self, initial: SignalValue) -> Result<Signal, HsaError> {
        let mut signal = Signal::NULL;
        check("hsa_signal_create", unsafe {
            (self.api.signal_create)(initial, 0, ptr::null(), &mut signal)
        })?;
        Ok(signal)
    }

    pub fn signal_destroy(&self, signal: Signal) {
        unsafe {
            (self.api.signal_destroy)(signal);
        }
    }

    pub fn signal_store(&self, signal: Signal, value: SignalValue) {
        unsafe { (self.api.signal_store_screlease)(signal, value) }
    }

    /// Wait until the signal drops below `compare`, with the runtime's
    /// timeout hint; returns the observed value.
    pub fn signal_wait_lt(
        &self,
        signal: Signal,
        compare: SignalValue,
        timeout_hint: u64,
    ) -> SignalValue {
        unsafe {
            (self.api.signal_wait_scacquire)(
                signal,
                crate::SIGNAL_CONDITION_LT,
                compare,
                timeout_hint,
                crate::WAIT_STATE_BLOCKED,
            )
        }
    }
}
