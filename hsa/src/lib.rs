//! HSA runtime contract
//!
//! Everything the rest of the workspace knows about the GPU runtime lives
//! here: opaque handle types, status codes, the attribute constants we query,
//! the tools-library API table whose slots the capture agent intercepts, the
//! AQL kernel-dispatch packet, and a [`runtime::Runtime`] that binds the
//! runtime's exported functions with `libloading` for the replay process.
//!
//! The capture agent never links the runtime. It receives a [`table::ApiTable`]
//! pointer at load time and calls originals through saved slots, which is why
//! the table and the dlopen binding are two separate surfaces of this crate.

pub mod packet;
pub mod runtime;
pub mod table;

use thiserror::Error;

/// Runtime status code. 0 is success; `STATUS_INFO_BREAK` terminates
/// iteration callbacks early without signalling an error.
pub type Status = u32;

pub const STATUS_SUCCESS: Status = 0;
pub const STATUS_INFO_BREAK: Status = 0x1;
pub const STATUS_ERROR: Status = 0x1000;

/// Signal payload type.
pub type SignalValue = i64;

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[repr(C)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            pub handle: u64,
        }

        impl $name {
            pub const NULL: Self = Self { handle: 0 };

            pub fn is_null(&self) -> bool {
                self.handle == 0
            }
        }
    };
}

handle_type!(
    /// An addressable device endpoint (CPU or GPU).
    Agent
);
handle_type!(Signal);
handle_type!(Executable);
handle_type!(ExecutableSymbol);
handle_type!(CodeObjectReader);
handle_type!(LoadedCodeObject);
handle_type!(Isa);
handle_type!(MemoryPool);
handle_type!(
    /// Backing physical allocation created by `vmem_handle_create`.
    VmemAllocHandle
);

// hsa_agent_info_t
pub const AGENT_INFO_NAME: u32 = 0;
pub const AGENT_INFO_WAVEFRONT_SIZE: u32 = 6;
pub const AGENT_INFO_DEVICE: u32 = 17;
pub const AGENT_INFO_ISA: u32 = 19;

// hsa_device_type_t
pub const DEVICE_TYPE_CPU: u32 = 0;
pub const DEVICE_TYPE_GPU: u32 = 1;

// hsa_isa_info_t
pub const ISA_INFO_NAME_LENGTH: u32 = 0;
pub const ISA_INFO_NAME: u32 = 1;

// hsa_executable_symbol_info_t
pub const SYMBOL_INFO_TYPE: u32 = 0;
pub const SYMBOL_INFO_NAME_LENGTH: u32 = 1;
pub const SYMBOL_INFO_NAME: u32 = 2;
pub const SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE: u32 = 11;
pub const SYMBOL_INFO_KERNEL_GROUP_SEGMENT_SIZE: u32 = 13;
pub const SYMBOL_INFO_KERNEL_PRIVATE_SEGMENT_SIZE: u32 = 14;
pub const SYMBOL_INFO_KERNEL_OBJECT: u32 = 22;

// hsa_symbol_kind_t
pub const SYMBOL_KIND_VARIABLE: u32 = 0;
pub const SYMBOL_KIND_KERNEL: u32 = 1;

// hsa_profile_t / hsa_executable_state_t
pub const PROFILE_FULL: u32 = 1;
pub const EXECUTABLE_STATE_UNFROZEN: u32 = 0;

// hsa_queue_type_t
pub const QUEUE_TYPE_MULTI: u32 = 0;

// hsa_signal_condition_t
pub const SIGNAL_CONDITION_LT: u32 = 2;

// hsa_wait_state_t
pub const WAIT_STATE_BLOCKED: u32 = 0;

// hsa_amd_segment_t
pub const AMD_SEGMENT_GLOBAL: u32 = 0;

// hsa_amd_memory_pool_info_t
pub const AMD_MEMORY_POOL_INFO_SEGMENT: u32 = 0;
pub const AMD_MEMORY_POOL_INFO_GLOBAL_FLAGS: u32 = 1;
pub const AMD_MEMORY_POOL_INFO_RUNTIME_ALLOC_ALLOWED: u32 = 5;

// hsa_amd_memory_pool_global_flag_t
pub const AMD_MEMORY_POOL_GLOBAL_FLAG_FINE_GRAINED: u32 = 2;

// hsa_access_permission_t
pub const ACCESS_PERMISSION_NONE: u32 = 0;
pub const ACCESS_PERMISSION_RO: u32 = 1;
pub const ACCESS_PERMISSION_WO: u32 = 2;
pub const ACCESS_PERMISSION_RW: u32 = 3;

/// Per-agent permission grant passed to `vmem_set_access`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryAccessDesc {
    pub permissions: u32,
    pub agent_handle: Agent,
}

/// Errors surfaced by the dlopen runtime binding.
#[derive(Error, Debug)]
pub enum HsaError {
    #[error("failed to load the HSA runtime library: {0}")]
    LibraryLoad(#[source] libloading::Error),

    #[error("HSA runtime is missing required symbol {name}: {source}")]
    MissingSymbol {
        name: &'static str,
        source: libloading::Error,
    },

    #[error("{call} failed with status {status:#x}")]
    Call { call: &'static str, status: Status },
}

/// Convert a status into a typed error, tagging the failed call.
pub fn check(call: &'static str, status: Status) -> Result<(), HsaError> {
    if status == STATUS_SUCCESS {
        Ok(())
    } else {
        Err(HsaError::Call { call, status })
    }
}

/// Read a fixed-capacity, NUL-padded name buffer the runtime filled in.
pub fn name_from_bytes(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
