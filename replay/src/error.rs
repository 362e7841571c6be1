//! Replay error taxonomy
//!
//! Strict replay never falls back to relocating a region; every failure mode
//! gets its own variant and message, and relocation alone maps to exit
//! code 2 so harnesses can tell "the address space could not be rebuilt as
//! captured" apart from every other failure.

use thiserror::Error;

use isolate_hsa::HsaError;
use isolate_shared::ArtifactError;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Relocation detected for region {base:#x} (runtime granted {granted:#x})")]
    RegionRelocated { base: u64, granted: u64 },

    #[error("failed to reserve region {base:#x}: {source}")]
    RegionReserveFailed { base: u64, source: HsaError },

    #[error("failed to create a backing handle for region {base:#x}: {source}")]
    HandleCreateFailed { base: u64, source: HsaError },

    #[error("failed to map region {base:#x}: {source}")]
    MapFailed { base: u64, source: HsaError },

    #[error("failed to grant agent access to region {base:#x}: {source}")]
    SetAccessFailed { base: u64, source: HsaError },

    #[error("failed to restore contents of region {base:#x}: {source}")]
    CopyFailed { base: u64, source: HsaError },

    #[error("no GPU agent present")]
    AgentMissing,

    #[error("no allocatable global memory pool on the agent")]
    BackingPoolMissing,

    #[error("captured ISA {captured:?} does not match the agent's ISA {actual:?}")]
    IsaMismatch { captured: String, actual: String },

    #[error("failed to load the captured kernel binary: {0}")]
    BinaryLoadFailed(#[source] HsaError),

    #[error("no kernel symbol found in the captured binary")]
    SymbolNotFound,

    #[error("failed to prepare the launch-argument buffer: {0}")]
    KernargAllocFailed(#[source] HsaError),

    #[error("failed to create the dispatch queue: {0}")]
    QueueCreateFailed(#[source] HsaError),

    #[error("failed to create the completion signal: {0}")]
    SignalCreateFailed(#[source] HsaError),

    #[error("dispatch did not complete within {0} seconds")]
    DispatchTimeout(u64),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("HSA runtime error: {0}")]
    Runtime(#[source] HsaError),
}

impl ReplayError {
    /// Process exit code: 2 flags VA relocation, 1 everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReplayError::RegionRelocated { .. } => 2,
            _ => 1,
        }
    }
}
