//! Capture artifact layout
//!
//! A capture directory holds everything the replay needs to re-issue one
//! kernel dispatch:
//!
//! ```text
//! <dir>/dispatch.json              kernel identity and launch geometry
//! <dir>/kernarg.bin                raw launch-argument block
//! <dir>/kernel.hsaco               the loaded GPU code object
//! <dir>/memory_regions.json        device-region metadata
//! <dir>/memory/region_<base>.bin   raw contents of each region
//! ```

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DISPATCH_JSON: &str = "dispatch.json";
pub const KERNARG_BIN: &str = "kernarg.bin";
pub const KERNEL_BINARY: &str = "kernel.hsaco";
pub const MEMORY_REGIONS_JSON: &str = "memory_regions.json";
pub const MEMORY_DIR: &str = "memory";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("capture directory {} does not exist", .0.display())]
    MissingDirectory(PathBuf),

    #[error("failed to read {name}: {source}")]
    Read {
        name: &'static str,
        source: std::io::Error,
    },

    #[error("failed to write {name}: {source}")]
    Write {
        name: &'static str,
        source: std::io::Error,
    },

    #[error("failed to decode {name}: {source}")]
    Decode {
        name: &'static str,
        source: serde_json::Error,
    },

    #[error("failed to encode {name}: {source}")]
    Encode {
        name: &'static str,
        source: serde_json::Error,
    },
}

fn one_u32() -> u32 {
    1
}

/// Grid or workgroup extents. `y` and `z` default to 1 when absent so older
/// artifacts that only recorded the x extent stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    #[serde(default = "one_u32")]
    pub y: u32,
    #[serde(default = "one_u32")]
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Number of dispatch dimensions implied by the extents.
    pub fn dimensions(&self) -> u16 {
        if self.z > 1 {
            3
        } else if self.y > 1 {
            2
        } else {
            1
        }
    }
}

/// Contents of `dispatch.json`: everything identifying the captured dispatch
/// besides raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    /// Symbol name as reported by the runtime (a trailing `.kd` descriptor
    /// suffix included, when the runtime reports one).
    pub mangled_name: String,

    /// Demangled form, when demangling succeeded.
    pub demangled_name: Option<String>,

    /// Kernel-object handle observed at capture time. Informational; the
    /// replay resolves its own handle from the reloaded binary.
    pub kernel_object: u64,

    /// Marketing name of the agent that owned the dispatch queue.
    pub agent_name: String,

    /// Full ISA target string of that agent.
    pub isa_name: String,

    pub wavefront_size: u32,

    pub grid: Dim3,
    pub block: Dim3,

    pub group_segment_size: u32,
    pub private_segment_size: u32,
    pub kernarg_size: u32,

    /// Zero-based occurrence index of this dispatch within its kernel, i.e.
    /// the matcher counter value that fired.
    pub dispatch_index: u64,
}

/// One tracked device-memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRecord {
    /// Device virtual address of the first byte.
    pub base: u64,
    /// Length in bytes (unaligned, as allocated).
    pub size: u64,
    /// Born from a memory-pool allocation.
    pub is_pool: bool,
    /// Born from a vmem address reservation.
    pub is_vmem: bool,
    /// Backing allocation handle for mapped vmem regions, 0 otherwise.
    pub handle: u64,
    /// Accumulated OR of access-permission bits granted to agents.
    pub access: u32,
}

impl RegionRecord {
    /// File name of this region's contents inside the `memory/` directory.
    pub fn file_name(&self) -> String {
        region_file_name(self.base)
    }
}

/// `region_<hex-base>.bin`, lowercase hex, no `0x` prefix.
pub fn region_file_name(base: u64) -> String {
    format!("region_{:x}.bin", base)
}

/// Contents of `memory_regions.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryRegions {
    pub regions: Vec<RegionRecord>,
}

/// A capture directory on disk, with typed accessors for each artifact.
#[derive(Debug, Clone)]
pub struct CaptureDir {
    root: PathBuf,
}

impl CaptureDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open an existing capture directory for reading.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let dir = Self::new(root);
        if !dir.root.is_dir() {
            return Err(ArtifactError::MissingDirectory(dir.root));
        }
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dispatch_path(&self) -> PathBuf {
        self.root.join(DISPATCH_JSON)
    }

    pub fn kernarg_path(&self) -> PathBuf {
        self.root.join(KERNARG_BIN)
    }

    pub fn binary_path(&self) -> PathBuf {
        self.root.join(KERNEL_BINARY)
    }

    pub fn regions_path(&self) -> PathBuf {
        self.root.join(MEMORY_REGIONS_JSON)
    }

    pub fn region_contents_path(&self, base: u64) -> PathBuf {
        self.root.join(MEMORY_DIR).join(region_file_name(base))
    }

    /// Create the directory tree, including `memory/`.
    pub fn create(&self) -> Result<(), ArtifactError> {
        fs::create_dir_all(self.root.join(MEMORY_DIR)).map_err(|source| ArtifactError::Write {
            name: MEMORY_DIR,
            source,
        })
    }

    pub fn read_dispatch(&self) -> Result<DispatchRecord, ArtifactError> {
        let file = File::open(self.dispatch_path()).map_err(|source| ArtifactError::Read {
            name: DISPATCH_JSON,
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| ArtifactError::Decode {
            name: DISPATCH_JSON,
            source,
        })
    }

    pub fn write_dispatch(&self, record: &DispatchRecord) -> Result<(), ArtifactError> {
        write_json(&self.dispatch_path(), DISPATCH_JSON, record)
    }

    pub fn read_regions(&self) -> Result<MemoryRegions, ArtifactError> {
        let file = File::open(self.regions_path()).map_err(|source| ArtifactError::Read {
            name: MEMORY_REGIONS_JSON,
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| ArtifactError::Decode {
            name: MEMORY_REGIONS_JSON,
            source,
        })
    }

    pub fn write_regions(&self, regions: &MemoryRegions) -> Result<(), ArtifactError> {
        write_json(&self.regions_path(), MEMORY_REGIONS_JSON, regions)
    }

    pub fn read_kernarg(&self) -> Result<Vec<u8>, ArtifactError> {
        fs::read(self.kernarg_path()).map_err(|source| ArtifactError::Read {
            name: KERNARG_BIN,
            source,
        })
    }

    pub fn write_kernarg(&self, bytes: &[u8]) -> Result<(), ArtifactError> {
        fs::write(self.kernarg_path(), bytes).map_err(|source| ArtifactError::Write {
            name: KERNARG_BIN,
            source,
        })
    }

    pub fn read_binary(&self) -> Result<Vec<u8>, ArtifactError> {
        fs::read(self.binary_path()).map_err(|source| ArtifactError::Read {
            name: KERNEL_BINARY,
            source,
        })
    }

    pub fn write_binary(&self, bytes: &[u8]) -> Result<(), ArtifactError> {
        fs::write(self.binary_path(), bytes).map_err(|source| ArtifactError::Write {
            name: KERNEL_BINARY,
            source,
        })
    }

    pub fn read_region_contents(&self, base: u64) -> Result<Vec<u8>, ArtifactError> {
        fs::read(self.region_contents_path(base)).map_err(|source| ArtifactError::Read {
            name: "region contents",
            source,
        })
    }

    pub fn write_region_contents(&self, base: u64, bytes: &[u8]) -> Result<(), ArtifactError> {
        fs::write(self.region_contents_path(base), bytes).map_err(|source| ArtifactError::Write {
            name: "region contents",
            source,
        })
    }
}

fn write_json<T: Serialize>(
    path: &Path,
    name: &'static str,
    value: &T,
) -> Result<(), ArtifactError> {
    let file = File::create(path).map_err(|source| ArtifactError::Write { name, source })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|source| ArtifactError::Encode { name, source })?;
    writer
        .flush()
        .map_err(|source| ArtifactError::Write { name, source })
}
