//! Parse-before-init artifact loading
//!
//! Everything the replay needs from disk is read before the runtime's `init`
//! runs, because the whole point of aperture steering is to beat the
//! runtime's address-space decisions — which are made during init — with
//! knowledge of the captured regions.

use std::path::PathBuf;

use isolate_shared::{CaptureDir, DispatchRecord, RegionRecord};

use crate::error::ReplayError;

/// Page size on the supported targets.
pub const PAGE_SIZE: u64 = 4096;

/// One captured region with its page-aligned reservation geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionPlan {
    pub record: RegionRecord,
    /// `record.base` rounded down to a page boundary.
    pub aligned_base: u64,
    /// Span from `aligned_base` to the page-rounded end of the region.
    pub aligned_size: usize,
    /// `record.base - aligned_base`.
    pub offset: u64,
}

impl RegionPlan {
    pub fn new(record: RegionRecord) -> Self {
        let aligned_base = record.base & !(PAGE_SIZE - 1);
        let end = record.base + record.size;
        let aligned_end = (end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        Self {
            record,
            aligned_base,
            aligned_size: (aligned_end - aligned_base) as usize,
            offset: record.base - aligned_base,
        }
    }
}

/// The full artifact, parsed and alignment-planned.
#[derive(Debug)]
pub struct ReplayPlan {
    pub dir: CaptureDir,
    pub dispatch: DispatchRecord,
    pub regions: Vec<RegionPlan>,
}

impl ReplayPlan {
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, ReplayError> {
        let dir = CaptureDir::open(root)?;
        let dispatch = dir.read_dispatch()?;
        let regions = dir
            .read_regions()?
            .regions
            .into_iter()
            .map(RegionPlan::new)
            .collect();
        Ok(Self {
            dir,
            dispatch,
            regions,
        })
    }
}
