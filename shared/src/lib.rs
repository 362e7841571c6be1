//! Shared types for isolate
//!
//! This crate defines the on-disk capture artifact: the schema of
//! `dispatch.json` and `memory_regions.json`, the fixed file names inside a
//! capture directory, and helpers for reading and writing a capture. Both the
//! capture agent and the replay binary depend on it, so the artifact layout
//! lives in exactly one place.

pub mod artifact;

pub use artifact::{
    ArtifactError, CaptureDir, Dim3, DispatchRecord, MemoryRegions, RegionRecord,
};
