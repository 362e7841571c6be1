//! Snapshot writer
//!
//! Runs once per session, on the submit thread, after the matcher fired and
//! its lock was dropped. The runtime does not forward the matched packet
//! until this returns, so the launch-argument block and every tracked region
//! are read exactly as the kernel would have seen them.

use std::ffi::c_void;
use std::slice;

use anyhow::{Context, Result};
use tracing::{info, warn};

use isolate_hsa::packet::{KernelDispatchPacket, Queue};
use isolate_hsa::{
    name_from_bytes, Agent, Isa, STATUS_SUCCESS, AGENT_INFO_ISA, AGENT_INFO_NAME,
    AGENT_INFO_WAVEFRONT_SIZE, ISA_INFO_NAME, ISA_INFO_NAME_LENGTH,
};
use isolate_shared::{CaptureDir, Dim3, DispatchRecord, MemoryRegions, RegionRecord};

use crate::hooks::SavedRoutines;
use crate::kernels::KernelRecord;
use crate::memory::RegionKind;
use crate::Engine;

/// Identity of the agent owning the dispatch queue, queried best-effort.
struct AgentIdentity {
    name: String,
    isa_name: String,
    wavefront_size: u32,
}

fn query_agent_identity(saved: &SavedRoutines, agent: Agent) -> AgentIdentity {
    let mut name_buf = [0u8; 64];
    let name = unsafe {
        if (saved.agent_get_info)(agent, AGENT_INFO_NAME, name_buf.as_mut_ptr() as *mut c_void)
            == STATUS_SUCCESS
        {
            name_from_bytes(&name_buf)
        } else {
            String::new()
        }
    };

    let mut wavefront_size: u32 = 0;
    unsafe {
        (saved.agent_get_info)(
            agent,
            AGENT_INFO_WAVEFRONT_SIZE,
            &mut wavefront_size as *mut _ as *mut c_void,
        );
    }

    let isa_name = query_isa_name(saved, agent).unwrap_or_default();

    AgentIdentity {
        name,
        isa_name,
        wavefront_size,
    }
}

fn query_isa_name(saved: &SavedRoutines, agent: Agent) -> Option<String> {
    let mut isa = Isa::NULL;
    let status = unsafe {
        (saved.agent_get_info)(agent, AGENT_INFO_ISA, &mut isa as *mut _ as *mut c_void)
    };
    if status != STATUS_SUCCESS {
        return None;
    }

    let mut len: u32 = 0;
    let status = unsafe {
        (saved.isa_get_info_alt)(isa, ISA_INFO_NAME_LENGTH, &mut len as *mut _ as *mut c_void)
    };
    if status != STATUS_SUCCESS || len == 0 {
        return None;
    }

    let mut buf = vec![0u8; len as usize + 1];
    let status =
        unsafe { (saved.isa_get_info_alt)(isa, ISA_INFO_NAME, buf.as_mut_ptr() as *mut c_void) };
    (status == STATUS_SUCCESS).then(|| name_from_bytes(&buf))
}

/// Serialize the matched dispatch: launch arguments, metadata, binary, and
/// the contents of every tracked device region.
///
/// Failures writing `dispatch.json` or `kernarg.bin` abort the capture;
/// per-region copy or write failures skip that region only.
pub fn write_capture(
    engine: &Engine,
    saved: &SavedRoutines,
    record: &KernelRecord,
    pkt: &KernelDispatchPacket,
    queue: *const Queue,
    dispatch_index: u64,
) -> Result<()> {
    // The launch-argument block lives in runtime-owned memory with no
    // lifetime guarantee past this callback; copy it first.
    let kernarg = unsafe {
        slice::from_raw_parts(
            pkt.kernarg_address as *const u8,
            record.kernarg_size as usize,
        )
    }
    .to_vec();

    let identity = match engine.queues.agent_for(queue) {
        Some(agent) => query_agent_identity(saved, agent),
        None => {
            warn!("dispatch queue was created before the agent attached; agent identity unknown");
            AgentIdentity {
                name: String::new(),
                isa_name: String::new(),
                wavefront_size: 0,
            }
        }
    };

    let dir = CaptureDir::new(&engine.capture_dir);
    dir.create().context("creating capture directory")?;

    let dispatch = DispatchRecord {
        mangled_name: record.mangled_name.clone(),
        demangled_name: record.demangled_name.clone(),
        kernel_object: pkt.kernel_object,
        agent_name: identity.name,
        isa_name: identity.isa_name,
        wavefront_size: identity.wavefront_size,
        grid: Dim3::new(pkt.grid_size_x, pkt.grid_size_y, pkt.grid_size_z),
        block: Dim3::new(
            pkt.workgroup_size_x as u32,
            pkt.workgroup_size_y as u32,
            pkt.workgroup_size_z as u32,
        ),
        group_segment_size: pkt.group_segment_size,
        private_segment_size: pkt.private_segment_size,
        kernarg_size: record.kernarg_size,
        dispatch_index,
    };
    dir.write_dispatch(&dispatch).context("writing dispatch.json")?;
    dir.write_kernarg(&kernarg).context("writing kernarg.bin")?;

    match engine.blobs.blob_for(record.kernel_object) {
        Some(blob) => dir.write_binary(&blob).context("writing kernel.hsaco")?,
        None => warn!(
            "no code object observed for kernel {:?}; capture has no kernel.hsaco",
            record.match_name()
        ),
    }

    // Consistent copy of the region list under the tracker's lock; the
    // device-to-host copies and file writes happen outside it.
    let regions = engine.regions.snapshot();
    let mut manifest = MemoryRegions::default();
    for region in &regions {
        let mut contents = vec![0u8; region.size];
        let status = unsafe {
            (saved.memory_copy)(
                contents.as_mut_ptr() as *mut c_void,
                region.base as *const c_void,
                region.size,
            )
        };
        if status != STATUS_SUCCESS {
            warn!(
                "copying region {:#x} (+{} bytes) failed with status {status:#x}; skipping",
                region.base, region.size
            );
            continue;
        }
        if let Err(e) = dir.write_region_contents(region.base, &contents) {
            warn!("writing region {:#x} contents failed: {e}; skipping", region.base);
            continue;
        }
        manifest.regions.push(RegionRecord {
            base: region.base,
            size: region.size as u64,
            is_pool: region.kind == RegionKind::Pool,
            is_vmem: region.kind == RegionKind::Vmem,
            handle: region.handle,
            access: region.access_mask,
        });
    }
    dir.write_regions(&manifest)
        .context("writing memory_regions.json")?;

    info!(
        kernel = record.match_name(),
        dispatch_index,
        regions = manifest.regions.len(),
        kernarg_size = record.kernarg_size,
        dir = %engine.capture_dir.display(),
        "dispatch captured"
    );
    Ok(())
}
