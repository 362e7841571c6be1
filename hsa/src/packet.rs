//! AQL queue and kernel-dispatch packet layout

use std::ffi::c_void;

use crate::Signal;

// Packet type lives in the low byte of the header.
pub const PACKET_TYPE_VENDOR_SPECIFIC: u8 = 0;
pub const PACKET_TYPE_INVALID: u8 = 1;
pub const PACKET_TYPE_KERNEL_DISPATCH: u8 = 2;
pub const PACKET_TYPE_BARRIER_AND: u8 = 3;

// Header bit offsets.
pub const HEADER_TYPE_SHIFT: u16 = 0;
pub const HEADER_SCACQUIRE_FENCE_SHIFT: u16 = 9;
pub const HEADER_SCRELEASE_FENCE_SHIFT: u16 = 11;

// hsa_fence_scope_t
pub const FENCE_SCOPE_SYSTEM: u16 = 2;

// Setup: dispatch dimension count in the low two bits.
pub const SETUP_DIMENSIONS_SHIFT: u16 = 0;

/// User-mode queue descriptor. Only the fields the engine touches are
/// meaningful to it; the layout matches the runtime's.
#[repr(C)]
pub struct Queue {
    pub queue_type: u32,
    pub features: u32,
    pub base_address: *mut c_void,
    pub doorbell_signal: Signal,
    pub size: u32,
    pub reserved1: u32,
    pub id: u64,
}

/// The 64-byte packet a queue consumes to launch one kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KernelDispatchPacket {
    pub header: u16,
    pub setup: u16,
    pub workgroup_size_x: u16,
    pub workgroup_size_y: u16,
    pub workgroup_size_z: u16,
    pub reserved0: u16,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub grid_size_z: u32,
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernel_object: u64,
    pub kernarg_address: *mut c_void,
    pub reserved2: u64,
    pub completion_signal: Signal,
}

impl KernelDispatchPacket {
    pub fn zeroed() -> Self {
        // All-zero is the INVALID-adjacent safe starting state; callers fill
        // every meaningful field before publishing the header.
        unsafe { std::mem::zeroed() }
    }

    /// Packet type from the header's low byte.
    pub fn packet_type(&self) -> u8 {
        (self.header & 0xff) as u8
    }
}

/// Header word for a kernel-dispatch packet with system-scope fences on both
/// sides, the conservative choice for a replayed dispatch.
pub fn dispatch_header() -> u16 {
    ((PACKET_TYPE_KERNEL_DISPATCH as u16) << HEADER_TYPE_SHIFT)
        | (FENCE_SCOPE_SYSTEM << HEADER_SCACQUIRE_FENCE_SHIFT)
        | (FENCE_SCOPE_SYSTEM << HEADER_SCRELEASE_FENCE_SHIFT)
}

/// Setup word encoding the dimension count.
pub fn dispatch_setup(dimensions: u16) -> u16 {
    dimensions << SETUP_DIMENSIONS_SHIFT
}

/// Publish `header`/`setup` into a packet slot with release ordering, after
/// every other field has been written. The GPU begins parsing the packet the
/// moment the header's type stops being INVALID.
///
/// # Safety
/// `slot` must point at a packet inside a live queue ring buffer.
pub unsafe fn publish_header(slot: *mut KernelDispatchPacket, header: u16, setup: u16) {
    let word = (header as u32) | ((setup as u32) << 16);
    let target = slot as *mut u32;
    std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
    std::ptr::write_volatile(target, word);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_is_64_bytes() {
        assert_eq!(std::mem::size_of::<KernelDispatchPacket>(), 64);
    }

    #[test]
    fn header_encodes_type_and_fences() {
        let h = dispatch_header();
        assert_eq!((h & 0xff) as u8, PACKET_TYPE_KERNEL_DISPATCH);
        assert_eq!((h >> HEADER_SCACQUIRE_FENCE_SHIFT) & 0x3, FENCE_SCOPE_SYSTEM);
        assert_eq!((h >> HEADER_SCRELEASE_FENCE_SHIFT) & 0x3, FENCE_SCOPE_SYSTEM);
    }

    #[test]
    fn packet_type_reads_low_byte() {
        let mut pkt = KernelDispatchPacket::zeroed();
        pkt.header = dispatch_header();
        assert_eq!(pkt.packet_type(), PACKET_TYPE_KERNEL_DISPATCH);
        pkt.header = PACKET_TYPE_BARRIER_AND as u16;
        assert_eq!(pkt.packet_type(), PACKET_TYPE_BARRIER_AND);
    }

    #[test]
    fn setup_encodes_dimensions() {
        assert_eq!(dispatch_setup(1), 1);
        assert_eq!(dispatch_setup(3), 3);
    }
}
