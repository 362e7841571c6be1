//! Full session: the second saxpy dispatch is captured, with launch
//! arguments, code object, and region contents round-tripping through the
//! artifact.

mod common;

use std::ffi::c_void;

use common::{dispatch_packet, forwarded_packets, MockSession, MOCK_AGENT_NAME, MOCK_ISA_NAME};
use isolate_shared::CaptureDir;

const SAXPY_SYMBOL: u64 = 0x51;
const SAXPY_KERNEL_OBJECT: u64 = 0x9000;
const HSACO: &[u8] = b"\x7fELF\x02\x01\x01mock-code-object";

#[test]
fn captures_second_occurrence() {
    let tmp = tempfile::tempdir().unwrap();
    let capture_dir = tmp.path().join("isolate_capture");
    let session = MockSession::load(Some("saxpy"), Some("1"), &capture_dir);

    // Application loads a code object defining saxpy, then looks it up.
    session.define_symbol(SAXPY_SYMBOL, "_Z5saxpyifPfS_.kd", 24, SAXPY_KERNEL_OBJECT);
    session.load_code_object(0x700, &[SAXPY_SYMBOL], HSACO);
    assert_eq!(session.query_kernel_object(SAXPY_SYMBOL), SAXPY_KERNEL_OBJECT);

    // One device buffer, filled with a recognizable pattern.
    let region = session.pool_allocate(64);
    let ints: Vec<u8> = (0..16u32).flat_map(|v| v.to_le_bytes()).collect();
    unsafe { std::ptr::copy_nonoverlapping(ints.as_ptr(), region, 64) };

    let queue = session.create_queue();
    let kernarg: Vec<u8> = (0..24u8).collect();

    let pkt = dispatch_packet(
        SAXPY_KERNEL_OBJECT,
        kernarg.as_ptr() as *mut c_void,
        1024,
        256,
    );

    // First dispatch: not the selected occurrence.
    queue.submit(&[pkt]);
    assert!(!capture_dir.exists(), "index 0 must not fire for index 1");

    // Second dispatch fires the snapshot.
    queue.submit(&[pkt]);
    assert!(capture_dir.exists());

    let dir = CaptureDir::open(&capture_dir).unwrap();
    let dispatch = dir.read_dispatch().unwrap();
    assert_eq!(dispatch.mangled_name, "_Z5saxpyifPfS_.kd");
    assert!(dispatch
        .demangled_name
        .as_deref()
        .unwrap()
        .starts_with("saxpy("));
    assert_eq!(dispatch.kernel_object, SAXPY_KERNEL_OBJECT);
    assert_eq!(dispatch.dispatch_index, 1);
    assert_eq!(dispatch.kernarg_size, 24);
    assert_eq!(dispatch.grid.x, 1024);
    assert_eq!(dispatch.block.x, 256);
    assert_eq!(dispatch.agent_name, MOCK_AGENT_NAME);
    assert_eq!(dispatch.isa_name, MOCK_ISA_NAME);
    assert_eq!(dispatch.wavefront_size, 64);

    assert_eq!(dir.read_kernarg().unwrap(), kernarg);

    let binary = dir.read_binary().unwrap();
    assert_eq!(binary, HSACO);
    assert_eq!(&binary[..4], b"\x7fELF");

    // The tracked pool region round-trips byte-for-byte.
    let regions = dir.read_regions().unwrap();
    assert_eq!(regions.regions.len(), 1);
    let record = regions.regions[0];
    assert_eq!(record.base, region as u64);
    assert_eq!(record.size, 64);
    assert!(record.is_pool);
    assert!(!record.is_vmem);
    assert_eq!(dir.read_region_contents(record.base).unwrap(), ints);

    // A third dispatch passes through without re-firing.
    queue.submit(&[pkt]);
    let dispatch = dir.read_dispatch().unwrap();
    assert_eq!(dispatch.dispatch_index, 1);

    // Every submitted packet was forwarded to the runtime.
    assert_eq!(forwarded_packets(), 3);
}
