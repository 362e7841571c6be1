//! A session whose pattern matches nothing must stay invisible: every packet
//! is forwarded untouched and no artifact directory is created.

mod common;

use std::ffi::c_void;

use common::{barrier_packet, dispatch_packet, forwarded_packets, MockSession};

const SYMBOL: u64 = 0x52;
const KERNEL_OBJECT: u64 = 0x9100;

#[test]
fn no_match_leaves_no_artifacts() {
    let tmp = tempfile::tempdir().unwrap();
    let capture_dir = tmp.path().join("isolate_capture");
    let session = MockSession::load(Some("does_not_exist"), Some("0"), &capture_dir);

    session.define_symbol(SYMBOL, "_Z5saxpyifPfS_.kd", 24, KERNEL_OBJECT);
    session.load_code_object(0x701, &[SYMBOL], b"\x7fELFmock");

    let queue = session.create_queue();
    let kernarg = [0u8; 24];
    let pkt = dispatch_packet(KERNEL_OBJECT, kernarg.as_ptr() as *mut c_void, 1024, 256);

    for _ in 0..4 {
        queue.submit(&[pkt]);
    }
    // Non-dispatch packets pass through without being inspected as
    // dispatches.
    queue.submit(&[barrier_packet()]);

    assert!(!capture_dir.exists());
    assert_eq!(forwarded_packets(), 5);
}
