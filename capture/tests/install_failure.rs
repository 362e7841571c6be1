//! A table with a missing required slot must be rejected at load; the
//! runtime then continues without the agent.

mod common;

use std::ptr;

#[test]
fn missing_slot_rejects_load() {
    let table = common::build_table();
    unsafe {
        (*(*table).amd_ext).queue_intercept_register = None;
        assert!(!isolate_capture::OnLoad(table, 1, 0, ptr::null()));
    }
}
