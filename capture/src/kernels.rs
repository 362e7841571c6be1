//! Kernel registry and binary-blob tracking
//!
//! The registry interns kernel identity on first sight and never mutates a
//! record afterwards. Code-object blobs travel a separate path: they are
//! observed on `code_object_reader_create_from_memory`, promoted to an
//! executable on `executable_load_agent_code_object`, and attached to kernel
//! objects either by walking the loaded executable's symbols or, as a
//! fallback, from whichever executable loaded last. Attachment is
//! last-writer-wins on the kernel-object key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Shared bytes of a loadable code object. A single binary may define many
/// kernels, so every attachment shares one allocation.
pub type Blob = Arc<[u8]>;

/// Identity of one kernel entry-point, keyed by its kernel-object handle.
#[derive(Debug, Clone)]
pub struct KernelRecord {
    pub kernel_object: u64,
    pub mangled_name: String,
    pub demangled_name: Option<String>,
    pub kernarg_size: u32,
}

impl KernelRecord {
    pub fn new(kernel_object: u64, mangled_name: String, kernarg_size: u32) -> Self {
        let demangled_name = demangle(&mangled_name);
        Self {
            kernel_object,
            mangled_name,
            demangled_name,
            kernarg_size,
        }
    }

    /// The name the dispatch matcher runs its pattern against.
    pub fn match_name(&self) -> &str {
        self.demangled_name.as_deref().unwrap_or(&self.mangled_name)
    }
}

/// Best-effort demangling. Kernel-descriptor symbols carry a `.kd` suffix
/// that is not part of the mangled name.
pub fn demangle(mangled: &str) -> Option<String> {
    let stripped = mangled.strip_suffix(".kd").unwrap_or(mangled);
    let symbol = cpp_demangle::Symbol::new(stripped).ok()?;
    symbol
        .demangle(&cpp_demangle::DemangleOptions::default())
        .ok()
}

#[derive(Default)]
pub struct KernelRegistry {
    inner: Mutex<HashMap<u64, Arc<KernelRecord>>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern on first sight; a handle already present keeps its original
    /// record.
    pub fn intern(&self, record: KernelRecord) {
        let mut map = self.inner.lock().unwrap();
        map.entry(record.kernel_object)
            .or_insert_with(|| Arc::new(record));
    }

    pub fn contains(&self, kernel_object: u64) -> bool {
        self.inner.lock().unwrap().contains_key(&kernel_object)
    }

    pub fn get(&self, kernel_object: u64) -> Option<Arc<KernelRecord>> {
        self.inner.lock().unwrap().get(&kernel_object).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct BlobMaps {
    /// Reader handle -> blob, pending until the reader is loaded.
    pending_readers: HashMap<u64, Blob>,
    /// Executable handle -> blob, after load.
    executables: HashMap<u64, Blob>,
    /// Kernel-object handle -> blob. Last writer wins.
    attached: HashMap<u64, Blob>,
    /// Blob of the most recently loaded executable, the fallback source when
    /// a symbol is observed outside the fan-out walk.
    last_loaded: Option<Blob>,
}

/// Tracks code-object bytes across the three unrelated callbacks that
/// together tie a kernel object to the binary it was loaded from. One lock
/// guards all four maps so both attach paths serialize.
#[derive(Default)]
pub struct BlobTracker {
    inner: Mutex<BlobMaps>,
}

impl BlobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reader was created over caller-owned memory; keep a copy, the
    /// caller's buffer has no lifetime guarantee past the call.
    pub fn record_reader(&self, reader: u64, bytes: &[u8]) {
        let blob: Blob = Arc::from(bytes);
        self.inner.lock().unwrap().pending_readers.insert(reader, blob);
    }

    /// The reader was loaded into an executable. Moves the pending blob to
    /// the executable key, marks it last-loaded, and returns it so the
    /// caller can fan it out to the executable's kernel symbols.
    pub fn promote_reader(&self, reader: u64, executable: u64) -> Option<Blob> {
        let mut maps = self.inner.lock().unwrap();
        let blob = maps.pending_readers.remove(&reader)?;
        maps.executables.insert(executable, blob.clone());
        maps.last_loaded = Some(blob.clone());
        Some(blob)
    }

    pub fn attach(&self, kernel_object: u64, blob: Blob) {
        self.inner.lock().unwrap().attached.insert(kernel_object, blob);
    }

    /// Fallback attach from the last-loaded executable, used when a kernel
    /// object is first observed through a symbol query rather than the
    /// fan-out walk.
    pub fn attach_last_loaded(&self, kernel_object: u64) {
        let mut maps = self.inner.lock().unwrap();
        if let Some(blob) = maps.last_loaded.clone() {
            maps.attached.insert(kernel_object, blob);
        }
    }

    pub fn blob_for(&self, kernel_object: u64) -> Option<Blob> {
        self.inner.lock().unwrap().attached.get(&kernel_object).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_first_sight_wins() {
        let registry = KernelRegistry::new();
        registry.intern(KernelRecord::new(7, "first".into(), 24));
        registry.intern(KernelRecord::new(7, "second".into(), 48));

        let record = registry.get(7).unwrap();
        assert_eq!(record.mangled_name, "first");
        assert_eq!(record.kernarg_size, 24);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_kernel_is_absent() {
        let registry = KernelRegistry::new();
        assert!(registry.get(42).is_none());
        assert!(!registry.contains(42));
    }

    #[test]
    fn demangles_itanium_names_and_strips_kd() {
        let plain = demangle("_Z5saxpyifPfS_").unwrap();
        assert!(plain.starts_with("saxpy("), "got {plain}");

        let with_suffix = demangle("_Z5saxpyifPfS_.kd").unwrap();
        assert_eq!(plain, with_suffix);

        assert!(demangle("not_a_mangled_name").is_none());
    }

    #[test]
    fn match_name_falls_back_to_mangled() {
        let record = KernelRecord::new(1, "plain_c_kernel".into(), 8);
        assert!(record.demangled_name.is_none());
        assert_eq!(record.match_name(), "plain_c_kernel");

        let record = KernelRecord::new(2, "_Z5saxpyifPfS_.kd".into(), 8);
        assert!(record.demangled_name.is_some());
        assert!(record.match_name().starts_with("saxpy("));
    }

    #[test]
    fn blob_travels_reader_to_executable_to_kernel() {
        let blobs = BlobTracker::new();
        blobs.record_reader(1, b"\x7fELF-one");

        // Not attached to anything yet.
        assert!(blobs.blob_for(100).is_none());

        let blob = blobs.promote_reader(1, 10).unwrap();
        blobs.attach(100, blob.clone());
        assert_eq!(&*blobs.blob_for(100).unwrap(), b"\x7fELF-one");

        // Promoting the same reader twice yields nothing.
        assert!(blobs.promote_reader(1, 11).is_none());
    }

    #[test]
    fn attach_is_last_writer_wins() {
        let blobs = BlobTracker::new();
        blobs.record_reader(1, b"old");
        let old = blobs.promote_reader(1, 10).unwrap();
        blobs.attach(100, old);

        blobs.record_reader(2, b"new");
        blobs.promote_reader(2, 11).unwrap();
        blobs.attach_last_loaded(100);

        assert_eq!(&*blobs.blob_for(100).unwrap(), b"new");
    }

    #[test]
    fn fallback_without_any_load_is_a_no_op() {
        let blobs = BlobTracker::new();
        blobs.attach_last_loaded(5);
        assert!(blobs.blob_for(5).is_none());
    }
}
