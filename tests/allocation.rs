use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

use geode::codec::CodecId;
use geode::engine::PAYLOAD_ENTRY;
use geode::entry::EntryHeader;
use geode::superblock::Superblock;
use geode::{BackupEngine, ErrorKind, ImportMode, MemoryStore};

/// Remembers the largest single request made of the system allocator.
struct Peak;

static LARGEST: AtomicUsize = AtomicUsize::new(0);

unsafe impl GlobalAlloc for Peak {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        LARGEST.fetch_max(layout.size(), Ordering::Relaxed);
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        LARGEST.fetch_max(new_size, Ordering::Relaxed);
        System.realloc(ptr, layout, new_size)
    }
}

#[global_allocator]
static GLOBAL: Peak = Peak;

const MIB: u64 = 1024 * 1024;

#[test]
fn declared_sizes_do_not_drive_allocation() {
    // A hundred bytes claiming 490 MiB of content: inside every declared
    // limit, but nowhere near that much data behind it.
    let mut archive = Vec::new();
    Superblock::new(1).write(&mut archive).unwrap();
    EntryHeader {
        codec:             CodecId::None,
        flags:             0,
        name:              PAYLOAD_ENTRY.into(),
        compressed_size:   5 * MIB,
        uncompressed_size: 490 * MIB,
        digest:            [0u8; 32],
    }
    .write(&mut archive)
    .unwrap();
    archive.extend_from_slice(b"tiny");
    assert!(archive.len() < 200);

    let engine = BackupEngine::new(MemoryStore::new());
    LARGEST.store(0, Ordering::Relaxed);
    let err = engine.import(&archive[..], None, ImportMode::Replace).unwrap_err();
    let largest = LARGEST.load(Ordering::Relaxed);

    assert_eq!(err.kind(), ErrorKind::Structural);
    assert!(largest < 16 * MIB as usize, "largest allocation was {largest} bytes");
}
