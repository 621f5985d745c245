//! Frame table: the bounded pool of physical frames the virtual-memory core
//! hands out to supplemental page table entries.
//!
//! Distinct from `memory::pmm`, which just tracks raw physical-frame
//! occupancy for the whole machine. The frame table is a fixed-size,
//! eviction-aware layer on top of it, sized to the subset of physical
//! memory this teaching core manages as "user pages."

use alloc::vec::Vec;

use crate::memory::address::PhysAddr;
use crate::memory::pmm;
use crate::memory::spt;
use crate::sync::spinlock::SpinLock;

/// Number of frame-table slots. Bounding this (rather than tracking every
/// physical frame PMM knows about) is what makes eviction necessary at all.
pub const FRAME_TABLE_SIZE: usize = 1024;

/// A opaque handle an SPTE holds to a frame-table slot. Non-owning: freeing
/// the handle's backing slot doesn't drop this value, it just invalidates
/// what it points to (mirrors the "index, not a pointer" design in `§9`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle(pub usize);

#[derive(Clone, Copy)]
struct FrameEntry {
    kpage: Option<PhysAddr>,
    occupied: bool,
}

impl FrameEntry {
    const fn empty() -> Self {
        Self {
            kpage: None,
            occupied: false,
        }
    }
}

struct FrameTable {
    entries: Vec<FrameEntry>,
    /// Round-robin eviction cursor. Acceptable per spec: not clock-bit based.
    evict_cursor: usize,
}

impl FrameTable {
    fn new() -> Self {
        Self {
            entries: alloc::vec![FrameEntry::empty(); FRAME_TABLE_SIZE],
            evict_cursor: 0,
        }
    }

    fn alloc(&mut self) -> Option<(FrameHandle, PhysAddr)> {
        for (i, e) in self.entries.iter_mut().enumerate() {
            if !e.occupied {
                if e.kpage.is_none() {
                    e.kpage = Some(pmm::alloc_frame()?);
                }
                e.occupied = true;
                return Some((FrameHandle(i), e.kpage.unwrap()));
            }
        }
        None
    }

    fn free(&mut self, handle: FrameHandle) {
        if let Some(e) = self.entries.get_mut(handle.0) {
            debug_assert!(e.occupied, "frame::free: double free of frame {}", handle.0);
            e.occupied = false;
        }
    }

    fn addr_of(&self, handle: FrameHandle) -> Option<PhysAddr> {
        self.entries.get(handle.0).and_then(|e| e.kpage)
    }

    fn next_victim(&mut self) -> FrameHandle {
        let v = self.evict_cursor % FRAME_TABLE_SIZE;
        self.evict_cursor = (v + 1) % FRAME_TABLE_SIZE;
        FrameHandle(v)
    }
}

static FRAME_TABLE: SpinLock<Option<FrameTable>> = SpinLock::new(None);

/// Initialize the frame table. Must run once during boot, after `pmm::init`.
pub fn init() {
    let mut table = FRAME_TABLE.lock();
    assert!(table.is_none(), "frame table: init called more than once");
    *table = Some(FrameTable::new());
}

fn with_table<R>(f: impl FnOnce(&mut FrameTable) -> R) -> R {
    let mut guard = FRAME_TABLE.lock();
    let table = guard.as_mut().expect("frame table: not initialized");
    f(table)
}

/// Bind a frame-table slot to a fresh physical page, evicting one victim SPTE
/// at a time until a slot frees up if the table is full.
///
/// # Panics
/// If eviction cannot make progress (the swap disk is also exhausted) —
/// this teaching core treats that as fatal rather than returning `None`
/// forever, since retry-forever-without-progress is worse than a clear halt.
pub fn alloc_frame() -> (FrameHandle, PhysAddr) {
    loop {
        if let Some(result) = with_table(|t| t.alloc()) {
            return result;
        }
        klog::warn!("frame table exhausted, evicting a victim page");
        let victim = with_table(|t| t.next_victim());
        spt::evict_one(victim);
    }
}

/// Release a frame-table slot. The physical page itself is retained in the
/// entry for reuse, only the occupied bit is cleared.
pub fn free_frame(handle: FrameHandle) {
    with_table(|t| t.free(handle));
}

/// Physical address currently bound to `handle`, if any.
pub fn addr_of(handle: FrameHandle) -> Option<PhysAddr> {
    with_table(|t| t.addr_of(handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_has_no_occupied_slots() {
        let mut t = FrameTable::new();
        assert_eq!(t.entries.len(), FRAME_TABLE_SIZE);
        assert!(t.entries.iter().all(|e| !e.occupied));
    }

    #[test]
    fn round_robin_cursor_wraps() {
        let mut t = FrameTable::new();
        let first = t.next_victim();
        for _ in 0..FRAME_TABLE_SIZE - 1 {
            t.next_victim();
        }
        assert_eq!(t.next_victim(), first);
    }

    #[test]
    fn free_then_alloc_reuses_slot_index() {
        let mut t = FrameTable::new();
        t.entries[5].kpage = Some(PhysAddr::new(0x1000));
        t.entries[5].occupied = true;
        t.free(FrameHandle(5));
        assert!(!t.entries[5].occupied);
    }
}
