//! Supplemental page table: per-address-space bookkeeping tying a virtual
//! page to its frame, swap slot, and origin.
//!
//! The MMU's own page tables only know "mapped or not." This layer knows
//! *why* a page is or isn't resident, which is what makes eviction and
//! page-fault-driven reload possible.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::memory::address::VirtAddr;
use crate::memory::frame::{self, FrameHandle};
use crate::memory::swap::{self, SwapSlot};
use crate::memory::vmm::PageDirectory;
use crate::sync::spinlock::SpinLock;

/// Where a page's initial contents come from.
#[derive(Debug, Clone, Copy)]
pub enum Origin {
    /// Demand-zeroed; never backed by a file.
    Anonymous,
    /// Backed by a byte range of a file (used by `memory::mmap`).
    FileBacked { first_sector: u64, file_len: usize },
}

/// A single page's supplemental entry.
pub struct Spte {
    pub upage: VirtAddr,
    pub frame: Option<FrameHandle>,
    pub swap: SwapSlot,
    pub origin: Origin,
    pub mmapped: bool,
}

/// One address space's supplemental page directory.
///
/// `pd` and `entries` are locked independently (rather than one outer lock
/// over the whole `Spde`) so that allocating a frame for a new page — which
/// may recursively evict one of this very address space's own pages — never
/// tries to re-enter a lock this call is already holding.
pub struct Spde {
    pd: SpinLock<Box<dyn PageDirectory>>,
    entries: SpinLock<Vec<Rc<RefCell<Spte>>>>,
}

/// Global registry of address spaces, so a page fault (which only carries a
/// faulting address, not an address-space id in this single-space teaching
/// kernel) and the eviction path can both find the owning SPDE.
static PAGEDIRS: SpinLock<Vec<Rc<Spde>>> = SpinLock::new(Vec::new());

/// Register a fresh address space and return a handle to its SPDE.
pub fn create_spde(pd: Box<dyn PageDirectory>) -> Rc<Spde> {
    let spde = Rc::new(Spde {
        pd: SpinLock::new(pd),
        entries: SpinLock::new(Vec::new()),
    });
    PAGEDIRS.lock().push(spde.clone());
    spde
}

/// Tear down an address space: destroy every SPTE it owns, then drop it
/// from the global registry.
pub fn destroy_spde(spde: &Rc<Spde>) {
    let pages: Vec<VirtAddr> = spde.entries.lock().iter().map(|e| e.borrow().upage).collect();
    for upage in pages {
        page_destroy(spde, upage);
    }
    PAGEDIRS.lock().retain(|s| !Rc::ptr_eq(s, spde));
}

/// Create an SPTE for `vaddr` under `spde`.
///
/// Zero-fill anonymous pages get no frame yet (they materialize on first
/// fault); everything else is allocated and mapped immediately.
///
/// # Returns
/// `None` (`OutOfMemory`) if a frame was needed and none could be obtained.
pub fn page_create(spde: &Rc<Spde>, vaddr: VirtAddr, origin: Origin) -> Option<Rc<RefCell<Spte>>> {
    debug_assert!(find_by_vaddr(spde, vaddr).is_none(), "page_create: vaddr already tracked");

    let (frame, swap) = match origin {
        Origin::Anonymous => (None, SwapSlot::ZeroFill),
        Origin::FileBacked { .. } => {
            let (handle, phys) = frame::alloc_frame();
            if spde.pd.lock().set_page(vaddr, phys, true).is_err() {
                frame::free_frame(handle);
                return None;
            }
            (Some(handle), SwapSlot::Unallocated)
        }
    };

    let spte = Rc::new(RefCell::new(Spte {
        upage: vaddr,
        frame,
        swap,
        origin,
        mmapped: false,
    }));
    spde.entries.lock().push(spte.clone());
    Some(spte)
}

/// Destroy the SPTE tracking `vaddr`: clears its MMU mapping, frees its
/// frame and swap slot, and removes it from `spde`'s entry list.
pub fn page_destroy(spde: &Rc<Spde>, vaddr: VirtAddr) {
    let spte = {
        let mut entries = spde.entries.lock();
        let idx = entries.iter().position(|e| e.borrow().upage == vaddr);
        idx.map(|i| entries.remove(i))
    };
    let Some(spte) = spte else { return };

    spde.pd.lock().clear_page(vaddr);

    let s = spte.borrow();
    if let Some(handle) = s.frame {
        frame::free_frame(handle);
    }
    if let SwapSlot::On(sector) = s.swap {
        swap::free_slot(sector);
    }
}

/// Find the SPTE for the page containing `vaddr`, if tracked by `spde`.
///
/// Linear scan in insertion order; fine at this scale (§4.7).
pub fn find_by_vaddr(spde: &Rc<Spde>, vaddr: VirtAddr) -> Option<Rc<RefCell<Spte>>> {
    let page = vaddr.page_align_down();
    spde.entries.lock().iter().find(|e| e.borrow().upage == page).cloned()
}

impl Spde {
    /// Whether `vaddr` currently has an installed MMU mapping. Used by
    /// `memory::mmap`'s overlap check; a tracked-but-not-yet-faulted-in SPTE
    /// (e.g. a still-zero-fill anonymous page) is not "mapped" by this
    /// definition even though `find_by_vaddr` would find it.
    pub fn is_mapped(&self, vaddr: VirtAddr) -> bool {
        self.pd.lock().translate_page(vaddr).is_some()
    }

    /// Whether the MMU's dirty bit is set for `vaddr`. Used by
    /// `memory::mmap`'s write-back-on-unmap path.
    pub fn is_dirty(&self, vaddr: VirtAddr) -> bool {
        self.pd.lock().is_dirty(vaddr)
    }
}

fn find_owner(handle: FrameHandle) -> Option<(Rc<Spde>, Rc<RefCell<Spte>>)> {
    for spde in PAGEDIRS.lock().iter() {
        let entries = spde.entries.lock();
        if let Some(spte) = entries.iter().find(|e| e.borrow().frame == Some(handle)) {
            return Some((spde.clone(), spte.clone()));
        }
    }
    None
}

/// Evict the page currently bound to frame-table slot `handle`.
///
/// Called by `memory::frame::alloc_frame` when the frame table is full.
/// A no-op if the handle isn't currently owned by any tracked page (it was
/// never bound, so the frame table already considers the slot free).
pub fn evict_one(handle: FrameHandle) {
    let Some((spde, spte)) = find_owner(handle) else {
        return;
    };

    let (upage, dirty, origin) = {
        let s = spte.borrow();
        let dirty = spde.pd.lock().is_dirty(s.upage);
        (s.upage, dirty, s.origin)
    };

    let kpage = frame::addr_of(handle).expect("evict_one: frame table slot has no backing page");

    let wrote = {
        let mut s = spte.borrow_mut();
        swap::swap_out(&origin, &mut s.swap, dirty, kpage)
    };
    if !wrote {
        // Out of swap: leave the page resident. The caller (frame::alloc_frame)
        // will simply try the next round-robin victim.
        return;
    }

    spde.pd.lock().clear_page(upage);
    frame::free_frame(handle);
    spte.borrow_mut().frame = None;

    klog::debug!("evicted page {:#x}", upage.as_u64());
}

/// Resolve a page fault at `fault_addr`: look up the owning SPTE across all
/// registered address spaces and load it back in.
///
/// `Err(())` means the fault is on an address no SPDE tracks — a genuine
/// error, not a resolvable not-resident page.
pub fn resolve_fault(fault_addr: VirtAddr) -> Result<(), ()> {
    for spde in PAGEDIRS.lock().iter().cloned().collect::<Vec<_>>() {
        if let Some(spte) = find_by_vaddr(&spde, fault_addr) {
            let already_resident = spte.borrow().frame.is_some();
            if already_resident {
                // A fault on a page the MMU should already be serving is a
                // real bug (e.g. a write to a read-only mapping), not ours
                // to resolve.
                return Err(());
            }

            let (handle, kpage) = frame::alloc_frame();
            let (slot, upage, origin) = {
                let s = spte.borrow();
                (s.swap, s.upage, s.origin)
            };
            {
                let mut pd = spde.pd.lock();
                swap::load(slot, &origin, upage, kpage, &mut **pd);
            }
            spte.borrow_mut().frame = Some(handle);
            return Ok(());
        }
    }
    Err(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vmm::mock::MockPageDirectory;

    fn new_test_spde() -> Rc<Spde> {
        create_spde(Box::new(MockPageDirectory::new()))
    }

    #[test]
    fn anonymous_page_create_has_no_frame_yet() {
        let spde = new_test_spde();
        let spte = page_create(&spde, VirtAddr::new(0x4000_0000), Origin::Anonymous).unwrap();
        assert!(spte.borrow().frame.is_none());
        assert_eq!(spte.borrow().swap, SwapSlot::ZeroFill);
        destroy_spde(&spde);
    }

    #[test]
    fn find_by_vaddr_rounds_down_to_page_boundary() {
        let spde = new_test_spde();
        page_create(&spde, VirtAddr::new(0x4000_0000), Origin::Anonymous).unwrap();
        let found = find_by_vaddr(&spde, VirtAddr::new(0x4000_0123));
        assert!(found.is_some());
        destroy_spde(&spde);
    }

    #[test]
    fn page_destroy_removes_entry() {
        let spde = new_test_spde();
        page_create(&spde, VirtAddr::new(0x4000_0000), Origin::Anonymous).unwrap();
        page_destroy(&spde, VirtAddr::new(0x4000_0000));
        assert!(find_by_vaddr(&spde, VirtAddr::new(0x4000_0000)).is_none());
        destroy_spde(&spde);
    }
}
