//! Memory-mapped files: binds a tar entry's byte range into an address
//! space as a run of file-backed supplemental pages, loaded eagerly from
//! the boot disk.
//!
//! A mapping owns a second, non-owning membership list over a subset of its
//! SPDE's SPTEs rather than a flag on every `Spte` — only a minority of
//! pages are ever mmapped.

use alloc::rc::Rc;
use alloc::vec::Vec;

use khal::disk::{Disk, SECTOR_SIZE};

use crate::fs::tar::TarEntry;
use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::frame;
use crate::memory::spt::{self, Origin, Spde};
use crate::sync::spinlock::SpinLock;

pub type MapId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    /// A page in the requested range already has an MMU mapping or is
    /// already tracked by an SPTE.
    InvalidMapping,
    /// A frame was needed and none could be obtained.
    OutOfMemory,
    /// Zero-length files can't be mapped.
    EmptyFile,
}

struct Region {
    id: MapId,
    spde: Rc<Spde>,
    pages: Vec<VirtAddr>,
}

static REGIONS: SpinLock<Vec<Region>> = SpinLock::new(Vec::new());
static NEXT_ID: SpinLock<MapId> = SpinLock::new(1);
static FS_DISK: SpinLock<Option<Disk>> = SpinLock::new(None);

/// Initialize the disk mmap'd files are read from and written back to.
/// Must run once during boot, after the archive holding those files has
/// been located on it.
pub fn init(disk: Disk) {
    let mut d = FS_DISK.lock();
    assert!(d.is_none(), "mmap: init called more than once");
    *d = Some(disk);
}

fn sectors_per_page() -> usize {
    PAGE_SIZE as usize / SECTOR_SIZE
}

fn page_count_for(len: usize) -> usize {
    (len + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize
}

fn next_id() -> MapId {
    let mut n = NEXT_ID.lock();
    let id = *n;
    *n += 1;
    id
}

/// `Err` if any page in `[vaddr, vaddr + page_count * PGSIZE)` already has
/// an MMU mapping or an SPTE tracking it.
fn check_overlap(spde: &Rc<Spde>, vaddr: VirtAddr, page_count: usize) -> Result<(), MmapError> {
    for i in 0..page_count {
        let page = VirtAddr::new(vaddr.as_u64() + (i as u64) * PAGE_SIZE);
        if spde.is_mapped(page) || spt::find_by_vaddr(spde, page).is_some() {
            return Err(MmapError::InvalidMapping);
        }
    }
    Ok(())
}

/// Read `this_len` bytes starting at `first_sector` into `kpage`, zeroing
/// the remainder of the page (covers the tail of a non-page-sized file).
///
/// `pub(crate)` so `memory::swap::load` can refetch a clean file-backed page
/// straight from the file system disk instead of zero-filling it.
pub(crate) fn read_page_from_file(first_sector: u64, this_len: usize, kpage: PhysAddr) {
    let mut guard = FS_DISK.lock();
    let disk = guard.as_mut().expect("mmap: not initialized");
    let dst = unsafe { core::slice::from_raw_parts_mut(kpage.to_virt().as_mut_ptr::<u8>(), PAGE_SIZE as usize) };
    dst.fill(0);

    let full_sectors = this_len / SECTOR_SIZE;
    for i in 0..full_sectors {
        disk.sector_read(first_sector + i as u64, &mut dst[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
    }
    let rem = this_len % SECTOR_SIZE;
    if rem > 0 {
        let mut tmp = [0u8; SECTOR_SIZE];
        disk.sector_read(first_sector + full_sectors as u64, &mut tmp);
        dst[full_sectors * SECTOR_SIZE..full_sectors * SECTOR_SIZE + rem].copy_from_slice(&tmp[..rem]);
    }
}

/// Write `this_len` bytes of `kpage` back to `first_sector`.
fn write_page_to_file(first_sector: u64, this_len: usize, kpage: PhysAddr) {
    let mut guard = FS_DISK.lock();
    let disk = guard.as_mut().expect("mmap: not initialized");
    let src = unsafe { core::slice::from_raw_parts(kpage.to_virt().as_ptr::<u8>(), PAGE_SIZE as usize) };

    let full_sectors = this_len / SECTOR_SIZE;
    for i in 0..full_sectors {
        disk.sector_write(first_sector + i as u64, &src[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
    }
    let rem = this_len % SECTOR_SIZE;
    if rem > 0 {
        let mut tmp = [0u8; SECTOR_SIZE];
        tmp[..rem].copy_from_slice(&src[full_sectors * SECTOR_SIZE..full_sectors * SECTOR_SIZE + rem]);
        disk.sector_write(first_sector + full_sectors as u64, &tmp);
    }
}

/// Map `file`'s contents at `vaddr` within `spde`, one page at a time.
/// Pages are loaded eagerly; nothing here waits for a fault.
pub fn mmap(spde: &Rc<Spde>, file: &TarEntry, vaddr: VirtAddr) -> Result<MapId, MmapError> {
    if file.is_empty() {
        return Err(MmapError::EmptyFile);
    }

    let page_count = page_count_for(file.len());
    let sectors_per_page = sectors_per_page();
    check_overlap(spde, vaddr, page_count)?;

    let mut pages = Vec::with_capacity(page_count);
    for i in 0..page_count {
        let page = VirtAddr::new(vaddr.as_u64() + (i as u64) * PAGE_SIZE);
        let page_first_sector = file.first_sector() + (i * sectors_per_page) as u64;
        let this_len = (file.len() - i * PAGE_SIZE as usize).min(PAGE_SIZE as usize);

        let origin = Origin::FileBacked {
            first_sector: page_first_sector,
            file_len: this_len,
        };

        let Some(spte) = spt::page_create(spde, page, origin) else {
            for p in &pages {
                spt::page_destroy(spde, *p);
            }
            return Err(MmapError::OutOfMemory);
        };
        spte.borrow_mut().mmapped = true;

        let handle = spte.borrow().frame.expect("mmap: file-backed page_create always allocates a frame");
        let kpage = frame::addr_of(handle).expect("mmap: frame table slot has no backing page");
        read_page_from_file(page_first_sector, this_len, kpage);

        pages.push(page);
    }

    let id = next_id();
    REGIONS.lock().push(Region {
        id,
        spde: spde.clone(),
        pages,
    });
    Ok(id)
}

/// Unmap `id`: write back any page still dirty to its originating file
/// sectors, then destroy every SPTE the mapping created.
pub fn munmap(id: MapId) {
    let region = {
        let mut regions = REGIONS.lock();
        let idx = regions.iter().position(|r| r.id == id);
        idx.map(|i| regions.remove(i))
    };
    let Some(region) = region else { return };

    for page in &region.pages {
        write_back_if_dirty(&region.spde, *page);
        spt::page_destroy(&region.spde, *page);
    }
}

fn write_back_if_dirty(spde: &Rc<Spde>, page: VirtAddr) {
    let Some(spte) = spt::find_by_vaddr(spde, page) else {
        return;
    };
    let s = spte.borrow();
    let Origin::FileBacked { first_sector, file_len } = s.origin else {
        return;
    };
    let Some(handle) = s.frame else { return };
    drop(s);

    if !spde.is_dirty(page) {
        return;
    }
    let kpage = frame::addr_of(handle).expect("munmap: frame table slot has no backing page");
    write_page_to_file(first_sector, file_len, kpage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vmm::mock::MockPageDirectory;
    use alloc::boxed::Box;

    // These tests exercise the pure validation logic (page counting, overlap
    // detection, id allocation) without going through `mmap()`'s frame
    // allocation, which needs a live frame table / physical memory this
    // host test environment doesn't have.

    #[test]
    fn page_count_spans_multiple_pages() {
        // A 9000-byte file needs 3 pages at PGSIZE=4096.
        assert_eq!(page_count_for(9000), 3);
        assert_eq!(page_count_for(PAGE_SIZE as usize), 1);
        assert_eq!(page_count_for(PAGE_SIZE as usize + 1), 2);
    }

    #[test]
    fn overlap_rejects_an_already_tracked_page() {
        let spde = spt::create_spde(Box::new(MockPageDirectory::new()));
        let vaddr = VirtAddr::new(0x6000_0000);
        spt::page_create(&spde, vaddr, Origin::Anonymous).unwrap();

        assert_eq!(check_overlap(&spde, vaddr, 1), Err(MmapError::InvalidMapping));

        spt::destroy_spde(&spde);
    }

    #[test]
    fn overlap_accepts_a_clean_range() {
        let spde = spt::create_spde(Box::new(MockPageDirectory::new()));
        let vaddr = VirtAddr::new(0x6100_0000);

        assert_eq!(check_overlap(&spde, vaddr, 3), Ok(()));

        spt::destroy_spde(&spde);
    }

    #[test]
    fn empty_file_is_rejected_before_any_page_work() {
        let spde = spt::create_spde(Box::new(MockPageDirectory::new()));
        let file = TarEntry {
            name: "empty.txt",
            size: 0,
            typeflag: b'0',
            data: &[],
            file_offset: 0,
        };
        assert_eq!(mmap(&spde, &file, VirtAddr::new(0x7000_0000)), Err(MmapError::EmptyFile));
        spt::destroy_spde(&spde);
    }

    #[test]
    fn ids_are_monotonically_increasing() {
        *NEXT_ID.lock() = 1;
        let a = next_id();
        let b = next_id();
        assert!(b > a);
    }
}
