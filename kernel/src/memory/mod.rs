// =============================================================================
// Memory Subsystem
// =============================================================================
//
// Layered from the bottom up:
//
//   address.rs — PhysAddr/VirtAddr newtypes (type safety for addresses)
//   heap.rs     — kernel heap allocator (Box, Vec, Rc, ...)
//   pmm.rs      — physical memory manager (bitmap allocator over all RAM)
//   vmm.rs      — page table operations, the PageDirectory trait
//   frame.rs    — bounded frame table handed out to supplemental pages
//   swap.rs     — swap slot allocator backing frame eviction
//   spt.rs      — supplemental page table: fault resolution and eviction
//   mmap.rs     — memory-mapped files built on top of the SPT
//
// This module only exposes what's needed. Internal details stay private.
// =============================================================================

pub mod address;
pub mod frame;
pub mod heap;
pub mod mmap;
pub mod pmm;
pub mod spt;
pub mod swap;
pub mod vmm;
