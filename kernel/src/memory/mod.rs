pub mod bitmap;
pub mod bitmap_frame_allocator;
pub mod error;
pub mod heap;
pub mod map;
pub mod paging;
pub mod range;

use crate::boot::BootInfo;
use crate::constants::memory::{FRAME_SIZE, KERNEL_BASE};
use crate::locking::{Lock, Locked, TaskScheduler};
use alloc::sync::Arc;
use bitmap_frame_allocator::BitmapFrameAllocator;
use paging::VirtualMemoryManager;
use x86_64::{structures::paging::PageTableFlags, PhysAddr, VirtAddr};

pub use error::MemoryError;
pub use map::MemoryMap;
pub use paging::AddressSpaceId;
pub use range::{MemoryRange, MemoryType};

/// Everything the memory lock protects: the frame bitmap and every address
/// space's page tables. One lock, one total order of mutations.
struct MemoryState {
    phys: BitmapFrameAllocator,
    paging: VirtualMemoryManager,
}

/// The kernel memory context.
///
/// Owns the physical allocator, the address-space arena and the two named
/// locks ("memory" for the allocators, "heap" for the dynamic-allocator
/// hooks). There is deliberately no global instance: whoever boots the
/// kernel creates one and passes it around, and tests create as many
/// isolated instances as they like.
pub struct MemoryManager {
    state: Locked<MemoryState>,
    heap_lock: Lock,
    kernel_space: AddressSpaceId,
}

impl MemoryManager {
    /// Builds the context from the bootloader handoff: seeds the frame
    /// bitmap, creates the kernel address space, identity-maps everything up
    /// to `kernel_end` (early memory plus the kernel image), installs the
    /// higher-half kernel alias and maps the framebuffer uncached.
    ///
    /// Runs single-threaded; all later calls go through the "memory" lock.
    pub fn initialize(boot: &BootInfo, kernel_end: u64) -> Result<Self, MemoryError> {
        if !boot.is_valid() {
            log::error!("bad boot magic {:#x}", boot.magic);
            return Err(MemoryError::InvalidArgument);
        }

        let mut phys = BitmapFrameAllocator::init(
            boot.memory_size,
            kernel_end,
            boot.memory_map.iter().copied(),
        );
        let mut paging = VirtualMemoryManager::new();
        let kernel_space = paging.create_space(&mut phys)?;

        let kernel_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL;
        let kernel_image =
            MemoryRange::new(0, kernel_end, MemoryType::Kernel).align_outward();
        if !kernel_image.is_empty() {
            // identity map, then the higher-half alias the kernel runs from
            paging.map_identity(&mut phys, kernel_space, kernel_image, kernel_flags)?;
            let alias = MemoryRange::new(KERNEL_BASE, kernel_image.size(), MemoryType::Kernel);
            paging.map(
                &mut phys,
                kernel_space,
                alias,
                PhysAddr::new(0),
                kernel_flags,
            )?;
        }

        let framebuffer = MemoryRange::new(
            boot.framebuffer.addr,
            boot.framebuffer.size(),
            MemoryType::Reserved,
        )
        .align_outward();
        if !framebuffer.is_empty() {
            paging.map_identity(
                &mut phys,
                kernel_space,
                framebuffer,
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_CACHE,
            )?;
        }

        log::info!(
            "memory context up, kernel space {:?}, {} KiB in use",
            kernel_space,
            phys.used_frames() * FRAME_SIZE / 1024
        );

        Ok(MemoryManager {
            state: Locked::new("memory", MemoryState { phys, paging }),
            heap_lock: Lock::new("heap"),
            kernel_space,
        })
    }

    /// The address space everything shares until tasks bring their own.
    pub fn kernel_space(&self) -> AddressSpaceId {
        self.kernel_space
    }

    /// Routes contended lock acquisitions to `scheduler` from now on.
    pub fn set_scheduler(&self, scheduler: Arc<dyn TaskScheduler>) {
        self.state.mutex().set_scheduler(scheduler.clone());
        self.heap_lock.set_scheduler(scheduler);
    }

    pub fn create_address_space(&self) -> Result<AddressSpaceId, MemoryError> {
        let mut state = self.state.lock();
        let MemoryState { phys, paging } = &mut *state;
        paging.create_space(phys)
    }

    /// Maps `virt_range` to consecutive frames starting at `phys_base`.
    pub fn map(
        &self,
        space: AddressSpaceId,
        virt_range: MemoryRange,
        phys_base: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), MemoryError> {
        let mut state = self.state.lock();
        let MemoryState { phys, paging } = &mut *state;
        paging.map(phys, space, virt_range, phys_base, flags)
    }

    /// Maps `range` with virtual == physical.
    pub fn map_identity(
        &self,
        space: AddressSpaceId,
        range: MemoryRange,
        flags: PageTableFlags,
    ) -> Result<(), MemoryError> {
        let mut state = self.state.lock();
        let MemoryState { phys, paging } = &mut *state;
        paging.map_identity(phys, space, range, flags)
    }

    /// Reserves and maps `ceil(size / FRAME_SIZE)` frames at a system-chosen
    /// virtual base.
    pub fn alloc(
        &self,
        space: AddressSpaceId,
        size: usize,
        flags: PageTableFlags,
    ) -> Result<VirtAddr, MemoryError> {
        let mut state = self.state.lock();
        let MemoryState { phys, paging } = &mut *state;
        paging.alloc(phys, space, size, flags)
    }

    /// Reserves frames and identity-maps them.
    pub fn alloc_identity(
        &self,
        space: AddressSpaceId,
        size: usize,
        flags: PageTableFlags,
    ) -> Result<VirtAddr, MemoryError> {
        let mut state = self.state.lock();
        let MemoryState { phys, paging } = &mut *state;
        paging.alloc_identity(phys, space, size, flags)
    }

    /// Unmaps `range` and returns its frames to the allocator.
    pub fn free(&self, space: AddressSpaceId, range: MemoryRange) -> Result<(), MemoryError> {
        let mut state = self.state.lock();
        let MemoryState { phys, paging } = &mut *state;
        paging.free(phys, space, range)
    }

    /// Resolves a mapping, if present.
    pub fn translate(&self, space: AddressSpaceId, virt: VirtAddr) -> Option<PhysAddr> {
        self.state.lock().paging.translate(space, virt)
    }

    /// Bytes of physical memory currently allocated. Always exactly the
    /// allocator's used-frame count times the frame size.
    pub fn used_memory(&self) -> usize {
        self.state.lock().phys.used_frames() * FRAME_SIZE
    }

    /// Bytes of physical memory under management.
    pub fn total_memory(&self) -> usize {
        self.state.lock().phys.total_frames() * FRAME_SIZE
    }

    /// Logs the full mapping picture at debug level. Diagnostic only.
    pub fn dump(&self) {
        let state = self.state.lock();
        state.paging.dump(&state.phys);
    }
}
