//! The Kernel Heap
//!
//! Backing and hook surface for the dynamic allocator. The allocation
//! algorithm itself lives outside this crate and reaches memory through
//! four hooks: a lock/unlock pair delegating to the context's "heap" lock,
//! and a page pair that gets and returns whole frames. Kernel builds
//! additionally install the Talc allocator as `#[global_allocator]`,
//! bootstrapped from a static arena and grown with the window `init` maps.

use crate::constants::memory::{FRAME_SIZE, HEAP_PAGES, HEAP_SIZE};
use crate::memory::error::MemoryError;
use crate::memory::range::{MemoryRange, MemoryType};
use crate::memory::MemoryManager;
use x86_64::{structures::paging::PageTableFlags, VirtAddr};

#[cfg(not(test))]
use talc::{ClaimOnOom, Span, Talc, Talck};

/// Carries the allocator until `init` has mapped the real heap window.
#[cfg(not(test))]
const BOOTSTRAP_HEAP_SIZE: usize = 64 * 1024;

#[cfg(not(test))]
static mut BOOTSTRAP_HEAP: [u8; BOOTSTRAP_HEAP_SIZE] = [0; BOOTSTRAP_HEAP_SIZE];

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: Talck<spin::Mutex<()>, ClaimOnOom> = Talc::new(unsafe {
    ClaimOnOom::new(Span::from_const_array(core::ptr::addr_of!(BOOTSTRAP_HEAP)))
})
.lock();

/// Lock hook: serialize the dynamic allocator's metadata.
pub fn lock(ctx: &MemoryManager) {
    ctx.heap_lock.lock();
}

/// Unlock hook.
pub fn unlock(ctx: &MemoryManager) {
    ctx.heap_lock.unlock();
}

/// Page hook: hand out `count` frames mapped into the kernel address space.
///
/// The request is sized to exactly `count * FRAME_SIZE` bytes.
pub fn pages_alloc(ctx: &MemoryManager, count: usize) -> Result<VirtAddr, MemoryError> {
    if count == 0 {
        return Err(MemoryError::InvalidArgument);
    }
    ctx.alloc(
        ctx.kernel_space(),
        count * FRAME_SIZE,
        PageTableFlags::WRITABLE | PageTableFlags::GLOBAL,
    )
}

/// Page hook: give `count` frames back.
pub fn pages_free(ctx: &MemoryManager, addr: VirtAddr, count: usize) -> Result<(), MemoryError> {
    if count == 0 {
        return Err(MemoryError::InvalidArgument);
    }
    ctx.free(
        ctx.kernel_space(),
        MemoryRange::new(addr.as_u64(), (count * FRAME_SIZE) as u64, MemoryType::Kernel),
    )
}

/// Maps the kernel heap window and, in kernel builds, claims it into the
/// global allocator. Returns the window's base.
pub fn init(ctx: &MemoryManager) -> Result<VirtAddr, MemoryError> {
    let base = pages_alloc(ctx, HEAP_PAGES)?;

    #[cfg(not(test))]
    unsafe {
        ALLOCATOR
            .lock()
            .claim(Span::from_base_size(base.as_mut_ptr(), HEAP_SIZE))
            .map_err(|_| MemoryError::ResourceExhausted)?;
    }

    log::info!("kernel heap: {} KiB at {:#x}", HEAP_SIZE / 1024, base);
    Ok(base)
}
