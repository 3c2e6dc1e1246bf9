#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod boot;
pub mod constants;
pub mod locking;
pub mod logging;
pub mod memory;

pub use locking::{Lock, LockGuard, Locked, TaskId, TaskScheduler};
pub use memory::{AddressSpaceId, MemoryError, MemoryManager};
