//! Blocking mutual exclusion for kernel subsystems.
//!
//! [`Lock`] is the primitive guarding the frame allocator and page tables;
//! [`LockGuard`] and [`Locked`] are the RAII shapes the rest of the kernel
//! uses to hold it.

pub mod mutex;
pub mod raii;

pub use mutex::{Lock, TaskId, TaskScheduler};
pub use raii::{LockGuard, Locked, LockedGuard};
