#![cfg_attr(not(feature = "std"), no_std)]
//! Blocking inter-task synchronization primitives for a small
//! preemptive RTOS kernel: a byte-oriented variable-length message
//! queue ([`FlexiQueue`]) and a re-entrant mutex ([`RecursiveMutex`]).
//!
//! Both types are generic over [`Kernel`], the trait that captures
//! everything they need from the host scheduler — critical sections,
//! task handles, event lists, the tick counter, and the allocator.
//! Bring your own RTOS binding by implementing it; enable the `std`
//! feature for [`mock::StdKernel`], a host-side implementation backed
//! by real OS threads that this crate's own test suite runs against.

mod ring;
mod varint;
mod wait;

pub mod flexiqueue;
pub mod kernel;
pub mod mutex;

#[cfg(feature = "std")]
pub mod mock;

pub use flexiqueue::{
    CreateError, FlexiQueue, FlushFlags, Mode, ReadError, ReadIsr, WriteError, WriteIsr,
    read_error_to_raw, write_error_to_raw,
};
pub use kernel::Kernel;
pub use mutex::RecursiveMutex;
pub use wait::Ticks;
