//! Core types and synchronization primitives for the Quark kernel.
//!
//! This crate contains the host-testable foundations of the memory
//! subsystem: typed address wrappers, page/frame abstractions, the page
//! table entry value object, spin-based locks, and the logging and clock
//! hooks. None of it depends on a particular paging hardware; the memory
//! manager in `quark-mm` builds on these types.
//!
//! By living outside the kernel crate, these types can be tested with
//! `cargo test` on the host without a kernel target.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod addr;
pub mod entry;
pub mod log;
pub mod paging;
pub mod sync;
pub mod time;
