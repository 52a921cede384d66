/*
Copyright 2026 The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
// We use Arbitrary during fuzzing, which requires std
#![cfg_attr(not(any(test, feature = "fuzzing", feature = "std")), no_std)]

//! Platform independent pieces of the multicore IPC stack.
//!
//! Everything in this crate talks to shared memory through [`mem::MemOps`]
//! and [`mem::CacheOps`], to the peer core through
//! [`channel::InterruptChannel`], and converts buffer addresses through
//! [`xlate::AddressTranslator`]. A platform supplies those three
//! capabilities plus a [`cache::CacheMaint`] flag and gets the whole stack:
//!
//! - [`vring`] / [`virtq`]: split virtio rings and the per-core dispatcher.
//! - [`circ`] / [`notify`]: fixed-slot circular queues and the event driver on top.
//! - [`listmp`], [`heap`], [`gate`]: shared lists, message blocks and locking.
//! - [`msgq`] / [`transport`]: the message header, router and transports.

extern crate alloc;

/// Size of a cache line assumed by shared layouts.
///
/// Index words that are written by different cores are placed this far apart.
pub const CACHE_LINE_SIZE: usize = 128;

/// Default alignment of the used ring inside a vring.
pub const VRING_ALIGN: usize = 0x1_000; // 4KB

pub mod cache;
pub mod channel;
pub mod circ;
pub mod deadline;
pub mod gate;
pub mod heap;
pub mod listmp;
pub mod mem;
pub mod msgq;
pub mod notify;
pub mod transport;
pub mod virtq;
pub mod vring;
pub mod xlate;

#[cfg(any(test, feature = "fuzzing"))]
pub mod testmem;

#[inline]
pub(crate) const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}
