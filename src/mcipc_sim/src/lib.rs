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

//! A hosted platform for the mcipc stack.
//!
//! Cores are simulated by threads. They share one [`mem::SimMemory`] through
//! per-core write-back caches that are *not* coherent with each other, and
//! raise each other's interrupt lines through a [`mailbox::MailboxBank`].
//! [`system::IpcSystem`] wires pairs of cores together with any of the
//! transports in [`mcipc_common::transport`].

/// Simulated clock used for send deadlines
pub mod clock;
/// Tunables for an [`system::IpcSystem`]
pub mod config;
/// Error type and macros for this crate
pub mod error;
/// Placement of every shared structure inside a link region
pub mod layout;
/// Mailbox bank: one FIFO per ordered pair of cores
pub mod mailbox;
/// Shared memory with non-coherent per-core caches
pub mod mem;
/// Metric definitions
pub(crate) mod metrics;
/// Cores, links and their wiring
pub mod system;

pub use config::IpcConfiguration;
pub use error::IpcError;
pub use system::{CoreContext, IpcSystem, TransportKind};

/// The standard return type for fallible calls in this crate
pub type Result<T> = core::result::Result<T, error::IpcError>;

/// Block size of every message heap and virtio buffer pool.
pub const HEAP_BLOCK_SIZE: usize = 512;
