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

//! Shared Memory Access Traits
//!
//! [`MemOps`] abstracts how this core reads and writes the shared window,
//! and [`CacheOps`] adds the two maintenance primitives needed when the
//! window is cached without hardware coherency. Addresses passed to both
//! traits are *local* addresses, as seen by the calling core.

use alloc::sync::Arc;

use bytemuck::Pod;

/// Backend-provided memory access for shared rings and queues.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Addresses passed to methods are valid for the duration of the call
/// - Memory ordering guarantees are upheld as documented
/// - Reads and writes don't cause undefined behavior (alignment, validity)
pub trait MemOps {
    type Error: core::fmt::Debug;

    /// Read bytes from shared memory.
    ///
    /// Returns the number of bytes read, which equals `dst.len()` on success.
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write bytes to shared memory.
    ///
    /// Returns the number of bytes written, which equals `src.len()` on success.
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Load a u16 with acquire semantics.
    ///
    /// `addr` must be 2-byte aligned.
    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error>;

    /// Store a u16 with release semantics.
    ///
    /// `addr` must be 2-byte aligned.
    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error>;

    /// Load a u32 with acquire semantics.
    ///
    /// `addr` must be 4-byte aligned.
    fn load_acquire_u32(&self, addr: u64) -> Result<u32, Self::Error>;

    /// Store a u32 with release semantics.
    ///
    /// `addr` must be 4-byte aligned.
    fn store_release_u32(&self, addr: u64, val: u32) -> Result<(), Self::Error>;

    /// Read a Pod type at the given address.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod type at the given address.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }
}

/// Cache maintenance for memory that is not kept coherent by hardware.
///
/// Both operations work on whole cache lines covering `[addr, addr + len)`.
/// Backends whose memory is coherent implement them as no-ops.
pub trait CacheOps: MemOps {
    /// Write dirty lines in the range back to memory, keeping them cached.
    fn writeback(&self, addr: u64, len: usize) -> Result<(), Self::Error>;

    /// Drop cached lines in the range so the next read observes memory.
    ///
    /// Dirty data in the range is discarded.
    fn invalidate(&self, addr: u64, len: usize) -> Result<(), Self::Error>;
}

macro_rules! forward_mem_ops {
    ($($ty:ty),*) => {
        $(
            impl<M: MemOps + ?Sized> MemOps for $ty {
                type Error = M::Error;

                #[inline]
                fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
                    (**self).read(addr, dst)
                }

                #[inline]
                fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
                    (**self).write(addr, src)
                }

                #[inline]
                fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
                    (**self).load_acquire(addr)
                }

                #[inline]
                fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
                    (**self).store_release(addr, val)
                }

                #[inline]
                fn load_acquire_u32(&self, addr: u64) -> Result<u32, Self::Error> {
                    (**self).load_acquire_u32(addr)
                }

                #[inline]
                fn store_release_u32(&self, addr: u64, val: u32) -> Result<(), Self::Error> {
                    (**self).store_release_u32(addr, val)
                }
            }

            impl<M: CacheOps + ?Sized> CacheOps for $ty {
                #[inline]
                fn writeback(&self, addr: u64, len: usize) -> Result<(), Self::Error> {
                    (**self).writeback(addr, len)
                }

                #[inline]
                fn invalidate(&self, addr: u64, len: usize) -> Result<(), Self::Error> {
                    (**self).invalidate(addr, len)
                }
            }
        )*
    };
}

forward_mem_ops!(&M, Arc<M>);
