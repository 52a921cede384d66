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

//! Cache Maintenance Helper
//!
//! Every structure shared between two cores goes through a [`CacheMaint`]
//! so the visibility rules are applied in one place:
//!
//! ```text
//! writer: write data -> writeback data -> write index -> writeback index -> kick
//! reader: invalidate index -> read index -> invalidate data -> read data
//! ```
//!
//! The `enabled` flag belongs to the shared region, not to the build: a
//! coherent region skips every maintenance call at runtime.

use bytemuck::Pod;

use crate::mem::CacheOps;

/// Memory accessor paired with the cacheability of the region it serves.
#[derive(Debug, Clone)]
pub struct CacheMaint<M> {
    mem: M,
    enabled: bool,
}

impl<M: CacheOps> CacheMaint<M> {
    pub fn new(mem: M, enabled: bool) -> Self {
        Self { mem, enabled }
    }

    /// Whether maintenance operations are issued for this region.
    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn mem(&self) -> &M {
        &self.mem
    }

    /// Write back `[addr, addr + len)` if the region is cached.
    #[inline]
    pub fn writeback(&self, addr: u64, len: usize) -> Result<(), M::Error> {
        if self.enabled && len > 0 {
            self.mem.writeback(addr, len)?;
        }
        Ok(())
    }

    /// Invalidate `[addr, addr + len)` if the region is cached.
    #[inline]
    pub fn invalidate(&self, addr: u64, len: usize) -> Result<(), M::Error> {
        if self.enabled && len > 0 {
            self.mem.invalidate(addr, len)?;
        }
        Ok(())
    }

    /// Plain write without maintenance; pair with [`writeback`](Self::writeback).
    #[inline]
    pub fn write(&self, addr: u64, src: &[u8]) -> Result<(), M::Error> {
        self.mem.write(addr, src)?;
        Ok(())
    }

    /// Plain read without maintenance; pair with [`invalidate`](Self::invalidate).
    #[inline]
    pub fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), M::Error> {
        self.mem.read(addr, dst)?;
        Ok(())
    }

    /// Write bytes and make them visible to the peer.
    pub fn publish(&self, addr: u64, src: &[u8]) -> Result<(), M::Error> {
        self.mem.write(addr, src)?;
        self.writeback(addr, src.len())
    }

    /// Write a value and make it visible to the peer.
    pub fn publish_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), M::Error> {
        self.mem.write_val(addr, val)?;
        self.writeback(addr, size_of::<T>())
    }

    /// Release-store an index word and make it visible to the peer.
    pub fn publish_u16(&self, addr: u64, val: u16) -> Result<(), M::Error> {
        self.mem.store_release(addr, val)?;
        self.writeback(addr, 2)
    }

    /// Release-store a 32-bit index word and make it visible to the peer.
    pub fn publish_u32(&self, addr: u64, val: u32) -> Result<(), M::Error> {
        self.mem.store_release_u32(addr, val)?;
        self.writeback(addr, 4)
    }

    /// Read bytes the peer published.
    pub fn fetch(&self, addr: u64, dst: &mut [u8]) -> Result<(), M::Error> {
        self.invalidate(addr, dst.len())?;
        self.mem.read(addr, dst)?;
        Ok(())
    }

    /// Read a value the peer published.
    pub fn fetch_val<T: Pod>(&self, addr: u64) -> Result<T, M::Error> {
        self.invalidate(addr, size_of::<T>())?;
        self.mem.read_val(addr)
    }

    /// Invalidate then acquire-load an index word.
    pub fn fetch_u16(&self, addr: u64) -> Result<u16, M::Error> {
        self.invalidate(addr, 2)?;
        self.mem.load_acquire(addr)
    }

    /// Invalidate then acquire-load a 32-bit index word.
    pub fn fetch_u32(&self, addr: u64) -> Result<u32, M::Error> {
        self.invalidate(addr, 4)?;
        self.mem.load_acquire_u32(addr)
    }
}
