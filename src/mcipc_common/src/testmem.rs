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

//! Vec backed shared memory used by unit tests.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};

use bytemuck::Pod;

use crate::mem::{CacheOps, MemOps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfBounds(pub u64);

/// Test memory starting at a fixed, fake base address.
///
/// Storage is a `Vec<u64>` so every offset that is aligned relative to the
/// base is also aligned in host memory. Cache operations only count calls.
#[derive(Debug)]
pub struct TestMem {
    storage: UnsafeCell<Vec<u64>>,
    base_addr: u64,
    len: usize,
    writebacks: AtomicUsize,
    invalidates: AtomicUsize,
}

// SAFETY: tests only touch disjoint fields from different threads, and index
// words are accessed through atomics.
unsafe impl Sync for TestMem {}
// SAFETY: see above
unsafe impl Send for TestMem {}

impl TestMem {
    pub const DEFAULT_BASE: u64 = 0x8000_0000;

    pub fn new(size: usize) -> Self {
        Self::with_base(Self::DEFAULT_BASE, size)
    }

    pub fn with_base(base_addr: u64, size: usize) -> Self {
        let words = size.div_ceil(8);
        Self {
            storage: UnsafeCell::new(vec![0u64; words]),
            base_addr,
            len: words * 8,
            writebacks: AtomicUsize::new(0),
            invalidates: AtomicUsize::new(0),
        }
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn writebacks(&self) -> usize {
        self.writebacks.load(Ordering::Relaxed)
    }

    pub fn invalidates(&self) -> usize {
        self.invalidates.load(Ordering::Relaxed)
    }

    fn ptr_for(&self, addr: u64, len: usize) -> Result<*mut u8, OutOfBounds> {
        let off = addr.checked_sub(self.base_addr).ok_or(OutOfBounds(addr))? as usize;
        if off.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(OutOfBounds(addr));
        }
        // SAFETY: storage is never resized after construction
        let storage = unsafe { &mut *self.storage.get() };
        Ok(storage.as_mut_ptr().cast::<u8>().wrapping_add(off))
    }
}

impl MemOps for TestMem {
    type Error = OutOfBounds;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        let src = self.ptr_for(addr, dst.len())?;
        // SAFETY: bounds checked above
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        let dst = self.ptr_for(addr, src.len())?;
        // SAFETY: bounds checked above
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(src.len())
    }

    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let ptr = self.ptr_for(addr, size_of::<T>())?.cast::<T>();
        // SAFETY: bounds checked above, unaligned read is allowed
        Ok(unsafe { ptr::read_unaligned(ptr) })
    }

    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        let ptr = self.ptr_for(addr, size_of::<T>())?.cast::<T>();
        // SAFETY: bounds checked above, unaligned write is allowed
        unsafe { ptr::write_unaligned(ptr, val) };
        Ok(())
    }

    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
        let ptr = self.ptr_for(addr, 2)?.cast::<AtomicU16>();
        // SAFETY: callers pass aligned index addresses
        Ok(unsafe { (*ptr).load(Ordering::Acquire) })
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
        let ptr = self.ptr_for(addr, 2)?.cast::<AtomicU16>();
        // SAFETY: callers pass aligned index addresses
        unsafe { (*ptr).store(val, Ordering::Release) };
        Ok(())
    }

    fn load_acquire_u32(&self, addr: u64) -> Result<u32, Self::Error> {
        let ptr = self.ptr_for(addr, 4)?.cast::<AtomicU32>();
        // SAFETY: callers pass aligned index addresses
        Ok(unsafe { (*ptr).load(Ordering::Acquire) })
    }

    fn store_release_u32(&self, addr: u64, val: u32) -> Result<(), Self::Error> {
        let ptr = self.ptr_for(addr, 4)?.cast::<AtomicU32>();
        // SAFETY: callers pass aligned index addresses
        unsafe { (*ptr).store(val, Ordering::Release) };
        Ok(())
    }
}

impl CacheOps for TestMem {
    fn writeback(&self, addr: u64, len: usize) -> Result<(), Self::Error> {
        self.ptr_for(addr, len)?;
        self.writebacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn invalidate(&self, addr: u64, len: usize) -> Result<(), Self::Error> {
        self.ptr_for(addr, len)?;
        self.invalidates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Loopback channel: `kick` records the payload, `clear` pops injected ones.
#[derive(Debug, Default)]
pub struct TestChannel {
    pending: spin::Mutex<std::collections::VecDeque<u32>>,
    sent: spin::Mutex<Vec<u32>>,
    fail: core::sync::atomic::AtomicBool,
    enabled: core::sync::atomic::AtomicBool,
}

impl TestChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next kicks fail, or succeed again.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Queue a payload for `clear` to return.
    pub fn inject(&self, payload: u32) {
        self.pending.lock().push_back(payload);
    }

    pub fn sent(&self) -> Vec<u32> {
        self.sent.lock().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl crate::channel::InterruptChannel for TestChannel {
    fn kick(&self, payload: u32) -> Result<(), crate::channel::ChannelError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(crate::channel::ChannelError::Full);
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    fn clear(&self) -> Option<u32> {
        self.pending.lock().pop_front()
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}
