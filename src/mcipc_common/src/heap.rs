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

//! Fixed-block message heap.
//!
//! [`HeapBuf`] hands out runs of `N`-byte blocks from a shared region,
//! tracked by a flat bitmap (`FixedBitSet`). The search is first-fit from
//! low addresses, with the most recently freed run tried first so a
//! put/free/put cycle keeps reusing the same block.
//!
//! The bitmap is local state behind a spin lock. Cores that allocate from
//! the same region share one `HeapBuf` (through an `Arc`); the block
//! contents themselves live in shared memory.

use fixedbitset::FixedBitSet;
use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Invalid region addr {0:#x}")]
    InvalidAlign(u64),
    #[error("Invalid free addr {0:#x} and size {1}")]
    InvalidFree(u64, usize),
    #[error("Invalid argument")]
    InvalidArg,
    #[error("Empty region")]
    EmptyRegion,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Overflow")]
    Overflow,
}

/// A run of blocks handed out by a [`BufferProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Local address of the first byte.
    pub addr: u64,
    /// Length in bytes, rounded up to the block size.
    pub len: usize,
}

/// Source of message buffers.
pub trait BufferProvider {
    /// Allocate at least `len` bytes.
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError>;

    /// Free a previously allocated run.
    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError>;

    /// Id written into the header of messages built from this provider.
    fn heap_id(&self) -> u16;

    /// Find the allocation starting at `addr`, as recorded when it was handed out.
    fn lookup(&self, addr: u64) -> Option<Allocation>;
}

impl<P: BufferProvider + ?Sized> BufferProvider for alloc::sync::Arc<P> {
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError> {
        (**self).alloc(len)
    }
    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError> {
        (**self).dealloc(alloc)
    }
    fn heap_id(&self) -> u16 {
        (**self).heap_id()
    }
    fn lookup(&self, addr: u64) -> Option<Allocation> {
        (**self).lookup(addr)
    }
}

#[derive(Debug)]
struct Blocks {
    used: FixedBitSet,
    /// Run length in blocks, indexed by first block. Zero when not a run head.
    runs: alloc::vec::Vec<u32>,
    last_free_run: Option<(usize, usize)>,
}

/// Bitmap allocator over `[base, base + len)` with `N`-byte blocks.
#[derive(Debug)]
pub struct HeapBuf<const N: usize> {
    base_addr: u64,
    heap_id: u16,
    blocks: spin::Mutex<Blocks>,
}

impl<const N: usize> HeapBuf<N> {
    /// The region is rounded down to a multiple of `N`; `base_addr` must be
    /// `N` aligned.
    pub fn new(heap_id: u16, base_addr: u64, region_len: usize) -> Result<Self, AllocError> {
        if N == 0 || !N.is_power_of_two() {
            return Err(AllocError::InvalidArg);
        }
        if !base_addr.is_multiple_of(N as u64) {
            return Err(AllocError::InvalidAlign(base_addr));
        }
        let num_blocks = region_len / N;
        if num_blocks == 0 {
            return Err(AllocError::EmptyRegion);
        }
        base_addr
            .checked_add((num_blocks * N) as u64)
            .ok_or(AllocError::Overflow)?;

        Ok(Self {
            base_addr,
            heap_id,
            blocks: spin::Mutex::new(Blocks {
                used: FixedBitSet::with_capacity(num_blocks),
                runs: alloc::vec![0; num_blocks],
                last_free_run: None,
            }),
        })
    }

    pub const BLOCK_SIZE: usize = N;

    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.lock().used.len()
    }

    pub fn free_blocks(&self) -> usize {
        let b = self.blocks.lock();
        b.used.len() - b.used.count_ones(..)
    }

    fn find_blocks(blocks: &mut Blocks, need: usize) -> Option<usize> {
        if let Some((start, len)) = blocks.last_free_run.take()
            && len >= need
            && blocks.used.count_ones(start..start + need) == 0
        {
            return Some(start);
        }

        let total = blocks.used.len();
        blocks.used.zeroes().find(|&next_free| {
            next_free + need <= total
                && blocks.used.count_zeroes(next_free..next_free + need) == need
        })
    }
}

impl<const N: usize> BufferProvider for HeapBuf<N> {
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError> {
        if len == 0 {
            return Err(AllocError::InvalidArg);
        }
        let need = len.div_ceil(N);

        let mut blocks = self.blocks.lock();
        if need > blocks.used.len() {
            return Err(AllocError::OutOfMemory);
        }
        let idx = Self::find_blocks(&mut blocks, need).ok_or(AllocError::OutOfMemory)?;
        blocks.used.insert_range(idx..idx + need);
        blocks.runs[idx] = need as u32;

        Ok(Allocation {
            addr: self.base_addr + (idx * N) as u64,
            len: need * N,
        })
    }

    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError> {
        let Allocation { addr, len } = alloc;
        let invalid = AllocError::InvalidFree(addr, len);
        if len == 0 || !len.is_multiple_of(N) || addr < self.base_addr {
            return Err(invalid);
        }
        let off = (addr - self.base_addr) as usize;
        if !off.is_multiple_of(N) {
            return Err(invalid);
        }
        let start = off / N;
        let count = len / N;

        let mut blocks = self.blocks.lock();
        if start + count > blocks.used.len() || blocks.runs[start] as usize != count {
            return Err(invalid);
        }
        // every block must still be taken, otherwise this is a double free
        if !blocks.used.contains_all_in_range(start..start + count) {
            return Err(invalid);
        }

        blocks.used.remove_range(start..start + count);
        blocks.runs[start] = 0;
        blocks.last_free_run = Some((start, count));
        Ok(())
    }

    fn heap_id(&self) -> u16 {
        self.heap_id
    }

    fn lookup(&self, addr: u64) -> Option<Allocation> {
        let off = addr.checked_sub(self.base_addr)? as usize;
        if !off.is_multiple_of(N) {
            return None;
        }
        let blocks = self.blocks.lock();
        let count = *blocks.runs.get(off / N)? as usize;
        (count > 0).then_some(Allocation {
            addr,
            len: count * N,
        })
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::thread;

    use rand::seq::SliceRandom;

    use super::*;

    const BASE: u64 = 0x9000_0000;

    #[test]
    fn rejects_bad_regions() {
        assert_eq!(
            HeapBuf::<256>::new(0, BASE + 8, 4096).err(),
            Some(AllocError::InvalidAlign(BASE + 8))
        );
        assert_eq!(
            HeapBuf::<256>::new(0, BASE, 100).err(),
            Some(AllocError::EmptyRegion)
        );
        assert_eq!(
            HeapBuf::<100>::new(0, BASE, 4096).err(),
            Some(AllocError::InvalidArg)
        );
    }

    #[test]
    fn alloc_rounds_up_and_exhausts() {
        let heap = HeapBuf::<256>::new(1, BASE, 1024).unwrap();
        assert_eq!(heap.num_blocks(), 4);
        let a = heap.alloc(1).unwrap();
        assert_eq!(a, Allocation { addr: BASE, len: 256 });
        let b = heap.alloc(300).unwrap();
        assert_eq!(b, Allocation { addr: BASE + 256, len: 512 });
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.alloc(257), Err(AllocError::OutOfMemory));
        assert_eq!(heap.alloc(0), Err(AllocError::InvalidArg));
        assert_eq!(heap.lookup(b.addr), Some(b));
        assert_eq!(heap.lookup(b.addr + 256), None);
    }

    #[test]
    fn double_and_foreign_frees_are_rejected() {
        let heap = HeapBuf::<128>::new(0, BASE, 1024).unwrap();
        let a = heap.alloc(200).unwrap();
        heap.dealloc(a).unwrap();
        assert!(heap.dealloc(a).is_err());

        let b = heap.alloc(128).unwrap();
        // wrong length for the run
        assert!(heap.dealloc(Allocation { addr: b.addr, len: 256 }).is_err());
        assert!(heap.dealloc(Allocation { addr: BASE - 128, len: 128 }).is_err());
        assert!(heap.dealloc(Allocation { addr: b.addr + 1, len: 128 }).is_err());
        heap.dealloc(b).unwrap();
        assert_eq!(heap.free_blocks(), 8);
    }

    #[test]
    fn freed_run_is_reused_first() {
        let heap = HeapBuf::<64>::new(0, BASE, 64 * 8).unwrap();
        let _a = heap.alloc(64).unwrap();
        let b = heap.alloc(64).unwrap();
        let _c = heap.alloc(64).unwrap();
        heap.dealloc(b).unwrap();
        assert_eq!(heap.alloc(64).unwrap().addr, b.addr);
    }

    #[test]
    fn random_alloc_free_keeps_accounting() {
        let heap = HeapBuf::<64>::new(0, BASE, 64 * 64).unwrap();
        let mut rng = rand::rng();
        let mut live: Vec<Allocation> = Vec::new();
        for _ in 0..2000 {
            if rand::Rng::random_bool(&mut rng, 0.6) {
                let len = rand::Rng::random_range(&mut rng, 1..=256);
                if let Ok(a) = heap.alloc(len) {
                    assert!(live.iter().all(|o| {
                        a.addr + a.len as u64 <= o.addr || o.addr + o.len as u64 <= a.addr
                    }));
                    live.push(a);
                }
            } else if !live.is_empty() {
                live.shuffle(&mut rng);
                let a = live.pop().unwrap();
                heap.dealloc(a).unwrap();
            }
            let used: usize = live.iter().map(|a| a.len / 64).sum();
            assert_eq!(heap.free_blocks(), 64 - used);
        }
    }

    #[test]
    fn shared_between_threads() {
        let heap = Arc::new(HeapBuf::<64>::new(0, BASE, 64 * 32).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let heap = heap.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let a = heap.alloc(64).unwrap();
                        heap.dealloc(a).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(heap.free_blocks(), 32);
    }
}
