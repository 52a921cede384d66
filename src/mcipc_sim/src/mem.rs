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

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mcipc_common::CACHE_LINE_SIZE;
use mcipc_common::mem::{CacheOps, MemOps};
use mcipc_common::msgq::ProcId;
use mcipc_common::xlate::Window;
use tracing::{Span, instrument};

use crate::Result;
use crate::error::IpcError;

/// Where every core sees the shared region.
pub const LOCAL_BASE: u64 = 0x20_0000_0000;
/// Where the shared region sits in the shared address space.
pub const SHARED_BASE: u32 = 0x8000_0000;

const LINE: usize = CACHE_LINE_SIZE;

// the dirty mask has one bit per byte
const _: () = assert!(LINE == u128::BITS as usize);

/// Physical memory shared by all simulated cores.
#[derive(Debug)]
pub struct SimMemory {
    phys: Mutex<Box<[u8]>>,
    size: usize,
}

impl SimMemory {
    /// `size` is rounded up to whole cache lines.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn new(size: usize) -> Result<Self> {
        let size = size.next_multiple_of(LINE);
        if size as u64 > (u32::MAX - SHARED_BASE) as u64 {
            return Err(IpcError::BoundsCheckFailed(LOCAL_BASE + size as u64, size));
        }
        Ok(Self {
            phys: Mutex::new(vec![0u8; size].into_boxed_slice()),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Translation between the local view and the shared address space.
    pub fn window(&self) -> Window {
        Window::new(LOCAL_BASE, SHARED_BASE, self.size as u32)
    }

    /// A core's view of this memory. Unless `coherent`, the view caches
    /// whole lines and only exchanges data with memory on writeback,
    /// invalidate or a miss.
    pub fn core_view(self: &Arc<Self>, core: ProcId, coherent: bool) -> Arc<CoreMem> {
        Arc::new(CoreMem {
            core,
            phys: self.clone(),
            cache: Mutex::new(BTreeMap::new()),
            coherent,
            writebacks: AtomicU64::new(0),
            invalidates: AtomicU64::new(0),
        })
    }

    /// Read memory directly, bypassing every cache.
    pub fn peek(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        let off = self.offset(addr, dst.len())?;
        let phys = self.phys.lock()?;
        dst.copy_from_slice(&phys[off..off + dst.len()]);
        Ok(())
    }

    fn offset(&self, addr: u64, len: usize) -> Result<usize> {
        let oob = || IpcError::BoundsCheckFailed(addr, self.size);
        let off = addr.checked_sub(LOCAL_BASE).ok_or_else(oob)?;
        let end = off.checked_add(len as u64).ok_or_else(oob)?;
        if end > self.size as u64 {
            return Err(oob());
        }
        Ok(off as usize)
    }
}

#[derive(Debug, Clone, Copy)]
struct Line {
    data: [u8; LINE],
    /// bit i set: byte i was written since the last writeback
    dirty: u128,
}

/// Bits `at..at + n` of a dirty mask.
#[inline]
fn byte_mask(at: usize, n: usize) -> u128 {
    if n == LINE {
        u128::MAX
    } else {
        ((1u128 << n) - 1) << at
    }
}

/// One core's cached view of [`SimMemory`].
#[derive(Debug)]
pub struct CoreMem {
    core: ProcId,
    phys: Arc<SimMemory>,
    /// line index -> cached line
    cache: Mutex<BTreeMap<usize, Line>>,
    coherent: bool,
    writebacks: AtomicU64,
    invalidates: AtomicU64,
}

impl CoreMem {
    pub fn core(&self) -> ProcId {
        self.core
    }

    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    /// Lines currently held in this core's cache.
    pub fn cached_lines(&self) -> Result<usize> {
        Ok(self.cache.lock()?.len())
    }

    pub fn writebacks(&self) -> u64 {
        self.writebacks.load(Ordering::Relaxed)
    }

    pub fn invalidates(&self) -> u64 {
        self.invalidates.load(Ordering::Relaxed)
    }

    /// Write every dirty line back, as on a full cache clean.
    pub fn flush_all(&self) -> Result<()> {
        let mut cache = self.cache.lock()?;
        let mut phys = self.phys.phys.lock()?;
        for (&tag, line) in cache.iter_mut() {
            Self::store_dirty(&mut phys, tag, line);
        }
        Ok(())
    }

    fn store_dirty(phys: &mut [u8], tag: usize, line: &mut Line) {
        if line.dirty == 0 {
            return;
        }
        let base = tag * LINE;
        for i in 0..LINE {
            if line.dirty & (1 << i) != 0 {
                phys[base + i] = line.data[i];
            }
        }
        line.dirty = 0;
    }

    fn line<'a>(&self, cache: &'a mut BTreeMap<usize, Line>, tag: usize) -> Result<&'a mut Line> {
        match cache.entry(tag) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let phys = self.phys.phys.lock()?;
                let mut data = [0u8; LINE];
                data.copy_from_slice(&phys[tag * LINE..(tag + 1) * LINE]);
                Ok(v.insert(Line { data, dirty: 0 }))
            }
        }
    }

    /// Walk `[off, off + len)` line by line: `(line index, offset in line,
    /// offset in buffer, length)`.
    fn chunks(off: usize, len: usize) -> impl Iterator<Item = (usize, usize, usize, usize)> {
        let mut done = 0;
        std::iter::from_fn(move || {
            if done >= len {
                return None;
            }
            let pos = off + done;
            let at = pos % LINE;
            let n = (LINE - at).min(len - done);
            let chunk = (pos / LINE, at, done, n);
            done += n;
            Some(chunk)
        })
    }

    /// Line indices covering `[off, off + len)`.
    fn lines(off: usize, len: usize) -> std::ops::RangeInclusive<usize> {
        let last = (off + len.max(1) - 1) / LINE;
        off / LINE..=last
    }
}

impl MemOps for CoreMem {
    type Error = IpcError;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize> {
        let off = self.phys.offset(addr, dst.len())?;
        if self.coherent {
            let phys = self.phys.phys.lock()?;
            dst.copy_from_slice(&phys[off..off + dst.len()]);
            return Ok(dst.len());
        }
        let mut cache = self.cache.lock()?;
        for (tag, at, pos, n) in Self::chunks(off, dst.len()) {
            let line = self.line(&mut cache, tag)?;
            dst[pos..pos + n].copy_from_slice(&line.data[at..at + n]);
        }
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize> {
        let off = self.phys.offset(addr, src.len())?;
        if self.coherent {
            let mut phys = self.phys.phys.lock()?;
            phys[off..off + src.len()].copy_from_slice(src);
            return Ok(src.len());
        }
        let mut cache = self.cache.lock()?;
        for (tag, at, pos, n) in Self::chunks(off, src.len()) {
            let line = self.line(&mut cache, tag)?;
            line.data[at..at + n].copy_from_slice(&src[pos..pos + n]);
            line.dirty |= byte_mask(at, n);
        }
        Ok(src.len())
    }

    fn load_acquire(&self, addr: u64) -> Result<u16> {
        let mut raw = [0u8; 2];
        self.read(addr, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<()> {
        self.write(addr, &val.to_le_bytes())?;
        Ok(())
    }

    fn load_acquire_u32(&self, addr: u64) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read(addr, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn store_release_u32(&self, addr: u64, val: u32) -> Result<()> {
        self.write(addr, &val.to_le_bytes())?;
        Ok(())
    }
}

impl CacheOps for CoreMem {
    /// Only bytes this core wrote are copied back, so two cores writing
    /// disjoint bytes of one line do not clobber each other.
    fn writeback(&self, addr: u64, len: usize) -> Result<()> {
        let off = self.phys.offset(addr, len)?;
        if self.coherent {
            return Ok(());
        }
        self.writebacks.fetch_add(1, Ordering::Relaxed);
        let mut cache = self.cache.lock()?;
        let mut phys = self.phys.phys.lock()?;
        for tag in Self::lines(off, len) {
            if let Some(line) = cache.get_mut(&tag) {
                Self::store_dirty(&mut phys, tag, line);
            }
        }
        Ok(())
    }

    fn invalidate(&self, addr: u64, len: usize) -> Result<()> {
        let off = self.phys.offset(addr, len)?;
        if self.coherent {
            return Ok(());
        }
        self.invalidates.fetch_add(1, Ordering::Relaxed);
        let mut cache = self.cache.lock()?;
        for tag in Self::lines(off, len) {
            if let Some(line) = cache.remove(&tag)
                && line.dirty != 0
            {
                log::trace!("{}: invalidate discarded dirty line {tag}", self.core);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mcipc_common::xlate::AddressTranslator;

    use super::*;

    fn two_cores(coherent: bool) -> (Arc<SimMemory>, Arc<CoreMem>, Arc<CoreMem>) {
        let mem = Arc::new(SimMemory::new(4 * LINE).unwrap());
        let a = mem.core_view(ProcId(0), coherent);
        let b = mem.core_view(ProcId(1), coherent);
        (mem, a, b)
    }

    #[test]
    fn writes_stay_private_until_written_back() {
        let (mem, a, b) = two_cores(false);
        a.write(LOCAL_BASE, &[1, 2, 3, 4]).unwrap();

        let mut raw = [0u8; 4];
        mem.peek(LOCAL_BASE, &mut raw).unwrap();
        assert_eq!(raw, [0; 4]);
        b.read(LOCAL_BASE, &mut raw).unwrap();
        assert_eq!(raw, [0; 4]);

        a.writeback(LOCAL_BASE, 4).unwrap();
        // b still holds the stale line
        b.read(LOCAL_BASE, &mut raw).unwrap();
        assert_eq!(raw, [0; 4]);

        b.invalidate(LOCAL_BASE, 4).unwrap();
        b.read(LOCAL_BASE, &mut raw).unwrap();
        assert_eq!(raw, [1, 2, 3, 4]);
    }

    #[test]
    fn writeback_is_byte_precise() {
        let (mem, a, b) = two_cores(false);
        a.store_release_u32(LOCAL_BASE, 0xAAAA_AAAA).unwrap();
        b.store_release_u32(LOCAL_BASE + 64, 0xBBBB_BBBB).unwrap();
        a.writeback(LOCAL_BASE, LINE).unwrap();
        b.writeback(LOCAL_BASE, LINE).unwrap();

        let mut raw = [0u8; 4];
        mem.peek(LOCAL_BASE, &mut raw).unwrap();
        assert_eq!(u32::from_le_bytes(raw), 0xAAAA_AAAA);
        mem.peek(LOCAL_BASE + 64, &mut raw).unwrap();
        assert_eq!(u32::from_le_bytes(raw), 0xBBBB_BBBB);
    }

    #[test]
    fn invalidate_discards_dirty_bytes() {
        let (mem, a, _) = two_cores(false);
        a.store_release(LOCAL_BASE + LINE as u64, 7).unwrap();
        a.invalidate(LOCAL_BASE + LINE as u64, 2).unwrap();
        assert_eq!(a.load_acquire(LOCAL_BASE + LINE as u64).unwrap(), 0);
        assert_eq!(a.cached_lines().unwrap(), 1);
        let mut raw = [0u8; 2];
        mem.peek(LOCAL_BASE + LINE as u64, &mut raw).unwrap();
        assert_eq!(raw, [0, 0]);
    }

    #[test]
    fn accesses_spanning_lines() {
        let (_, a, b) = two_cores(false);
        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        a.write(LOCAL_BASE + 100, &data).unwrap();
        a.writeback(LOCAL_BASE + 100, data.len()).unwrap();
        let mut back = vec![0u8; data.len()];
        b.read(LOCAL_BASE + 100, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(b.cached_lines().unwrap(), 3);
    }

    #[test]
    fn coherent_view_bypasses_cache() {
        let (_, a, b) = two_cores(true);
        a.store_release_u32(LOCAL_BASE + 8, 42).unwrap();
        assert_eq!(b.load_acquire_u32(LOCAL_BASE + 8).unwrap(), 42);
        a.writeback(LOCAL_BASE, 16).unwrap();
        assert_eq!(a.writebacks(), 0);
        assert_eq!(a.cached_lines().unwrap(), 0);
    }

    #[test]
    fn flush_all_cleans_every_line() {
        let (mem, a, _) = two_cores(false);
        a.write(LOCAL_BASE, &[9]).unwrap();
        a.write(LOCAL_BASE + 3 * LINE as u64, &[8]).unwrap();
        a.flush_all().unwrap();
        let mut raw = [0u8; 1];
        mem.peek(LOCAL_BASE + 3 * LINE as u64, &mut raw).unwrap();
        assert_eq!(raw, [8]);
    }

    #[test]
    fn out_of_bounds() {
        let (mem, a, _) = two_cores(false);
        let mut raw = [0u8; 8];
        assert!(matches!(
            a.read(LOCAL_BASE - 8, &mut raw),
            Err(IpcError::BoundsCheckFailed(_, _))
        ));
        assert!(matches!(
            a.read(LOCAL_BASE + mem.size() as u64 - 4, &mut raw),
            Err(IpcError::BoundsCheckFailed(_, _))
        ));
        assert!(a.writeback(LOCAL_BASE + mem.size() as u64, 1).is_err());
    }

    #[test]
    fn window_maps_the_region() {
        let (mem, _, _) = two_cores(false);
        let w = mem.window();
        assert_eq!(w.to_shared(LOCAL_BASE + 0x40), Some(SHARED_BASE + 0x40));
        assert_eq!(w.to_local(SHARED_BASE), Some(LOCAL_BASE));
        assert_eq!(w.to_shared(LOCAL_BASE + mem.size() as u64), None);
    }
}
