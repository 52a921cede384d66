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

//! Split Vring Layout
//!
//! The wire format shared by both peers. A vring of `num` entries is one
//! contiguous block:
//!
//! ```text
//! base ─┬─ desc[num]        16 bytes each, written by the driver
//!       ├─ avail.flags      u16, driver
//!       ├─ avail.idx        u16, driver
//!       ├─ avail.ring[num]  u16 descriptor heads, driver
//!       ├─ avail.used_event u16
//!       │  (padding up to `align`)
//!       ├─ used.flags       u16, device
//!       ├─ used.idx         u16, device
//!       ├─ used.ring[num]   {id: u32, len: u32}, device
//!       └─ used.avail_event u16
//! ```
//!
//! `avail.idx` and `used.idx` are free running 16-bit counters. A slot is
//! `idx & (num - 1)`, so `num` must be a power of two and the counters wrap
//! independently of the slot position.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::align_up;

bitflags! {
    /// Flags in `avail.flags`, written by the driver.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AvailFlags: u16 {
        /// The driver does not want an interrupt when buffers are used.
        const NO_INTERRUPT = VRING_AVAIL_F_NO_INTERRUPT;
    }
}

bitflags! {
    /// Flags in `used.flags`, written by the device.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct UsedFlags: u16 {
        /// The device does not want a kick when buffers are added.
        const NO_NOTIFY = VRING_USED_F_NO_NOTIFY;
    }
}

bitflags! {
    /// Descriptor flags. Chaining is not used; only `WRITE` is meaningful.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DescFlags: u16 {
        const NEXT     = 1 << 0;
        const WRITE    = 1 << 1;
        const INDIRECT = 1 << 2;
    }
}

pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;
pub const VRING_USED_F_NO_NOTIFY: u16 = 1;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("No free descriptors")]
    RingFull,
    #[error("Descriptor index {0} out of range or not in flight")]
    InvalidDescriptor(u16),
    #[error("Invalid memory layout")]
    InvalidLayout,
    #[error("Address {0:#x} has no shared-space translation")]
    TranslationFailed(u64),
    #[error("Operation not valid for this side of the ring")]
    WrongRole,
    #[error("Backend memory error")]
    MemError,
}

/// One descriptor table entry.
///
/// The 32-bit pad after `addr` keeps the entry byte-identical to a
/// little-endian virtio descriptor with a 64-bit address whose high half is
/// zero.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct VringDesc {
    /// Shared-space address of the buffer.
    pub addr: u32,
    pub pad: u32,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

const _: () = assert!(core::mem::size_of::<VringDesc>() == 16);
const _: () = assert!(core::mem::offset_of!(VringDesc, len) == 8);
const _: () = assert!(core::mem::offset_of!(VringDesc, flags) == 12);
const _: () = assert!(core::mem::offset_of!(VringDesc, next) == 14);

impl VringDesc {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const ALIGN: usize = 16;

    pub fn new(addr: u32, len: u32, flags: DescFlags) -> Self {
        Self {
            addr,
            pad: 0,
            len,
            flags: flags.bits(),
            next: 0,
        }
    }

    #[inline]
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }
}

/// One used ring element: which head completed and how many bytes the
/// device wrote into it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct VringUsedElem {
    pub id: u32,
    pub len: u32,
}

const _: () = assert!(core::mem::size_of::<VringUsedElem>() == 8);

/// Addresses of every vring sub-structure, computed once from the base.
///
/// Both peers compute the same layout from `(num, align)`, only the base
/// differs when the two cores map the ring at different local addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VringLayout {
    /// Number of descriptors, a power of two.
    pub num: u16,
    /// Descriptor table base.
    pub desc_addr: u64,
    /// `avail.flags`; `avail.idx` and the ring follow.
    pub avail_addr: u64,
    /// `used.flags`, aligned to the ring alignment.
    pub used_addr: u64,
}

impl VringLayout {
    const AVAIL_HDR: usize = 4;
    const USED_HDR: usize = 4;

    /// Lay out a vring of `num` descriptors at `base`.
    ///
    /// `num` must be a non-zero power of two, `align` a power of two of at
    /// least 16 and `base` a multiple of `align`. The region starting at
    /// `base` must be at least [`query_size`](Self::query_size) bytes.
    pub const fn from_base(base: u64, num: u16, align: usize) -> Result<Self, RingError> {
        if num == 0 || !num.is_power_of_two() {
            return Err(RingError::InvalidLayout);
        }
        if align < VringDesc::ALIGN || !align.is_power_of_two() {
            return Err(RingError::InvalidLayout);
        }
        if !base.is_multiple_of(align as u64) {
            return Err(RingError::InvalidLayout);
        }

        let n = num as usize;
        let avail_off = n * VringDesc::SIZE;
        let used_off = align_up(avail_off + Self::AVAIL_HDR + 2 * n + 2, align);

        Ok(Self {
            num,
            desc_addr: base,
            avail_addr: base + avail_off as u64,
            used_addr: base + used_off as u64,
        })
    }

    /// Total bytes needed for a vring of `num` descriptors.
    pub const fn query_size(num: usize, align: usize) -> usize {
        let desc_and_avail = num * VringDesc::SIZE + 2 * (3 + num);
        align_up(desc_and_avail, align) + 2 * 3 + num * size_of::<VringUsedElem>()
    }

    /// Slot for a free running index.
    #[inline]
    pub const fn slot(&self, idx: u16) -> u16 {
        idx & (self.num - 1)
    }

    /// Address of descriptor `i`, `None` when out of range.
    #[inline]
    pub fn desc(&self, i: u16) -> Option<u64> {
        (i < self.num).then(|| self.desc_addr + i as u64 * VringDesc::SIZE as u64)
    }

    /// Bytes from the descriptor table to the end of the avail ring.
    #[inline]
    pub fn driver_area_len(&self) -> usize {
        (self.used_event() - self.desc_addr) as usize + 2
    }

    #[inline]
    pub fn avail_flags(&self) -> u64 {
        self.avail_addr
    }

    #[inline]
    pub fn avail_idx(&self) -> u64 {
        self.avail_addr + 2
    }

    /// Address of the avail ring entry for a free running index.
    #[inline]
    pub fn avail_slot(&self, idx: u16) -> u64 {
        self.avail_addr + Self::AVAIL_HDR as u64 + 2 * self.slot(idx) as u64
    }

    #[inline]
    pub fn used_event(&self) -> u64 {
        self.avail_addr + Self::AVAIL_HDR as u64 + 2 * self.num as u64
    }

    #[inline]
    pub fn used_flags(&self) -> u64 {
        self.used_addr
    }

    #[inline]
    pub fn used_idx(&self) -> u64 {
        self.used_addr + 2
    }

    /// Address of the used ring element for a free running index.
    #[inline]
    pub fn used_elem(&self, idx: u16) -> u64 {
        self.used_addr
            + Self::USED_HDR as u64
            + size_of::<VringUsedElem>() as u64 * self.slot(idx) as u64
    }

    #[inline]
    pub fn avail_event(&self) -> u64 {
        self.used_addr + Self::USED_HDR as u64 + size_of::<VringUsedElem>() as u64 * self.num as u64
    }

    /// One past the last byte of the ring.
    #[inline]
    pub fn end(&self) -> u64 {
        self.avail_event() + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_size_matches_classic_vring_size() {
        // ((16 * 256 + 2 * (3 + 256) + 4095) & !4095) + 2 * 3 + 8 * 256
        assert_eq!(VringLayout::query_size(256, 4096), 8192 + 6 + 2048);
        assert_eq!(VringLayout::query_size(4, 4096), 4096 + 6 + 32);
        assert_eq!(VringLayout::query_size(4, 16), 64 + 16 + 6 + 32);
    }

    #[test]
    fn layout_offsets() {
        let base = 0x10_0000;
        let l = VringLayout::from_base(base, 4, 4096).unwrap();
        assert_eq!(l.desc_addr, base);
        assert_eq!(l.avail_flags(), base + 64);
        assert_eq!(l.avail_idx(), base + 66);
        assert_eq!(l.avail_slot(0), base + 68);
        assert_eq!(l.avail_slot(5), base + 70);
        assert_eq!(l.used_event(), base + 76);
        assert_eq!(l.used_flags(), base + 4096);
        assert_eq!(l.used_idx(), base + 4098);
        assert_eq!(l.used_elem(3), base + 4100 + 24);
        assert_eq!(l.used_elem(7), l.used_elem(3));
        assert_eq!(l.end() - base, VringLayout::query_size(4, 4096) as u64);
        assert_eq!(l.driver_area_len(), 78);
    }

    #[test]
    fn every_size_fits_query_size() {
        for shift in 0..10 {
            let num = 1u16 << shift;
            for align in [16usize, 64, 4096] {
                let l = VringLayout::from_base(0, num, align).unwrap();
                assert_eq!(l.end() as usize, VringLayout::query_size(num as usize, align));
                assert_eq!(l.used_addr as usize % align, 0);
            }
        }
    }

    #[test]
    fn rejects_bad_parameters() {
        assert_eq!(VringLayout::from_base(0, 0, 4096), Err(RingError::InvalidLayout));
        assert_eq!(VringLayout::from_base(0, 6, 4096), Err(RingError::InvalidLayout));
        assert_eq!(VringLayout::from_base(0, 8, 100), Err(RingError::InvalidLayout));
        assert_eq!(VringLayout::from_base(0, 8, 8), Err(RingError::InvalidLayout));
        assert_eq!(VringLayout::from_base(0x10, 8, 4096), Err(RingError::InvalidLayout));
    }

    #[test]
    fn desc_bounds() {
        let l = VringLayout::from_base(0x2000, 8, 4096).unwrap();
        assert_eq!(l.desc(7), Some(0x2000 + 7 * 16));
        assert_eq!(l.desc(8), None);
    }

    #[test]
    fn slot_wraps_independently_of_index() {
        let l = VringLayout::from_base(0, 4, 4096).unwrap();
        assert_eq!(l.slot(u16::MAX), 3);
        assert_eq!(l.slot(u16::MAX.wrapping_add(1)), 0);
    }
}
