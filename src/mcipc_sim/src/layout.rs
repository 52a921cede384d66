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

use std::fmt::Debug;

use mcipc_common::CACHE_LINE_SIZE;
use mcipc_common::circ::CircLayout;
use mcipc_common::notify::EVENT_ENTRY_SIZE;
use mcipc_common::transport::shm_circ;
use mcipc_common::vring::VringLayout;
use tracing::{Span, instrument};

use crate::HEAP_BLOCK_SIZE;
use crate::config::IpcConfiguration;
use crate::error::IpcError;

/// Bytes a `TransportShm` needs: attributes plus two list heads, a line each.
const SHM_SIZE: usize = 3 * CACHE_LINE_SIZE;

#[inline]
fn align_up(val: usize, align: usize) -> usize {
    val.next_multiple_of(align)
}

/// Offsets of everything one link between two cores keeps in shared
/// memory, relative to the start of the link region.
///
/// Every link region has the same shape whatever transport runs over it:
///
/// ```text
/// +---------------------------+ 0
/// | notify queues (2 x circ)  |
/// +---------------------------+ shm_offset
/// | TransportShm attrs+lists  |
/// +---------------------------+ shm_circ_offset
/// | pointer queues (2 x circ) |
/// +---------------------------+ circ_offset
/// | message slots (2 x circ)  |
/// +---------------------------+ vring_offset[0]   (vring_align)
/// | vring host -> remote      |
/// +---------------------------+ vring_offset[1]   (vring_align)
/// | vring remote -> host      |
/// +---------------------------+ heap_offset       (block size)
/// | message heap              |
/// +---------------------------+ pool_offset       (block size)
/// | virtio buffer pool        |
/// +---------------------------+ link_size         (vring_align)
/// ```
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    num_cores: u16,
    shm_offset: usize,
    shm_circ_offset: usize,
    circ_offset: usize,
    vring_offset: [usize; 2],
    heap_offset: usize,
    heap_size: usize,
    pool_offset: usize,
    pool_size: usize,
    link_size: usize,
}

impl Debug for MemoryLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLayout")
            .field("Num Cores", &self.num_cores)
            .field("Shm Offset", &format_args!("{:#x}", self.shm_offset))
            .field("Shm Circ Offset", &format_args!("{:#x}", self.shm_circ_offset))
            .field("Circ Offset", &format_args!("{:#x}", self.circ_offset))
            .field("Vring Offsets", &format_args!("{:#x?}", self.vring_offset))
            .field("Heap Offset", &format_args!("{:#x}", self.heap_offset))
            .field("Pool Offset", &format_args!("{:#x}", self.pool_offset))
            .field("Link Size", &format_args!("{:#x}", self.link_size))
            .finish()
    }
}

impl MemoryLayout {
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn new(cfg: &IpcConfiguration, num_cores: u16) -> crate::Result<Self> {
        if num_cores < 2 {
            return Err(IpcError::Error(format!(
                "a system needs at least two cores, got {num_cores}"
            )));
        }
        let line = CACHE_LINE_SIZE;
        let n = cfg.get_circ_num_msgs() as usize;
        let align = cfg.get_vring_align();
        let entries = cfg.get_ring_entries() as usize;

        let notify_size = 2 * CircLayout::query_size(n, EVENT_ENTRY_SIZE);
        let shm_offset = align_up(notify_size, line);
        let shm_circ_offset = align_up(shm_offset + SHM_SIZE, line);
        let circ_offset = align_up(shm_circ_offset + 2 * CircLayout::query_size(n, shm_circ::ENTRY_SIZE), line);
        let circ_size = 2 * CircLayout::query_size(n, cfg.get_circ_entry_size());

        let vring_size = align_up(VringLayout::query_size(entries, align), align);
        let vring0 = align_up(circ_offset + circ_size, align);
        let vring1 = vring0 + vring_size;

        let heap_offset = align_up(vring1 + vring_size, HEAP_BLOCK_SIZE);
        let heap_size = cfg.get_heap_blocks() as usize * HEAP_BLOCK_SIZE;
        // receive buffers stay posted while as many transmit buffers are in flight
        let pool_offset = heap_offset + heap_size;
        let pool_size = 2 * entries * HEAP_BLOCK_SIZE;
        let link_size = align_up(pool_offset + pool_size, align);

        Ok(Self {
            num_cores,
            shm_offset,
            shm_circ_offset,
            circ_offset,
            vring_offset: [vring0, vring1],
            heap_offset,
            heap_size,
            pool_offset,
            pool_size,
            link_size,
        })
    }

    pub fn num_links(&self) -> usize {
        let n = self.num_cores as usize;
        n * (n - 1) / 2
    }

    /// Index of the link between `a` and `b`, in either order.
    pub fn link_index(&self, a: u16, b: u16) -> Option<usize> {
        let (lo, hi) = (a.min(b) as usize, a.max(b) as usize);
        let n = self.num_cores as usize;
        if lo == hi || hi >= n {
            return None;
        }
        // links of every core below lo come first
        Some(lo * (2 * n - lo - 1) / 2 + (hi - lo - 1))
    }

    /// Offset of the link region between `a` and `b`.
    pub fn link_offset(&self, a: u16, b: u16) -> Option<usize> {
        self.link_index(a, b).map(|i| i * self.link_size)
    }

    /// Bytes of shared memory the whole system needs.
    pub fn total_size(&self) -> usize {
        self.num_links() * self.link_size
    }

    pub fn link_size(&self) -> usize {
        self.link_size
    }

    pub fn notify_offset(&self) -> usize {
        0
    }

    pub fn shm_offset(&self) -> usize {
        self.shm_offset
    }

    pub fn shm_circ_offset(&self) -> usize {
        self.shm_circ_offset
    }

    pub fn circ_offset(&self) -> usize {
        self.circ_offset
    }

    /// Ring 0 carries host to remote, ring 1 remote to host.
    pub fn vring_offset(&self, ring: usize) -> usize {
        self.vring_offset[ring & 1]
    }

    pub fn heap_offset(&self) -> usize {
        self.heap_offset
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn pool_offset(&self) -> usize {
        self.pool_offset
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}
