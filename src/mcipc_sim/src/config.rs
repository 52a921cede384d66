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

use std::cmp::{max, min};
use std::time::Duration;

use mcipc_common::msgq::MsgHeader;
use mcipc_common::{CACHE_LINE_SIZE, VRING_ALIGN};
use tracing::{Span, instrument};

/// The complete set of configuration needed to build an [`IpcSystem`](crate::IpcSystem)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IpcConfiguration {
    /// Entries in each vring of a virtio link. Always a power of two.
    ring_entries: u16,
    /// Alignment of the used ring, and of each vring in a link region.
    vring_align: usize,
    /// Slots in each direction of a circular queue. Always a power of two.
    circ_num_msgs: u32,
    /// Slot size of the message-copying circular transport.
    circ_entry_size: usize,
    /// Blocks in the message heap of each link.
    heap_blocks: u32,
    /// Whether shared memory is cached without coherency.
    ///
    /// When false every core sees every write at once and the stack skips
    /// cache maintenance.
    cache_enabled: bool,
    /// Payloads each mailbox FIFO holds before kicks are refused.
    mailbox_depth: u32,
    /// How long a send may spin on a full queue, in milliseconds.
    send_timeout: u16,
}

impl IpcConfiguration {
    /// The default number of vring entries
    pub const DEFAULT_RING_ENTRIES: u16 = 64;
    /// The minimum number of vring entries
    pub const MIN_RING_ENTRIES: u16 = 2;
    /// The maximum number of vring entries
    pub const MAX_RING_ENTRIES: u16 = 1024;
    /// The default vring alignment
    pub const DEFAULT_VRING_ALIGN: usize = VRING_ALIGN;
    /// The minimum vring alignment
    pub const MIN_VRING_ALIGN: usize = CACHE_LINE_SIZE;
    /// The maximum vring alignment
    pub const MAX_VRING_ALIGN: usize = 0x1_0000;
    /// The default number of circular queue slots
    pub const DEFAULT_CIRC_NUM_MSGS: u32 = 32;
    /// The minimum number of circular queue slots
    pub const MIN_CIRC_NUM_MSGS: u32 = 2;
    /// The maximum number of circular queue slots
    pub const MAX_CIRC_NUM_MSGS: u32 = 1024;
    /// The default circular transport slot size
    pub const DEFAULT_CIRC_ENTRY_SIZE: usize = 256;
    /// The minimum circular transport slot size, an empty message
    pub const MIN_CIRC_ENTRY_SIZE: usize = MsgHeader::SIZE;
    /// The maximum circular transport slot size
    pub const MAX_CIRC_ENTRY_SIZE: usize = 4096;
    /// The default number of message heap blocks
    pub const DEFAULT_HEAP_BLOCKS: u32 = 64;
    /// The minimum number of message heap blocks
    pub const MIN_HEAP_BLOCKS: u32 = 1;
    /// The maximum number of message heap blocks
    pub const MAX_HEAP_BLOCKS: u32 = 4096;
    /// The default mailbox FIFO depth
    pub const DEFAULT_MAILBOX_DEPTH: u32 = 4;
    /// The minimum mailbox FIFO depth
    pub const MIN_MAILBOX_DEPTH: u32 = 1;
    /// The maximum mailbox FIFO depth
    pub const MAX_MAILBOX_DEPTH: u32 = 256;
    /// The default send timeout (in milliseconds)
    pub const DEFAULT_SEND_TIMEOUT: u16 = 100;
    /// The minimum send timeout (in milliseconds)
    pub const MIN_SEND_TIMEOUT: u16 = 1;
    /// The maximum send timeout (in milliseconds)
    pub const MAX_SEND_TIMEOUT: u16 = u16::MAX;

    /// Set the number of entries in each vring. The value is clamped to
    /// `MIN_RING_ENTRIES..=MAX_RING_ENTRIES` and rounded up to a power of two.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_ring_entries(&mut self, entries: u16) {
        let n = min(Self::MAX_RING_ENTRIES, max(entries, Self::MIN_RING_ENTRIES));
        self.ring_entries = n.next_power_of_two();
    }

    /// Get the number of entries in each vring
    pub fn get_ring_entries(&self) -> u16 {
        self.ring_entries
    }

    /// Set the vring alignment. Clamped to `MIN_VRING_ALIGN..=MAX_VRING_ALIGN`
    /// and rounded up to a power of two.
    pub fn set_vring_align(&mut self, align: usize) {
        let a = min(Self::MAX_VRING_ALIGN, max(align, Self::MIN_VRING_ALIGN));
        self.vring_align = a.next_power_of_two();
    }

    /// Get the vring alignment
    pub fn get_vring_align(&self) -> usize {
        self.vring_align
    }

    /// Set the number of slots in each circular queue direction. Clamped
    /// and rounded up to a power of two.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_circ_num_msgs(&mut self, num_msgs: u32) {
        let n = min(
            Self::MAX_CIRC_NUM_MSGS,
            max(num_msgs, Self::MIN_CIRC_NUM_MSGS),
        );
        self.circ_num_msgs = n.next_power_of_two();
    }

    /// Get the number of circular queue slots
    pub fn get_circ_num_msgs(&self) -> u32 {
        self.circ_num_msgs
    }

    /// Set the slot size of the message-copying circular transport. Clamped
    /// and rounded up to a multiple of 4.
    pub fn set_circ_entry_size(&mut self, size: usize) {
        let s = min(
            Self::MAX_CIRC_ENTRY_SIZE,
            max(size, Self::MIN_CIRC_ENTRY_SIZE),
        );
        self.circ_entry_size = s.next_multiple_of(4);
    }

    /// Get the circular transport slot size
    pub fn get_circ_entry_size(&self) -> usize {
        self.circ_entry_size
    }

    /// Set the number of message heap blocks per link
    pub fn set_heap_blocks(&mut self, blocks: u32) {
        self.heap_blocks = min(Self::MAX_HEAP_BLOCKS, max(blocks, Self::MIN_HEAP_BLOCKS));
    }

    /// Get the number of message heap blocks per link
    pub fn get_heap_blocks(&self) -> u32 {
        self.heap_blocks
    }

    /// Turn simulated non-coherent caching on or off
    pub fn set_cache_enabled(&mut self, enabled: bool) {
        self.cache_enabled = enabled;
    }

    /// Is shared memory cached without coherency?
    pub fn get_cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    /// Set the mailbox FIFO depth
    pub fn set_mailbox_depth(&mut self, depth: u32) {
        self.mailbox_depth = min(
            Self::MAX_MAILBOX_DEPTH,
            max(depth, Self::MIN_MAILBOX_DEPTH),
        );
    }

    /// Get the mailbox FIFO depth
    pub fn get_mailbox_depth(&self) -> u32 {
        self.mailbox_depth
    }

    /// Set how long a send may wait for room. If set to 0, the timeout will
    /// be set to the default value of `DEFAULT_SEND_TIMEOUT`; the minimum
    /// value is `MIN_SEND_TIMEOUT`.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_send_timeout(&mut self, timeout: Duration) {
        match timeout.as_millis() {
            0 => self.send_timeout = Self::DEFAULT_SEND_TIMEOUT,
            1.. => {
                self.send_timeout = min(
                    Self::MAX_SEND_TIMEOUT.into(),
                    max(timeout.as_millis(), Self::MIN_SEND_TIMEOUT.into()),
                ) as u16
            }
        }
    }

    /// Get the send timeout
    pub fn get_send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout as u64)
    }

    /// Cache line size shared layouts are built for. Fixed at compile time.
    pub const fn cache_line_size(&self) -> usize {
        CACHE_LINE_SIZE
    }
}

impl Default for IpcConfiguration {
    fn default() -> Self {
        Self {
            ring_entries: Self::DEFAULT_RING_ENTRIES,
            vring_align: Self::DEFAULT_VRING_ALIGN,
            circ_num_msgs: Self::DEFAULT_CIRC_NUM_MSGS,
            circ_entry_size: Self::DEFAULT_CIRC_ENTRY_SIZE,
            heap_blocks: Self::DEFAULT_HEAP_BLOCKS,
            cache_enabled: true,
            mailbox_depth: Self::DEFAULT_MAILBOX_DEPTH,
            send_timeout: Self::DEFAULT_SEND_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::IpcConfiguration;

    #[test]
    fn overrides() {
        let mut cfg = IpcConfiguration::default();
        cfg.set_ring_entries(16);
        cfg.set_circ_num_msgs(8);
        cfg.set_circ_entry_size(128);
        cfg.set_heap_blocks(10);
        cfg.set_cache_enabled(false);
        cfg.set_mailbox_depth(8);
        cfg.set_send_timeout(Duration::from_millis(250));

        assert_eq!(cfg.get_ring_entries(), 16);
        assert_eq!(cfg.get_circ_num_msgs(), 8);
        assert_eq!(cfg.get_circ_entry_size(), 128);
        assert_eq!(cfg.get_heap_blocks(), 10);
        assert!(!cfg.get_cache_enabled());
        assert_eq!(cfg.get_mailbox_depth(), 8);
        assert_eq!(cfg.get_send_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn min_and_max_are_enforced() {
        let mut cfg = IpcConfiguration::default();
        cfg.set_ring_entries(0);
        cfg.set_circ_num_msgs(u32::MAX);
        cfg.set_circ_entry_size(1);
        cfg.set_heap_blocks(0);
        cfg.set_mailbox_depth(0);
        cfg.set_vring_align(1);
        assert_eq!(cfg.get_ring_entries(), IpcConfiguration::MIN_RING_ENTRIES);
        assert_eq!(cfg.get_circ_num_msgs(), IpcConfiguration::MAX_CIRC_NUM_MSGS);
        assert_eq!(
            cfg.get_circ_entry_size(),
            IpcConfiguration::MIN_CIRC_ENTRY_SIZE
        );
        assert_eq!(cfg.get_heap_blocks(), IpcConfiguration::MIN_HEAP_BLOCKS);
        assert_eq!(cfg.get_mailbox_depth(), IpcConfiguration::MIN_MAILBOX_DEPTH);
        assert_eq!(cfg.get_vring_align(), IpcConfiguration::MIN_VRING_ALIGN);

        cfg.set_send_timeout(Duration::from_secs(3600));
        assert_eq!(
            cfg.get_send_timeout(),
            Duration::from_millis(IpcConfiguration::MAX_SEND_TIMEOUT as u64)
        );
    }

    #[test]
    fn rounding() {
        let mut cfg = IpcConfiguration::default();
        cfg.set_ring_entries(100);
        assert_eq!(cfg.get_ring_entries(), 128);
        cfg.set_circ_num_msgs(5);
        assert_eq!(cfg.get_circ_num_msgs(), 8);
        cfg.set_circ_entry_size(61);
        assert_eq!(cfg.get_circ_entry_size(), 64);
        cfg.set_send_timeout(Duration::ZERO);
        assert_eq!(
            cfg.get_send_timeout(),
            Duration::from_millis(IpcConfiguration::DEFAULT_SEND_TIMEOUT as u64)
        );
    }
}
