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

//! Fixed Slot Circular Queues
//!
//! A [`CircQueue`] is one endpoint of a pair of one-way channels. Each
//! direction is laid out as:
//!
//! ```text
//! base                    write_index: u32   (sender writes)
//! base + CACHE_LINE       read_index:  u32   (receiver writes)
//! base + 2 * CACHE_LINE   entries[num_msgs], entry_size bytes each
//! ```
//!
//! The two index words live on separate cache lines so each line has a
//! single writer. Indices are stored masked to `num_msgs - 1`; a direction
//! is full when `((write_index + 1) & max_index) == read_index`, so it holds
//! at most `num_msgs - 1` entries.

use alloc::vec;
use core::cmp::max;

use thiserror::Error;

use crate::cache::CacheMaint;
use crate::channel::ChannelError;
use crate::deadline::WaitMode;
use crate::mem::CacheOps;
use crate::{CACHE_LINE_SIZE, align_up};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircError {
    #[error("Queue is full")]
    QueueFull,
    #[error("Timed out waiting for the peer to drain")]
    Timeout,
    #[error("Entry of {0} bytes does not fit a slot")]
    EntryTooLarge(usize),
    #[error("Invalid memory layout")]
    InvalidLayout,
    #[error("Failed to signal peer: {0}")]
    SignalFailure(ChannelError),
    #[error("Invalid event id {0}")]
    InvalidEvent(u32),
    #[error("Backend memory error")]
    MemError,
}

/// Addresses of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircLayout {
    base: u64,
    num_msgs: u32,
    entry_size: usize,
}

impl CircLayout {
    /// Bytes needed by one direction.
    pub const fn query_size(num_msgs: usize, entry_size: usize) -> usize {
        2 * CACHE_LINE_SIZE + align_up(num_msgs * entry_size, CACHE_LINE_SIZE)
    }

    /// `num_msgs` must be a power of two of at least 2, `entry_size` a
    /// non-zero multiple of 4 and `base` cache line aligned.
    pub fn from_base(base: u64, num_msgs: u32, entry_size: usize) -> Result<Self, CircError> {
        if num_msgs < 2 || !num_msgs.is_power_of_two() {
            return Err(CircError::InvalidLayout);
        }
        if entry_size == 0 || !entry_size.is_multiple_of(4) {
            return Err(CircError::InvalidLayout);
        }
        if !base.is_multiple_of(CACHE_LINE_SIZE as u64) {
            return Err(CircError::InvalidLayout);
        }
        Ok(Self {
            base,
            num_msgs,
            entry_size,
        })
    }

    /// Both directions back to back from `base`.
    ///
    /// The creator sends on `[0]` and receives on `[1]`; the opener uses
    /// them the other way round.
    pub fn pair(base: u64, num_msgs: u32, entry_size: usize) -> Result<[Self; 2], CircError> {
        let first = Self::from_base(base, num_msgs, entry_size)?;
        let second = Self::from_base(base + first.size() as u64, num_msgs, entry_size)?;
        Ok([first, second])
    }

    #[inline]
    pub fn size(&self) -> usize {
        Self::query_size(self.num_msgs as usize, self.entry_size)
    }

    #[inline]
    pub fn num_msgs(&self) -> u32 {
        self.num_msgs
    }

    #[inline]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    #[inline]
    pub fn max_index(&self) -> u32 {
        self.num_msgs - 1
    }

    #[inline]
    pub fn write_index_addr(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn read_index_addr(&self) -> u64 {
        self.base + CACHE_LINE_SIZE as u64
    }

    #[inline]
    pub fn entry_addr(&self, index: u32) -> u64 {
        let slot = (index & self.max_index()) as u64;
        self.base + 2 * CACHE_LINE_SIZE as u64 + slot * self.entry_size as u64
    }

    /// Is a direction with these indices full?
    #[inline]
    pub fn is_full(&self, write_index: u32, read_index: u32) -> bool {
        ((write_index + 1) & self.max_index()) == read_index
    }

    /// Entries to consume between read index write-backs.
    #[inline]
    fn writeback_batch(&self) -> u32 {
        max(1, self.num_msgs / 4)
    }
}

/// One endpoint: sends on `tx`, receives on `rx`.
///
/// `send` and `drain` take `&self`; each direction's local index sits behind
/// its own short critical section so an ISR and a task on the same core
/// cannot interleave.
#[derive(Debug)]
pub struct CircQueue<M> {
    tx: CircLayout,
    rx: CircLayout,
    mem: CacheMaint<M>,
    write_index: spin::Mutex<u32>,
    read_index: spin::Mutex<u32>,
}

impl<M: CacheOps> CircQueue<M> {
    /// Initialise both directions and take the creator's side.
    pub fn create(tx: CircLayout, rx: CircLayout, mem: CacheMaint<M>) -> Result<Self, CircError> {
        check_compatible(&tx, &rx)?;
        for dir in [&tx, &rx] {
            mem.publish_u32(dir.write_index_addr(), 0)
                .map_err(|_| CircError::MemError)?;
            mem.publish_u32(dir.read_index_addr(), 0)
                .map_err(|_| CircError::MemError)?;
        }
        Ok(Self {
            tx,
            rx,
            mem,
            write_index: spin::Mutex::new(0),
            read_index: spin::Mutex::new(0),
        })
    }

    /// Attach to directions the peer initialised.
    pub fn open(tx: CircLayout, rx: CircLayout, mem: CacheMaint<M>) -> Result<Self, CircError> {
        check_compatible(&tx, &rx)?;
        let w = mem
            .fetch_u32(tx.write_index_addr())
            .map_err(|_| CircError::MemError)?;
        let r = mem
            .fetch_u32(rx.read_index_addr())
            .map_err(|_| CircError::MemError)?;
        Ok(Self {
            write_index: spin::Mutex::new(w & tx.max_index()),
            read_index: spin::Mutex::new(r & rx.max_index()),
            tx,
            rx,
            mem,
        })
    }

    /// Copy `entry` into the next slot and publish it.
    ///
    /// Returns the index the entry was written at. While the direction is
    /// full the behaviour follows `wait`; the critical section is released
    /// between polls.
    pub fn send(&self, entry: &[u8], wait: WaitMode<'_>) -> Result<u32, CircError> {
        if entry.len() > self.tx.entry_size {
            return Err(CircError::EntryTooLarge(entry.len()));
        }

        loop {
            {
                let mut w = self.write_index.lock();
                let r = self
                    .mem
                    .fetch_u32(self.tx.read_index_addr())
                    .map_err(|_| CircError::MemError)?;
                if !self.tx.is_full(*w, r & self.tx.max_index()) {
                    let at = *w;
                    self.mem
                        .publish(self.tx.entry_addr(at), entry)
                        .map_err(|_| CircError::MemError)?;
                    let next = (at + 1) & self.tx.max_index();
                    self.mem
                        .publish_u32(self.tx.write_index_addr(), next)
                        .map_err(|_| CircError::MemError)?;
                    *w = next;
                    return Ok(at);
                }
            }

            match wait {
                WaitMode::NoWait => return Err(CircError::QueueFull),
                WaitMode::Spin => core::hint::spin_loop(),
                WaitMode::Until(deadline) => {
                    if deadline.expired() {
                        return Err(CircError::Timeout);
                    }
                    core::hint::spin_loop();
                }
            }
        }
    }

    /// Deliver every entry up to the latest write index.
    ///
    /// The read index is stored after each entry and written back every
    /// `max(1, num_msgs / 4)` entries and once at the end. `f` runs with
    /// this direction's critical section held and must not drain the same
    /// queue. Returns the number of entries delivered.
    pub fn drain(&self, mut f: impl FnMut(&[u8])) -> Result<usize, CircError> {
        let mut r = self.read_index.lock();
        let max_index = self.rx.max_index();
        let batch = self.rx.writeback_batch();
        let read_addr = self.rx.read_index_addr();
        let mut buf = vec![0u8; self.rx.entry_size];
        let mut delivered = 0usize;
        let mut unflushed = 0u32;

        loop {
            let w = self
                .mem
                .fetch_u32(self.rx.write_index_addr())
                .map_err(|_| CircError::MemError)?
                & max_index;
            if w == *r {
                break;
            }
            while *r != w {
                self.mem
                    .fetch(self.rx.entry_addr(*r), &mut buf)
                    .map_err(|_| CircError::MemError)?;
                *r = (*r + 1) & max_index;
                self.mem
                    .mem()
                    .store_release_u32(read_addr, *r)
                    .map_err(|_| CircError::MemError)?;
                unflushed += 1;
                if unflushed == batch {
                    self.mem
                        .writeback(read_addr, 4)
                        .map_err(|_| CircError::MemError)?;
                    unflushed = 0;
                }
                delivered += 1;
                f(&buf);
            }
        }

        if unflushed > 0 {
            self.mem
                .writeback(read_addr, 4)
                .map_err(|_| CircError::MemError)?;
        }
        Ok(delivered)
    }

    /// Would a send fail right now?
    pub fn is_full(&self) -> Result<bool, CircError> {
        let w = self.write_index.lock();
        let r = self
            .mem
            .fetch_u32(self.tx.read_index_addr())
            .map_err(|_| CircError::MemError)?;
        Ok(self.tx.is_full(*w, r & self.tx.max_index()))
    }

    /// Slot size in bytes.
    #[inline]
    pub fn entry_size(&self) -> usize {
        self.tx.entry_size
    }

    #[inline]
    pub fn cache(&self) -> &CacheMaint<M> {
        &self.mem
    }
}

fn check_compatible(tx: &CircLayout, rx: &CircLayout) -> Result<(), CircError> {
    let tx_end = tx.base + tx.size() as u64;
    let rx_end = rx.base + rx.size() as u64;
    if tx.base < rx_end && rx.base < tx_end {
        return Err(CircError::InvalidLayout);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use std::thread;

    use super::*;
    use crate::deadline::Deadline;
    use crate::deadline::tests::StepClock;
    use crate::testmem::TestMem;

    type Queue = CircQueue<Arc<TestMem>>;

    fn make_pair(num_msgs: u32, entry_size: usize) -> (Arc<TestMem>, Queue, Queue) {
        let mem = Arc::new(TestMem::new(2 * CircLayout::query_size(
            num_msgs as usize,
            entry_size,
        )));
        let [a, b] = CircLayout::pair(mem.base_addr(), num_msgs, entry_size).unwrap();
        let creator = CircQueue::create(a, b, CacheMaint::new(mem.clone(), true)).unwrap();
        let opener = CircQueue::open(b, a, CacheMaint::new(mem.clone(), true)).unwrap();
        (mem, creator, opener)
    }

    fn collect(q: &Queue) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        q.drain(|e| out.push(e.to_vec())).unwrap();
        out
    }

    #[test]
    fn eight_slots_hold_seven() {
        let (_mem, a, b) = make_pair(8, 8);
        for i in 0..7u8 {
            a.send(&[i; 8], WaitMode::NoWait).unwrap();
        }
        assert!(a.is_full().unwrap());
        assert_eq!(a.send(&[7; 8], WaitMode::NoWait), Err(CircError::QueueFull));

        let got = collect(&b);
        assert_eq!(got.len(), 7);
        for (i, e) in got.iter().enumerate() {
            assert_eq!(e, &vec![i as u8; 8]);
        }

        a.send(&[7; 8], WaitMode::NoWait).unwrap();
        assert_eq!(collect(&b), vec![vec![7; 8]]);
    }

    #[test]
    fn full_predicate_for_every_power_of_two() {
        for shift in 1..=8 {
            let n = 1u32 << shift;
            let (_mem, a, b) = make_pair(n, 4);
            for i in 0..n - 1 {
                assert!(!a.is_full().unwrap());
                a.send(&i.to_le_bytes(), WaitMode::NoWait).unwrap();
            }
            assert!(a.is_full().unwrap());
            assert_eq!(a.send(&[0; 4], WaitMode::NoWait), Err(CircError::QueueFull));
            assert_eq!(b.drain(|_| {}).unwrap(), n as usize - 1);
            assert!(!a.is_full().unwrap());
        }
    }

    #[test]
    fn directions_are_independent() {
        let (_mem, a, b) = make_pair(4, 4);
        a.send(&[1; 4], WaitMode::NoWait).unwrap();
        b.send(&[2; 4], WaitMode::NoWait).unwrap();
        assert_eq!(collect(&a), vec![vec![2; 4]]);
        assert_eq!(collect(&b), vec![vec![1; 4]]);
        assert!(collect(&a).is_empty());
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let (_mem, a, _b) = make_pair(4, 8);
        assert_eq!(a.send(&[0; 9], WaitMode::NoWait), Err(CircError::EntryTooLarge(9)));
    }

    #[test]
    fn deadline_bounds_the_spin() {
        let (_mem, a, _b) = make_pair(2, 4);
        a.send(&[0; 4], WaitMode::NoWait).unwrap();
        let clock = StepClock::default();
        let deadline = Deadline::after(&clock, 5);
        assert_eq!(a.send(&[0; 4], WaitMode::Until(deadline)), Err(CircError::Timeout));
    }

    #[test]
    fn read_index_written_back_in_batches() {
        let (mem, a, b) = make_pair(8, 4);
        for i in 0..7u32 {
            a.send(&i.to_le_bytes(), WaitMode::NoWait).unwrap();
        }
        let before = mem.writebacks();
        assert_eq!(b.drain(|_| {}).unwrap(), 7);
        // batch of 2: after entries 2, 4, 6 and once at the end
        assert_eq!(mem.writebacks() - before, 4);
    }

    #[test]
    fn entries_sent_during_drain_arrive_once() {
        let (_mem, a, b) = make_pair(4, 4);
        for i in 0..3u8 {
            a.send(&[i; 4], WaitMode::NoWait).unwrap();
        }
        assert!(a.is_full().unwrap());

        let mut seen = Vec::new();
        let n = b
            .drain(|e| {
                if seen.is_empty() {
                    // the slot just read is already free for the writer
                    a.send(&[3; 4], WaitMode::NoWait).unwrap();
                }
                seen.push(e[0]);
            })
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(collect(&b).is_empty());
    }

    #[test]
    fn bad_layouts() {
        assert_eq!(CircLayout::from_base(0, 6, 8), Err(CircError::InvalidLayout));
        assert_eq!(CircLayout::from_base(0, 1, 8), Err(CircError::InvalidLayout));
        assert_eq!(CircLayout::from_base(0, 8, 6), Err(CircError::InvalidLayout));
        assert_eq!(CircLayout::from_base(64, 8, 8), Err(CircError::InvalidLayout));
        let l = CircLayout::from_base(0, 8, 8).unwrap();
        assert_eq!(l.entry_addr(9), l.entry_addr(1));
    }

    #[test]
    fn spinning_sender_with_concurrent_receiver() {
        let (_mem, a, b) = make_pair(8, 4);
        let a = Arc::new(a);
        const N: u32 = 5000;

        let sender = {
            let a = a.clone();
            thread::spawn(move || {
                for i in 0..N {
                    a.send(&i.to_le_bytes(), WaitMode::Spin).unwrap();
                }
            })
        };

        let mut next = 0u32;
        while next < N {
            b.drain(|e| {
                let v = u32::from_le_bytes(e.try_into().unwrap());
                assert_eq!(v, next);
                next += 1;
            })
            .unwrap();
        }
        sender.join().unwrap();
    }
}
