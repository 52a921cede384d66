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

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mcipc_common::channel::{ChannelError, InterruptChannel};
use mcipc_common::msgq::ProcId;

use crate::Result;
use crate::error::IpcError;
use crate::metrics::{CounterMetric, EmittableMetric};

// a FIFO of u32 is consistent whatever a panicking holder did
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One direction between two cores.
#[derive(Debug, Default)]
struct Mailbox {
    fifo: Mutex<VecDeque<u32>>,
    /// interrupt enable of the receiving core
    enabled: AtomicBool,
}

/// Wakes a core when any of its inbound mailboxes gets a payload.
#[derive(Debug, Default)]
struct Doorbell {
    rung: Mutex<u64>,
    cv: Condvar,
}

/// All mailboxes of a system: one FIFO per ordered `(src, dst)` pair.
#[derive(Debug)]
pub struct MailboxBank {
    num_cores: u16,
    depth: usize,
    boxes: BTreeMap<(u16, u16), Mailbox>,
    doorbells: Vec<Doorbell>,
    dropped: AtomicU64,
}

impl MailboxBank {
    pub fn new(num_cores: u16, depth: u32) -> Self {
        let mut boxes = BTreeMap::new();
        for src in 0..num_cores {
            for dst in (0..num_cores).filter(|&d| d != src) {
                boxes.insert((src, dst), Mailbox::default());
            }
        }
        Self {
            num_cores,
            depth: depth as usize,
            boxes,
            doorbells: (0..num_cores).map(|_| Doorbell::default()).collect(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn num_cores(&self) -> u16 {
        self.num_cores
    }

    fn mailbox(&self, src: ProcId, dst: ProcId) -> Option<&Mailbox> {
        self.boxes.get(&(src.0, dst.0))
    }

    /// The line `local` uses to interrupt `remote` and to take what
    /// `remote` sent it.
    pub fn channel(self: &Arc<Self>, local: ProcId, remote: ProcId) -> Result<MailboxChannel> {
        if self.mailbox(local, remote).is_none() {
            let unknown = if local.0 >= self.num_cores { local } else { remote };
            return Err(IpcError::UnknownProcessor(unknown.0));
        }
        Ok(MailboxChannel {
            bank: self.clone(),
            local,
            remote,
        })
    }

    /// Payloads waiting from `src` to `dst`.
    pub fn pending(&self, src: ProcId, dst: ProcId) -> Result<usize> {
        let mb = self
            .mailbox(src, dst)
            .ok_or(IpcError::UnknownProcessor(src.0.max(dst.0)))?;
        Ok(lock(&mb.fifo).len())
    }

    /// Kicks refused because a FIFO was full.
    pub fn dropped_kicks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn has_pending(&self, dst: ProcId) -> bool {
        (0..self.num_cores)
            .filter(|&src| src != dst.0)
            .filter_map(|src| self.mailbox(ProcId(src), dst))
            .any(|mb| mb.enabled.load(Ordering::Acquire) && !lock(&mb.fifo).is_empty())
    }

    /// Block until an enabled mailbox of `dst` holds a payload, or `timeout`
    /// passes. Returns whether one does.
    pub fn wait(&self, dst: ProcId, timeout: Duration) -> bool {
        let Some(bell) = self.doorbells.get(dst.0 as usize) else {
            return false;
        };
        let guard = lock(&bell.rung);
        let (_guard, _) = bell
            .cv
            .wait_timeout_while(guard, timeout, |_| !self.has_pending(dst))
            .unwrap_or_else(PoisonError::into_inner);
        self.has_pending(dst)
    }

    fn ring(&self, dst: ProcId) {
        if let Some(bell) = self.doorbells.get(dst.0 as usize) {
            *lock(&bell.rung) += 1;
            bell.cv.notify_all();
        }
    }
}

/// An [`InterruptChannel`] between two cores of a [`MailboxBank`].
#[derive(Debug, Clone)]
pub struct MailboxChannel {
    bank: Arc<MailboxBank>,
    local: ProcId,
    remote: ProcId,
}

impl MailboxChannel {
    pub fn local(&self) -> ProcId {
        self.local
    }

    pub fn remote(&self) -> ProcId {
        self.remote
    }

    fn outbound(&self) -> Option<&Mailbox> {
        self.bank.mailbox(self.local, self.remote)
    }

    fn inbound(&self) -> Option<&Mailbox> {
        self.bank.mailbox(self.remote, self.local)
    }
}

impl InterruptChannel for MailboxChannel {
    fn kick(&self, payload: u32) -> core::result::Result<(), ChannelError> {
        let mb = self.outbound().ok_or(ChannelError::Detached)?;
        {
            let mut fifo = lock(&mb.fifo);
            if fifo.len() >= self.bank.depth {
                drop(fifo);
                self.bank.dropped.fetch_add(1, Ordering::Relaxed);
                CounterMetric::dropped_kick(self.local.0, self.remote.0).emit();
                log::trace!("{} -> {}: mailbox full, kick {payload:#x} refused", self.local, self.remote);
                return Err(ChannelError::Full);
            }
            fifo.push_back(payload);
        }
        self.bank.ring(self.remote);
        Ok(())
    }

    fn clear(&self) -> Option<u32> {
        lock(&self.inbound()?.fifo).pop_front()
    }

    fn enable(&self) {
        if let Some(mb) = self.inbound() {
            mb.enabled.store(true, Ordering::Release);
            self.bank.ring(self.local);
        }
    }

    fn disable(&self) {
        if let Some(mb) = self.inbound() {
            mb.enabled.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn bank_has_one_mailbox_per_ordered_pair() {
        let bank = MailboxBank::new(3, 4);
        assert_eq!(bank.boxes.len(), 6);
        assert!(bank.mailbox(ProcId(1), ProcId(1)).is_none());
        assert!(bank.mailbox(ProcId(2), ProcId(0)).is_some());
    }

    #[test]
    fn payloads_flow_in_order() {
        let bank = Arc::new(MailboxBank::new(2, 4));
        let a = bank.channel(ProcId(0), ProcId(1)).unwrap();
        let b = bank.channel(ProcId(1), ProcId(0)).unwrap();
        a.kick(1).unwrap();
        a.kick(2).unwrap();
        assert_eq!(bank.pending(ProcId(0), ProcId(1)).unwrap(), 2);
        assert_eq!(a.clear(), None);
        assert_eq!(b.clear(), Some(1));
        assert_eq!(b.clear(), Some(2));
        assert_eq!(b.clear(), None);
    }

    #[test]
    fn full_fifo_refuses_and_counts() {
        let bank = Arc::new(MailboxBank::new(2, 2));
        let a = bank.channel(ProcId(0), ProcId(1)).unwrap();
        a.kick(1).unwrap();
        a.kick(2).unwrap();
        assert_eq!(a.kick(3), Err(ChannelError::Full));
        assert_eq!(bank.dropped_kicks(), 1);
    }

    #[test]
    fn unknown_processor() {
        let bank = Arc::new(MailboxBank::new(2, 2));
        assert!(matches!(
            bank.channel(ProcId(0), ProcId(5)),
            Err(IpcError::UnknownProcessor(5))
        ));
        assert!(matches!(
            bank.channel(ProcId(1), ProcId(1)),
            Err(IpcError::UnknownProcessor(1))
        ));
    }

    #[test]
    fn wait_needs_enabled_line() {
        let bank = Arc::new(MailboxBank::new(2, 4));
        let a = bank.channel(ProcId(0), ProcId(1)).unwrap();
        let b = bank.channel(ProcId(1), ProcId(0)).unwrap();
        a.kick(9).unwrap();
        assert!(!bank.wait(ProcId(1), Duration::from_millis(1)));
        b.enable();
        assert!(bank.wait(ProcId(1), Duration::from_millis(1)));
        b.disable();
        assert!(!bank.wait(ProcId(1), Duration::ZERO));
    }

    #[test]
    fn wait_wakes_on_kick() {
        let bank = Arc::new(MailboxBank::new(2, 4));
        let b = bank.channel(ProcId(1), ProcId(0)).unwrap();
        b.enable();

        let kicker = {
            let bank = bank.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                bank.channel(ProcId(0), ProcId(1)).unwrap().kick(5).unwrap();
            })
        };
        let start = Instant::now();
        assert!(bank.wait(ProcId(1), Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(b.clear(), Some(5));
        kicker.join().unwrap();
    }
}
