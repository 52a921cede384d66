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

//! Event notification over a circular queue.
//!
//! [`NotifyDriverCirc`] moves `(event_id, payload)` pairs through a
//! [`CircQueue`] and raises the peer's interrupt line after every event. The
//! peer's [`isr`](NotifyDriverCirc::isr) drains the queue and calls the
//! callback registered for each event id.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::channel::InterruptChannel;
use crate::circ::{CircError, CircQueue};
use crate::deadline::WaitMode;
use crate::mem::CacheOps;

/// Event ids are `0..MAX_EVENTS`.
pub const MAX_EVENTS: u32 = 32;

/// Slot size of a circular queue carrying events.
pub const EVENT_ENTRY_SIZE: usize = size_of::<EventEntry>();

/// Called with `(event_id, payload)` from interrupt context. Must not block.
pub type EventCallback = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// Sees events that arrived for an id with no callback.
pub type DropHook = Arc<dyn Fn(u32, u32) + Send + Sync>;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
struct EventEntry {
    payload: u32,
    event_id: u32,
}

/// Anything that can deliver numbered events to a peer.
pub trait NotifyDriver {
    fn register_event(&self, event_id: u32, callback: EventCallback) -> Result<(), CircError>;
    fn unregister_event(&self, event_id: u32) -> Result<(), CircError>;
    fn send_event(&self, event_id: u32, payload: u32, wait: WaitMode<'_>)
    -> Result<(), CircError>;
}

impl<D: NotifyDriver + ?Sized> NotifyDriver for Arc<D> {
    fn register_event(&self, event_id: u32, callback: EventCallback) -> Result<(), CircError> {
        (**self).register_event(event_id, callback)
    }
    fn unregister_event(&self, event_id: u32) -> Result<(), CircError> {
        (**self).unregister_event(event_id)
    }
    fn send_event(
        &self,
        event_id: u32,
        payload: u32,
        wait: WaitMode<'_>,
    ) -> Result<(), CircError> {
        (**self).send_event(event_id, payload, wait)
    }
}

/// Notify driver for one remote core.
pub struct NotifyDriverCirc<M, C> {
    queue: CircQueue<M>,
    channel: C,
    kick_payload: u32,
    evt_reg_mask: AtomicU32,
    callbacks: spin::Mutex<[Option<EventCallback>; MAX_EVENTS as usize]>,
    dropped: AtomicU32,
    drop_hook: spin::Mutex<Option<DropHook>>,
}

impl<M: CacheOps, C: InterruptChannel> NotifyDriverCirc<M, C> {
    /// `queue` must have been built with [`EVENT_ENTRY_SIZE`] slots.
    /// `kick_payload` is what the peer reads from its line.
    pub fn new(queue: CircQueue<M>, channel: C, kick_payload: u32) -> Result<Self, CircError> {
        if queue.entry_size() != EVENT_ENTRY_SIZE {
            return Err(CircError::InvalidLayout);
        }
        channel.enable();
        Ok(Self {
            queue,
            channel,
            kick_payload,
            evt_reg_mask: AtomicU32::new(0),
            callbacks: spin::Mutex::new([const { None }; MAX_EVENTS as usize]),
            dropped: AtomicU32::new(0),
            drop_hook: spin::Mutex::new(None),
        })
    }

    pub fn set_drop_hook(&self, hook: Option<DropHook>) {
        *self.drop_hook.lock() = hook;
    }

    /// Events that arrived for an unregistered id.
    pub fn dropped_events(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_registered(&self, event_id: u32) -> bool {
        event_id < MAX_EVENTS && self.evt_reg_mask.load(Ordering::Acquire) & (1 << event_id) != 0
    }

    /// Acknowledge the line and dispatch every queued event.
    ///
    /// Returns the number of events taken from the queue, dropped ones
    /// included.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn isr(&self) -> Result<usize, CircError> {
        // clear first: anything published before a cleared kick is drained below
        while self.channel.clear().is_some() {}

        self.queue.drain(|raw| {
            let entry: EventEntry = bytemuck::pod_read_unaligned(raw);
            self.dispatch(entry);
        })
    }

    fn dispatch(&self, entry: EventEntry) {
        let EventEntry { payload, event_id } = entry;
        let cb = if self.is_registered(event_id) {
            self.callbacks.lock()[event_id as usize].clone()
        } else {
            None
        };
        match cb {
            Some(cb) => cb(event_id, payload),
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping event {event_id} (payload {payload:#x}): no callback");
                let hook = self.drop_hook.lock().clone();
                if let Some(hook) = hook {
                    hook(event_id, payload);
                }
            }
        }
    }

    #[inline]
    pub fn queue(&self) -> &CircQueue<M> {
        &self.queue
    }
}

impl<M: CacheOps, C: InterruptChannel> NotifyDriver for NotifyDriverCirc<M, C> {
    fn register_event(&self, event_id: u32, callback: EventCallback) -> Result<(), CircError> {
        if event_id >= MAX_EVENTS {
            return Err(CircError::InvalidEvent(event_id));
        }
        self.callbacks.lock()[event_id as usize] = Some(callback);
        self.evt_reg_mask
            .fetch_or(1 << event_id, Ordering::AcqRel);
        Ok(())
    }

    fn unregister_event(&self, event_id: u32) -> Result<(), CircError> {
        if event_id >= MAX_EVENTS {
            return Err(CircError::InvalidEvent(event_id));
        }
        self.evt_reg_mask
            .fetch_and(!(1 << event_id), Ordering::AcqRel);
        self.callbacks.lock()[event_id as usize] = None;
        Ok(())
    }

    /// Queue the event and raise the peer's line.
    ///
    /// The line is raised for every event. If raising it fails the event
    /// stays queued and is dispatched by the peer's next [`isr`](Self::isr).
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self, wait), parent = Span::current(), level = "Trace"))]
    fn send_event(
        &self,
        event_id: u32,
        payload: u32,
        wait: WaitMode<'_>,
    ) -> Result<(), CircError> {
        if event_id >= MAX_EVENTS {
            return Err(CircError::InvalidEvent(event_id));
        }
        let entry = EventEntry { payload, event_id };
        self.queue.send(bytemuck::bytes_of(&entry), wait)?;

        self.channel.kick(self.kick_payload).map_err(|e| {
            log::warn!("event {event_id} queued but line not raised: {e}");
            CircError::SignalFailure(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::cache::CacheMaint;
    use crate::channel::ChannelError;
    use crate::circ::CircLayout;
    use crate::testmem::{TestChannel, TestMem};

    type Driver = NotifyDriverCirc<Arc<TestMem>, Arc<TestChannel>>;

    struct Pair {
        a: Driver,
        b: Driver,
        a_line: Arc<TestChannel>,
    }

    fn make_pair(num_msgs: u32) -> Pair {
        let size = CircLayout::query_size(num_msgs as usize, EVENT_ENTRY_SIZE);
        let mem = Arc::new(TestMem::new(2 * size));
        let [x, y] = CircLayout::pair(mem.base_addr(), num_msgs, EVENT_ENTRY_SIZE).unwrap();
        let qa = CircQueue::create(x, y, CacheMaint::new(mem.clone(), true)).unwrap();
        let qb = CircQueue::open(y, x, CacheMaint::new(mem.clone(), true)).unwrap();
        let a_line = Arc::new(TestChannel::new());
        let b_line = Arc::new(TestChannel::new());
        Pair {
            a: NotifyDriverCirc::new(qa, a_line.clone(), 1).unwrap(),
            b: NotifyDriverCirc::new(qb, b_line, 0).unwrap(),
            a_line,
        }
    }

    fn recorder() -> (Arc<spin::Mutex<Vec<(u32, u32)>>>, EventCallback) {
        let seen = Arc::new(spin::Mutex::new(Vec::new()));
        let cb: EventCallback = {
            let seen = seen.clone();
            Arc::new(move |id, payload| seen.lock().push((id, payload)))
        };
        (seen, cb)
    }

    #[test]
    fn events_reach_registered_callback() {
        let p = make_pair(8);
        let (seen, cb) = recorder();
        p.b.register_event(3, cb).unwrap();

        p.a.send_event(3, 0xabcd, WaitMode::NoWait).unwrap();
        p.a.send_event(3, 0x1234, WaitMode::NoWait).unwrap();
        assert_eq!(p.a_line.sent(), vec![1, 1]);

        assert_eq!(p.b.isr().unwrap(), 2);
        assert_eq!(*seen.lock(), vec![(3, 0xabcd), (3, 0x1234)]);
    }

    #[test]
    fn eight_slot_scenario() {
        let p = make_pair(8);
        let (seen, cb) = recorder();
        p.b.register_event(0, cb).unwrap();

        for i in 0..7 {
            p.a.send_event(0, i, WaitMode::NoWait).unwrap();
        }
        assert_eq!(
            p.a.send_event(0, 7, WaitMode::NoWait),
            Err(CircError::QueueFull)
        );
        assert_eq!(p.b.isr().unwrap(), 7);
        p.a.send_event(0, 7, WaitMode::NoWait).unwrap();
        assert_eq!(p.b.isr().unwrap(), 1);
        let payloads: Vec<u32> = seen.lock().iter().map(|&(_, p)| p).collect();
        assert_eq!(payloads, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn unregistered_events_are_counted_and_hooked() {
        let p = make_pair(4);
        let (hooked, hook) = recorder();
        p.b.set_drop_hook(Some(hook));
        let (seen, cb) = recorder();
        p.b.register_event(1, cb).unwrap();
        p.b.unregister_event(1).unwrap();

        p.a.send_event(1, 5, WaitMode::NoWait).unwrap();
        p.a.send_event(2, 6, WaitMode::NoWait).unwrap();
        assert_eq!(p.b.isr().unwrap(), 2);
        assert!(seen.lock().is_empty());
        assert_eq!(p.b.dropped_events(), 2);
        assert_eq!(*hooked.lock(), vec![(1, 5), (2, 6)]);
    }

    #[test]
    fn event_ids_are_bounded() {
        let p = make_pair(4);
        let (_seen, cb) = recorder();
        assert_eq!(
            p.b.register_event(MAX_EVENTS, cb),
            Err(CircError::InvalidEvent(MAX_EVENTS))
        );
        assert_eq!(
            p.a.send_event(40, 0, WaitMode::NoWait),
            Err(CircError::InvalidEvent(40))
        );
    }

    #[test]
    fn unraised_event_waits_for_next_isr() {
        let p = make_pair(4);
        let (seen, cb) = recorder();
        p.b.register_event(0, cb).unwrap();

        p.a_line.set_failing(true);
        assert_eq!(
            p.a.send_event(0, 9, WaitMode::NoWait),
            Err(CircError::SignalFailure(ChannelError::Full))
        );
        assert_eq!(p.b.isr().unwrap(), 1);
        assert_eq!(*seen.lock(), vec![(0, 9)]);

        p.a_line.set_failing(false);
        p.a.send_event(0, 10, WaitMode::NoWait).unwrap();
        p.b.isr().unwrap();
        assert_eq!(*seen.lock(), vec![(0, 9), (0, 10)]);
    }

    #[test]
    fn wrong_slot_size_is_rejected() {
        let mem = Arc::new(TestMem::new(2 * CircLayout::query_size(4, 16)));
        let [x, y] = CircLayout::pair(mem.base_addr(), 4, 16).unwrap();
        let q = CircQueue::create(x, y, CacheMaint::new(mem, false)).unwrap();
        assert!(NotifyDriverCirc::new(q, Arc::new(TestChannel::new()), 0).is_err());
    }
}
