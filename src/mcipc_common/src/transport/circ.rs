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

//! Whole messages copied into circular queue slots. No heap is involved,
//! so a message must fit one slot.

use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use super::{
    MessageSink, ObjType, SendWait, Status, Transport, TransportError, announce_failed,
    deliver_or_log,
};
use crate::cache::CacheMaint;
use crate::circ::{CircLayout, CircQueue};
use crate::mem::CacheOps;
use crate::msgq::{Message, Priority, ProcId};
use crate::notify::{EventCallback, NotifyDriver};

pub struct TransportCirc<M, N> {
    queue: CircQueue<M>,
    notify: N,
    remote: ProcId,
    priority: Priority,
    notify_event: u32,
    wait: SendWait,
    closed: AtomicBool,
}

impl<M: CacheOps, N: NotifyDriver> TransportCirc<M, N> {
    pub const fn shared_size(num_msgs: usize, slot_size: usize) -> usize {
        2 * CircLayout::query_size(num_msgs, slot_size)
    }

    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        obj_type: ObjType,
        base: u64,
        num_msgs: u32,
        slot_size: usize,
        remote: ProcId,
        priority: Priority,
        notify_event: u32,
        mem: CacheMaint<M>,
        notify: N,
    ) -> Result<Self, TransportError> {
        let [first, second] = CircLayout::pair(base, num_msgs, slot_size)?;
        let queue = match obj_type {
            ObjType::CreateDynamic => CircQueue::create(first, second, mem)?,
            ObjType::OpenDynamic => CircQueue::open(second, first, mem)?,
        };
        Ok(Self {
            queue,
            notify,
            remote,
            priority,
            notify_event,
            wait: SendWait::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_send_wait(mut self, wait: SendWait) -> Self {
        self.wait = wait;
        self
    }

    /// Largest message a slot holds.
    #[inline]
    pub fn max_message(&self) -> usize {
        self.queue.entry_size()
    }

    pub fn attach(self: &Arc<Self>, sink: Arc<dyn MessageSink>) -> Result<(), TransportError>
    where
        Self: Send + Sync + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let cb: EventCallback = Arc::new(move |_event, _payload| {
            if let Some(t) = weak.upgrade()
                && let Err(e) = t.receive(&*sink)
            {
                log::error!("circ transport receive failed: {e}");
            }
        });
        self.notify.register_event(self.notify_event, cb)?;
        Ok(())
    }

    /// Drain the queue and hand every message to `sink`.
    pub fn receive(&self, sink: &dyn MessageSink) -> Result<usize, TransportError> {
        let mut msgs = Vec::new();
        let n = self.queue.drain(|slot| match Message::decode(slot) {
            Ok(msg) => msgs.push(msg),
            Err(e) => log::error!("dropping malformed slot: {e}"),
        })?;
        for msg in msgs {
            deliver_or_log(sink, msg);
        }
        Ok(n)
    }

    #[inline]
    pub fn queue(&self) -> &CircQueue<M> {
        &self.queue
    }

    pub fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.notify.unregister_event(self.notify_event)?;
        Ok(())
    }
}

impl<M: CacheOps, N: NotifyDriver> Transport for TransportCirc<M, N> {
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    fn put(&self, msg: &Message) -> Result<(), TransportError> {
        if self.status() != Status::Up {
            return Err(TransportError::NotReady);
        }
        let size = msg.size();
        if size > self.max_message() {
            return Err(TransportError::MessageTooLarge(size));
        }
        let mut buf = vec![0u8; size];
        msg.encode(&mut buf)?;
        self.queue.send(&buf, self.wait.mode())?;

        self.notify
            .send_event(self.notify_event, 0, self.wait.mode())
            .map_err(|e| announce_failed(msg, e))
    }

    fn status(&self) -> Status {
        if self.closed.load(Ordering::Acquire) {
            Status::Down
        } else {
            Status::Up
        }
    }

    fn remote(&self) -> ProcId {
        self.remote
    }

    fn priority(&self) -> Priority {
        self.priority
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{Inbox, NOTIFY_SIZE, TestNotify, notify_pair};
    use super::*;
    use crate::channel::ChannelError;
    use crate::testmem::{TestChannel, TestMem};

    type Circ = TransportCirc<Arc<TestMem>, Arc<TestNotify>>;

    const SLOT: usize = 64;

    struct Setup {
        a: Arc<Circ>,
        b: Arc<Circ>,
        a_inbox: Arc<Inbox>,
        b_inbox: Arc<Inbox>,
        na: Arc<TestNotify>,
        nb: Arc<TestNotify>,
        a_line: Arc<TestChannel>,
    }

    fn setup() -> Setup {
        let size = Circ::shared_size(8, SLOT);
        let mem = Arc::new(TestMem::new(NOTIFY_SIZE + size));
        let (na, nb, a_line, _) = notify_pair(&mem, mem.base_addr());
        let base = mem.base_addr() + NOTIFY_SIZE as u64;
        let make = |obj, remote, notify| {
            Arc::new(
                Circ::new(
                    obj,
                    base,
                    8,
                    SLOT,
                    ProcId(remote),
                    Priority::Normal,
                    0,
                    CacheMaint::new(mem.clone(), true),
                    notify,
                )
                .unwrap()
                .with_send_wait(SendWait::NoWait),
            )
        };
        let a = make(ObjType::CreateDynamic, 1, na.clone());
        let b = make(ObjType::OpenDynamic, 0, nb.clone());
        let a_inbox = Arc::new(Inbox::default());
        let b_inbox = Arc::new(Inbox::default());
        a.attach(a_inbox.clone()).unwrap();
        b.attach(b_inbox.clone()).unwrap();
        Setup {
            a,
            b,
            a_inbox,
            b_inbox,
            na,
            nb,
            a_line,
        }
    }

    #[test]
    fn slots_carry_whole_messages() {
        let s = setup();
        s.a.put(&Message::new(1, &b"ping"[..])).unwrap();
        s.nb.isr().unwrap();
        let got = s.b_inbox.0.lock().pop().unwrap();
        assert_eq!(&got.payload[..], b"ping");

        s.b.put(&Message::new(2, &b"pong"[..])).unwrap();
        s.na.isr().unwrap();
        assert_eq!(s.a_inbox.ids(), vec![2]);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let s = setup();
        let big = Message::new(1, vec![0u8; SLOT - 31]);
        assert_eq!(s.a.put(&big), Err(TransportError::MessageTooLarge(SLOT + 1)));
        let fits = Message::new(2, vec![7u8; SLOT - 32]);
        s.a.put(&fits).unwrap();
        s.nb.isr().unwrap();
        assert_eq!(s.b_inbox.0.lock()[0].payload.len(), SLOT - 32);
    }

    #[test]
    fn refused_signal_leaves_message_published() {
        let s = setup();
        s.a_line.set_failing(true);
        assert_eq!(
            s.a.put(&Message::new(1, &b"x"[..])),
            Err(TransportError::SignalFailure(ChannelError::Full))
        );
        // the next interrupt still finds it
        s.a_line.set_failing(false);
        s.a.put(&Message::new(2, &b"y"[..])).unwrap();
        s.nb.isr().unwrap();
        assert_eq!(s.b_inbox.ids(), vec![1, 2]);
    }

    #[test]
    fn refused_signal_while_peer_drains_delivers_once() {
        let s = setup();
        for i in 0..3 {
            s.a.put(&Message::new(i, &b"early"[..])).unwrap();
        }
        // the reader holds its drain open while the writer's kick is refused
        let mut taken = Vec::new();
        let n = s
            .b
            .queue()
            .drain(|slot| {
                taken.push(Message::decode(slot).unwrap().header.msg_id);
                if taken.len() == 1 {
                    s.a_line.set_failing(true);
                    assert!(matches!(
                        s.a.put(&Message::new(3, &b"late"[..])),
                        Err(TransportError::SignalFailure(_))
                    ));
                }
            })
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(taken, vec![0, 1, 2, 3]);
        assert_eq!(s.b.receive(&*s.b_inbox).unwrap(), 0);
    }
}
