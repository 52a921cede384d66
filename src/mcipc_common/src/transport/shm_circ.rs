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

//! Messages in heap blocks, passed by shared-space pointer through a
//! circular queue of 4-byte slots.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use super::{
    MessageSink, ObjType, SendWait, Status, Transport, TransportError, announce_failed,
    deliver_or_log,
    read_block, write_block,
};
use crate::cache::CacheMaint;
use crate::circ::{CircLayout, CircQueue};
use crate::heap::BufferProvider;
use crate::mem::CacheOps;
use crate::msgq::{Message, Priority, ProcId};
use crate::notify::{EventCallback, NotifyDriver};
use crate::xlate::AddressTranslator;

/// Slot size: one shared-space pointer.
pub const ENTRY_SIZE: usize = 4;

pub struct TransportShmCirc<M, T, N, P> {
    queue: CircQueue<M>,
    mem: CacheMaint<M>,
    xlate: T,
    notify: N,
    heap: P,
    remote: ProcId,
    priority: Priority,
    notify_event: u32,
    wait: SendWait,
    closed: AtomicBool,
}

impl<M, T, N, P> TransportShmCirc<M, T, N, P>
where
    M: CacheOps + Clone,
    T: AddressTranslator,
    N: NotifyDriver,
    P: BufferProvider,
{
    /// Bytes of shared memory needed for `num_msgs` pointers each way.
    pub const fn shared_size(num_msgs: usize) -> usize {
        2 * CircLayout::query_size(num_msgs, ENTRY_SIZE)
    }

    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        obj_type: ObjType,
        base: u64,
        num_msgs: u32,
        remote: ProcId,
        priority: Priority,
        notify_event: u32,
        mem: CacheMaint<M>,
        xlate: T,
        notify: N,
        heap: P,
    ) -> Result<Self, TransportError> {
        let [first, second] = CircLayout::pair(base, num_msgs, ENTRY_SIZE)?;
        let queue = match obj_type {
            ObjType::CreateDynamic => CircQueue::create(first, second, mem.clone())?,
            ObjType::OpenDynamic => CircQueue::open(second, first, mem.clone())?,
        };
        log::debug!("shm circ transport to {remote} {obj_type:?} at {base:#x}, {num_msgs} slots");
        Ok(Self {
            queue,
            mem,
            xlate,
            notify,
            heap,
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

    /// Deliver inbound messages to `sink` whenever the peer signals.
    pub fn attach(self: &Arc<Self>, sink: Arc<dyn MessageSink>) -> Result<(), TransportError>
    where
        Self: Send + Sync + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let cb: EventCallback = Arc::new(move |_event, _payload| {
            if let Some(t) = weak.upgrade()
                && let Err(e) = t.receive(&*sink)
            {
                log::error!("shm circ transport receive failed: {e}");
            }
        });
        self.notify.register_event(self.notify_event, cb)?;
        Ok(())
    }

    /// Drain the queue and hand every message to `sink`.
    pub fn receive(&self, sink: &dyn MessageSink) -> Result<usize, TransportError> {
        let mut ptrs = Vec::new();
        self.queue.drain(|e| {
            ptrs.push(u32::from_le_bytes([e[0], e[1], e[2], e[3]]));
        })?;

        for &ptr in &ptrs {
            let msg = self
                .xlate
                .to_local(ptr)
                .ok_or(TransportError::TranslationFailed(ptr as u64))
                .and_then(|addr| read_block(&self.mem, &self.heap, addr));
            match msg {
                Ok(msg) => deliver_or_log(sink, msg),
                Err(e) => log::error!("dropping message at shared {ptr:#x}: {e}"),
            }
        }
        Ok(ptrs.len())
    }

    pub fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.notify.unregister_event(self.notify_event)?;
        Ok(())
    }
}

impl<M, T, N, P> Transport for TransportShmCirc<M, T, N, P>
where
    M: CacheOps + Clone,
    T: AddressTranslator,
    N: NotifyDriver,
    P: BufferProvider,
{
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    fn put(&self, msg: &Message) -> Result<(), TransportError> {
        if self.status() != Status::Up {
            return Err(TransportError::NotReady);
        }

        let block = write_block(&self.mem, &self.heap, msg)?;
        let Some(ptr) = self.xlate.to_shared(block.addr) else {
            self.heap.dealloc(block)?;
            return Err(TransportError::TranslationFailed(block.addr));
        };
        if let Err(e) = self.queue.send(&ptr.to_le_bytes(), self.wait.mode()) {
            self.heap.dealloc(block)?;
            return Err(e.into());
        }

        // the block now belongs to the reader
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
