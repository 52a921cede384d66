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

//! Messages in heap blocks, passed through shared lists.
//!
//! ```text
//! base               Attrs { flag, creator_proc, notify_event, priority }
//! base + LINE        list head: messages for the creator
//! base + 2 * LINE    list head: messages for the opener
//! ```
//!
//! The creator writes `flag = FLAG_UP` after both lists are initialised;
//! the opener refuses to attach before that.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, Ordering};

use bytemuck::{Pod, Zeroable};
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use super::{
    MessageSink, ObjType, SendWait, Status, Transport, TransportError, announce_failed,
    deliver_or_log,
    read_block, write_block,
};
use crate::CACHE_LINE_SIZE;
use crate::cache::CacheMaint;
use crate::gate::Gate;
use crate::heap::BufferProvider;
use crate::listmp::ListMP;
use crate::mem::CacheOps;
use crate::msgq::{Message, Priority, ProcId};
use crate::notify::{EventCallback, NotifyDriver};
use crate::xlate::AddressTranslator;

/// Value of `Attrs::flag` once the creator finished initialising.
pub const FLAG_UP: u32 = 0xBADC_0FFE;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Attrs {
    flag: u32,
    creator_proc: u16,
    notify_event: u16,
    priority: u16,
    reserved: u16,
}

/// Who is on each end and which event signals new messages.
#[derive(Debug, Clone, Copy)]
pub struct ShmParams {
    pub local: ProcId,
    pub remote: ProcId,
    pub priority: Priority,
    pub notify_event: u32,
}

pub struct TransportShm<M, G, T, N, P> {
    base: u64,
    obj_type: ObjType,
    mem: CacheMaint<M>,
    inbound: ListMP<M, G, T>,
    outbound: ListMP<M, G, T>,
    notify: N,
    heap: P,
    remote: ProcId,
    priority: Priority,
    notify_event: u32,
    wait: SendWait,
    closed: AtomicBool,
}

impl<M, G, T, N, P> TransportShm<M, G, T, N, P>
where
    M: CacheOps + Clone,
    G: Gate + Clone,
    T: AddressTranslator + Clone,
    N: NotifyDriver,
    P: BufferProvider,
{
    /// Bytes of shared memory one transport needs at `base`.
    pub const SHARED_SIZE: usize = 3 * CACHE_LINE_SIZE;

    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        obj_type: ObjType,
        base: u64,
        params: ShmParams,
        mem: CacheMaint<M>,
        gate: G,
        xlate: T,
        notify: N,
        heap: P,
    ) -> Result<Self, TransportError> {
        let creator_inbox = base + CACHE_LINE_SIZE as u64;
        let opener_inbox = base + 2 * CACHE_LINE_SIZE as u64;

        let (inbound, outbound, priority, notify_event) = match obj_type {
            ObjType::CreateDynamic => {
                let attrs = Attrs {
                    flag: 0,
                    creator_proc: params.local.0,
                    notify_event: params.notify_event as u16,
                    priority: params.priority as u16,
                    reserved: 0,
                };
                mem.publish_val(base, attrs)
                    .map_err(|_| TransportError::MemError)?;
                let inbound = ListMP::create(creator_inbox, mem.clone(), gate.clone(), xlate.clone())?;
                let outbound = ListMP::create(opener_inbox, mem.clone(), gate, xlate)?;
                mem.publish_u32(base, FLAG_UP)
                    .map_err(|_| TransportError::MemError)?;
                (inbound, outbound, params.priority, params.notify_event)
            }
            ObjType::OpenDynamic => {
                let attrs: Attrs = mem
                    .fetch_val(base)
                    .map_err(|_| TransportError::MemError)?;
                if attrs.flag != FLAG_UP {
                    return Err(TransportError::NotReady);
                }
                if attrs.creator_proc != params.remote.0 {
                    log::warn!(
                        "transport at {base:#x} was created by proc {}, expected {}",
                        attrs.creator_proc,
                        params.remote
                    );
                    return Err(TransportError::NotReady);
                }
                let inbound = ListMP::open(opener_inbox, mem.clone(), gate.clone(), xlate.clone())?;
                let outbound = ListMP::open(creator_inbox, mem.clone(), gate, xlate)?;
                (
                    inbound,
                    outbound,
                    Priority::from_bits(attrs.priority),
                    attrs.notify_event as u32,
                )
            }
        };

        log::debug!(
            "shm transport to {} {:?} at {base:#x}, event {notify_event}",
            params.remote,
            obj_type
        );
        Ok(Self {
            base,
            obj_type,
            mem,
            inbound,
            outbound,
            notify,
            heap,
            remote: params.remote,
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
                log::error!("shm transport receive failed: {e}");
            }
        });
        self.notify.register_event(self.notify_event, cb)?;
        Ok(())
    }

    /// Take every message off the inbound list and hand it to `sink`.
    pub fn receive(&self, sink: &dyn MessageSink) -> Result<usize, TransportError> {
        let mut n = 0;
        while let Some(addr) = self.inbound.get_head()? {
            match read_block(&self.mem, &self.heap, addr) {
                Ok(msg) => deliver_or_log(sink, msg),
                Err(e) => log::error!("dropping message at {addr:#x}: {e}"),
            }
            n += 1;
        }
        Ok(n)
    }

    /// Mark the transport down. The creator also clears the shared flag.
    pub fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.notify.unregister_event(self.notify_event)?;
        if self.obj_type == ObjType::CreateDynamic {
            self.mem
                .publish_u32(self.base, 0)
                .map_err(|_| TransportError::MemError)?;
        }
        Ok(())
    }
}

impl<M, G, T, N, P> Transport for TransportShm<M, G, T, N, P>
where
    M: CacheOps + Clone,
    G: Gate + Clone,
    T: AddressTranslator + Clone,
    N: NotifyDriver,
    P: BufferProvider,
{
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    fn put(&self, msg: &Message) -> Result<(), TransportError> {
        if self.status() != Status::Up {
            return Err(TransportError::NotReady);
        }

        let block = write_block(&self.mem, &self.heap, msg)?;
        if let Err(e) = self.outbound.put_tail(block.addr) {
            self.heap.dealloc(block)?;
            return Err(e.into());
        }

        // linked blocks are never unlinked here: the peer may already hold this one
        self.notify
            .send_event(self.notify_event, 0, self.wait.mode())
            .map_err(|e| announce_failed(msg, e))
    }

    fn status(&self) -> Status {
        if self.closed.load(Ordering::Acquire) {
            return Status::Down;
        }
        match self.mem.fetch_u32(self.base) {
            Ok(FLAG_UP) => Status::Up,
            _ => Status::Down,
        }
    }

    fn remote(&self) -> ProcId {
        self.remote
    }

    fn priority(&self) -> Priority {
        self.priority
    }
}
