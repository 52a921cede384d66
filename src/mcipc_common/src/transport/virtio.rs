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

//! Messages in fixed-size buffers exchanged over a pair of vrings.
//!
//! The host is the driver of both rings and owns every buffer:
//!
//! ```text
//! vq0  host -> remote   host adds filled buffers, remote returns them empty
//! vq1  remote -> host   host adds empty buffers, remote returns them filled
//! ```
//!
//! The remote side is the device of both rings. It can only send while the
//! host has receive buffers posted.

use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use super::{MessageSink, Status, Transport, TransportError, deliver_or_log, read_message};
use crate::channel::InterruptChannel;
use crate::heap::{Allocation, BufferProvider};
use crate::mem::CacheOps;
use crate::msgq::{Message, Priority, ProcId};
use crate::virtq::{PeerState, Role, VirtQueue, VqCallback, VqDispatcher};
use crate::vring::RingError;
use crate::xlate::AddressTranslator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioSide {
    /// Driver of both rings, owns the buffers.
    Host,
    /// Device of both rings.
    Remote,
}

pub struct TransportVirtio<M, C, T, P> {
    side: VirtioSide,
    tx: spin::Mutex<VirtQueue<M, C, T>>,
    rx: spin::Mutex<VirtQueue<M, C, T>>,
    tx_id: u32,
    rx_id: u32,
    pool: Option<P>,
    buf_size: u32,
    remote: ProcId,
    priority: Priority,
    up: AtomicBool,
    dispatcher: spin::Mutex<Option<Arc<VqDispatcher>>>,
}

impl<M, C, T, P> TransportVirtio<M, C, T, P>
where
    M: CacheOps,
    C: InterruptChannel,
    T: AddressTranslator,
    P: BufferProvider,
{
    /// Host side. Fills `rx` with empty `buf_size` buffers from `pool`.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn host(
        tx: VirtQueue<M, C, T>,
        mut rx: VirtQueue<M, C, T>,
        pool: P,
        buf_size: u32,
        remote: ProcId,
        priority: Priority,
    ) -> Result<Self, TransportError> {
        if tx.role() != Role::Driver || rx.role() != Role::Driver {
            return Err(RingError::WrongRole.into());
        }
        while !rx.is_full() {
            let buf = pool.alloc(buf_size as usize)?;
            if let Err(e) = rx.add_avail_buf(buf.addr, buf_size) {
                pool.dealloc(buf)?;
                return Err(e.into());
            }
        }
        if let Err(e) = rx.kick() {
            log::warn!("could not announce receive buffers to {remote}: {e}");
        }
        Ok(Self::new(VirtioSide::Host, tx, rx, Some(pool), buf_size, remote, priority))
    }

    /// Remote side, on rings the host created.
    pub fn remote(
        tx: VirtQueue<M, C, T>,
        rx: VirtQueue<M, C, T>,
        remote: ProcId,
        priority: Priority,
    ) -> Result<Self, TransportError> {
        if tx.role() != Role::Device || rx.role() != Role::Device {
            return Err(RingError::WrongRole.into());
        }
        Ok(Self::new(VirtioSide::Remote, tx, rx, None, 0, remote, priority))
    }

    fn new(
        side: VirtioSide,
        tx: VirtQueue<M, C, T>,
        rx: VirtQueue<M, C, T>,
        pool: Option<P>,
        buf_size: u32,
        remote: ProcId,
        priority: Priority,
    ) -> Self {
        Self {
            side,
            tx_id: tx.id(),
            rx_id: rx.id(),
            tx: spin::Mutex::new(tx),
            rx: spin::Mutex::new(rx),
            pool,
            buf_size,
            remote,
            priority,
            up: AtomicBool::new(false),
            dispatcher: spin::Mutex::new(None),
        }
    }

    #[inline]
    pub fn side(&self) -> VirtioSide {
        self.side
    }

    /// Route both queue ids through `dispatcher` and deliver to `sink`.
    pub fn attach(
        self: &Arc<Self>,
        dispatcher: &Arc<VqDispatcher>,
        sink: Arc<dyn MessageSink>,
    ) -> Result<(), TransportError>
    where
        Self: Send + Sync + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let cb: VqCallback = Arc::new(move |id| {
            if let Some(t) = weak.upgrade()
                && let Err(e) = t.on_kick(id, &*sink)
            {
                log::error!("virtio transport kick {id:#x} failed: {e}");
            }
        });
        dispatcher.register(self.tx_id, cb.clone())?;
        dispatcher.register(self.rx_id, cb)?;
        *self.dispatcher.lock() = Some(dispatcher.clone());
        Ok(())
    }

    /// Service a kick for queue `id`. Returns the number of messages delivered.
    pub fn on_kick(&self, id: u32, sink: &dyn MessageSink) -> Result<usize, TransportError> {
        match self.side {
            VirtioSide::Host if id == self.tx_id => {
                let reclaimed = self.reclaim(&mut self.tx.lock())?;
                if reclaimed > 0 {
                    self.up.store(true, Ordering::Release);
                }
                Ok(0)
            }
            // new receive buffers; put takes them on demand
            VirtioSide::Remote if id == self.tx_id => Ok(0),
            _ if id == self.rx_id => self.receive(sink),
            _ => Ok(0),
        }
    }

    /// Take every message the peer sent and hand it to `sink`.
    pub fn receive(&self, sink: &dyn MessageSink) -> Result<usize, TransportError> {
        let msgs = match self.side {
            VirtioSide::Host => self.host_receive()?,
            VirtioSide::Remote => self.remote_receive()?,
        };
        if !msgs.is_empty() {
            self.up.store(true, Ordering::Release);
        }
        let n = msgs.len();
        for msg in msgs {
            deliver_or_log(sink, msg);
        }
        Ok(n)
    }

    fn host_receive(&self) -> Result<Vec<Message>, TransportError> {
        let mut rx = self.rx.lock();
        let mut msgs = Vec::new();
        let mut reposted = false;
        while let Some(used) = rx.get_used_buf()? {
            if used.written > 0 {
                match read_message(rx.cache(), used.addr, used.written as usize) {
                    Ok(msg) => msgs.push(msg),
                    Err(e) => log::error!("dropping message from {}: {e}", self.remote),
                }
            }
            rx.add_avail_buf(used.addr, used.len)?;
            reposted = true;
        }
        if reposted && let Err(e) = rx.kick() {
            log::warn!("could not announce receive buffers to {}: {e}", self.remote);
        }
        Ok(msgs)
    }

    fn remote_receive(&self) -> Result<Vec<Message>, TransportError> {
        let mut rx = self.rx.lock();
        let mut msgs = Vec::new();
        let mut completed = false;
        loop {
            let buf = match rx.get_avail_buf() {
                Ok(Some(buf)) => buf,
                Ok(None) => break,
                Err(e @ (RingError::TranslationFailed(_) | RingError::InvalidDescriptor(_))) => {
                    log::error!("skipping bad buffer from {}: {e}", self.remote);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match read_message(rx.cache(), buf.addr, buf.len as usize) {
                Ok(msg) => msgs.push(msg),
                Err(e) => log::error!("dropping message from {}: {e}", self.remote),
            }
            rx.add_used_buf(buf.head, 0)?;
            completed = true;
        }
        // the host reclaims completed buffers on its next put either way
        if completed && let Err(e) = rx.kick() {
            log::warn!("could not announce completed buffers to {}: {e}", self.remote);
        }
        Ok(msgs)
    }

    /// Free transmit buffers the remote has finished with.
    fn reclaim(&self, tx: &mut VirtQueue<M, C, T>) -> Result<usize, TransportError> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };
        let mut n = 0;
        while let Some(used) = tx.get_used_buf()? {
            let block = pool.lookup(used.addr).unwrap_or(Allocation {
                addr: used.addr,
                len: self.buf_size as usize,
            });
            pool.dealloc(block)?;
            n += 1;
        }
        Ok(n)
    }

    fn host_put(&self, msg: &Message) -> Result<(), TransportError> {
        let Some(pool) = &self.pool else {
            return Err(TransportError::NotReady);
        };
        let size = msg.size();
        if size > self.buf_size as usize {
            return Err(TransportError::MessageTooLarge(size));
        }

        let mut tx = self.tx.lock();
        if tx.is_full() {
            self.reclaim(&mut tx)?;
        }
        if tx.is_full() {
            return Err(RingError::RingFull.into());
        }

        let block = pool.alloc(size)?;
        let mut buf = vec![0u8; size];
        msg.encode(&mut buf)?;
        if tx.cache().publish(block.addr, &buf).is_err() {
            pool.dealloc(block)?;
            return Err(TransportError::MemError);
        }
        if let Err(e) = tx.add_avail_buf(block.addr, size as u32) {
            pool.dealloc(block)?;
            return Err(e.into());
        }
        // published buffers cannot be withdrawn; the remote sees it on its next drain
        Self::announce(&tx, msg)
    }

    fn remote_put(&self, msg: &Message) -> Result<(), TransportError> {
        let size = msg.size();
        let mut tx = self.tx.lock();
        let buf = loop {
            match tx.get_avail_buf() {
                Ok(Some(buf)) => break buf,
                Ok(None) => return Err(RingError::RingFull.into()),
                Err(e @ (RingError::TranslationFailed(_) | RingError::InvalidDescriptor(_))) => {
                    log::error!("skipping bad receive buffer from {}: {e}", self.remote);
                }
                Err(e) => return Err(e.into()),
            }
        };

        if size > buf.len as usize {
            tx.add_used_buf(buf.head, 0)?;
            return Err(TransportError::MessageTooLarge(size));
        }
        let mut raw = vec![0u8; size];
        msg.encode(&mut raw)?;
        if tx.cache().publish(buf.addr, &raw).is_err() {
            tx.add_used_buf(buf.head, 0)?;
            return Err(TransportError::MemError);
        }
        tx.add_used_buf(buf.head, size as u32)?;
        Self::announce(&tx, msg)
    }

    fn announce(tx: &VirtQueue<M, C, T>, msg: &Message) -> Result<(), TransportError> {
        tx.kick().map(|_| ()).map_err(|e| {
            log::warn!("msg {} published but not announced: {e}", msg.header.msg_id);
            e.into()
        })
    }

    fn peer_crashed(&self) -> bool {
        self.dispatcher
            .lock()
            .as_ref()
            .is_some_and(|d| d.peer_state() == PeerState::Crashed)
    }
}

impl<M, C, T, P> Transport for TransportVirtio<M, C, T, P>
where
    M: CacheOps,
    C: InterruptChannel,
    T: AddressTranslator,
    P: BufferProvider,
{
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    fn put(&self, msg: &Message) -> Result<(), TransportError> {
        // the host is down until the first exchange, so only a crash refuses
        if self.peer_crashed() {
            return Err(TransportError::NotReady);
        }
        match self.side {
            VirtioSide::Host => self.host_put(msg),
            VirtioSide::Remote => self.remote_put(msg),
        }
    }

    /// Up once the peer reported ready or anything was exchanged, down
    /// after the peer crashed.
    fn status(&self) -> Status {
        let peer = self
            .dispatcher
            .lock()
            .as_ref()
            .map(|d| d.peer_state())
            .unwrap_or(PeerState::Unknown);
        match peer {
            PeerState::Crashed => Status::Down,
            PeerState::Ready => Status::Up,
            PeerState::Unknown if self.up.load(Ordering::Acquire) => Status::Up,
            PeerState::Unknown => Status::Down,
        }
    }

    fn remote(&self) -> ProcId {
        self.remote
    }

    fn priority(&self) -> Priority {
        self.priority
    }
}
