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

//! Transports move whole messages to one remote processor.
//!
//! Every transport is a pair of halves, one per core. The sending half
//! implements [`Transport`]; the receiving half hands what it takes out of
//! shared memory to a [`MessageSink`], normally the local
//! [`MessageRouter`](crate::msgq::MessageRouter).
//!
//! - [`shm::TransportShm`]: messages in heap blocks, linked into a shared list.
//! - [`shm_circ::TransportShmCirc`]: heap block pointers in a circular queue.
//! - [`circ::TransportCirc`]: whole messages copied into circular queue slots.
//! - [`virtio::TransportVirtio`]: messages in buffers exchanged over two vrings.
//!
//! `put` makes the whole message visible to the peer before publishing it.
//! A published message is never withdrawn: the reader may be halfway through
//! taking it. When the peer cannot be signalled afterwards the caller sees
//! [`TransportError::SignalFailure`] and the message is picked up by the
//! peer's next receive. Every failure before the publish leaves nothing
//! behind.

use alloc::sync::Arc;
use alloc::vec;
use core::fmt;

use thiserror::Error;

use crate::cache::CacheMaint;
use crate::channel::ChannelError;
use crate::circ::CircError;
use crate::deadline::{Clock, Deadline, WaitMode};
use crate::heap::{AllocError, Allocation, BufferProvider};
use crate::listmp::ListError;
use crate::mem::CacheOps;
use crate::msgq::{Message, MsgHeader, Priority, ProcId};
use crate::virtq::VirtqError;
use crate::vring::RingError;

pub mod circ;
pub mod shm;
pub mod shm_circ;
pub mod virtio;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),
    #[error("VirtQueue error: {0}")]
    Virtq(VirtqError),
    #[error("Circular queue error: {0}")]
    Circ(CircError),
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),
    #[error("Shared list error: {0}")]
    List(#[from] ListError),
    /// The message is published but the peer was not interrupted. Do not
    /// send it again.
    #[error("Message published but the peer was not signalled: {0}")]
    SignalFailure(ChannelError),
    #[error("Transport is not up")]
    NotReady,
    #[error("Message of {0} bytes does not fit")]
    MessageTooLarge(usize),
    #[error("No queue {0:#010x}")]
    UnknownQueue(u32),
    #[error("Queue port {0} already exists")]
    QueueExists(u16),
    #[error("No transport to processor {0}")]
    NoTransport(u16),
    #[error("Address {0:#x} has no translation")]
    TranslationFailed(u64),
    #[error("Backend memory error")]
    MemError,
    #[error("Malformed message")]
    BadMessage,
}

// a failed signal is reported the same way by every layer
impl From<CircError> for TransportError {
    fn from(e: CircError) -> Self {
        match e {
            CircError::SignalFailure(c) => TransportError::SignalFailure(c),
            CircError::MemError => TransportError::MemError,
            e => TransportError::Circ(e),
        }
    }
}

impl From<VirtqError> for TransportError {
    fn from(e: VirtqError) -> Self {
        match e {
            VirtqError::SignalFailure(c) => TransportError::SignalFailure(c),
            VirtqError::Ring(r) => TransportError::Ring(r),
            e => TransportError::Virtq(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Up,
    Down,
}

/// The sending half of a transport.
pub trait Transport {
    /// Hand `msg` to the remote processor.
    fn put(&self, msg: &Message) -> Result<(), TransportError>;
    fn status(&self) -> Status;
    fn remote(&self) -> ProcId;
    fn priority(&self) -> Priority;
}

/// Where a receiving half delivers messages.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, msg: Message) -> Result<(), TransportError>;
}

/// Whether this side initialises the shared state or attaches to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    CreateDynamic,
    OpenDynamic,
}

/// Hand `msg` to `sink`, logging instead of failing the interrupt path.
pub(crate) fn deliver_or_log(sink: &dyn MessageSink, msg: Message) {
    let id = msg.header.msg_id;
    if let Err(e) = sink.deliver(msg) {
        log::warn!("inbound msg {id} not delivered: {e}");
    }
}

/// Error for a message already published when `send_event` failed.
///
/// Without a queued event the message waits for the next event or receive
/// sweep, so a full event queue counts as a refused signal too.
pub(crate) fn announce_failed(msg: &Message, e: CircError) -> TransportError {
    log::warn!("msg {} published but not announced: {e}", msg.header.msg_id);
    match e {
        CircError::SignalFailure(c) => TransportError::SignalFailure(c),
        CircError::QueueFull | CircError::Timeout => TransportError::SignalFailure(ChannelError::Full),
        e => e.into(),
    }
}

/// How long `put` may spin while the peer has not made room.
#[derive(Clone, Default)]
pub enum SendWait {
    NoWait,
    #[default]
    Spin,
    /// Give up after this many ticks of the clock.
    Timeout(Arc<dyn Clock>, u64),
}

impl SendWait {
    pub(crate) fn mode(&self) -> WaitMode<'_> {
        match self {
            SendWait::NoWait => WaitMode::NoWait,
            SendWait::Spin => WaitMode::Spin,
            SendWait::Timeout(clock, ticks) => WaitMode::Until(Deadline::after(&**clock, *ticks)),
        }
    }
}

impl fmt::Debug for SendWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendWait::NoWait => f.write_str("NoWait"),
            SendWait::Spin => f.write_str("Spin"),
            SendWait::Timeout(_, ticks) => f.debug_tuple("Timeout").field(ticks).finish(),
        }
    }
}

/// Copy `msg` into a fresh heap block and make it visible to the peer.
pub(crate) fn write_block<M: CacheOps, P: BufferProvider>(
    mem: &CacheMaint<M>,
    heap: &P,
    msg: &Message,
) -> Result<Allocation, TransportError> {
    let size = msg.size();
    let block = heap.alloc(size)?;
    let mut buf = vec![0u8; size];
    msg.encode(&mut buf)?;
    let at = core::mem::offset_of!(MsgHeader, heap_id);
    buf[at..at + 2].copy_from_slice(&heap.heap_id().to_le_bytes());

    if mem.publish(block.addr, &buf).is_err() {
        heap.dealloc(block)?;
        return Err(TransportError::MemError);
    }
    Ok(block)
}

/// Copy the message at local `addr` out of its heap block and free the block.
pub(crate) fn read_block<M: CacheOps, P: BufferProvider>(
    mem: &CacheMaint<M>,
    heap: &P,
    addr: u64,
) -> Result<Message, TransportError> {
    let block = heap.lookup(addr).ok_or(TransportError::BadMessage)?;
    let msg = read_message(mem, addr, block.len);
    heap.dealloc(block)?;
    msg
}

/// Copy a message of at most `max_len` bytes out of shared memory.
pub(crate) fn read_message<M: CacheOps>(
    mem: &CacheMaint<M>,
    addr: u64,
    max_len: usize,
) -> Result<Message, TransportError> {
    let mut raw = [0u8; MsgHeader::SIZE];
    mem.fetch(addr, &mut raw)
        .map_err(|_| TransportError::MemError)?;
    let size = MsgHeader::decode(&raw)?.msg_size as usize;
    if size < MsgHeader::SIZE || size > max_len {
        return Err(TransportError::BadMessage);
    }
    let mut buf = vec![0u8; size];
    mem.fetch(addr, &mut buf)
        .map_err(|_| TransportError::MemError)?;
    Message::decode(&buf)
}
