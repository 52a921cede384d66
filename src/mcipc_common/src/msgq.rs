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

//! Message queues on top of the transports.
//!
//! Every message starts with a 32-byte [`MsgHeader`]. A [`MessageRouter`]
//! owns the local queues of one processor and forwards messages for other
//! processors to the [`Transport`] registered for that processor and
//! priority.
//!
//! # Header layout
//!
//! ```text
//!  0  link_next   u32    8  msg_size   u32   14 msg_id     u16
//!  4  link_prev   u32   12  flags      u16   16 dst_id     u16
//! 18  dst_proc    u16   20  reply_id   u16   22 reply_proc u16
//! 24  src_proc    u16   26  heap_id    u16   28 seq_num    u16
//! 30  reserved    u16
//! ```
//!
//! All fields are little-endian. `flags` bits 0-1 carry the [`Priority`],
//! bit 13 requests tracing.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::transport::{MessageSink, Transport, TransportError};

/// A processor in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcId(pub u16);

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc{}", self.0)
    }
}

/// A queue anywhere in the system, `(proc << 16) | port` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId {
    pub proc: ProcId,
    pub port: u16,
}

impl QueueId {
    pub const fn new(proc: ProcId, port: u16) -> Self {
        Self { proc, port }
    }
}

impl From<QueueId> for u32 {
    fn from(q: QueueId) -> u32 {
        ((q.proc.0 as u32) << 16) | q.port as u32
    }
}

impl From<u32> for QueueId {
    fn from(v: u32) -> Self {
        Self {
            proc: ProcId((v >> 16) as u16),
            port: v as u16,
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.proc, self.port)
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    #[default]
    Normal = 0,
    High = 1,
    Reserved = 2,
    Urgent = 3,
}

impl Priority {
    pub const fn from_bits(bits: u16) -> Self {
        match bits & MsgFlags::PRIORITY_MASK.bits() {
            1 => Priority::High,
            2 => Priority::Reserved,
            3 => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u16 {
        const PRIORITY_MASK = 0x3;
        const TRACE = 1 << 13;
    }
}

/// Wire header at the start of every message.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MsgHeader {
    pub link_next: u32,
    pub link_prev: u32,
    /// Header plus payload, in bytes.
    pub msg_size: u32,
    pub flags: u16,
    pub msg_id: u16,
    pub dst_id: u16,
    pub dst_proc: u16,
    pub reply_id: u16,
    pub reply_proc: u16,
    pub src_proc: u16,
    pub heap_id: u16,
    pub seq_num: u16,
    pub reserved: u16,
}

const _: () = assert!(size_of::<MsgHeader>() == MsgHeader::SIZE);

impl MsgHeader {
    pub const SIZE: usize = 32;

    #[inline]
    pub fn priority(&self) -> Priority {
        Priority::from_bits(self.flags)
    }

    #[inline]
    pub fn set_priority(&mut self, prio: Priority) {
        self.flags = (self.flags & !MsgFlags::PRIORITY_MASK.bits()) | prio as u16;
    }

    #[inline]
    pub fn trace(&self) -> bool {
        self.flags & MsgFlags::TRACE.bits() != 0
    }

    #[inline]
    pub fn dst(&self) -> QueueId {
        QueueId::new(ProcId(self.dst_proc), self.dst_id)
    }

    #[inline]
    pub fn reply_to(&self) -> QueueId {
        QueueId::new(ProcId(self.reply_proc), self.reply_id)
    }

    /// Decode a header from its little-endian wire form.
    pub fn decode(raw: &[u8]) -> Result<Self, TransportError> {
        let raw = raw.get(..Self::SIZE).ok_or(TransportError::BadMessage)?;
        let mut hdr: MsgHeader = bytemuck::pod_read_unaligned(raw);
        hdr.to_le_in_place();
        Ok(hdr)
    }

    /// Encode into `dst[..32]` in little-endian wire form.
    pub fn encode(&self, dst: &mut [u8]) -> Result<(), TransportError> {
        let dst = dst.get_mut(..Self::SIZE).ok_or(TransportError::BadMessage)?;
        let mut wire = *self;
        wire.to_le_in_place();
        dst.copy_from_slice(bytemuck::bytes_of(&wire));
        Ok(())
    }

    // byte swapping is its own inverse, so this also converts back
    fn to_le_in_place(&mut self) {
        self.link_next = self.link_next.to_le();
        self.link_prev = self.link_prev.to_le();
        self.msg_size = self.msg_size.to_le();
        for f in [
            &mut self.flags,
            &mut self.msg_id,
            &mut self.dst_id,
            &mut self.dst_proc,
            &mut self.reply_id,
            &mut self.reply_proc,
            &mut self.src_proc,
            &mut self.heap_id,
            &mut self.seq_num,
            &mut self.reserved,
        ] {
            *f = f.to_le();
        }
    }
}

/// A message held in local memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MsgHeader,
    pub payload: Bytes,
}

impl Message {
    pub fn new(msg_id: u16, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let header = MsgHeader {
            msg_id,
            msg_size: (MsgHeader::SIZE + payload.len()) as u32,
            ..Default::default()
        };
        Self { header, payload }
    }

    pub fn with_priority(mut self, prio: Priority) -> Self {
        self.header.set_priority(prio);
        self
    }

    pub fn with_reply_to(mut self, q: QueueId) -> Self {
        self.header.reply_proc = q.proc.0;
        self.header.reply_id = q.port;
        self
    }

    pub fn with_trace(mut self) -> Self {
        self.header.flags |= MsgFlags::TRACE.bits();
        self
    }

    /// Header plus payload.
    #[inline]
    pub fn size(&self) -> usize {
        MsgHeader::SIZE + self.payload.len()
    }

    /// Serialize into the first `size()` bytes of `dst`. Links are cleared.
    pub fn encode(&self, dst: &mut [u8]) -> Result<usize, TransportError> {
        let size = self.size();
        if dst.len() < size {
            return Err(TransportError::MessageTooLarge(size));
        }
        let mut hdr = self.header;
        hdr.link_next = 0;
        hdr.link_prev = 0;
        hdr.msg_size = size as u32;
        hdr.encode(dst)?;
        dst[MsgHeader::SIZE..size].copy_from_slice(&self.payload);
        Ok(size)
    }

    /// Parse a message whose header says how long it is.
    pub fn decode(raw: &[u8]) -> Result<Self, TransportError> {
        let header = MsgHeader::decode(raw)?;
        let size = header.msg_size as usize;
        if size < MsgHeader::SIZE || size > raw.len() {
            return Err(TransportError::BadMessage);
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&raw[MsgHeader::SIZE..size]),
        })
    }
}

/// A transport as the router holds it.
pub type SharedTransport = Arc<dyn Transport + Send + Sync>;

/// Local queues and outbound routing for one processor.
pub struct MessageRouter {
    local: ProcId,
    queues: spin::Mutex<BTreeMap<u16, VecDeque<Message>>>,
    transports: spin::Mutex<BTreeMap<(ProcId, Priority), SharedTransport>>,
    seq: AtomicU16,
    undeliverable: AtomicU32,
}

impl MessageRouter {
    pub fn new(local: ProcId) -> Self {
        Self {
            local,
            queues: spin::Mutex::new(BTreeMap::new()),
            transports: spin::Mutex::new(BTreeMap::new()),
            seq: AtomicU16::new(0),
            undeliverable: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn local(&self) -> ProcId {
        self.local
    }

    pub fn create_queue(&self, port: u16) -> Result<QueueId, TransportError> {
        let mut queues = self.queues.lock();
        if queues.contains_key(&port) {
            return Err(TransportError::QueueExists(port));
        }
        queues.insert(port, VecDeque::new());
        Ok(QueueId::new(self.local, port))
    }

    /// Delete a queue; its pending messages are dropped.
    pub fn delete_queue(&self, port: u16) -> Result<usize, TransportError> {
        self.queues
            .lock()
            .remove(&port)
            .map(|q| q.len())
            .ok_or(TransportError::UnknownQueue(QueueId::new(self.local, port).into()))
    }

    /// Take the oldest message from a local queue.
    pub fn get(&self, port: u16) -> Result<Option<Message>, TransportError> {
        let mut queues = self.queues.lock();
        let q = queues
            .get_mut(&port)
            .ok_or(TransportError::UnknownQueue(QueueId::new(self.local, port).into()))?;
        Ok(q.pop_front())
    }

    pub fn count(&self, port: u16) -> Result<usize, TransportError> {
        let queues = self.queues.lock();
        queues
            .get(&port)
            .map(VecDeque::len)
            .ok_or(TransportError::UnknownQueue(QueueId::new(self.local, port).into()))
    }

    /// Route `transport` for messages to its remote at its priority,
    /// replacing any previous one.
    pub fn register_transport(&self, transport: SharedTransport) -> Option<SharedTransport> {
        let key = (transport.remote(), transport.priority());
        log::debug!("{}: transport to {} at {:?} registered", self.local, key.0, key.1);
        self.transports.lock().insert(key, transport)
    }

    pub fn unregister_transport(&self, remote: ProcId, prio: Priority) -> Option<SharedTransport> {
        self.transports.lock().remove(&(remote, prio))
    }

    /// Messages that arrived for a queue that does not exist.
    pub fn undeliverable_count(&self) -> u32 {
        self.undeliverable.load(Ordering::Relaxed)
    }

    /// Send `msg` to `dst`.
    ///
    /// Fills in the source processor and the next sequence number. Remote
    /// messages go to the transport registered for the destination and the
    /// message priority, falling back to the normal priority transport.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self, msg), parent = Span::current(), level = "Trace"))]
    pub fn put(&self, dst: QueueId, mut msg: Message) -> Result<(), TransportError> {
        msg.header.dst_proc = dst.proc.0;
        msg.header.dst_id = dst.port;
        msg.header.src_proc = self.local.0;
        msg.header.seq_num = self.seq.fetch_add(1, Ordering::Relaxed);
        msg.header.msg_size = msg.size() as u32;

        if msg.header.trace() {
            log::info!(
                "put msg {} seq {} to {dst}",
                msg.header.msg_id,
                msg.header.seq_num
            );
        }

        if dst.proc == self.local {
            return self.enqueue(msg);
        }

        let prio = msg.header.priority();
        let transport = {
            let transports = self.transports.lock();
            transports
                .get(&(dst.proc, prio))
                .or_else(|| transports.get(&(dst.proc, Priority::Normal)))
                .cloned()
        };
        let transport = transport.ok_or(TransportError::NoTransport(dst.proc.0))?;
        transport.put(&msg)
    }

    fn enqueue(&self, msg: Message) -> Result<(), TransportError> {
        let port = msg.header.dst_id;
        let mut queues = self.queues.lock();
        match queues.get_mut(&port) {
            Some(q) => {
                q.push_back(msg);
                Ok(())
            }
            None => {
                drop(queues);
                self.undeliverable.fetch_add(1, Ordering::Relaxed);
                log::warn!("{}: no queue {port}, dropping msg {}", self.local, msg.header.msg_id);
                Err(TransportError::UnknownQueue(msg.header.dst().into()))
            }
        }
    }
}

impl MessageSink for MessageRouter {
    fn deliver(&self, msg: Message) -> Result<(), TransportError> {
        if msg.header.dst_proc != self.local.0 {
            log::warn!(
                "{}: message for proc {} arrived here",
                self.local,
                msg.header.dst_proc
            );
            self.undeliverable.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::UnknownQueue(msg.header.dst().into()));
        }
        if msg.header.trace() {
            log::info!(
                "deliver msg {} seq {} from proc {}",
                msg.header.msg_id,
                msg.header.seq_num,
                msg.header.src_proc
            );
        }
        self.enqueue(msg)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::transport::Status;

    #[test]
    fn header_wire_offsets() {
        let hdr = MsgHeader {
            link_next: 0x0403_0201,
            msg_size: 0x40,
            flags: Priority::Urgent as u16 | MsgFlags::TRACE.bits(),
            msg_id: 0x1111,
            dst_id: 0x2222,
            dst_proc: 0x3333,
            src_proc: 0x4444,
            seq_num: 0x5555,
            ..Default::default()
        };
        let mut raw = [0u8; 32];
        hdr.encode(&mut raw).unwrap();
        assert_eq!(&raw[0..4], &[1, 2, 3, 4]);
        assert_eq!(&raw[8..12], &[0x40, 0, 0, 0]);
        assert_eq!(&raw[12..14], &[0x03, 0x20]);
        assert_eq!(&raw[14..16], &[0x11, 0x11]);
        assert_eq!(&raw[16..18], &[0x22, 0x22]);
        assert_eq!(&raw[18..20], &[0x33, 0x33]);
        assert_eq!(&raw[24..26], &[0x44, 0x44]);
        assert_eq!(&raw[28..30], &[0x55, 0x55]);

        let back = MsgHeader::decode(&raw).unwrap();
        assert_eq!(back, hdr);
        assert_eq!(back.priority(), Priority::Urgent);
        assert!(back.trace());
    }

    #[test]
    fn message_encode_decode() {
        let msg = Message::new(7, &b"hello"[..]).with_priority(Priority::High);
        let mut buf = [0u8; 64];
        assert_eq!(msg.encode(&mut buf).unwrap(), 37);
        let back = Message::decode(&buf).unwrap();
        assert_eq!(back.payload, msg.payload);
        assert_eq!(back.header.msg_size, 37);
        assert_eq!(back.header.priority(), Priority::High);

        let mut small = [0u8; 36];
        assert_eq!(msg.encode(&mut small), Err(TransportError::MessageTooLarge(37)));
        assert_eq!(Message::decode(&buf[..20]), Err(TransportError::BadMessage));
        buf[8] = 200;
        assert_eq!(Message::decode(&buf), Err(TransportError::BadMessage));
    }

    #[test]
    fn queue_id_packs_proc_and_port() {
        let q = QueueId::new(ProcId(2), 0x10);
        assert_eq!(u32::from(q), 0x0002_0010);
        assert_eq!(QueueId::from(0x0002_0010), q);
    }

    #[test]
    fn local_put_and_get() {
        let router = MessageRouter::new(ProcId(0));
        let q = router.create_queue(1).unwrap();
        assert_eq!(router.create_queue(1), Err(TransportError::QueueExists(1)));

        router.put(q, Message::new(1, &b"a"[..])).unwrap();
        router.put(q, Message::new(2, &b"b"[..])).unwrap();
        assert_eq!(router.count(1).unwrap(), 2);

        let first = router.get(1).unwrap().unwrap();
        let second = router.get(1).unwrap().unwrap();
        assert_eq!((first.header.msg_id, second.header.msg_id), (1, 2));
        assert_eq!(second.header.seq_num, first.header.seq_num.wrapping_add(1));
        assert_eq!(first.header.src_proc, 0);
        assert!(router.get(1).unwrap().is_none());

        assert!(router.put(QueueId::new(ProcId(0), 9), Message::new(3, Bytes::new())).is_err());
        assert_eq!(router.undeliverable_count(), 1);
        assert_eq!(router.delete_queue(1), Ok(0));
        assert!(router.get(1).is_err());
    }

    struct Recording {
        remote: ProcId,
        prio: Priority,
        seen: spin::Mutex<Vec<u16>>,
    }

    impl Transport for Recording {
        fn put(&self, msg: &Message) -> Result<(), TransportError> {
            self.seen.lock().push(msg.header.msg_id);
            Ok(())
        }
        fn status(&self) -> Status {
            Status::Up
        }
        fn remote(&self) -> ProcId {
            self.remote
        }
        fn priority(&self) -> Priority {
            self.prio
        }
    }

    #[test]
    fn remote_routing_falls_back_to_normal() {
        let router = MessageRouter::new(ProcId(0));
        let normal = Arc::new(Recording {
            remote: ProcId(1),
            prio: Priority::Normal,
            seen: spin::Mutex::new(Vec::new()),
        });
        let urgent = Arc::new(Recording {
            remote: ProcId(1),
            prio: Priority::Urgent,
            seen: spin::Mutex::new(Vec::new()),
        });
        router.register_transport(normal.clone());
        router.register_transport(urgent.clone());

        let dst = QueueId::new(ProcId(1), 4);
        router.put(dst, Message::new(1, Bytes::new())).unwrap();
        router
            .put(dst, Message::new(2, Bytes::new()).with_priority(Priority::Urgent))
            .unwrap();
        router
            .put(dst, Message::new(3, Bytes::new()).with_priority(Priority::High))
            .unwrap();
        assert_eq!(*normal.seen.lock(), vec![1, 3]);
        assert_eq!(*urgent.seen.lock(), vec![2]);

        assert_eq!(
            router.put(QueueId::new(ProcId(5), 0), Message::new(4, Bytes::new())),
            Err(TransportError::NoTransport(5))
        );
        assert!(router.unregister_transport(ProcId(1), Priority::Normal).is_some());
        assert!(router.put(dst, Message::new(5, Bytes::new())).is_err());
    }

    #[test]
    fn sink_rejects_foreign_destination() {
        let router = MessageRouter::new(ProcId(3));
        router.create_queue(0).unwrap();
        let mut msg = Message::new(1, Bytes::new());
        msg.header.dst_proc = 4;
        assert!(router.deliver(msg).is_err());
        let mut msg = Message::new(2, Bytes::new());
        msg.header.dst_proc = 3;
        router.deliver(msg).unwrap();
        assert_eq!(router.count(0).unwrap(), 1);
    }
}
