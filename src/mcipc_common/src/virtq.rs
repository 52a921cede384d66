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

//! Split VirtQueue
//!
//! A [`VirtQueue`] owns one vring between exactly two processors together
//! with the interrupt channel used to kick the peer. One side is the
//! [`Role::Driver`], which adds buffers to the avail ring and reclaims them
//! from the used ring; the other is the [`Role::Device`], which consumes the
//! avail ring and returns buffers through the used ring.
//!
//! # Lifecycle
//!
//! ```text
//!  UNINITIALIZED ── create (zeroes the ring) ──┐
//!                                              ├──> READY
//!  UNINITIALIZED ── open (maps existing ring) ─┘
//! ```
//!
//! Exactly one peer creates the ring. The other only opens it, because
//! reinitialising would race with a producer already publishing.
//!
//! # Notification Policy
//!
//! Each side owns one suppression flag: the device owns
//! `VRING_USED_F_NO_NOTIFY`, the driver owns `VRING_AVAIL_F_NO_INTERRUPT`.
//! A side requests an interrupt only when it is idle:
//!
//! - a successful `get_*_buf` sets the flag, the side is busy draining and
//!   will see further entries without being interrupted;
//! - an empty `get_*_buf` clears the flag and then checks the index once
//!   more, closing the window where the peer published just before the
//!   flag was cleared.
//!
//! Callbacks must therefore drain until `get_*_buf` returns `None`.
//! [`VirtQueue::disable_notifications`] pins the flag set for polling.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering, fence};

use smallvec::SmallVec;
use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::cache::CacheMaint;
use crate::channel::{ChannelError, ControlMessage, InterruptChannel, RESERVED_BASE};
use crate::mem::CacheOps;
use crate::vring::{
    AvailFlags, DescFlags, RingError, UsedFlags, VringDesc, VringLayout, VringUsedElem,
};
use crate::xlate::AddressTranslator;

const DEFAULT_LEN: usize = 64;

/// Errors that can occur in virtqueue operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtqError {
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),
    #[error("Failed to signal peer: {0}")]
    SignalFailure(ChannelError),
    #[error("Queue id {0:#x} is in the reserved control range")]
    ReservedQueueId(u32),
}

/// Which half of the protocol this side runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Adds buffers to avail, reclaims them from used.
    Driver,
    /// Consumes avail, returns buffers through used.
    Device,
}

/// A buffer taken from the avail ring by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailBuf {
    /// Descriptor head, pass it back to [`VirtQueue::add_used_buf`].
    pub head: u16,
    /// Local address of the buffer.
    pub addr: u64,
    pub len: u32,
}

/// A buffer reclaimed from the used ring by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedBuf {
    pub head: u16,
    /// Local address originally passed to [`VirtQueue::add_avail_buf`].
    pub addr: u64,
    /// Length originally passed to [`VirtQueue::add_avail_buf`].
    pub len: u32,
    /// Length reported by the device.
    pub written: u32,
}

#[derive(Debug, Clone, Copy)]
struct Inflight {
    addr: u64,
    len: u32,
}

/// One direction of a vring plus its notify wiring.
#[derive(Debug)]
pub struct VirtQueue<M, C, T> {
    id: u32,
    role: Role,
    layout: VringLayout,
    mem: CacheMaint<M>,
    channel: C,
    xlate: T,
    /// Free descriptors, driver only
    num_free: u16,
    /// Next avail.idx to publish, driver only
    avail_idx: u16,
    /// How far the used ring has been consumed, driver only
    last_used_idx: u16,
    /// How far the avail ring has been consumed, device only
    last_avail_idx: u16,
    /// Next used.idx to publish, device only
    used_idx: u16,
    /// stack of free descriptor heads, allows out-of-order completion
    desc_free: SmallVec<[u16; DEFAULT_LEN]>,
    /// what each in-flight head points at, index = head
    inflight: SmallVec<[Option<Inflight>; DEFAULT_LEN]>,
    /// Last value written to our own suppression flag
    flags_shadow: u16,
    polling: bool,
}

impl<M, C, T> VirtQueue<M, C, T>
where
    M: CacheOps,
    C: InterruptChannel,
    T: AddressTranslator,
{
    /// Create a queue and initialise the ring memory.
    ///
    /// The whole ring is zeroed: indices start at 0 and both suppression
    /// flags are clear. Call this on exactly one of the two peers.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn create(
        id: u32,
        role: Role,
        layout: VringLayout,
        mem: CacheMaint<M>,
        channel: C,
        xlate: T,
    ) -> Result<Self, VirtqError> {
        let vq = Self::new(id, role, layout, mem, channel, xlate)?;

        const ZERO: [u8; 64] = [0; 64];
        let mut addr = layout.desc_addr;
        while addr < layout.end() {
            let n = core::cmp::min(ZERO.len() as u64, layout.end() - addr) as usize;
            vq.mem.write(addr, &ZERO[..n]).map_err(|_| RingError::MemError)?;
            addr += n as u64;
        }
        vq.mem
            .writeback(layout.desc_addr, (layout.end() - layout.desc_addr) as usize)
            .map_err(|_| RingError::MemError)?;

        log::debug!("virtqueue {id:#x} created as {role:?}, {} entries", layout.num);
        Ok(vq)
    }

    /// Open a queue whose ring the peer already created.
    ///
    /// Nothing in shared memory is modified. Local counters resume from the
    /// index this side owns, which is 0 on a fresh ring.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn open(
        id: u32,
        role: Role,
        layout: VringLayout,
        mem: CacheMaint<M>,
        channel: C,
        xlate: T,
    ) -> Result<Self, VirtqError> {
        let mut vq = Self::new(id, role, layout, mem, channel, xlate)?;
        let (idx_addr, flags_addr) = match role {
            Role::Driver => (layout.avail_idx(), layout.avail_flags()),
            Role::Device => (layout.used_idx(), layout.used_flags()),
        };
        let idx = vq.mem.fetch_u16(idx_addr).map_err(|_| RingError::MemError)?;
        vq.flags_shadow = vq.mem.fetch_u16(flags_addr).map_err(|_| RingError::MemError)?;
        vq.avail_idx = idx;
        vq.last_used_idx = idx;
        vq.last_avail_idx = idx;
        vq.used_idx = idx;

        log::debug!("virtqueue {id:#x} opened as {role:?} at index {idx}");
        Ok(vq)
    }

    fn new(
        id: u32,
        role: Role,
        layout: VringLayout,
        mem: CacheMaint<M>,
        channel: C,
        xlate: T,
    ) -> Result<Self, VirtqError> {
        if id >= RESERVED_BASE {
            return Err(VirtqError::ReservedQueueId(id));
        }

        let num = layout.num;
        // pop() hands out head 0 first
        let desc_free = (0..num).rev().collect::<SmallVec<[_; DEFAULT_LEN]>>();
        let inflight = SmallVec::<[_; DEFAULT_LEN]>::from_elem(None, num as usize);

        Ok(Self {
            id,
            role,
            layout,
            mem,
            channel,
            xlate,
            num_free: num,
            avail_idx: 0,
            last_used_idx: 0,
            last_avail_idx: 0,
            used_idx: 0,
            desc_free,
            inflight,
            flags_shadow: 0,
            polling: false,
        })
    }

    #[inline]
    fn require(&self, role: Role) -> Result<(), RingError> {
        if self.role != role {
            return Err(RingError::WrongRole);
        }
        Ok(())
    }

    /// Add a buffer to the avail ring.
    ///
    /// Returns the number of free descriptors left. On error nothing in
    /// shared memory is published and the queue state is unchanged.
    ///
    /// # Errors
    ///
    /// - [`RingError::RingFull`] - no free descriptor
    /// - [`RingError::TranslationFailed`] - `addr` is outside the shared window
    pub fn add_avail_buf(&mut self, addr: u64, len: u32) -> Result<u16, RingError> {
        self.require(Role::Driver)?;
        if self.num_free == 0 {
            return Err(RingError::RingFull);
        }
        let shared = self
            .xlate
            .to_shared(addr)
            .ok_or(RingError::TranslationFailed(addr))?;
        let head = *self.desc_free.last().ok_or(RingError::RingFull)?;
        let desc_addr = self
            .layout
            .desc(head)
            .ok_or(RingError::InvalidDescriptor(head))?;

        let desc = VringDesc::new(shared, len, DescFlags::empty());
        self.mem
            .publish_val(desc_addr, desc)
            .map_err(|_| RingError::MemError)?;
        self.mem
            .publish_val(self.layout.avail_slot(self.avail_idx), head)
            .map_err(|_| RingError::MemError)?;

        let next = self.avail_idx.wrapping_add(1);
        self.mem
            .publish_u16(self.layout.avail_idx(), next)
            .map_err(|_| RingError::MemError)?;

        self.avail_idx = next;
        self.desc_free.pop();
        self.inflight[head as usize] = Some(Inflight { addr, len });
        self.num_free -= 1;

        Ok(self.num_free)
    }

    /// Take the next buffer from the avail ring.
    ///
    /// Returns `Ok(None)` when the ring is empty, after asking the driver to
    /// kick on its next add. A head outside the table is consumed and
    /// reported as [`RingError::InvalidDescriptor`]. A buffer whose address
    /// has no local translation is returned to the driver with length 0 and
    /// reported as [`RingError::TranslationFailed`].
    pub fn get_avail_buf(&mut self) -> Result<Option<AvailBuf>, RingError> {
        self.require(Role::Device)?;
        let avail_idx = self.layout.avail_idx();
        if !self.poll_index(avail_idx, self.last_avail_idx)? {
            return Ok(None);
        }

        let slot = self.layout.avail_slot(self.last_avail_idx);
        let head: u16 = self.mem.fetch_val(slot).map_err(|_| RingError::MemError)?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);

        let desc_addr = self
            .layout
            .desc(head)
            .ok_or(RingError::InvalidDescriptor(head))?;
        let desc: VringDesc = self
            .mem
            .fetch_val(desc_addr)
            .map_err(|_| RingError::MemError)?;

        match self.xlate.to_local(desc.addr) {
            Some(addr) => Ok(Some(AvailBuf {
                head,
                addr,
                len: desc.len,
            })),
            None => {
                log::warn!(
                    "virtqueue {:#x}: descriptor {head} address {:#x} not mapped locally",
                    self.id,
                    desc.addr
                );
                self.add_used_buf(head, 0)?;
                Err(RingError::TranslationFailed(desc.addr as u64))
            }
        }
    }

    /// Return a consumed buffer to the driver through the used ring.
    ///
    /// `len` is the number of bytes the device wrote into the buffer.
    pub fn add_used_buf(&mut self, head: u16, len: u32) -> Result<(), RingError> {
        self.require(Role::Device)?;
        if head >= self.layout.num {
            return Err(RingError::InvalidDescriptor(head));
        }

        let elem = VringUsedElem {
            id: head as u32,
            len,
        };
        self.mem
            .publish_val(self.layout.used_elem(self.used_idx), elem)
            .map_err(|_| RingError::MemError)?;

        let next = self.used_idx.wrapping_add(1);
        self.mem
            .publish_u16(self.layout.used_idx(), next)
            .map_err(|_| RingError::MemError)?;
        self.used_idx = next;

        Ok(())
    }

    /// Reclaim the next buffer the device returned.
    ///
    /// The descriptor goes back to the free pool. Returns `Ok(None)` when
    /// nothing has been returned, after asking the device to interrupt on its
    /// next completion.
    pub fn get_used_buf(&mut self) -> Result<Option<UsedBuf>, RingError> {
        self.require(Role::Driver)?;
        let used_idx = self.layout.used_idx();
        if !self.poll_index(used_idx, self.last_used_idx)? {
            return Ok(None);
        }

        let elem: VringUsedElem = self
            .mem
            .fetch_val(self.layout.used_elem(self.last_used_idx))
            .map_err(|_| RingError::MemError)?;
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        let head = elem.id as u16;
        if elem.id >= self.layout.num as u32 {
            return Err(RingError::InvalidDescriptor(head));
        }
        let inflight = self.inflight[head as usize]
            .take()
            .ok_or(RingError::InvalidDescriptor(head))?;

        self.desc_free.push(head);
        self.num_free += 1;

        Ok(Some(UsedBuf {
            head,
            addr: inflight.addr,
            len: inflight.len,
            written: elem.len,
        }))
    }

    /// Is there anything new at `idx_addr` beyond `seen`?
    ///
    /// Applies the idle/busy notification policy to our own flag.
    fn poll_index(&mut self, idx_addr: u64, seen: u16) -> Result<bool, RingError> {
        let mut idx = self.mem.fetch_u16(idx_addr).map_err(|_| RingError::MemError)?;
        if idx == seen {
            if self.polling {
                return Ok(false);
            }
            self.set_suppressed(false)?;
            // order the flag store before the index reload
            fence(Ordering::SeqCst);
            idx = self.mem.fetch_u16(idx_addr).map_err(|_| RingError::MemError)?;
            if idx == seen {
                return Ok(false);
            }
        }
        self.set_suppressed(true)?;
        Ok(true)
    }

    fn set_suppressed(&mut self, on: bool) -> Result<(), RingError> {
        let want = match (self.role, on) {
            (_, false) => 0,
            (Role::Driver, true) => AvailFlags::NO_INTERRUPT.bits(),
            (Role::Device, true) => UsedFlags::NO_NOTIFY.bits(),
        };
        if self.flags_shadow == want {
            return Ok(());
        }
        let addr = match self.role {
            Role::Driver => self.layout.avail_flags(),
            Role::Device => self.layout.used_flags(),
        };
        self.mem
            .publish_u16(addr, want)
            .map_err(|_| RingError::MemError)?;
        self.flags_shadow = want;
        Ok(())
    }

    /// Interrupt the peer unless it asked not to be.
    ///
    /// The driver honours `VRING_USED_F_NO_NOTIFY`, the device honours
    /// `VRING_AVAIL_F_NO_INTERRUPT`. Returns whether the interrupt was raised.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn kick(&self) -> Result<bool, VirtqError> {
        // order our index publish before reading the peer's flag
        fence(Ordering::SeqCst);
        let suppressed = match self.role {
            Role::Driver => {
                let raw = self
                    .mem
                    .fetch_u16(self.layout.used_flags())
                    .map_err(|_| RingError::MemError)?;
                UsedFlags::from_bits_truncate(raw).contains(UsedFlags::NO_NOTIFY)
            }
            Role::Device => {
                let raw = self
                    .mem
                    .fetch_u16(self.layout.avail_flags())
                    .map_err(|_| RingError::MemError)?;
                AvailFlags::from_bits_truncate(raw).contains(AvailFlags::NO_INTERRUPT)
            }
        };
        if suppressed {
            log::trace!("virtqueue {:#x}: kick suppressed by peer", self.id);
            return Ok(false);
        }

        self.channel
            .kick(self.id)
            .map_err(VirtqError::SignalFailure)?;
        Ok(true)
    }

    /// Stop asking the peer for interrupts; the caller polls instead.
    pub fn disable_notifications(&mut self) -> Result<(), RingError> {
        self.polling = true;
        self.set_suppressed(true)
    }

    /// Go back to interrupt driven operation.
    pub fn enable_notifications(&mut self) -> Result<(), RingError> {
        self.polling = false;
        self.set_suppressed(false)
    }

    /// Is there an avail entry the device has not consumed yet?
    ///
    /// Does not touch the suppression flag.
    pub fn has_avail(&self) -> Result<bool, RingError> {
        self.require(Role::Device)?;
        let idx = self
            .mem
            .fetch_u16(self.layout.avail_idx())
            .map_err(|_| RingError::MemError)?;
        Ok(idx != self.last_avail_idx)
    }

    /// Is there a used entry the driver has not reclaimed yet?
    ///
    /// Does not touch the suppression flag.
    pub fn has_used(&self) -> Result<bool, RingError> {
        self.require(Role::Driver)?;
        let idx = self
            .mem
            .fetch_u16(self.layout.used_idx())
            .map_err(|_| RingError::MemError)?;
        Ok(idx != self.last_used_idx)
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn layout(&self) -> &VringLayout {
        &self.layout
    }

    /// Memory of the ring, for reading and writing buffer contents.
    #[inline]
    pub fn cache(&self) -> &CacheMaint<M> {
        &self.mem
    }

    /// Get number of free descriptors in the ring.
    #[inline]
    pub fn num_free(&self) -> usize {
        self.num_free as usize
    }

    /// Get number of added but not yet reclaimed descriptors.
    #[inline]
    pub fn num_inflight(&self) -> usize {
        self.layout.num as usize - self.num_free as usize
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.num_free == 0
    }

    /// Get descriptor table length
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.num as usize
    }
}

/// Called with the queue id from interrupt context. Must not block.
pub type VqCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Sees every control message after built-in handling. When installed, its
/// answer replaces the built-in reply; echo requests are always answered.
pub type ControlHook = Arc<dyn Fn(ControlMessage) -> Option<ControlMessage> + Send + Sync>;

/// What the dispatcher knows about the remote core.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unknown = 0,
    Ready = 1,
    Crashed = 2,
}

/// Routes payloads arriving on one interrupt channel.
///
/// One dispatcher exists per remote core and replaces a global queue
/// registry. Queue ids go to their registered callback, control messages are
/// handled in place.
pub struct VqDispatcher {
    callbacks: spin::Mutex<BTreeMap<u32, VqCallback>>,
    control: spin::Mutex<Option<ControlHook>>,
    peer: AtomicU8,
    unknown: AtomicU32,
    echo_replies: AtomicU32,
}

impl Default for VqDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl VqDispatcher {
    pub fn new() -> Self {
        Self {
            callbacks: spin::Mutex::new(BTreeMap::new()),
            control: spin::Mutex::new(None),
            peer: AtomicU8::new(PeerState::Unknown as u8),
            unknown: AtomicU32::new(0),
            echo_replies: AtomicU32::new(0),
        }
    }

    /// Route kicks carrying `id` to `callback`, replacing any previous one.
    pub fn register(&self, id: u32, callback: VqCallback) -> Result<(), VirtqError> {
        if id >= RESERVED_BASE {
            return Err(VirtqError::ReservedQueueId(id));
        }
        self.callbacks.lock().insert(id, callback);
        Ok(())
    }

    /// Returns whether a callback was registered.
    pub fn unregister(&self, id: u32) -> bool {
        self.callbacks.lock().remove(&id).is_some()
    }

    pub fn set_control_hook(&self, hook: Option<ControlHook>) {
        *self.control.lock() = hook;
    }

    pub fn peer_state(&self) -> PeerState {
        match self.peer.load(Ordering::Acquire) {
            1 => PeerState::Ready,
            2 => PeerState::Crashed,
            _ => PeerState::Unknown,
        }
    }

    /// Payloads that named no registered queue.
    pub fn unknown_queue_count(&self) -> u32 {
        self.unknown.load(Ordering::Relaxed)
    }

    pub fn echo_reply_count(&self) -> u32 {
        self.echo_replies.load(Ordering::Relaxed)
    }

    /// Service the channel until no payload is pending.
    ///
    /// Returns the number of payloads handled. One call may stand for any
    /// number of coalesced kicks, so callbacks rescan their rings.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level = "Trace"))]
    pub fn isr<C: InterruptChannel>(&self, channel: &C) -> usize {
        let mut handled = 0;
        while let Some(payload) = channel.clear() {
            handled += 1;
            match ControlMessage::try_from(payload) {
                Ok(msg) => self.handle_control(channel, msg),
                Err(id) if ControlMessage::is_reserved(id) => {
                    log::warn!("unassigned control payload {id:#x}");
                }
                Err(id) => {
                    // clone out so the callback runs without the lock held
                    let cb = self.callbacks.lock().get(&id).cloned();
                    match cb {
                        Some(cb) => cb(id),
                        None => {
                            self.unknown.fetch_add(1, Ordering::Relaxed);
                            log::warn!("kick for unregistered virtqueue {id:#x}");
                        }
                    }
                }
            }
        }
        handled
    }

    fn handle_control<C: InterruptChannel>(&self, channel: &C, msg: ControlMessage) {
        let mut reply = None;
        match msg {
            ControlMessage::Ready | ControlMessage::BootInitDone => {
                self.peer.store(PeerState::Ready as u8, Ordering::Release);
                log::info!("peer reported {msg:?}");
            }
            ControlMessage::Crash => {
                self.peer.store(PeerState::Crashed as u8, Ordering::Release);
                log::error!("peer crashed");
            }
            ControlMessage::EchoRequest => reply = Some(ControlMessage::EchoReply),
            ControlMessage::EchoReply => {
                self.echo_replies.fetch_add(1, Ordering::Relaxed);
            }
            ControlMessage::AbortRequest => log::warn!("peer requested abort"),
            ControlMessage::Hibernation => reply = Some(ControlMessage::HibernationCancel),
            ControlMessage::HibernationForce => reply = Some(ControlMessage::HibernationAck),
            ControlMessage::StateChange
            | ControlMessage::FlushCache
            | ControlMessage::HibernationAck
            | ControlMessage::HibernationCancel => {}
        }

        let hook = self.control.lock().clone();
        if let Some(hook) = hook {
            let answer = hook(msg);
            if msg != ControlMessage::EchoRequest {
                reply = answer;
            }
        }

        if let Some(reply) = reply
            && let Err(e) = channel.kick(reply.into())
        {
            log::warn!("failed to answer {msg:?} with {reply:?}: {e}");
        }
    }
}
