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

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcipc_common::cache::CacheMaint;
use mcipc_common::channel::{ControlMessage, InterruptChannel};
use mcipc_common::circ::{CircError, CircLayout, CircQueue};
use mcipc_common::gate::SpinGate;
use mcipc_common::heap::HeapBuf;
use mcipc_common::msgq::{Message, MessageRouter, Priority, ProcId, QueueId, SharedTransport};
use mcipc_common::notify::{DropHook, EVENT_ENTRY_SIZE, NotifyDriverCirc};
use mcipc_common::transport::circ::TransportCirc;
use mcipc_common::transport::shm::{ShmParams, TransportShm};
use mcipc_common::transport::shm_circ::TransportShmCirc;
use mcipc_common::transport::virtio::TransportVirtio;
use mcipc_common::transport::{
    MessageSink, ObjType, SendWait, Status, TransportError,
};
use mcipc_common::virtq::{Role, VirtQueue, VqDispatcher};
use mcipc_common::vring::{RingError, VringLayout};
use mcipc_common::xlate::Window;
use tracing::{Span, instrument};

use crate::clock::StdClock;
use crate::config::IpcConfiguration;
use crate::error::IpcError;
use crate::layout::MemoryLayout;
use crate::mailbox::{MailboxBank, MailboxChannel};
use crate::mem::{CoreMem, LOCAL_BASE, SimMemory};
use crate::metrics::{CounterMetric, EmittableMetric, HistogramMetric};
use crate::{HEAP_BLOCK_SIZE, Result, log_then_return};

type SimNotify = NotifyDriverCirc<Arc<CoreMem>, MailboxChannel>;
type SimHeap = HeapBuf<HEAP_BLOCK_SIZE>;
type ShmLink = TransportShm<Arc<CoreMem>, Arc<SpinGate>, Window, Arc<SimNotify>, Arc<SimHeap>>;
type ShmCircLink = TransportShmCirc<Arc<CoreMem>, Window, Arc<SimNotify>, Arc<SimHeap>>;
type CircLink = TransportCirc<Arc<CoreMem>, Arc<SimNotify>>;
type VirtioLink = TransportVirtio<Arc<CoreMem>, MailboxChannel, Window, Arc<SimHeap>>;

/// Payload a notify driver raises on the mailbox. Any non-reserved value works.
const NOTIFY_KICK: u32 = 0;
const SHM_EVENT: u32 = 2;
const SHM_CIRC_EVENT: u32 = 3;
const CIRC_EVENT: u32 = 4;

/// Virtio queue ids: ring 0 carries host to remote, ring 1 the way back.
const VQ_HOST_TO_REMOTE: u32 = 0;
const VQ_REMOTE_TO_HOST: u32 = 1;

/// Which transport carries messages over a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Heap blocks chained on shared lists
    Shm,
    /// Heap block pointers in a circular queue
    ShmCirc,
    /// Messages copied into circular queue slots
    Circ,
    /// Buffers exchanged over two vrings
    Virtio,
}

enum LinkTransport {
    Shm(Arc<ShmLink>),
    ShmCirc(Arc<ShmCircLink>),
    Circ(Arc<CircLink>),
    Virtio {
        transport: Arc<VirtioLink>,
        dispatcher: Arc<VqDispatcher>,
    },
}

impl LinkTransport {
    fn shared(&self) -> SharedTransport {
        match self {
            LinkTransport::Shm(t) => t.clone(),
            LinkTransport::ShmCirc(t) => t.clone(),
            LinkTransport::Circ(t) => t.clone(),
            LinkTransport::Virtio { transport, .. } => transport.clone(),
        }
    }

    fn kind(&self) -> TransportKind {
        match self {
            LinkTransport::Shm(_) => TransportKind::Shm,
            LinkTransport::ShmCirc(_) => TransportKind::ShmCirc,
            LinkTransport::Circ(_) => TransportKind::Circ,
            LinkTransport::Virtio { .. } => TransportKind::Virtio,
        }
    }
}

/// One end of a link between two cores.
struct Link {
    remote: ProcId,
    channel: MailboxChannel,
    /// Notify-based transports only.
    notify: Option<Arc<SimNotify>>,
    transport: LinkTransport,
}

impl Link {
    /// Take everything the peer signalled. Returns payloads or events handled
    /// plus messages picked up by the sweep.
    fn service(&self, core: ProcId, sink: &dyn MessageSink) -> Result<usize> {
        let handled = match (&self.transport, &self.notify) {
            (LinkTransport::Virtio { transport, dispatcher }, _) => {
                let kicks = dispatcher.isr(&self.channel);
                kicks + transport.receive(sink)?
            }
            // messages published behind a refused kick are only found by looking
            (LinkTransport::Shm(t), Some(notify)) => notify.isr()? + t.receive(sink)?,
            (LinkTransport::ShmCirc(t), Some(notify)) => notify.isr()? + t.receive(sink)?,
            (LinkTransport::Circ(t), Some(notify)) => notify.isr()? + t.receive(sink)?,
            (_, None) => 0,
        };
        if handled > 0 {
            HistogramMetric::emit_isr_batch(core.0, handled);
        }
        Ok(handled)
    }

    fn close(&self) -> Result<()> {
        match &self.transport {
            LinkTransport::Shm(t) => t.close()?,
            LinkTransport::ShmCirc(t) => t.close()?,
            LinkTransport::Circ(t) => t.close()?,
            LinkTransport::Virtio { dispatcher, .. } => {
                dispatcher.unregister(VQ_HOST_TO_REMOTE);
                dispatcher.unregister(VQ_REMOTE_TO_HOST);
            }
        }
        self.channel.disable();
        Ok(())
    }
}

/// Everything one simulated core owns: its cache, its router and its links.
pub struct CoreContext {
    id: ProcId,
    mem: Arc<CoreMem>,
    router: Arc<MessageRouter>,
    links: Mutex<BTreeMap<u16, Link>>,
    bank: Arc<MailboxBank>,
}

impl fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreContext")
            .field("id", &self.id)
            .field("coherent", &self.mem.is_coherent())
            .finish_non_exhaustive()
    }
}

impl CoreContext {
    fn new(id: ProcId, mem: Arc<CoreMem>, bank: Arc<MailboxBank>) -> Self {
        Self {
            id,
            mem,
            router: Arc::new(MessageRouter::new(id)),
            links: Mutex::new(BTreeMap::new()),
            bank,
        }
    }

    pub fn id(&self) -> ProcId {
        self.id
    }

    pub fn mem(&self) -> &Arc<CoreMem> {
        &self.mem
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn create_queue(&self, port: u16) -> Result<QueueId> {
        Ok(self.router.create_queue(port)?)
    }

    pub fn get(&self, port: u16) -> Result<Option<Message>> {
        Ok(self.router.get(port)?)
    }

    /// Send `msg` to `dst`, local or remote.
    ///
    /// A remote send that fails for lack of room left nothing behind; see
    /// [`IpcError::is_retryable`]. A [`TransportError::SignalFailure`] means
    /// the message is published and is found on the peer's next
    /// [`service`](Self::service), so it must not be sent again.
    #[instrument(err(Debug), skip(self, msg), parent = Span::current(), level = "Trace")]
    pub fn put(&self, dst: QueueId, msg: Message) -> Result<()> {
        match self.router.put(dst, msg) {
            Ok(()) => Ok(()),
            Err(e) => {
                match e {
                    TransportError::Ring(RingError::RingFull)
                    | TransportError::Circ(CircError::QueueFull | CircError::Timeout) => {
                        CounterMetric::ring_full(self.id.0).emit();
                    }
                    TransportError::SignalFailure(_) => {
                        CounterMetric::signal_failure(self.id.0).emit();
                    }
                    _ => {}
                }
                Err(e.into())
            }
        }
    }

    /// Block until one of this core's enabled lines holds a payload or
    /// `timeout` passes.
    pub fn wait_for_interrupt(&self, timeout: Duration) -> bool {
        self.bank.wait(self.id, timeout)
    }

    /// Run the interrupt handler of every link once.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn service(&self) -> Result<usize> {
        let links = self.links.lock()?;
        let mut handled = 0;
        for link in links.values() {
            handled += link.service(self.id, &*self.router)?;
        }
        Ok(handled)
    }

    /// Wait up to `timeout` for an interrupt, then service every link.
    pub fn poll(&self, timeout: Duration) -> Result<usize> {
        self.wait_for_interrupt(timeout);
        self.service()
    }

    /// Remote cores this core has a link to.
    pub fn peers(&self) -> Result<Vec<ProcId>> {
        Ok(self.links.lock()?.values().map(|l| l.remote).collect())
    }

    /// Transport kind of the link to `remote`, if there is one.
    pub fn link_kind(&self, remote: ProcId) -> Result<Option<TransportKind>> {
        Ok(self.links.lock()?.get(&remote.0).map(|l| l.transport.kind()))
    }

    /// Status of the transport to `remote`.
    pub fn status(&self, remote: ProcId) -> Result<Status> {
        let links = self.links.lock()?;
        let link = links
            .get(&remote.0)
            .ok_or(IpcError::NotAttached(self.id.0, remote.0))?;
        Ok(link.transport.shared().status())
    }

    /// Ask `remote` to answer with an echo reply. Only virtio links carry
    /// control messages.
    pub fn ping(&self, remote: ProcId) -> Result<()> {
        let links = self.links.lock()?;
        let link = links
            .get(&remote.0)
            .ok_or(IpcError::NotAttached(self.id.0, remote.0))?;
        if link.transport.kind() != TransportKind::Virtio {
            log_then_return!("link {} -> {} carries no control messages", self.id, remote);
        }
        link.channel.kick(ControlMessage::EchoRequest.into())?;
        Ok(())
    }

    /// Echo replies received from `remote`.
    pub fn echo_replies(&self, remote: ProcId) -> Result<u32> {
        let links = self.links.lock()?;
        match links.get(&remote.0).map(|l| &l.transport) {
            Some(LinkTransport::Virtio { dispatcher, .. }) => Ok(dispatcher.echo_reply_count()),
            Some(_) => Ok(0),
            None => Err(IpcError::NotAttached(self.id.0, remote.0)),
        }
    }

    /// Events dropped for lack of a callback, over every link.
    pub fn dropped_events(&self) -> Result<u32> {
        Ok(self
            .links
            .lock()?
            .values()
            .filter_map(|l| l.notify.as_ref())
            .map(|n| n.dropped_events())
            .sum())
    }

    fn insert_link(&self, link: Link) -> Result<()> {
        self.router.register_transport(link.transport.shared());
        self.links.lock()?.insert(link.remote.0, link);
        Ok(())
    }

    fn remove_link(&self, remote: ProcId) -> Result<Option<Link>> {
        let link = self.links.lock()?.remove(&remote.0);
        if link.is_some() {
            self.router.unregister_transport(remote, Priority::Normal);
        }
        Ok(link)
    }
}

/// Simulated cores sharing one memory and one mailbox bank.
///
/// Cores start unconnected; [`attach`](Self::attach) builds a link between a
/// pair and [`detach`](Self::detach) tears it down again. The lower core id
/// of a pair creates the shared state and, over virtio, acts as host.
pub struct IpcSystem {
    config: IpcConfiguration,
    layout: MemoryLayout,
    memory: Arc<SimMemory>,
    bank: Arc<MailboxBank>,
    gate: Arc<SpinGate>,
    clock: Arc<StdClock>,
    cores: Vec<Arc<CoreContext>>,
}

impl fmt::Debug for IpcSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcSystem")
            .field("config", &self.config)
            .field("layout", &self.layout)
            .field("cores", &self.cores.len())
            .finish_non_exhaustive()
    }
}

impl IpcSystem {
    #[instrument(err(Debug), skip(config), parent = Span::current(), level = "Trace")]
    pub fn new(num_cores: u16, config: IpcConfiguration) -> Result<Self> {
        let layout = MemoryLayout::new(&config, num_cores)?;
        let memory = Arc::new(SimMemory::new(layout.total_size())?);
        let bank = Arc::new(MailboxBank::new(num_cores, config.get_mailbox_depth()));
        let coherent = !config.get_cache_enabled();
        let cores = (0..num_cores)
            .map(|id| {
                let mem = memory.core_view(ProcId(id), coherent);
                Arc::new(CoreContext::new(ProcId(id), mem, bank.clone()))
            })
            .collect();
        log::debug!("{num_cores} cores over {:#x} bytes of shared memory: {layout:?}", memory.size());

        Ok(Self {
            config,
            layout,
            memory,
            bank,
            gate: Arc::new(SpinGate::new()),
            clock: Arc::new(StdClock::new()),
            cores,
        })
    }

    pub fn config(&self) -> &IpcConfiguration {
        &self.config
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn memory(&self) -> &Arc<SimMemory> {
        &self.memory
    }

    pub fn mailboxes(&self) -> &Arc<MailboxBank> {
        &self.bank
    }

    pub fn num_cores(&self) -> u16 {
        self.cores.len() as u16
    }

    pub fn core(&self, id: u16) -> Result<Arc<CoreContext>> {
        self.cores
            .get(id as usize)
            .cloned()
            .ok_or(IpcError::UnknownProcessor(id))
    }

    fn send_wait(&self) -> SendWait {
        SendWait::Timeout(
            self.clock.clone(),
            StdClock::ticks(self.config.get_send_timeout()),
        )
    }

    fn cache(&self, core: &CoreContext) -> CacheMaint<Arc<CoreMem>> {
        CacheMaint::new(core.mem.clone(), self.config.get_cache_enabled())
    }

    /// Connect cores `a` and `b` with a transport of `kind`.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn attach(&self, a: u16, b: u16, kind: TransportKind) -> Result<()> {
        let (lo, hi) = (a.min(b), a.max(b));
        let host = self.core(lo)?;
        let remote = self.core(hi)?;
        let Some(offset) = self.layout.link_offset(lo, hi) else {
            log_then_return!("core {lo} cannot be linked to itself");
        };
        if host.links.lock()?.contains_key(&hi) || remote.links.lock()?.contains_key(&lo) {
            return Err(IpcError::AlreadyAttached(lo, hi));
        }
        let base = LOCAL_BASE + offset as u64;
        let heap_id = offset / self.layout.link_size();
        let (host_link, remote_link) = match kind {
            TransportKind::Virtio => self.build_virtio(&host, &remote, base, heap_id as u16)?,
            _ => self.build_notified(&host, &remote, base, heap_id as u16, kind)?,
        };
        host.insert_link(host_link)?;
        remote.insert_link(remote_link)?;
        log::info!("cores {lo} and {hi} linked over {kind:?} at {base:#x}");
        Ok(())
    }

    /// Tear down the link between `a` and `b`.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn detach(&self, a: u16, b: u16) -> Result<()> {
        let ca = self.core(a)?;
        let cb = self.core(b)?;
        let la = ca.remove_link(cb.id)?;
        let lb = cb.remove_link(ca.id)?;
        if la.is_none() && lb.is_none() {
            return Err(IpcError::NotAttached(a, b));
        }
        for link in la.iter().chain(lb.iter()) {
            link.close()?;
        }
        // nothing of the old link may be written back over the next one
        ca.mem.flush_all()?;
        cb.mem.flush_all()?;
        log::info!("cores {a} and {b} unlinked");
        Ok(())
    }

    fn notify_pair(
        &self,
        host: &CoreContext,
        remote: &CoreContext,
        base: u64,
    ) -> Result<(Arc<SimNotify>, Arc<SimNotify>)> {
        let n = self.config.get_circ_num_msgs();
        let at = base + self.layout.notify_offset() as u64;
        let [first, second] = CircLayout::pair(at, n, EVENT_ENTRY_SIZE)?;
        let host_q = CircQueue::create(first, second, self.cache(host))?;
        let remote_q = CircQueue::open(second, first, self.cache(remote))?;

        let mut pair = Vec::with_capacity(2);
        for (queue, local, peer) in [(host_q, host.id, remote.id), (remote_q, remote.id, host.id)] {
            let channel = self.bank.channel(local, peer)?;
            let notify = Arc::new(NotifyDriverCirc::new(queue, channel, NOTIFY_KICK)?);
            let hook: DropHook = Arc::new(move |_event, _payload| {
                CounterMetric::dropped_event(local.0).emit();
            });
            notify.set_drop_hook(Some(hook));
            pair.push(notify);
        }
        let remote_notify = pair.pop().ok_or("notify pair")?;
        let host_notify = pair.pop().ok_or("notify pair")?;
        Ok((host_notify, remote_notify))
    }

    fn build_notified(
        &self,
        host: &Arc<CoreContext>,
        remote: &Arc<CoreContext>,
        base: u64,
        heap_id: u16,
        kind: TransportKind,
    ) -> Result<(Link, Link)> {
        let (host_notify, remote_notify) = self.notify_pair(host, remote, base)?;
        let heap = Arc::new(SimHeap::new(
            heap_id,
            base + self.layout.heap_offset() as u64,
            self.layout.heap_size(),
        )?);
        let window = self.memory.window();
        let n = self.config.get_circ_num_msgs();

        let (host_t, remote_t) = match kind {
            TransportKind::Shm => {
                let at = base + self.layout.shm_offset() as u64;
                let params = |local: ProcId, peer: ProcId| ShmParams {
                    local,
                    remote: peer,
                    priority: Priority::Normal,
                    notify_event: SHM_EVENT,
                };
                let h = Arc::new(
                    ShmLink::new(
                        ObjType::CreateDynamic,
                        at,
                        params(host.id, remote.id),
                        self.cache(host),
                        self.gate.clone(),
                        window,
                        host_notify.clone(),
                        heap.clone(),
                    )?
                    .with_send_wait(self.send_wait()),
                );
                let r = Arc::new(
                    ShmLink::new(
                        ObjType::OpenDynamic,
                        at,
                        params(remote.id, host.id),
                        self.cache(remote),
                        self.gate.clone(),
                        window,
                        remote_notify.clone(),
                        heap,
                    )?
                    .with_send_wait(self.send_wait()),
                );
                h.attach(host.router.clone())?;
                r.attach(remote.router.clone())?;
                (LinkTransport::Shm(h), LinkTransport::Shm(r))
            }
            TransportKind::ShmCirc => {
                let at = base + self.layout.shm_circ_offset() as u64;
                let h = Arc::new(
                    ShmCircLink::new(
                        ObjType::CreateDynamic,
                        at,
                        n,
                        remote.id,
                        Priority::Normal,
                        SHM_CIRC_EVENT,
                        self.cache(host),
                        window,
                        host_notify.clone(),
                        heap.clone(),
                    )?
                    .with_send_wait(self.send_wait()),
                );
                let r = Arc::new(
                    ShmCircLink::new(
                        ObjType::OpenDynamic,
                        at,
                        n,
                        host.id,
                        Priority::Normal,
                        SHM_CIRC_EVENT,
                        self.cache(remote),
                        window,
                        remote_notify.clone(),
                        heap,
                    )?
                    .with_send_wait(self.send_wait()),
                );
                h.attach(host.router.clone())?;
                r.attach(remote.router.clone())?;
                (LinkTransport::ShmCirc(h), LinkTransport::ShmCirc(r))
            }
            TransportKind::Circ => {
                let at = base + self.layout.circ_offset() as u64;
                let slot = self.config.get_circ_entry_size();
                let h = Arc::new(
                    CircLink::new(
                        ObjType::CreateDynamic,
                        at,
                        n,
                        slot,
                        remote.id,
                        Priority::Normal,
                        CIRC_EVENT,
                        self.cache(host),
                        host_notify.clone(),
                    )?
                    .with_send_wait(self.send_wait()),
                );
                let r = Arc::new(
                    CircLink::new(
                        ObjType::OpenDynamic,
                        at,
                        n,
                        slot,
                        host.id,
                        Priority::Normal,
                        CIRC_EVENT,
                        self.cache(remote),
                        remote_notify.clone(),
                    )?
                    .with_send_wait(self.send_wait()),
                );
                h.attach(host.router.clone())?;
                r.attach(remote.router.clone())?;
                (LinkTransport::Circ(h), LinkTransport::Circ(r))
            }
            TransportKind::Virtio => log_then_return!("virtio links carry no notify driver"),
        };

        Ok((
            Link {
                remote: remote.id,
                channel: self.bank.channel(host.id, remote.id)?,
                notify: Some(host_notify),
                transport: host_t,
            },
            Link {
                remote: host.id,
                channel: self.bank.channel(remote.id, host.id)?,
                notify: Some(remote_notify),
                transport: remote_t,
            },
        ))
    }

    fn build_virtio(
        &self,
        host: &Arc<CoreContext>,
        remote: &Arc<CoreContext>,
        base: u64,
        heap_id: u16,
    ) -> Result<(Link, Link)> {
        let entries = self.config.get_ring_entries();
        let align = self.config.get_vring_align();
        let window = self.memory.window();
        let to_remote = self.bank.channel(host.id, remote.id)?;
        let to_host = self.bank.channel(remote.id, host.id)?;
        let ring0 = VringLayout::from_base(base + self.layout.vring_offset(0) as u64, entries, align)?;
        let ring1 = VringLayout::from_base(base + self.layout.vring_offset(1) as u64, entries, align)?;

        let host_tx = VirtQueue::create(
            VQ_HOST_TO_REMOTE,
            Role::Driver,
            ring0,
            self.cache(host),
            to_remote.clone(),
            window,
        )?;
        let host_rx = VirtQueue::create(
            VQ_REMOTE_TO_HOST,
            Role::Driver,
            ring1,
            self.cache(host),
            to_remote.clone(),
            window,
        )?;
        let pool = Arc::new(SimHeap::new(
            heap_id,
            base + self.layout.pool_offset() as u64,
            self.layout.pool_size(),
        )?);
        let host_t = Arc::new(VirtioLink::host(
            host_tx,
            host_rx,
            pool,
            HEAP_BLOCK_SIZE as u32,
            remote.id,
            Priority::Normal,
        )?);

        let remote_tx = VirtQueue::open(
            VQ_REMOTE_TO_HOST,
            Role::Device,
            ring1,
            self.cache(remote),
            to_host.clone(),
            window,
        )?;
        let remote_rx = VirtQueue::open(
            VQ_HOST_TO_REMOTE,
            Role::Device,
            ring0,
            self.cache(remote),
            to_host.clone(),
            window,
        )?;
        let remote_t = Arc::new(VirtioLink::remote(
            remote_tx,
            remote_rx,
            host.id,
            Priority::Normal,
        )?);

        let host_disp = Arc::new(VqDispatcher::new());
        let remote_disp = Arc::new(VqDispatcher::new());
        host_t.attach(&host_disp, host.router.clone())?;
        remote_t.attach(&remote_disp, remote.router.clone())?;

        for line in [&to_remote, &to_host] {
            line.enable();
            if let Err(e) = line.kick(ControlMessage::Ready.into()) {
                log::warn!("{} could not announce itself to {}: {e}", line.local(), line.remote());
            }
        }

        Ok((
            Link {
                remote: remote.id,
                channel: to_remote,
                notify: None,
                transport: LinkTransport::Virtio {
                    transport: host_t,
                    dispatcher: host_disp,
                },
            },
            Link {
                remote: host.id,
                channel: to_host,
                notify: None,
                transport: LinkTransport::Virtio {
                    transport: remote_t,
                    dispatcher: remote_disp,
                },
            },
        ))
    }
}
