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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mcipc_common::cache::CacheMaint;
use mcipc_common::channel::{ChannelError, InterruptChannel};
use mcipc_common::circ::{CircError, CircLayout, CircQueue};
use mcipc_common::deadline::WaitMode;
use mcipc_common::msgq::{Message, ProcId, QueueId};
use mcipc_common::notify::{EVENT_ENTRY_SIZE, NotifyDriver, NotifyDriverCirc};
use mcipc_common::transport::TransportError;
use mcipc_sim::mailbox::MailboxBank;
use mcipc_sim::mem::{LOCAL_BASE, SimMemory};
use mcipc_sim::{CoreContext, IpcConfiguration, IpcError, IpcSystem, TransportKind};
use mcipc_testing::wait_for;
use rand::Rng;

const PORT: u16 = 7;
const GIVE_UP: Duration = Duration::from_secs(60);

const ALL_KINDS: [TransportKind; 4] = [
    TransportKind::Shm,
    TransportKind::ShmCirc,
    TransportKind::Circ,
    TransportKind::Virtio,
];

fn config(cache_enabled: bool) -> IpcConfiguration {
    shallow_config(cache_enabled, IpcConfiguration::MAX_MAILBOX_DEPTH)
}

fn shallow_config(cache_enabled: bool, mailbox_depth: u32) -> IpcConfiguration {
    let mut cfg = IpcConfiguration::default();
    cfg.set_ring_entries(16);
    cfg.set_circ_num_msgs(16);
    cfg.set_heap_blocks(32);
    cfg.set_cache_enabled(cache_enabled);
    cfg.set_mailbox_depth(mailbox_depth);
    cfg.set_send_timeout(Duration::from_millis(5));
    cfg
}

fn payload(src: ProcId, seq: u16) -> Vec<u8> {
    format!("from {} seq {seq}", src.0).into_bytes()
}

/// Try once. Returns whether the message is on its way.
fn try_send(core: &CoreContext, dst: QueueId, msg: &Message) -> bool {
    match core.put(dst, msg.clone()) {
        Ok(()) => true,
        // published; the peer finds it on its next service
        Err(IpcError::Transport(TransportError::SignalFailure(_))) => true,
        Err(e) if e.is_retryable() => false,
        Err(e) => panic!("{:?} -> {dst}: {e}", core.id()),
    }
}

/// Send `count` messages to each of `peers` while taking in everything
/// they send. Returns the msg ids received, per source.
fn run_core(
    core: Arc<CoreContext>,
    peers: Vec<QueueId>,
    count: u16,
) -> BTreeMap<u16, Vec<u16>> {
    let expected = peers.len() * count as usize;
    let mut next = vec![0u16; peers.len()];
    let mut got: BTreeMap<u16, Vec<u16>> = BTreeMap::new();
    let mut received = 0;
    let start = Instant::now();

    while received < expected || next.iter().any(|&n| n < count) {
        assert!(start.elapsed() < GIVE_UP, "{:?} stalled", core.id());
        for (i, &dst) in peers.iter().enumerate() {
            if next[i] < count {
                let msg = Message::new(next[i], payload(core.id(), next[i]));
                if try_send(&core, dst, &msg) {
                    next[i] += 1;
                }
            }
        }
        core.poll(Duration::from_millis(1)).unwrap();
        while let Some(msg) = core.get(PORT).unwrap() {
            let src = ProcId(msg.header.src_proc);
            assert_eq!(&msg.payload[..], &payload(src, msg.header.msg_id)[..]);
            got.entry(src.0).or_default().push(msg.header.msg_id);
            received += 1;
        }
    }
    got
}

fn run_system(sys: &IpcSystem, links: &[(u16, u16, TransportKind)], count: u16) {
    let n = sys.num_cores();
    for &(a, b, kind) in links {
        sys.attach(a, b, kind).unwrap();
    }
    for id in 0..n {
        sys.core(id).unwrap().create_queue(PORT).unwrap();
    }

    let handles: Vec<_> = (0..n)
        .map(|id| {
            let core = sys.core(id).unwrap();
            let peers: Vec<_> = links
                .iter()
                .filter_map(|&(a, b, _)| match id {
                    _ if id == a => Some(QueueId::new(ProcId(b), PORT)),
                    _ if id == b => Some(QueueId::new(ProcId(a), PORT)),
                    _ => None,
                })
                .collect();
            thread::spawn(move || run_core(core, peers, count))
        })
        .collect();

    for (id, handle) in handles.into_iter().enumerate() {
        let got = handle.join().unwrap();
        for (src, ids) in got {
            // every sender's messages arrive once and in order
            let want: Vec<u16> = (0..count).collect();
            assert_eq!(ids, want, "core {id} from core {src}");
        }
    }
}

#[test]
fn two_cores_every_kind_non_coherent() {
    for kind in ALL_KINDS {
        let sys = IpcSystem::new(2, config(true)).unwrap();
        run_system(&sys, &[(0, 1, kind)], 300);
    }
}

#[test]
fn two_cores_every_kind_coherent() {
    for kind in ALL_KINDS {
        let sys = IpcSystem::new(2, config(false)).unwrap();
        run_system(&sys, &[(1, 0, kind)], 200);
    }
}

#[test]
fn refused_kicks_lose_and_repeat_nothing() {
    // a one-deep mailbox refuses kicks while the peer is mid-drain
    for kind in ALL_KINDS {
        let sys = IpcSystem::new(2, shallow_config(true, IpcConfiguration::MIN_MAILBOX_DEPTH))
            .unwrap();
        run_system(&sys, &[(0, 1, kind)], 300);
    }
}

#[test]
fn three_cores_mixed_links() {
    let sys = IpcSystem::new(3, config(true)).unwrap();
    run_system(
        &sys,
        &[
            (0, 1, TransportKind::Shm),
            (0, 2, TransportKind::Virtio),
            (1, 2, TransportKind::Circ),
        ],
        200,
    );
}

#[test]
fn random_sizes_survive_non_coherent_caches() {
    let sys = IpcSystem::new(2, config(true)).unwrap();
    sys.attach(0, 1, TransportKind::ShmCirc).unwrap();
    let tx = sys.core(0).unwrap();
    let rx = sys.core(1).unwrap();
    let dst = rx.create_queue(PORT).unwrap();

    let mut rng = rand::rng();
    // the receiver drains after every batch so the queue never fills
    for round in 0..20u16 {
        let mut sent = Vec::new();
        for i in 0..8u16 {
            let len = rng.random_range(0..1500);
            let body: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            tx.put(dst, Message::new(round * 8 + i, body.clone())).unwrap();
            sent.push(body);
        }
        rx.service().unwrap();
        for body in sent {
            let msg = rx.get(PORT).unwrap().unwrap();
            assert_eq!(&msg.payload[..], &body[..]);
        }
        assert!(rx.get(PORT).unwrap().is_none());
    }
    assert!(rx.mem().writebacks() > 0);
    assert!(tx.mem().invalidates() > 0);
}

#[test]
fn detach_and_relink_while_idle() {
    let sys = IpcSystem::new(2, config(true)).unwrap();
    for kind in ALL_KINDS {
        run_system_once(&sys, kind);
        sys.detach(0, 1).unwrap();
    }
}

fn run_system_once(sys: &IpcSystem, kind: TransportKind) {
    sys.attach(0, 1, kind).unwrap();
    let c0 = sys.core(0).unwrap();
    let c1 = sys.core(1).unwrap();
    // queues outlive links
    if c1.get(PORT).is_err() {
        c1.create_queue(PORT).unwrap();
    }
    let q = QueueId::new(c1.id(), PORT);
    c0.put(q, Message::new(1, &b"hello"[..])).unwrap();
    c1.service().unwrap();
    assert_eq!(c1.get(PORT).unwrap().unwrap().header.msg_id, 1);
}

#[test]
fn echo_is_answered_by_a_running_core() {
    let sys = IpcSystem::new(2, config(true)).unwrap();
    sys.attach(0, 1, TransportKind::Virtio).unwrap();
    let c0 = sys.core(0).unwrap();
    let c1 = sys.core(1).unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let remote = {
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                c1.poll(Duration::from_millis(1)).unwrap();
            }
        })
    };

    c0.ping(ProcId(1)).unwrap();
    let replies = wait_for(GIVE_UP, || {
        c0.poll(Duration::from_millis(1)).unwrap();
        let n = c0.echo_replies(ProcId(1)).unwrap();
        (n > 0).then_some(n)
    });
    stop.store(true, Ordering::Relaxed);
    remote.join().unwrap();
    assert_eq!(replies, Some(1));
}

#[test]
fn unraised_event_sent_mid_drain_arrives_once() {
    let mem = Arc::new(SimMemory::new(4096).unwrap());
    let bank = Arc::new(MailboxBank::new(2, 1));
    let [x, y] = CircLayout::pair(LOCAL_BASE, 8, EVENT_ENTRY_SIZE).unwrap();
    let qa = CircQueue::create(x, y, CacheMaint::new(mem.core_view(ProcId(0), false), true)).unwrap();
    let qb = CircQueue::open(y, x, CacheMaint::new(mem.core_view(ProcId(1), false), true)).unwrap();
    let a = Arc::new(
        NotifyDriverCirc::new(qa, bank.channel(ProcId(0), ProcId(1)).unwrap(), 1).unwrap(),
    );
    let b = NotifyDriverCirc::new(qb, bank.channel(ProcId(1), ProcId(0)).unwrap(), 1).unwrap();
    let stray = bank.channel(ProcId(0), ProcId(1)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let refused = Arc::new(Mutex::new(None));
    {
        let (a, seen, refused) = (a.clone(), seen.clone(), refused.clone());
        b.register_event(
            0,
            Arc::new(move |_event, payload| {
                let first = {
                    let mut seen = seen.lock().unwrap();
                    seen.push(payload);
                    seen.len() == 1
                };
                if first {
                    // the line is full, so this event is queued but not raised
                    stray.kick(0x55).unwrap();
                    *refused.lock().unwrap() = Some(a.send_event(0, 3, WaitMode::NoWait));
                }
            }),
        )
        .unwrap();
    }

    a.send_event(0, 0, WaitMode::NoWait).unwrap();
    // the one-deep line is taken, later events are queued without a kick
    for payload in 1..3 {
        assert_eq!(
            a.send_event(0, payload, WaitMode::NoWait),
            Err(CircError::SignalFailure(ChannelError::Full))
        );
    }
    assert_eq!(bank.dropped_kicks(), 2);

    assert_eq!(b.isr().unwrap(), 4);
    assert_eq!(
        *refused.lock().unwrap(),
        Some(Err(CircError::SignalFailure(ChannelError::Full)))
    );
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(bank.dropped_kicks(), 3);

    // only the stray payload is left on the line
    assert_eq!(b.isr().unwrap(), 0);
    assert_eq!(seen.lock().unwrap().len(), 4);
}
