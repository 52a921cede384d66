use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use mcipc_common::msgq::Message;
use mcipc_sim::{IpcConfiguration, IpcSystem, TransportKind};

const PORT: u16 = 1;
const BATCH: u64 = 16;

// Put a batch from core 0, service core 1, take everything out again.
fn put_service_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_service_get");
    group.throughput(Throughput::Elements(BATCH));

    for cache_enabled in [false, true] {
        for kind in [
            TransportKind::Shm,
            TransportKind::ShmCirc,
            TransportKind::Circ,
            TransportKind::Virtio,
        ] {
            let mut cfg = IpcConfiguration::default();
            cfg.set_cache_enabled(cache_enabled);
            cfg.set_mailbox_depth(IpcConfiguration::MAX_MAILBOX_DEPTH);
            let sys = IpcSystem::new(2, cfg).unwrap();
            sys.attach(0, 1, kind).unwrap();
            let tx = sys.core(0).unwrap();
            let rx = sys.core(1).unwrap();
            let dst = rx.create_queue(PORT).unwrap();
            let body = vec![0xA5u8; 128];

            let id = format!("{kind:?}/{}", if cache_enabled { "cached" } else { "coherent" });
            group.bench_function(BenchmarkId::from_parameter(id), |b| {
                b.iter(|| {
                    for i in 0..BATCH as u16 {
                        tx.put(dst, Message::new(i, body.clone())).unwrap();
                    }
                    rx.service().unwrap();
                    // lets the virtio host reclaim its buffers
                    tx.service().unwrap();
                    while let Some(msg) = rx.get(PORT).unwrap() {
                        black_box(msg);
                    }
                });
            });
        }
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = put_service_get
}
criterion_main!(benches);
