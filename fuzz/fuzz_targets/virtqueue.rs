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

#![no_main]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mcipc_common::VRING_ALIGN;
use mcipc_common::cache::CacheMaint;
use mcipc_common::testmem::{TestChannel, TestMem};
use mcipc_common::virtq::{Role, VirtQueue};
use mcipc_common::vring::{RingError, VringLayout};
use mcipc_common::xlate::Identity;

type Queue = VirtQueue<Arc<TestMem>, Arc<TestChannel>, Identity>;

#[derive(Arbitrary, Debug)]
enum Op {
    /// Driver posts a buffer of this length.
    Post(u16),
    /// Device takes the next posted buffer.
    Take,
    /// Device completes one of the buffers it holds.
    Complete { pick: u8, written: u16 },
    /// Driver reclaims the next completed buffer.
    Reclaim,
}

#[derive(Arbitrary, Debug)]
struct Input {
    shift: u8,
    cache: bool,
    ops: Vec<Op>,
}

fn check(driver: &Queue) {
    assert_eq!(driver.num_free() + driver.num_inflight(), driver.len());
}

// Buffers may complete out of order; the driver must always get back the
// address and length it posted under the head the device returned.
fuzz_target!(|input: Input| {
    let num = 1u16 << (input.shift % 8);
    let mem = Arc::new(TestMem::new(VringLayout::query_size(num as usize, VRING_ALIGN)));
    let layout = VringLayout::from_base(mem.base_addr(), num, VRING_ALIGN).unwrap();
    let mut driver: Queue = VirtQueue::create(
        1,
        Role::Driver,
        layout,
        CacheMaint::new(mem.clone(), input.cache),
        Arc::new(TestChannel::new()),
        Identity,
    )
    .unwrap();
    let mut device: Queue = VirtQueue::open(
        1,
        Role::Device,
        layout,
        CacheMaint::new(mem.clone(), input.cache),
        Arc::new(TestChannel::new()),
        Identity,
    )
    .unwrap();

    let mut next_addr = 0x10_0000u64;
    // head -> (addr, len) for everything the driver has out
    let mut posted: BTreeMap<u16, (u64, u32)> = BTreeMap::new();
    let mut unseen: VecDeque<(u64, u32)> = VecDeque::new();
    let mut held: Vec<(u16, u64, u32)> = Vec::new();
    let mut completed: VecDeque<(u16, u32)> = VecDeque::new();

    for op in input.ops {
        match op {
            Op::Post(len) => {
                let addr = next_addr;
                next_addr += 0x100;
                match driver.add_avail_buf(addr, len as u32) {
                    Ok(_) => unseen.push_back((addr, len as u32)),
                    Err(RingError::RingFull) => assert_eq!(driver.num_free(), 0),
                    Err(e) => panic!("post: {e:?}"),
                }
            }
            Op::Take => match device.get_avail_buf().unwrap() {
                Some(buf) => {
                    let want = unseen.pop_front();
                    assert_eq!(Some((buf.addr, buf.len)), want);
                    assert!(posted.insert(buf.head, (buf.addr, buf.len)).is_none());
                    held.push((buf.head, buf.addr, buf.len));
                }
                None => assert!(unseen.is_empty()),
            },
            Op::Complete { pick, written } => {
                if !held.is_empty() {
                    let (head, _, _) = held.swap_remove(pick as usize % held.len());
                    device.add_used_buf(head, written as u32).unwrap();
                    completed.push_back((head, written as u32));
                }
            }
            Op::Reclaim => match driver.get_used_buf().unwrap() {
                Some(used) => {
                    let (head, written) = completed.pop_front().unwrap();
                    assert_eq!(used.head, head);
                    assert_eq!(used.written, written);
                    assert_eq!(posted.remove(&head), Some((used.addr, used.len)));
                }
                None => assert!(completed.is_empty()),
            },
        }
        check(&driver);
        assert_eq!(
            driver.num_inflight(),
            unseen.len() + held.len() + completed.len()
        );
    }
});
