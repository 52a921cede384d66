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

use std::collections::VecDeque;
use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mcipc_common::cache::CacheMaint;
use mcipc_common::circ::{CircError, CircLayout, CircQueue};
use mcipc_common::deadline::WaitMode;
use mcipc_common::testmem::TestMem;

const ENTRY_SIZE: usize = 16;

#[derive(Arbitrary, Debug)]
enum Op {
    /// Creator sends a short entry.
    Send(u8),
    /// Opener sends back.
    Reply(u8),
    /// Opener drains and the creator sends from inside the first callback.
    SendDuringDrain(u8),
    DrainOpener,
    DrainCreator,
}

#[derive(Arbitrary, Debug)]
struct Input {
    shift: u8,
    cache: bool,
    ops: Vec<Op>,
}

fn drain(q: &CircQueue<Arc<TestMem>>, model: &mut VecDeque<u8>) {
    q.drain(|e| {
        let want = model.pop_front();
        assert_eq!(Some(e[0]), want);
    })
    .unwrap();
    assert!(model.is_empty());
}

// Both endpoints run on one thread, so the queue must behave exactly like a
// bounded FIFO holding num_msgs - 1 entries per direction.
fuzz_target!(|input: Input| {
    let num_msgs = 1u32 << (1 + input.shift % 7);
    let mem = Arc::new(TestMem::new(2 * CircLayout::query_size(
        num_msgs as usize,
        ENTRY_SIZE,
    )));
    let [a, b] = CircLayout::pair(mem.base_addr(), num_msgs, ENTRY_SIZE).unwrap();
    let creator = CircQueue::create(a, b, CacheMaint::new(mem.clone(), input.cache)).unwrap();
    let opener = CircQueue::open(b, a, CacheMaint::new(mem.clone(), input.cache)).unwrap();

    let capacity = num_msgs as usize - 1;
    let mut forward = VecDeque::new();
    let mut back = VecDeque::new();

    for op in input.ops {
        match op {
            Op::Send(v) => match creator.send(&[v; ENTRY_SIZE], WaitMode::NoWait) {
                Ok(_) => {
                    assert!(forward.len() < capacity);
                    forward.push_back(v);
                }
                Err(CircError::QueueFull) => {
                    assert_eq!(forward.len(), capacity);
                    assert!(creator.is_full().unwrap());
                }
                Err(e) => panic!("send: {e:?}"),
            },
            Op::Reply(v) => match opener.send(&[v], WaitMode::NoWait) {
                Ok(_) => {
                    assert!(back.len() < capacity);
                    back.push_back(v);
                }
                Err(CircError::QueueFull) => assert_eq!(back.len(), capacity),
                Err(e) => panic!("reply: {e:?}"),
            },
            Op::SendDuringDrain(v) => {
                let mut first = true;
                opener
                    .drain(|e| {
                        assert_eq!(Some(e[0]), forward.pop_front());
                        if first {
                            first = false;
                            // one slot was just released, so this cannot be full
                            creator.send(&[v; ENTRY_SIZE], WaitMode::NoWait).unwrap();
                            forward.push_back(v);
                        }
                    })
                    .unwrap();
                assert!(forward.is_empty());
            }
            Op::DrainOpener => drain(&opener, &mut forward),
            Op::DrainCreator => drain(&creator, &mut back),
        }
    }
});
