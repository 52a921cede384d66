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

//! Doubly linked list in shared memory.
//!
//! The list head and every element begin with two shared-space links,
//! `next` at offset 0 and `prev` at offset 4. An empty list's head points
//! at itself in both directions. Both peers modify the links, so every
//! operation runs under a [`Gate`].

use thiserror::Error;

use crate::CACHE_LINE_SIZE;
use crate::cache::CacheMaint;
use crate::gate::Gate;
use crate::mem::CacheOps;
use crate::xlate::AddressTranslator;

const NEXT: u64 = 0;
const PREV: u64 = 4;
const LINKS_LEN: usize = 8;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListError {
    #[error("Address {0:#x} has no translation")]
    TranslationFailed(u64),
    #[error("List head was never initialised")]
    NotInitialized,
    #[error("Element {0:#x} is not linked into this list")]
    NotInList(u64),
    #[error("Backend memory error")]
    MemError,
}

/// A shared list handle.
#[derive(Debug)]
pub struct ListMP<M, G, T> {
    head: u64,
    head_shared: u32,
    mem: CacheMaint<M>,
    gate: G,
    xlate: T,
}

impl<M: CacheOps, G: Gate, T: AddressTranslator> ListMP<M, G, T> {
    /// Bytes reserved for the head; a whole line so nothing else shares it.
    pub const SHARED_SIZE: usize = CACHE_LINE_SIZE;

    /// Initialise an empty list at local address `head`.
    pub fn create(head: u64, mem: CacheMaint<M>, gate: G, xlate: T) -> Result<Self, ListError> {
        let list = Self::new(head, mem, gate, xlate)?;
        list.gate.with(|| {
            list.set_link(list.head_shared, NEXT, list.head_shared)?;
            list.set_link(list.head_shared, PREV, list.head_shared)
        })?;
        Ok(list)
    }

    /// Attach to a list the peer created.
    pub fn open(head: u64, mem: CacheMaint<M>, gate: G, xlate: T) -> Result<Self, ListError> {
        let list = Self::new(head, mem, gate, xlate)?;
        let next = list.link(list.head_shared, NEXT)?;
        let prev = list.link(list.head_shared, PREV)?;
        if next == 0 || prev == 0 {
            return Err(ListError::NotInitialized);
        }
        Ok(list)
    }

    fn new(head: u64, mem: CacheMaint<M>, gate: G, xlate: T) -> Result<Self, ListError> {
        let head_shared = xlate
            .to_shared(head)
            .ok_or(ListError::TranslationFailed(head))?;
        Ok(Self {
            head,
            head_shared,
            mem,
            gate,
            xlate,
        })
    }

    fn local(&self, shared: u32) -> Result<u64, ListError> {
        self.xlate
            .to_local(shared)
            .ok_or(ListError::TranslationFailed(shared as u64))
    }

    fn link(&self, node: u32, field: u64) -> Result<u32, ListError> {
        let addr = self.local(node)? + field;
        self.mem.fetch_val(addr).map_err(|_| ListError::MemError)
    }

    fn set_link(&self, node: u32, field: u64, to: u32) -> Result<(), ListError> {
        let addr = self.local(node)? + field;
        self.mem
            .publish_val(addr, to)
            .map_err(|_| ListError::MemError)
    }

    /// Append the element at local address `elem`.
    pub fn put_tail(&self, elem: u64) -> Result<(), ListError> {
        let e = self
            .xlate
            .to_shared(elem)
            .ok_or(ListError::TranslationFailed(elem))?;
        self.gate.with(|| {
            let tail = self.link(self.head_shared, PREV)?;
            let links = [self.head_shared, tail];
            self.mem
                .publish(elem, bytemuck::cast_slice(&links))
                .map_err(|_| ListError::MemError)?;
            self.set_link(tail, NEXT, e)?;
            self.set_link(self.head_shared, PREV, e)
        })
    }

    /// Unlink and return the first element's local address.
    pub fn get_head(&self) -> Result<Option<u64>, ListError> {
        self.gate.with(|| {
            let first = self.link(self.head_shared, NEXT)?;
            if first == self.head_shared {
                return Ok(None);
            }
            let after = self.link(first, NEXT)?;
            self.set_link(self.head_shared, NEXT, after)?;
            self.set_link(after, PREV, self.head_shared)?;
            self.local(first).map(Some)
        })
    }

    /// Unlink the element at local address `elem`.
    ///
    /// Fails with [`ListError::NotInList`] if its neighbours no longer point
    /// at it, e.g. because the peer already took it.
    pub fn remove(&self, elem: u64) -> Result<(), ListError> {
        let e = self
            .xlate
            .to_shared(elem)
            .ok_or(ListError::TranslationFailed(elem))?;
        if e == self.head_shared {
            return Err(ListError::NotInList(elem));
        }
        self.gate.with(|| {
            let next = self.link(e, NEXT)?;
            let prev = self.link(e, PREV)?;
            if next == 0
                || prev == 0
                || self.link(prev, NEXT)? != e
                || self.link(next, PREV)? != e
            {
                return Err(ListError::NotInList(elem));
            }
            self.set_link(prev, NEXT, next)?;
            self.set_link(next, PREV, prev)
        })
    }

    pub fn is_empty(&self) -> Result<bool, ListError> {
        Ok(self.link(self.head_shared, NEXT)? == self.head_shared)
    }

    /// Local address of the head.
    #[inline]
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Number of bytes of an element the list owns.
    pub const fn links_len() -> usize {
        LINKS_LEN
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::thread;

    use super::*;
    use crate::gate::SpinGate;
    use crate::testmem::TestMem;
    use crate::xlate::{Identity, Window};

    type List = ListMP<Arc<TestMem>, Arc<SpinGate>, Identity>;

    const ELEM: u64 = 64;

    fn setup(elems: usize) -> (Arc<TestMem>, Arc<SpinGate>, List) {
        let mem = Arc::new(TestMem::new(CACHE_LINE_SIZE + elems * ELEM as usize));
        let gate = Arc::new(SpinGate::new());
        let list = ListMP::create(
            mem.base_addr(),
            CacheMaint::new(mem.clone(), true),
            gate.clone(),
            Identity,
        )
        .unwrap();
        (mem, gate, list)
    }

    fn elem(mem: &TestMem, i: u64) -> u64 {
        mem.base_addr() + CACHE_LINE_SIZE as u64 + i * ELEM
    }

    #[test]
    fn fifo_order() {
        let (mem, _gate, list) = setup(4);
        assert!(list.is_empty().unwrap());
        for i in 0..4 {
            list.put_tail(elem(&mem, i)).unwrap();
        }
        assert!(!list.is_empty().unwrap());
        for i in 0..4 {
            assert_eq!(list.get_head().unwrap(), Some(elem(&mem, i)));
        }
        assert_eq!(list.get_head().unwrap(), None);
        assert!(list.is_empty().unwrap());
    }

    #[test]
    fn remove_from_middle_and_twice() {
        let (mem, _gate, list) = setup(3);
        for i in 0..3 {
            list.put_tail(elem(&mem, i)).unwrap();
        }
        list.remove(elem(&mem, 1)).unwrap();
        assert_eq!(
            list.remove(elem(&mem, 1)),
            Err(ListError::NotInList(elem(&mem, 1)))
        );
        assert_eq!(list.get_head().unwrap(), Some(elem(&mem, 0)));
        // already taken by get_head
        assert!(list.remove(elem(&mem, 0)).is_err());
        list.remove(elem(&mem, 2)).unwrap();
        assert!(list.is_empty().unwrap());
        assert!(list.remove(mem.base_addr()).is_err());
    }

    #[test]
    fn opener_sees_creator_elements() {
        let (mem, gate, list) = setup(2);
        list.put_tail(elem(&mem, 0)).unwrap();

        let other = List::open(
            mem.base_addr(),
            CacheMaint::new(mem.clone(), true),
            gate,
            Identity,
        )
        .unwrap();
        assert_eq!(other.get_head().unwrap(), Some(elem(&mem, 0)));
        assert!(list.is_empty().unwrap());
    }

    #[test]
    fn open_uninitialised_head_fails() {
        let mem = Arc::new(TestMem::new(256));
        let res = List::open(
            mem.base_addr(),
            CacheMaint::new(mem.clone(), false),
            Arc::new(SpinGate::new()),
            Identity,
        );
        assert!(res.is_err());
    }

    #[test]
    fn links_are_shared_space_addresses() {
        let mem = Arc::new(TestMem::new(CACHE_LINE_SIZE + 2 * ELEM as usize));
        let window = Window::new(mem.base_addr(), 0x1000, mem.len() as u32);
        let list = ListMP::create(
            mem.base_addr(),
            CacheMaint::new(mem.clone(), false),
            SpinGate::new(),
            window,
        )
        .unwrap();
        let e = elem(&mem, 0);
        list.put_tail(e).unwrap();

        let shared_e = 0x1000 + CACHE_LINE_SIZE as u32;
        let head_next: u32 = crate::mem::MemOps::read_val(&*mem, mem.base_addr()).unwrap();
        assert_eq!(head_next, shared_e);
        let links: [u32; 2] = crate::mem::MemOps::read_val(&*mem, e).unwrap();
        assert_eq!(links, [0x1000, 0x1000]);
        assert_eq!(list.get_head().unwrap(), Some(e));
    }

    #[test]
    fn concurrent_producers_one_consumer() {
        let (mem, gate, list) = setup(64);
        let list = Arc::new(list);
        let producers: Vec<_> = (0..2u64)
            .map(|p| {
                let mem = mem.clone();
                let gate = gate.clone();
                thread::spawn(move || {
                    let list = List::open(
                        mem.base_addr(),
                        CacheMaint::new(mem.clone(), true),
                        gate,
                        Identity,
                    )
                    .unwrap();
                    for i in 0..32 {
                        list.put_tail(elem(&mem, p * 32 + i)).unwrap();
                    }
                })
            })
            .collect();

        let mut got = Vec::new();
        while got.len() < 64 {
            if let Some(e) = list.get_head().unwrap() {
                got.push(e);
            }
        }
        for h in producers {
            h.join().unwrap();
        }
        // per producer order is kept
        for p in 0..2u64 {
            let mine: Vec<u64> = got
                .iter()
                .copied()
                .filter(|&e| (e - elem(&mem, 0)) / ELEM / 32 == p)
                .collect();
            let expected: Vec<u64> = (0..32).map(|i| elem(&mem, p * 32 + i)).collect();
            assert_eq!(mine, expected);
        }
    }
}
