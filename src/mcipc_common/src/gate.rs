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

//! Cross-core mutual exclusion for shared structures that have more than
//! one writer, such as [`ListMP`](crate::listmp::ListMP).

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

/// A lock both peers can take, typically a hardware spinlock.
pub trait Gate {
    /// Acquire the gate, spinning until it is free. Returns a key for `leave`.
    fn enter(&self) -> u32;
    fn leave(&self, key: u32);

    /// Run `f` with the gate held.
    fn with<R>(&self, f: impl FnOnce() -> R) -> R
    where
        Self: Sized,
    {
        let key = self.enter();
        let r = f();
        self.leave(key);
        r
    }
}

impl<G: Gate + ?Sized> Gate for Arc<G> {
    fn enter(&self) -> u32 {
        (**self).enter()
    }
    fn leave(&self, key: u32) {
        (**self).leave(key)
    }
}

impl<G: Gate + ?Sized> Gate for &G {
    fn enter(&self) -> u32 {
        (**self).enter()
    }
    fn leave(&self, key: u32) {
        (**self).leave(key)
    }
}

/// Test-and-set lock on a single word.
///
/// Stands in for a hardware spinlock register: reading 0 means the lock was
/// free and is now taken.
#[derive(Debug, Default)]
pub struct SpinGate {
    word: AtomicU32,
}

impl SpinGate {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != 0
    }
}

impl Gate for SpinGate {
    fn enter(&self) -> u32 {
        while self
            .word
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        0
    }

    fn leave(&self, _key: u32) {
        self.word.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn gate_serialises_threads() {
        let gate = Arc::new(SpinGate::new());
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        gate.with(|| {
                            // non-atomic read-modify-write under the gate
                            let v = counter.load(Ordering::Relaxed);
                            counter.store(v + 1, Ordering::Relaxed);
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert!(!gate.is_locked());
    }
}
