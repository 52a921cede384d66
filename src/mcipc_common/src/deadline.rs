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

//! Tick based deadlines for bounded spin-waits.

use core::fmt;

/// A monotonic tick source.
pub trait Clock: Send + Sync {
    fn now_ticks(&self) -> u64;
}

/// A point in time after which a spin-wait gives up.
#[derive(Clone, Copy)]
pub struct Deadline<'a> {
    clock: &'a dyn Clock,
    at: u64,
}

impl<'a> Deadline<'a> {
    /// Expire `ticks` from now.
    pub fn after(clock: &'a dyn Clock, ticks: u64) -> Self {
        Self {
            clock,
            at: clock.now_ticks().saturating_add(ticks),
        }
    }

    /// Expire at an absolute tick.
    pub fn at(clock: &'a dyn Clock, at: u64) -> Self {
        Self { clock, at }
    }

    #[inline]
    pub fn expired(&self) -> bool {
        self.clock.now_ticks() >= self.at
    }
}

impl fmt::Debug for Deadline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deadline").field("at", &self.at).finish()
    }
}

/// How a sender behaves while the peer has not made room.
#[derive(Debug, Clone, Copy, Default)]
pub enum WaitMode<'a> {
    /// Fail immediately.
    NoWait,
    /// Spin until the peer drains.
    #[default]
    Spin,
    /// Spin until the peer drains or the deadline passes.
    Until(Deadline<'a>),
}
