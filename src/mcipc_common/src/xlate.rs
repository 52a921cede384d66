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

//! Local <-> shared address translation.
//!
//! Descriptors and list links carry 32-bit *shared* addresses that mean the
//! same thing on every core. Each core converts them to its own local view
//! before touching memory.

use alloc::sync::Arc;

/// Translation between this core's addresses and shared-space addresses.
pub trait AddressTranslator {
    /// Convert a local address to its shared-space form.
    fn to_shared(&self, local: u64) -> Option<u32>;

    /// Convert a shared-space address to this core's local form.
    fn to_local(&self, shared: u32) -> Option<u64>;
}

/// Local and shared addresses are the same.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl AddressTranslator for Identity {
    #[inline]
    fn to_shared(&self, local: u64) -> Option<u32> {
        u32::try_from(local).ok()
    }

    #[inline]
    fn to_local(&self, shared: u32) -> Option<u64> {
        Some(shared as u64)
    }
}

/// A single linear window: `[local_base, local_base + len)` maps onto
/// `[shared_base, shared_base + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub local_base: u64,
    pub shared_base: u32,
    pub len: u32,
}

impl Window {
    pub const fn new(local_base: u64, shared_base: u32, len: u32) -> Self {
        Self {
            local_base,
            shared_base,
            len,
        }
    }

    /// Does the window cover `local`?
    #[inline]
    pub fn contains_local(&self, local: u64) -> bool {
        local >= self.local_base && local - self.local_base < self.len as u64
    }
}

impl AddressTranslator for Window {
    fn to_shared(&self, local: u64) -> Option<u32> {
        if !self.contains_local(local) {
            return None;
        }
        let off = (local - self.local_base) as u32;
        self.shared_base.checked_add(off)
    }

    fn to_local(&self, shared: u32) -> Option<u64> {
        let off = shared.checked_sub(self.shared_base)?;
        if off >= self.len {
            return None;
        }
        self.local_base.checked_add(off as u64)
    }
}

impl<T: AddressTranslator + ?Sized> AddressTranslator for &T {
    #[inline]
    fn to_shared(&self, local: u64) -> Option<u32> {
        (**self).to_shared(local)
    }

    #[inline]
    fn to_local(&self, shared: u32) -> Option<u64> {
        (**self).to_local(shared)
    }
}

impl<T: AddressTranslator + ?Sized> AddressTranslator for Arc<T> {
    #[inline]
    fn to_shared(&self, local: u64) -> Option<u32> {
        (**self).to_shared(local)
    }

    #[inline]
    fn to_local(&self, shared: u32) -> Option<u64> {
        (**self).to_local(shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rejects_addresses_above_4g() {
        assert_eq!(Identity.to_shared(0x1000), Some(0x1000));
        assert_eq!(Identity.to_shared(0x1_0000_0000), None);
        assert_eq!(Identity.to_local(0xdead_0000), Some(0xdead_0000));
    }

    #[test]
    fn window_translates_both_ways() {
        let w = Window::new(0x4000_0000, 0x9000_0000, 0x10000);
        assert_eq!(w.to_shared(0x4000_0010), Some(0x9000_0010));
        assert_eq!(w.to_local(0x9000_0010), Some(0x4000_0010));
        assert_eq!(w.to_local(w.to_shared(0x4000_fff0).unwrap()), Some(0x4000_fff0));
    }

    #[test]
    fn window_bounds() {
        let w = Window::new(0x1000, 0x2000, 0x100);
        assert_eq!(w.to_shared(0xfff), None);
        assert_eq!(w.to_shared(0x1100), None);
        assert_eq!(w.to_local(0x1fff), None);
        assert_eq!(w.to_local(0x2100), None);
        assert_eq!(w.to_local(0x20ff), Some(0x10ff));
    }
}
