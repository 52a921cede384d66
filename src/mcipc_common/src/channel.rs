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

//! Interrupt channel between two cores.
//!
//! A channel carries 32-bit payloads one way and raises the peer's interrupt
//! line. Payloads below [`RESERVED_BASE`] are queue ids; payloads at or above
//! it are [`ControlMessage`]s and can never collide with a queue id.

use alloc::sync::Arc;

use thiserror::Error;

/// First payload value reserved for control messages.
pub const RESERVED_BASE: u32 = 0xFFFF_FF00;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Mailbox is full")]
    Full,
    #[error("Channel is disabled")]
    Disabled,
    #[error("Channel is not attached to a peer")]
    Detached,
}

/// One direction of a mailbox-style interrupt line.
///
/// `kick` raises the peer's line carrying `payload`. `clear` acknowledges
/// and returns the next pending payload on this core's receive side, or
/// `None` when nothing is pending. Kicks may coalesce: a backend is allowed
/// to drop a payload when its slot is still occupied, so receivers always
/// rescan their rings after `clear`.
pub trait InterruptChannel {
    fn kick(&self, payload: u32) -> Result<(), ChannelError>;
    fn clear(&self) -> Option<u32>;
    fn enable(&self);
    fn disable(&self);
}

impl<C: InterruptChannel + ?Sized> InterruptChannel for &C {
    fn kick(&self, payload: u32) -> Result<(), ChannelError> {
        (**self).kick(payload)
    }
    fn clear(&self) -> Option<u32> {
        (**self).clear()
    }
    fn enable(&self) {
        (**self).enable()
    }
    fn disable(&self) {
        (**self).disable()
    }
}

impl<C: InterruptChannel + ?Sized> InterruptChannel for Arc<C> {
    fn kick(&self, payload: u32) -> Result<(), ChannelError> {
        (**self).kick(payload)
    }
    fn clear(&self) -> Option<u32> {
        (**self).clear()
    }
    fn enable(&self) {
        (**self).enable()
    }
    fn disable(&self) {
        (**self).disable()
    }
}

/// Out-of-band messages sharing the mailbox with queue ids.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub enum ControlMessage {
    Ready = 0xFFFF_FF00,
    StateChange = 0xFFFF_FF01,
    Crash = 0xFFFF_FF02,
    EchoRequest = 0xFFFF_FF03,
    EchoReply = 0xFFFF_FF04,
    AbortRequest = 0xFFFF_FF05,
    FlushCache = 0xFFFF_FF06,
    BootInitDone = 0xFFFF_FF07,
    Hibernation = 0xFFFF_FF10,
    HibernationForce = 0xFFFF_FF11,
    HibernationAck = 0xFFFF_FF12,
    HibernationCancel = 0xFFFF_FF13,
}

impl ControlMessage {
    /// Is `payload` in the reserved control range?
    #[inline]
    pub const fn is_reserved(payload: u32) -> bool {
        payload >= RESERVED_BASE
    }
}

impl From<ControlMessage> for u32 {
    fn from(msg: ControlMessage) -> u32 {
        msg as u32
    }
}

impl TryFrom<u32> for ControlMessage {
    type Error = u32;

    /// Returns the payload back when it is not a known control message.
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let msg = match value {
            0xFFFF_FF00 => Self::Ready,
            0xFFFF_FF01 => Self::StateChange,
            0xFFFF_FF02 => Self::Crash,
            0xFFFF_FF03 => Self::EchoRequest,
            0xFFFF_FF04 => Self::EchoReply,
            0xFFFF_FF05 => Self::AbortRequest,
            0xFFFF_FF06 => Self::FlushCache,
            0xFFFF_FF07 => Self::BootInitDone,
            0xFFFF_FF10 => Self::Hibernation,
            0xFFFF_FF11 => Self::HibernationForce,
            0xFFFF_FF12 => Self::HibernationAck,
            0xFFFF_FF13 => Self::HibernationCancel,
            other => return Err(other),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_values_round_trip() {
        let all = [
            ControlMessage::Ready,
            ControlMessage::StateChange,
            ControlMessage::Crash,
            ControlMessage::EchoRequest,
            ControlMessage::EchoReply,
            ControlMessage::AbortRequest,
            ControlMessage::FlushCache,
            ControlMessage::BootInitDone,
            ControlMessage::Hibernation,
            ControlMessage::HibernationForce,
            ControlMessage::HibernationAck,
            ControlMessage::HibernationCancel,
        ];
        for msg in all {
            let raw: u32 = msg.into();
            assert!(ControlMessage::is_reserved(raw));
            assert_eq!(ControlMessage::try_from(raw), Ok(msg));
        }
    }

    #[test]
    fn queue_ids_are_not_control_messages() {
        assert!(!ControlMessage::is_reserved(0));
        assert!(!ControlMessage::is_reserved(RESERVED_BASE - 1));
        assert_eq!(ControlMessage::try_from(5), Err(5));
        // reserved but unassigned
        assert_eq!(ControlMessage::try_from(0xFFFF_FF08), Err(0xFFFF_FF08));
    }

    #[test]
    fn exact_wire_values() {
        assert_eq!(u32::from(ControlMessage::Ready), 0xFFFFFF00);
        assert_eq!(u32::from(ControlMessage::BootInitDone), 0xFFFFFF07);
        assert_eq!(u32::from(ControlMessage::HibernationCancel), 0xFFFFFF13);
    }
}
