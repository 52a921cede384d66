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

use std::error::Error;
use std::sync::{MutexGuard, PoisonError};

use mcipc_common::channel::ChannelError;
use mcipc_common::circ::CircError;
use mcipc_common::heap::AllocError;
use mcipc_common::listmp::ListError;
use mcipc_common::transport::TransportError;
use mcipc_common::virtq::VirtqError;
use mcipc_common::vring::RingError;
use thiserror::Error;

/// The error type for simulated IPC operations
#[derive(Error, Debug)]
pub enum IpcError {
    /// Anyhow error
    #[error("Anyhow Error was returned: {0}")]
    AnyhowError(#[from] anyhow::Error),

    /// Memory access out of bounds
    #[error("Address: {0:#x} out of bounds, region size is: {1}")]
    BoundsCheckFailed(u64, usize),

    /// A vring operation failed
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),

    /// A virtqueue operation failed
    #[error("VirtQueue error: {0}")]
    Virtq(#[from] VirtqError),

    /// A circular queue or notify driver operation failed
    #[error("Circular queue error: {0}")]
    Circ(#[from] CircError),

    /// A message heap operation failed
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),

    /// A shared list operation failed
    #[error("Shared list error: {0}")]
    List(#[from] ListError),

    /// A transport or router operation failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Raising an interrupt line failed
    #[error("Interrupt channel error: {0}")]
    Channel(#[from] ChannelError),

    /// No such core in this system
    #[error("Unknown processor {0}")]
    UnknownProcessor(u16),

    /// The two cores are already linked
    #[error("Processors {0} and {1} are already attached")]
    AlreadyAttached(u16, u16),

    /// The two cores are not linked
    #[error("Processors {0} and {1} are not attached")]
    NotAttached(u16, u16),

    /// A Mutex was poisoned
    #[error("Failed to acquire lock: {0}")]
    LockAttemptFailed(String),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),
}

impl From<&str> for IpcError {
    fn from(s: &str) -> Self {
        IpcError::Error(s.to_string())
    }
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for IpcError {
    // Implemented this way rather than passing the error as a source to LockAttemptFailed as that would require
    // Box<dyn Error + Send + Sync> which is not easy to implement for PoisonError<MutexGuard<'_, T>>
    fn from(e: PoisonError<MutexGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => String::from(""),
        };
        IpcError::LockAttemptFailed(source)
    }
}

impl IpcError {
    /// Is this a transient condition the caller may retry?
    ///
    /// A full ring, queue or heap drains once the peer runs. A failed signal
    /// is not retryable: the message is already published.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IpcError::Transport(
                TransportError::Ring(RingError::RingFull)
                    | TransportError::Circ(CircError::QueueFull | CircError::Timeout)
                    | TransportError::Alloc(AllocError::OutOfMemory)
            ) | IpcError::Ring(RingError::RingFull)
                | IpcError::Circ(CircError::QueueFull | CircError::Timeout)
                | IpcError::Alloc(AllocError::OutOfMemory)
        )
    }
}

/// Creates an `IpcError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::IpcError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
           let __err_msg = std::format!($fmtstr, $($arg)*);
           $crate::error::IpcError::Error(__err_msg)
    }};
}

/// Logs an error then returns with it. Accepts an `IpcError`, a string
/// literal or a format string.
#[macro_export]
macro_rules! log_then_return {
    ($msg:literal $(,)?) => {{
        let __err = $crate::new_error!($msg);
        log::error!("{}", __err);
        return Err(__err);
    }};
    ($err:expr $(,)?) => {
        log::error!("{}", $err);
        return Err($err);
    };
    ($fmtstr:expr, $($arg:tt)*) => {
        let __err = $crate::new_error!($fmtstr, $($arg)*);
        log::error!("{}", __err);
        return Err(__err);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails_with_literal() -> crate::Result<()> {
        log_then_return!("link is gone");
    }

    fn fails_with_format(core: u16) -> crate::Result<()> {
        log_then_return!("core {} is gone", core);
    }

    #[test]
    fn macros_build_generic_errors() {
        assert!(matches!(fails_with_literal(), Err(IpcError::Error(m)) if m == "link is gone"));
        assert!(matches!(fails_with_format(3), Err(IpcError::Error(m)) if m == "core 3 is gone"));
        let e = new_error!("{} > {}", 5, 4);
        assert_eq!(e.to_string(), "5 > 4");
    }

    #[test]
    fn common_errors_convert() {
        let e: IpcError = TransportError::NotReady.into();
        assert!(matches!(e, IpcError::Transport(TransportError::NotReady)));
        let e: IpcError = RingError::RingFull.into();
        assert!(matches!(e, IpcError::Ring(RingError::RingFull)));
    }

    #[test]
    fn retryable_errors() {
        let full: IpcError = TransportError::Circ(CircError::QueueFull).into();
        assert!(full.is_retryable());
        let signal: IpcError = TransportError::SignalFailure(ChannelError::Full).into();
        assert!(!signal.is_retryable());
        let ring: IpcError = RingError::RingFull.into();
        assert!(ring.is_retryable());
        let circ: IpcError = CircError::Timeout.into();
        assert!(circ.is_retryable());
        assert!(!IpcError::Circ(CircError::MemError).is_retryable());
        let gone: IpcError = TransportError::NoTransport(2).into();
        assert!(!gone.is_retryable());
    }
}
