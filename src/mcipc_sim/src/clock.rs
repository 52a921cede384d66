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

use std::time::{Duration, Instant};

use mcipc_common::deadline::Clock;

/// Wall clock ticking in microseconds since creation.
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    start: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Ticks that make up `d`.
    pub fn ticks(d: Duration) -> u64 {
        u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now_ticks(&self) -> u64 {
        Self::ticks(self.start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use mcipc_common::deadline::Deadline;

    use super::*;

    #[test]
    fn deadline_passes() {
        let clock = StdClock::new();
        let d = Deadline::after(&clock, StdClock::ticks(Duration::from_millis(5)));
        assert!(!d.expired());
        std::thread::sleep(Duration::from_millis(10));
        assert!(d.expired());
    }
}
