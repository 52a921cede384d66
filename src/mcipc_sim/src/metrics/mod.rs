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

use metrics_macro::NamedMetric;

#[macro_use]
mod metrics_macro;

static LABEL_CORE: &str = "core";
static LABEL_SRC: &str = "src";
static LABEL_DST: &str = "dst";

// These defines all types of metrics in this crate
define_metrics! {
    counter CounterMetric {
        DroppedEvents { core: u16 } => {
            name: "mcipc_dropped_events_total",
            description: "Events that arrived for an id with no registered callback",
            unit: metrics::Unit::Count,
        },
        DroppedKicks { src: u16, dst: u16 } => {
            name: "mcipc_dropped_kicks_total",
            description: "Interrupts lost because the mailbox FIFO was full",
            unit: metrics::Unit::Count,
        },
        RingFull { core: u16 } => {
            name: "mcipc_ring_full_total",
            description: "Sends refused because the ring or queue had no room",
            unit: metrics::Unit::Count,
        },
        SignalFailures { core: u16 } => {
            name: "mcipc_signal_failures_total",
            description: "Sends rolled back because the peer could not be interrupted",
            unit: metrics::Unit::Count,
        },
    }
    histogram HistogramMetric {
        IsrBatchSize { core: u16, size: usize } => {
            name: "mcipc_isr_batch_size",
            description: "Payloads or events handled by one interrupt service pass",
            unit: metrics::Unit::Count,
        },
    }
}

impl CounterMetric {
    #[must_use]
    pub(crate) fn dropped_event(core: u16) -> Self {
        CounterMetric::DroppedEvents { core }
    }

    #[must_use]
    pub(crate) fn dropped_kick(src: u16, dst: u16) -> Self {
        CounterMetric::DroppedKicks { src, dst }
    }

    #[must_use]
    pub(crate) fn ring_full(core: u16) -> Self {
        CounterMetric::RingFull { core }
    }

    #[must_use]
    pub(crate) fn signal_failure(core: u16) -> Self {
        CounterMetric::SignalFailures { core }
    }
}

impl HistogramMetric {
    /// Emits the batch size of one service pass.
    ///
    /// Note: If the `isr_batch_metrics` feature is not enabled, this function
    /// does nothing.
    pub(crate) fn emit_isr_batch(#[allow(unused_variables)] core: u16, #[allow(unused_variables)] size: usize) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "isr_batch_metrics")] {
                HistogramMetric::IsrBatchSize { core, size }.emit();
            }
        }
    }

    #[cfg(test)]
    #[must_use]
    fn isr_batch(core: u16, size: usize) -> Self {
        HistogramMetric::IsrBatchSize { core, size }
    }
}

/// A metric which can be emitted to the underlying metrics system
pub(crate) trait EmittableMetric {
    /// Emits the metric to the underlying metrics system.
    /// The first time this is called for a given metric variant, it will
    /// also describe the metric to the underlying metrics system.
    fn emit(self);
}

impl EmittableMetric for CounterMetric {
    /// Increases the counter represented by `self` by 1
    fn emit(self) {
        self.describe_once();
        let name = self.name();

        match self {
            CounterMetric::DroppedEvents { core }
            | CounterMetric::RingFull { core }
            | CounterMetric::SignalFailures { core } => {
                metrics::counter!(name, LABEL_CORE => core.to_string()).increment(1);
            }
            CounterMetric::DroppedKicks { src, dst } => {
                metrics::counter!(name, LABEL_SRC => src.to_string(), LABEL_DST => dst.to_string())
                    .increment(1);
            }
        }
    }
}

impl EmittableMetric for HistogramMetric {
    fn emit(self) {
        self.describe_once();
        let name = self.name();

        match self {
            HistogramMetric::IsrBatchSize { core, size } => {
                metrics::histogram!(name, LABEL_CORE => core.to_string()).record(size as f64);
            }
        }
    }
}
