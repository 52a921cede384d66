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

/// Crate-internal trait for defining metrics.
pub(crate) trait NamedMetric {
    /// The name of the metric.
    fn name(&self) -> &'static str;
    /// The description of the metric.
    fn description(&self) -> &'static str;
    /// The unit of the metric.
    fn unit(&self) -> metrics::Unit;
    /// Describe this variant to the installed recorder, once per process.
    fn describe_once(&self);
}

/// Defines metric enums. Each block starts with the metric kind
/// (`counter` or `histogram`), which selects the describe call.
#[macro_export]
macro_rules! define_metrics {
    (@describe counter, $name:expr, $unit:expr, $description:expr) => {
        metrics::describe_counter!($name, $unit, $description)
    };
    (@describe histogram, $name:expr, $unit:expr, $description:expr) => {
        metrics::describe_histogram!($name, $unit, $description)
    };
    (
        $(
            $kind:ident $metric_type:ident {
                $(
                    $variant:ident $( { $($field_name:ident : $field_ty:ty),* $(,)? } )? => {
                        name: $name:expr,
                        description: $description:expr,
                        unit: $unit:expr $(,)?
                    }
                ),* $(,)?
            }
        )*
    ) => {
        $(
            #[derive(Debug, Clone)]
            #[allow(dead_code)]
            pub(crate) enum $metric_type {
                $(
                    $variant $( { $($field_name : $field_ty),* } )?
                ),*
            }

            impl $crate::metrics::metrics_macro::NamedMetric for $metric_type {
                fn name(&self) -> &'static str {
                    match self {
                        $(
                            Self::$variant { .. } => $name,
                        )*
                    }
                }

                fn description(&self) -> &'static str {
                    match self {
                        $(
                            Self::$variant { .. } => $description,
                        )*
                    }
                }

                fn unit(&self) -> metrics::Unit {
                    match self {
                        $(
                            Self::$variant { .. } => $unit,
                        )*
                    }
                }

                fn describe_once(&self) {
                    match self {
                        $(
                            Self::$variant { .. } => {
                                static DESCRIBE: std::sync::Once = std::sync::Once::new();
                                DESCRIBE.call_once(|| {
                                    $crate::define_metrics!(
                                        @describe $kind,
                                        self.name(),
                                        self.unit(),
                                        self.description()
                                    );
                                });
                            }
                        )*
                    }
                }
            }
        )*
    };
}
