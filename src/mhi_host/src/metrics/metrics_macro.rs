/*
Copyright 2026  The MHI Authors.

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
    /// The unit of the metric, fixed by its kind.
    fn unit(&self) -> metrics::Unit;
    /// Hand name, unit and description to the installed recorder.
    fn describe(&self);
}

/// Defines metric enums grouped by kind.
///
/// Each group names its kind (`counter` or `histogram`), which fixes the unit
/// and the describe call, followed by the enum and its variants:
///
/// ```text
/// counter CounterMetric {
///     Doorbells { ring: &'static str } => ("mhi_doorbells_total", "Doorbells written"),
/// }
/// ```
#[macro_export]
macro_rules! define_metrics {
    (@unit counter) => { metrics::Unit::Count };
    (@unit histogram) => { metrics::Unit::Seconds };
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
                    $variant:ident $( { $($field_name:ident : $field_ty:ty),* $(,)? } )?
                        => ($name:literal, $description:literal)
                ),* $(,)?
            }
        )*
    ) => {
        $(
            #[derive(Debug, Clone)]
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
                    $crate::define_metrics!(@unit $kind)
                }

                fn describe(&self) {
                    $crate::define_metrics!(@describe $kind, self.name(), self.unit(), self.description())
                }
            }
        )*
    };
}
