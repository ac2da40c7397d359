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

use std::sync::Once;
use std::time::Duration;

use metrics_macro::NamedMetric;

#[macro_use]
pub(crate) mod metrics_macro;

// These defines all types of metrics in this crate
define_metrics! {
    counter CounterMetric {
        Doorbells { ring: &'static str } =>
            ("mhi_doorbells_total", "Number of doorbell registers written to the device"),
        EventsProcessed { kind: &'static str } =>
            ("mhi_events_processed_total", "Number of event ring elements consumed"),
        CommandTimeouts =>
            ("mhi_command_timeouts_total", "Number of channel commands that were not completed in time"),
        SysErrors =>
            ("mhi_sys_errors_total", "Number of device system errors handled"),
        RddmEntries =>
            ("mhi_rddm_entries_total", "Number of times the device entered RAM dump mode"),
        XferErrors { code: u8 } =>
            ("mhi_xfer_errors_total", "Number of transfer events reporting an error code"),
    }
    histogram HistogramMetric {
        CommandRoundTrip { command: &'static str, duration: Duration } =>
            ("mhi_command_round_trip_seconds", "Time from command submission to its completion"),
    }
}

impl CounterMetric {
    /// A doorbell write on a `ring` kind ("channel", "event", "command")
    #[must_use]
    pub(crate) fn doorbell(ring: &'static str) -> Self {
        CounterMetric::Doorbells { ring }
    }
    /// One consumed event of `kind`
    #[must_use]
    pub(crate) fn event(kind: &'static str) -> Self {
        CounterMetric::EventsProcessed { kind }
    }
    #[must_use]
    pub(crate) fn command_timeout() -> Self {
        CounterMetric::CommandTimeouts
    }
    #[must_use]
    pub(crate) fn sys_error() -> Self {
        CounterMetric::SysErrors
    }
    #[must_use]
    pub(crate) fn rddm_entry() -> Self {
        CounterMetric::RddmEntries
    }
    /// A transfer event with error completion `code`
    #[must_use]
    pub(crate) fn xfer_error(code: u8) -> Self {
        CounterMetric::XferErrors { code }
    }
}

impl HistogramMetric {
    /// Measures the time to execute the given closure, and then emits the duration
    /// as a command round trip metric.
    ///
    /// Note: If the `command_metrics` feature is not enabled, this function
    /// will simply execute the closure without measuring time or emitting metrics.
    pub(crate) fn time_and_emit_command<T, F: FnOnce() -> T>(
        #[allow(unused_variables)] command: &'static str,
        f: F,
    ) -> T {
        cfg_if::cfg_if! {
            if #[cfg(feature = "command_metrics")] {
                use std::time::Instant;

                let start = Instant::now();
                let result = f();
                let duration = start.elapsed();
                HistogramMetric::CommandRoundTrip { command, duration }.emit();
                result
            } else {
                f()
            }
        }
    }

    #[cfg(test)]
    #[must_use]
    fn command_round_trip(command: &'static str, duration: Duration) -> Self {
        HistogramMetric::CommandRoundTrip { command, duration }
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
        let name = self.name();

        match self {
            CounterMetric::Doorbells { ring } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| self.describe());

                static LABEL_RING: &str = "ring";
                metrics::counter!(name, LABEL_RING => ring).increment(1);
            }
            CounterMetric::EventsProcessed { kind } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| self.describe());

                static LABEL_KIND: &str = "kind";
                metrics::counter!(name, LABEL_KIND => kind).increment(1);
            }
            CounterMetric::CommandTimeouts => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| self.describe());
                metrics::counter!(name).increment(1);
            }
            CounterMetric::SysErrors => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| self.describe());
                metrics::counter!(name).increment(1);
            }
            CounterMetric::RddmEntries => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| self.describe());
                metrics::counter!(name).increment(1);
            }
            CounterMetric::XferErrors { code } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| self.describe());

                static LABEL_CODE: &str = "code";
                metrics::counter!(name, LABEL_CODE => format!("{code:#x}")).increment(1);
            }
        }
    }
}

impl EmittableMetric for HistogramMetric {
    fn emit(self) {
        let metric_name = self.name();

        static LABEL_COMMAND: &str = "command";

        match self {
            HistogramMetric::CommandRoundTrip { command, duration } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_histogram!(
                        metric_name,
                        metrics::Unit::Seconds,
                        "Time from command submission to its completion"
                    );
                });

                metrics::histogram!(metric_name, LABEL_COMMAND => command).record(duration);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use metrics::{Counter, Gauge, Histogram, Key, Label};
    use metrics_util::CompositeKey;

    use super::*;

    #[test]
    fn test_counter_and_histogram_metrics() {
        // Set up the recorder and snapshotter
        let recorder = metrics_util::debugging::DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let metric_1 = CounterMetric::doorbell("channel");
        let metric_2 = CounterMetric::sys_error();
        let metric_3 = CounterMetric::xfer_error(0x11);
        let metric_4 = HistogramMetric::command_round_trip("START", Duration::from_secs(2));

        let snapshot = metrics::with_local_recorder(&recorder, || {
            metric_1.clone().emit();
            metric_2.clone().emit();
            metric_3.clone().emit();
            metric_3.clone().emit();
            metric_4.clone().emit();

            snapshotter.snapshot()
        });

        #[expect(clippy::mutable_key_type)]
        let snapshot = snapshot.into_hashmap();
        assert_eq!(snapshot.len(), 4, "Expected four metrics in the snapshot");

        let counter_key = CompositeKey::new(
            metrics_util::MetricKind::Counter,
            Key::from_parts(metric_1.name(), vec![Label::new("ring", "channel")]),
        );
        assert_eq!(
            snapshot.get(&counter_key).unwrap().2,
            metrics_util::debugging::DebugValue::Counter(1)
        );

        let counter_key =
            CompositeKey::new(metrics_util::MetricKind::Counter, metric_2.name().into());
        assert_eq!(
            snapshot.get(&counter_key).unwrap().2,
            metrics_util::debugging::DebugValue::Counter(1)
        );

        let counter_key = CompositeKey::new(
            metrics_util::MetricKind::Counter,
            Key::from_parts(metric_3.name(), vec![Label::new("code", "0x11")]),
        );
        assert_eq!(
            snapshot.get(&counter_key).unwrap().2,
            metrics_util::debugging::DebugValue::Counter(2)
        );

        let histogram_key = CompositeKey::new(
            metrics_util::MetricKind::Histogram,
            Key::from_parts(metric_4.name(), vec![Label::new("command", "START")]),
        );
        let histogram_value = &snapshot.get(&histogram_key).unwrap().2;
        assert!(
            matches!(
                histogram_value,
                metrics_util::debugging::DebugValue::Histogram(histogram) if histogram.len() == 1 && histogram[0].0 == 2.0
            ),
            "Histogram metric does not match expected value"
        );
    }

    #[test]
    fn test_units_follow_kind() {
        assert_eq!(CounterMetric::rddm_entry().unit(), metrics::Unit::Count);
        assert_eq!(
            HistogramMetric::command_round_trip("STOP", Duration::ZERO).unit(),
            metrics::Unit::Seconds
        );
    }

    /// Makes sure that the description function is called only once for each metric variant.
    ///
    /// This test needs to ran in its own process
    #[test]
    #[ignore = "Other tests interfere by initializing the Once statics before our local recorder is installed"]
    fn test_description_called_once() {
        struct DescriptionCounterRecorder {
            num_descriptions: AtomicU64,
        }

        impl metrics::Recorder for DescriptionCounterRecorder {
            fn describe_counter(
                &self,
                _key: metrics::KeyName,
                _unit: Option<metrics::Unit>,
                _description: metrics::SharedString,
            ) {
                self.num_descriptions
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }

            fn describe_gauge(
                &self,
                _key: metrics::KeyName,
                _unit: Option<metrics::Unit>,
                _description: metrics::SharedString,
            ) {
                self.num_descriptions
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }

            fn describe_histogram(
                &self,
                _key: metrics::KeyName,
                _unit: Option<metrics::Unit>,
                _description: metrics::SharedString,
            ) {
                self.num_descriptions
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }

            fn register_counter(&self, _key: &Key, _metadata: &metrics::Metadata<'_>) -> Counter {
                Counter::noop()
            }

            fn register_gauge(&self, _key: &Key, _metadata: &metrics::Metadata<'_>) -> Gauge {
                Gauge::noop()
            }

            fn register_histogram(
                &self,
                _key: &Key,
                _metadata: &metrics::Metadata<'_>,
            ) -> Histogram {
                Histogram::noop()
            }
        }

        let recorder = DescriptionCounterRecorder {
            num_descriptions: AtomicU64::new(0),
        };

        metrics::with_local_recorder(&recorder, || {
            CounterMetric::doorbell("channel").emit();
            CounterMetric::doorbell("event").emit();
            CounterMetric::xfer_error(0x10).emit();
            CounterMetric::xfer_error(0x11).emit();
            HistogramMetric::command_round_trip("START", Duration::from_secs(1)).emit();
            HistogramMetric::command_round_trip("RESET", Duration::from_secs(1)).emit();
        });

        // Despite 6 emitted metrics above, we expect only 3 descriptions to be recorded
        assert_eq!(
            recorder
                .num_descriptions
                .load(std::sync::atomic::Ordering::Relaxed),
            3,
            "Expected each metric variant to be described exactly once"
        );
    }
}
