use tracing::warn;

use crate::{
    event::Event, registry::Registry, sampling::SampleMode, telemetry::TelemetryUpdate, writer::PayloadWriter,
    Error,
};

/// Client state configuration.
pub(crate) struct StateConfiguration {
    /// Prefix prepended to every metric key.
    pub prefix: String,

    /// Sampling behavior for producer calls.
    pub sample_mode: SampleMode,

    /// Hostname substituted for `%HOST%` in metric keys, if it could be resolved.
    pub hostname: Option<String>,

    /// Whether or not to collect/emit internal telemetry.
    pub telemetry: bool,
}

/// Client state.
pub(crate) struct State {
    config: StateConfiguration,
    registry: Registry,
}

impl State {
    /// Creates a new `State` from the given configuration.
    pub fn new(config: StateConfiguration) -> Self {
        State { config, registry: Registry::new() }
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns the configured prefix.
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Returns the configured sample mode.
    pub fn sample_mode(&self) -> SampleMode {
        self.config.sample_mode
    }

    /// Returns `true` if telemetry is enabled.
    pub fn telemetry_enabled(&self) -> bool {
        self.config.telemetry
    }

    /// Creates a payload writer that substitutes the resolved hostname.
    pub fn payload_writer(&self, max_payload_len: usize) -> PayloadWriter {
        PayloadWriter::new(max_payload_len).with_hostname(self.config.hostname.clone())
    }

    /// Returns the sample rate to write for the given event, if any.
    fn sample_rate_for(&self, event: &Event) -> Option<f64> {
        if event.metric_type().is_sampled() {
            self.config.sample_mode.rate()
        } else {
            None
        }
    }

    /// Records a single observation into the registry.
    pub fn record(&self, event: Event) -> Result<(), Error> {
        self.registry.record(event)
    }

    /// Writes a single observation directly to the given payload writer, bypassing the registry.
    pub fn write_event(&self, writer: &mut PayloadWriter, event: Event) {
        let sample_rate = self.sample_rate_for(&event);
        let (key, payload) = event.into_parts();

        let result = writer.write_payload(self.prefix(), &key, &payload, sample_rate);
        if result.any_oversized() {
            warn!(metric_key = key.as_str(), "Metric line exceeds the maximum payload length and will be sent alone.");
        }
        if result.lines_invalid() > 0 {
            warn!(metric_key = key.as_str(), "Skipped non-finite metric value.");
        }
    }

    /// Flushes all registered events to the given payload writer.
    ///
    /// Each event is snapshotted and reset under its own lock, so updates that land while the flush is in progress are
    /// carried over to the next flush rather than lost.
    pub fn flush(&self, writer: &mut PayloadWriter, telemetry: &mut TelemetryUpdate) {
        let handles = self.registry.get_event_handles();
        telemetry.increment_contexts(handles.len());

        for event in handles {
            let payload = event.flush();
            if payload.is_empty() {
                continue;
            }

            let result = writer.write_payload(self.prefix(), event.key(), &payload, self.sample_rate_for(&event));
            telemetry.increment_lines(event.metric_type(), result.lines_written());
            if result.any_oversized() {
                let lines_oversized = result.lines_oversized();
                warn!(
                    metric_key = event.key(),
                    lines_oversized, "Metric line(s) exceed the maximum payload length and will be sent alone."
                );
                telemetry.increment_lines_oversized(lines_oversized);
            }
            if result.lines_invalid() > 0 {
                let lines_invalid = result.lines_invalid();
                warn!(metric_key = event.key(), lines_invalid, "Skipped non-finite metric value(s).");
                telemetry.increment_lines_invalid(lines_invalid);
            }
        }
    }

    /// Evicts events that have been idle for at least `max_idle_intervals` flushes.
    pub fn evict_idle(&self, max_idle_intervals: u32, telemetry: &mut TelemetryUpdate) {
        let evicted = self.registry.evict_idle(max_idle_intervals);
        telemetry.increment_contexts_evicted(evicted);
    }
}
