use tracing::warn;

use crate::{event::Event, registry::Registry, MetricType};

const PACKETS_SENT: &str = "statsd.client.packets_sent";
const PACKETS_DROPPED: &str = "statsd.client.packets_dropped";
const BYTES_SENT: &str = "statsd.client.bytes_sent";
const BYTES_DROPPED: &str = "statsd.client.bytes_dropped";
const LINES_FLUSHED: &str = "statsd.client.lines_flushed";
const LINES_OVERSIZED: &str = "statsd.client.lines_oversized";
const LINES_INVALID: &str = "statsd.client.lines_invalid";
const CONTEXTS: &str = "statsd.client.aggregated_context";
const CONTEXTS_EVICTED: &str = "statsd.client.aggregated_context_evicted";

/// Client telemetry.
///
/// `Telemetry` feeds information about the client's own behavior back into the registry as ordinary counters, so it is
/// sent to the collector on the next flush alongside everything else. All internal telemetry is under the
/// `statsd.client` namespace.
pub(crate) struct Telemetry;

impl Telemetry {
    /// Applies the given telemetry update, recording it into `registry`.
    pub fn apply_update(registry: &Registry, update: &TelemetryUpdate) {
        let counters = [
            (PACKETS_SENT, update.packets_sent),
            (PACKETS_DROPPED, update.packets_dropped),
            (BYTES_SENT, update.bytes_sent),
            (BYTES_DROPPED, update.bytes_dropped),
            (LINES_FLUSHED, update.lines_flushed()),
            (LINES_OVERSIZED, update.lines_oversized),
            (LINES_INVALID, update.lines_invalid),
            (CONTEXTS, update.contexts),
            (CONTEXTS_EVICTED, update.contexts_evicted),
        ];

        for (key, value) in counters {
            // Producers share the key space, so a telemetry key may already be taken by another metric type.
            if let Err(e) = registry.record(Event::counter(key, i64::try_from(value).unwrap_or(i64::MAX))) {
                warn!(error = %e, "Failed to record telemetry.");
            }
        }
    }
}

/// A buffer for collecting telemetry over a single flush pass.
#[derive(Debug, Default)]
pub(crate) struct TelemetryUpdate {
    contexts: u64,
    contexts_evicted: u64,
    counter_lines: u64,
    timer_lines: u64,
    gauge_lines: u64,
    set_lines: u64,
    absolute_lines: u64,
    lines_oversized: u64,
    lines_invalid: u64,
    packets_sent: u64,
    packets_dropped: u64,
    bytes_sent: u64,
    bytes_dropped: u64,
}

impl TelemetryUpdate {
    /// Clears the update buffer, resetting it back to an empty state.
    pub fn clear(&mut self) {
        *self = TelemetryUpdate::default();
    }

    /// Returns `true` if any lines were flushed.
    pub fn had_updates(&self) -> bool {
        self.lines_flushed() > 0
    }

    /// Returns the total number of lines flushed, across all metric types.
    pub fn lines_flushed(&self) -> u64 {
        self.counter_lines + self.timer_lines + self.gauge_lines + self.set_lines + self.absolute_lines
    }

    /// Returns the number of datagrams sent.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Returns the number of datagrams dropped.
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped
    }

    /// Increments the number of events visited.
    pub fn increment_contexts(&mut self, value: usize) {
        self.contexts += value as u64;
    }

    /// Increments the number of events evicted.
    pub fn increment_contexts_evicted(&mut self, value: usize) {
        self.contexts_evicted += value as u64;
    }

    /// Increments the number of lines flushed for the given metric type.
    pub fn increment_lines(&mut self, metric_type: MetricType, value: u64) {
        let lines = match metric_type {
            MetricType::Counter => &mut self.counter_lines,
            MetricType::Timer => &mut self.timer_lines,
            MetricType::Gauge => &mut self.gauge_lines,
            MetricType::Set => &mut self.set_lines,
            MetricType::Absolute => &mut self.absolute_lines,
        };
        *lines += value;
    }

    /// Increments the number of lines that were too large to share a datagram.
    pub fn increment_lines_oversized(&mut self, value: u64) {
        self.lines_oversized += value;
    }

    /// Increments the number of values skipped for not being finite.
    pub fn increment_lines_invalid(&mut self, value: u64) {
        self.lines_invalid += value;
    }

    /// Returns the number of values skipped for not being finite.
    pub fn lines_invalid(&self) -> u64 {
        self.lines_invalid
    }

    /// Tracks a successful packet send.
    pub fn track_packet_send_succeeded(&mut self, bytes_len: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes_len as u64;
    }

    /// Tracks a failed packet send.
    pub fn track_packet_send_failed(&mut self, bytes_len: usize) {
        self.packets_dropped += 1;
        self.bytes_dropped += bytes_len as u64;
    }
}
