//! A client for sending metrics to a [statsd][statsd]-compatible collector over UDP.
//!
//! [statsd]: https://github.com/statsd/statsd/blob/master/docs/metric_types.md
//!
//! # Usage
//!
//! ```no_run
//! # use statsd_client::StatsdClient;
//! // An unbuffered client sends every producer call as its own datagram.
//! let client = StatsdClient::new("127.0.0.1:8125", "myproject.", "none").expect("invalid configuration");
//! client.create_socket().expect("failed to open socket");
//!
//! client.total("requests.%HOST%", 1).expect("failed to send");
//! client.close().expect("failed to close client");
//!
//! // A buffered client aggregates updates locally and flushes them periodically, packing as many lines as fit into
//! // each datagram.
//! let client = StatsdClient::buffered("127.0.0.1:8125", "myproject.", "none", 1432).expect("invalid configuration");
//! client.create_socket().expect("failed to open socket");
//!
//! client.incr("cache.hits", 1).expect("failed to record");
//! client.gauge("queue.depth", 17.0).expect("failed to record");
//! client.close().expect("failed to close client");
//! ```
//!
//! For anything beyond the defaults, use [`StatsdBuilder`].
//!
//! # Features
//!
//! ## Client-side aggregation
//!
//! In buffered mode, every metric key maps to a single [`Event`] that merges updates as they arrive. Counters are
//! summed, gauges keep the last write, timers and absolute metrics keep every sample, and sets de-duplicate their
//! members. Each event is guarded by its own lock, so producers updating unrelated keys never contend with each other.
//!
//! ## Datagram packing
//!
//! Serialized lines are newline-delimited and packed into datagrams no larger than the configured buffer size. A line
//! that could never fit is sent on its own rather than split, since a split line would be unparseable.
//!
//! ## Host substitution
//!
//! The literal token `%HOST%` anywhere in a metric key is replaced with the local hostname when the key is written to
//! the wire.
//!
//! # Delivery
//!
//! Delivery is best-effort: there is no acknowledgement, retry, or ordering across datagrams. A datagram that fails to
//! send is dropped along with every line packed inside it.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

use std::fmt;

mod builder;
pub use self::builder::{BuildError, StatsdBuilder};

mod client;
pub use self::client::StatsdClient;

mod error;
pub use self::error::Error;

mod event;
pub use self::event::{Event, GaugeValue, Payload};

mod forwarder;
mod hostname;
mod registry;

mod sampling;
pub use self::sampling::SampleMode;

mod state;
mod telemetry;
mod writer;

const SMALLEST_VALID_PAYLOAD: &[u8] = b"a:0|c";

/// Metric type.
///
/// Every [`Event`] carries exactly one metric type for its entire life. The discriminant is the stable type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricType {
    /// Summed deltas, emitted as a single `|c` line per interval.
    Counter = 1,

    /// Individual durations in milliseconds, emitted as one `|ms` line per sample.
    Timer = 2,

    /// Last-write-wins value, emitted as a single `|g` line per interval.
    Gauge = 3,

    /// Distinct members, emitted as a single `|s` line carrying the member count.
    Set = 4,

    /// Individual samples that are never folded together, emitted as one `|c` line per sample.
    Absolute = 5,
}

impl MetricType {
    /// Returns the stable type tag.
    pub const fn type_tag(self) -> u8 {
        self as u8
    }

    /// Returns `true` if producer calls for this metric type are subject to sampling.
    ///
    /// Gauges and sets are never sampled, as the collector has no way to extrapolate them.
    pub const fn is_sampled(self) -> bool {
        matches!(self, MetricType::Counter | MetricType::Timer | MetricType::Absolute)
    }

    fn as_bytes(self) -> &'static [u8] {
        match self {
            MetricType::Counter | MetricType::Absolute => b"|c",
            MetricType::Timer => b"|ms",
            MetricType::Gauge => b"|g",
            MetricType::Set => b"|s",
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Timer => "timer",
            MetricType::Gauge => "gauge",
            MetricType::Set => "set",
            MetricType::Absolute => "absolute",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum MetricValue {
    Integer(i64),
    FloatingPoint(f64),

    // Relative gauge adjustment, always written with an explicit sign.
    Delta(f64),
}

impl MetricValue {
    /// Returns `false` for NaN and infinite values, which no collector can parse.
    fn is_finite(self) -> bool {
        match self {
            MetricValue::Integer(_) => true,
            MetricValue::FloatingPoint(v) | MetricValue::Delta(v) => v.is_finite(),
        }
    }
}

// Floats with no fractional part below this magnitude are written as integers.
const MAX_INTEGRAL_FLOAT: f64 = 1e15;

struct MetricValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
    delta_buf: String,
}

impl MetricValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new(), delta_buf: String::new() }
    }

    fn format(&mut self, value: MetricValue) -> &str {
        match value {
            MetricValue::Integer(v) => self.int_writer.format(v),
            MetricValue::FloatingPoint(v) => self.format_float(v),
            MetricValue::Delta(v) => {
                let sign = if v.is_sign_negative() { "-" } else { "+" };
                let magnitude = self.format_float(v.abs()).to_owned();

                self.delta_buf.clear();
                self.delta_buf.push_str(sign);
                self.delta_buf.push_str(&magnitude);
                &self.delta_buf
            }
        }
    }

    fn format_float(&mut self, v: f64) -> &str {
        if v.is_finite() && v.fract() == 0.0 && v.abs() < MAX_INTEGRAL_FLOAT {
            self.int_writer.format(v as i64)
        } else {
            self.float_writer.format(v)
        }
    }
}

/// Outcome of writing a single event into a payload writer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct WriteResult {
    lines_written: u64,
    lines_oversized: u64,
    lines_invalid: u64,
}

impl WriteResult {
    const fn new() -> Self {
        Self { lines_written: 0, lines_oversized: 0, lines_invalid: 0 }
    }

    fn increment_lines_invalid(&mut self) {
        self.lines_invalid += 1;
    }

    fn increment_lines_written(&mut self) {
        self.lines_written += 1;
    }

    fn increment_lines_oversized(&mut self) {
        self.lines_oversized += 1;
    }

    pub const fn any_oversized(&self) -> bool {
        self.lines_oversized != 0
    }

    pub const fn lines_written(&self) -> u64 {
        self.lines_written
    }

    pub const fn lines_oversized(&self) -> u64 {
        self.lines_oversized
    }

    /// Returns the number of values that were skipped because they were not finite.
    pub const fn lines_invalid(&self) -> u64 {
        self.lines_invalid
    }
}
