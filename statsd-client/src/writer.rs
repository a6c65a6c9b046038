use std::{
    ops::{Deref, DerefMut},
    vec::Drain,
};

use crate::{
    hostname::HOST_TOKEN, MetricType, MetricValueFormatter, Payload, WriteResult, SMALLEST_VALID_PAYLOAD,
};

/// Packs serialized metric lines into datagram-sized payloads.
///
/// Statsd lines are always newline delimited, which means that multiple lines can be sent in a single datagram, and
/// then trivially split apart by the collector. This saves on the number of system calls required to send the metrics
/// over the network, and on per-packet overhead.
///
/// A maximum payload length must be specified. Lines are appended to the current payload until the next line (plus its
/// separating newline) would push it past the maximum, at which point the current payload is finalized and a new one is
/// started. A line that is longer than the maximum payload length by itself is never split: it is placed in a payload
/// of its own, which is the only case where a payload may exceed the maximum.
///
/// Lines are written as `<prefix><key>:<value>|<type>[|@<sample rate>]`, with the token `%HOST%` in the prefix or key
/// replaced by the configured hostname.
pub(crate) struct PayloadWriter {
    max_payload_len: usize,
    payloads_buf: Vec<u8>,
    offsets: Vec<usize>,
    header_buf: Vec<u8>,
    line_buf: Vec<u8>,
    trailer_buf: Vec<u8>,
    hostname: Option<String>,
}

impl PayloadWriter {
    /// Creates a new `PayloadWriter` with the given maximum payload length.
    pub fn new(max_payload_len: usize) -> Self {
        // NOTE: This is also validated by the builder, but we want to double check here that we're getting a properly
        // sanitized value.
        assert!(
            max_payload_len >= SMALLEST_VALID_PAYLOAD.len(),
            "maximum payload length is too small to allow any metrics to be written (must be {} or greater)",
            SMALLEST_VALID_PAYLOAD.len()
        );

        Self {
            max_payload_len,
            payloads_buf: Vec::new(),
            offsets: Vec::new(),
            header_buf: Vec::new(),
            line_buf: Vec::new(),
            trailer_buf: Vec::new(),
            hostname: None,
        }
    }

    /// Sets the hostname used to replace `%HOST%` in metric keys.
    ///
    /// When no hostname is set, the token is written as-is.
    #[must_use]
    pub fn with_hostname(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname;
        self
    }

    fn last_offset(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Returns the number of bytes in the current payload.
    fn current_payload_len(&self) -> usize {
        self.payloads_buf.len() - self.last_offset()
    }

    /// Finalizes the current payload and starts a new one.
    ///
    /// If the current payload is empty, this method does nothing.
    fn finalize_current_payload(&mut self) {
        if self.current_payload_len() == 0 {
            return;
        }

        self.offsets.push(self.payloads_buf.len());
    }

    /// Commits the pending line to the current payload.
    ///
    /// If the current payload cannot fit the line without exceeding the maximum payload length, the current payload is
    /// finalized first. If the line cannot fit in any payload, it is written to a payload of its own.
    ///
    /// Returns `true` if the line fit within the maximum payload length, or `false` if it was written alone as an
    /// oversized payload.
    fn commit(&mut self) -> bool {
        let line_len = self.line_buf.len();
        if line_len > self.max_payload_len {
            self.finalize_current_payload();
            self.payloads_buf.extend_from_slice(&self.line_buf);
            self.line_buf.clear();
            self.finalize_current_payload();
            return false;
        }

        let current_payload_len = self.current_payload_len();
        let separator_len = usize::from(current_payload_len > 0);
        if current_payload_len + separator_len + line_len > self.max_payload_len {
            self.finalize_current_payload();
        }

        if self.current_payload_len() > 0 {
            self.payloads_buf.push(b'\n');
        }
        self.payloads_buf.extend_from_slice(&self.line_buf);
        self.line_buf.clear();

        true
    }

    fn write_substituted(&mut self, s: &str) {
        let Some(hostname) = self.hostname.as_deref() else {
            self.header_buf.extend_from_slice(s.as_bytes());
            return;
        };

        let mut parts = s.split(HOST_TOKEN);
        if let Some(first) = parts.next() {
            self.header_buf.extend_from_slice(first.as_bytes());
        }
        for part in parts {
            self.header_buf.extend_from_slice(hostname.as_bytes());
            self.header_buf.extend_from_slice(part.as_bytes());
        }
    }

    fn write_metric_header(&mut self, prefix: &str, key: &str) {
        self.header_buf.clear();
        self.write_substituted(prefix);
        self.write_substituted(key);
    }

    fn write_metric_trailer(&mut self, metric_type: MetricType, maybe_sample_rate: Option<f64>) {
        self.trailer_buf.clear();
        self.trailer_buf.extend_from_slice(metric_type.as_bytes());

        if let Some(sample_rate) = maybe_sample_rate {
            let mut float_writer = ryu::Buffer::new();
            let sample_rate_str = float_writer.format(sample_rate);

            self.trailer_buf.extend_from_slice(b"|@");
            self.trailer_buf.extend_from_slice(sample_rate_str.as_bytes());
        }
    }

    /// Writes every value of the given payload as its own line.
    ///
    /// NaN and infinite values are skipped, and counted in the returned [`WriteResult`].
    pub fn write_payload(
        &mut self,
        prefix: &str,
        key: &str,
        payload: &Payload,
        maybe_sample_rate: Option<f64>,
    ) -> WriteResult {
        self.write_metric_header(prefix, key);
        self.write_metric_trailer(payload.metric_type(), maybe_sample_rate);

        let mut result = WriteResult::new();
        let mut formatter = MetricValueFormatter::new();
        for value in payload.values() {
            if !value.is_finite() {
                result.increment_lines_invalid();
                continue;
            }
            let value_str = formatter.format(value);

            self.line_buf.clear();
            self.line_buf.extend_from_slice(&self.header_buf);
            self.line_buf.push(b':');
            self.line_buf.extend_from_slice(value_str.as_bytes());
            self.line_buf.extend_from_slice(&self.trailer_buf);

            if !self.commit() {
                result.increment_lines_oversized();
            }
            result.increment_lines_written();
        }

        result
    }

    /// Returns a consuming iterator over all payloads written by this writer.
    ///
    /// The iterator will yield payloads in the order they were written, and the payloads will be cleared from the
    /// writer when the iterator is dropped.
    pub fn payloads(&mut self) -> Payloads<'_> {
        // Finalize the current payload, and clear the intermediate buffers.
        //
        // Between this method, and the logic in `Payloads`, the writer should be completely cleared out after
        // `Payloads` is dropped.
        self.finalize_current_payload();
        self.header_buf.clear();
        self.line_buf.clear();
        self.trailer_buf.clear();

        Payloads::new(&mut self.payloads_buf, &mut self.offsets)
    }
}

/// Iterator over all payloads written by a `PayloadWriter`.
pub struct Payloads<'a> {
    payloads_buf: ConsumingBufferSwap<'a, u8>,
    start: usize,
    offsets: Drain<'a, usize>,
}

impl<'a> Payloads<'a> {
    fn new(payload_buf: &'a mut Vec<u8>, offsets: &'a mut Vec<usize>) -> Self {
        Self { payloads_buf: ConsumingBufferSwap::new(payload_buf), start: 0, offsets: offsets.drain(..) }
    }

    /// Returns the number of remaining payloads.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns the next payload.
    ///
    /// If there are no more payloads, `None` is returned.
    pub fn next_payload(&mut self) -> Option<&[u8]> {
        let offset = self.offsets.next()?;

        let offset_buf = &self.payloads_buf[self.start..offset];
        self.start = offset;

        Some(offset_buf)
    }
}

// Helper type for "pre-pooping our pants".
//
// This type is used when a `Vec<T>` is meant to be drained during an operation, such that the buffer is entirely empty
// after the operation is finished. Since it's safe to "forget" a value and not have its drop logic called, how do we
// ensure that we don't leave the buffer in an indeterminate state without drop logic? We pre-poop our pants.
//
// By swapping out the buffer with an empty one, we ensure that the end state -- the buffer is cleared -- is established
// as soon as we create `ConsumingBufferSwap`. When the drop logic is called, we replace the original buffer, which lets
// use reuse the allocation. At worst, if the drop logic doesn't run, then the buffer is still empty.
//
// https://faultlore.com/blah/everyone-poops/
struct ConsumingBufferSwap<'a, T> {
    source: &'a mut Vec<T>,
    original: Vec<T>,
}

impl<'a, T> ConsumingBufferSwap<'a, T> {
    fn new(source: &'a mut Vec<T>) -> Self {
        let original = std::mem::take(source);
        Self { source, original }
    }
}

impl<T> Drop for ConsumingBufferSwap<'_, T> {
    fn drop(&mut self) {
        // Clear out the original buffer to reset it, and then return it to the source.
        self.original.clear();
        std::mem::swap(self.source, &mut self.original);
    }
}

impl<T> Deref for ConsumingBufferSwap<'_, T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.original
    }
}

impl<T> DerefMut for ConsumingBufferSwap<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.original
    }
}
