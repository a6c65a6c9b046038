use std::sync::Arc;

use crossbeam_channel::{select, tick, Receiver};
use tracing::{debug, error, trace};

use crate::{
    state::State,
    telemetry::{Telemetry, TelemetryUpdate},
    writer::PayloadWriter,
    Error,
};

use super::{ForwarderConfiguration, Transport};

/// Sends every payload in the writer, in the order they were written.
///
/// Each payload is attempted exactly once. A payload that fails to send is dropped, and sending continues with the
/// remaining payloads. The first error encountered, if any, is returned after all payloads have been attempted.
pub(crate) fn send_payloads(
    transport: &Transport,
    writer: &mut PayloadWriter,
    telemetry: &mut TelemetryUpdate,
) -> Result<(), Error> {
    let mut payloads = writer.payloads();
    let mut first_error = None;
    trace!(num_payloads = payloads.len(), "Sending payloads.");

    while let Some(payload) = payloads.next_payload() {
        match transport.send(payload) {
            Ok(_) => telemetry.track_packet_send_succeeded(payload.len()),
            Err(e) => {
                error!(error = %e, "Failed to send payload.");
                telemetry.track_packet_send_failed(payload.len());
                first_error.get_or_insert(e);
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}

/// Runs a single flush pass: drains every event, sends the resulting payloads, and evicts idle events.
pub(crate) fn flush_pass(
    config: &ForwarderConfiguration,
    state: &State,
    transport: &Transport,
    writer: &mut PayloadWriter,
    telemetry: &mut TelemetryUpdate,
) -> Result<(), Error> {
    telemetry.clear();
    state.flush(writer, telemetry);

    let result = send_payloads(transport, writer, telemetry);
    debug!(
        lines_flushed = telemetry.lines_flushed(),
        lines_invalid = telemetry.lines_invalid(),
        payloads_sent = telemetry.packets_sent(),
        payloads_dropped = telemetry.packets_dropped(),
        "Finished flushing events."
    );

    if let Some(max_idle_intervals) = config.idle_eviction {
        state.evict_idle(max_idle_intervals, telemetry);
    }

    // Telemetry is recorded into the registry, so it goes out with the next flush.
    if state.telemetry_enabled() && telemetry.had_updates() {
        Telemetry::apply_update(state.registry(), telemetry);
    }

    result
}

/// Background flusher for buffered clients.
///
/// The forwarder wakes up once per flush interval, drains the registry, and sends the resulting payloads. When the
/// shutdown channel fires (or its sender is dropped), it runs one final flush pass and exits.
pub(crate) struct Forwarder {
    config: ForwarderConfiguration,
    state: Arc<State>,
    transport: Arc<Transport>,
    shutdown: Receiver<()>,
}

impl Forwarder {
    /// Create a new synchronous `Forwarder`.
    pub fn new(
        config: ForwarderConfiguration,
        state: Arc<State>,
        transport: Arc<Transport>,
        shutdown: Receiver<()>,
    ) -> Self {
        Forwarder { config, state, transport, shutdown }
    }

    /// Run the forwarder, sending out payloads to the remote address at the configured interval.
    ///
    /// Returns the result of the final flush pass once shutdown is requested.
    pub fn run(self) -> Result<(), Error> {
        let mut writer = self.state.payload_writer(self.config.max_payload_len);
        let mut telemetry = TelemetryUpdate::default();
        let ticker = tick(self.config.flush_interval);

        loop {
            select! {
                recv(ticker) -> _ => {
                    trace!("Flush interval elapsed.");

                    // Failures are already logged, and the dropped payloads can't be recovered.
                    let _ = self.flush(&mut writer, &mut telemetry);
                }
                recv(self.shutdown) -> _ => break,
            }
        }

        debug!("Shutdown requested, running final flush.");
        let result = self.flush(&mut writer, &mut telemetry);
        debug!("Forwarder stopped.");

        result
    }

    fn flush(&self, writer: &mut PayloadWriter, telemetry: &mut TelemetryUpdate) -> Result<(), Error> {
        flush_pass(&self.config, &self.state, &self.transport, writer, telemetry)
    }
}
