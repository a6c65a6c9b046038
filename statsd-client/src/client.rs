use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::{
    builder::{BuildError, StatsdBuilder},
    event::Event,
    forwarder::{
        sync::{flush_pass, send_payloads, Forwarder},
        ForwarderConfiguration, Transport,
    },
    state::State,
    telemetry::TelemetryUpdate,
    Error,
};

/// How producer calls reach the wire.
pub(crate) enum Mode {
    /// Every producer call is serialized and sent immediately, in its own datagram.
    Unbuffered { max_payload_len: usize },

    /// Producer calls are aggregated in the registry and sent by a background forwarder.
    Buffered(ForwarderConfiguration),
}

struct FlushHandle {
    shutdown: Sender<()>,
    thread: JoinHandle<Result<(), Error>>,
}

/// A statsd client.
///
/// A client is created unconnected: [`create_socket`][Self::create_socket] must be called before any metrics can be
/// sent. The client is `Send` and `Sync`, so a single client can be shared (typically behind an `Arc`) by every thread
/// that records metrics.
///
/// ## Buffered and unbuffered modes
///
/// In unbuffered mode, every producer call is written to the socket immediately as its own datagram, and any write
/// failure is returned to the caller.
///
/// In buffered mode, producer calls are merged into the per-key [`Event`] held in the client's registry, and a
/// background thread flushes every event at a fixed interval, packing the resulting lines into as few datagrams as the
/// buffer size allows. Write failures during a background flush are logged, and the affected datagrams are dropped.
///
/// ## Producer errors
///
/// Every producer call fails with [`Error::NotConnected`] if the socket is not open, and with
/// [`Error::NonFiniteValue`] if it is given NaN or an infinite value. In buffered mode, an update for a
/// key that was already recorded with a different metric type fails with [`Error::TypeConflict`], and leaves the
/// existing event untouched. In unbuffered mode, a failed write fails with [`Error::Write`].
///
/// An update that is dropped by sampling is not an error.
pub struct StatsdClient {
    state: Arc<State>,
    transport: Arc<Transport>,
    mode: Mode,
    flusher: Mutex<Option<FlushHandle>>,

    // Producer calls hold this for reading while they run, so `close` can shut them out before the final flush.
    accepting: RwLock<bool>,
}

impl StatsdClient {
    /// Creates an unbuffered client.
    ///
    /// `sample_mode` is either `none`, or a sample rate in the range `(0, 1]`.
    ///
    /// # Errors
    ///
    /// If the remote address or sample mode cannot be parsed, an error will be returned.
    pub fn new(remote_addr: &str, prefix: &str, sample_mode: &str) -> Result<Self, BuildError> {
        Self::builder()
            .with_remote_address(remote_addr)?
            .with_prefix(prefix)
            .with_sample_mode(sample_mode)?
            .build()
    }

    /// Creates a buffered client, packing lines into datagrams of at most `buffer_size` bytes.
    ///
    /// `sample_mode` is either `none`, or a sample rate in the range `(0, 1]`.
    ///
    /// # Errors
    ///
    /// If the remote address or sample mode cannot be parsed, or the buffer size is too small to hold any metric line,
    /// an error will be returned.
    pub fn buffered(
        remote_addr: &str,
        prefix: &str,
        sample_mode: &str,
        buffer_size: usize,
    ) -> Result<Self, BuildError> {
        Self::builder()
            .with_remote_address(remote_addr)?
            .with_prefix(prefix)
            .with_sample_mode(sample_mode)?
            .with_buffer_size(buffer_size)
            .build()
    }

    /// Creates a [`StatsdBuilder`] for configuring a client.
    pub fn builder() -> StatsdBuilder {
        StatsdBuilder::default()
    }

    pub(crate) fn from_parts(state: Arc<State>, transport: Arc<Transport>, mode: Mode) -> Self {
        StatsdClient { state, transport, mode, flusher: Mutex::new(None), accepting: RwLock::new(false) }
    }

    /// Returns `true` if this client is in buffered mode.
    pub fn is_buffered(&self) -> bool {
        matches!(self.mode, Mode::Buffered(_))
    }

    /// Resolves the remote address and opens the socket.
    ///
    /// In buffered mode, this also starts the background flush thread.
    ///
    /// # Errors
    ///
    /// If the remote address cannot be resolved, [`Error::Resolution`] is returned. If the socket cannot be created,
    /// [`Error::Socket`] is returned. If the socket is already open, [`Error::AlreadyConnected`] is returned. If the
    /// flush thread cannot be spawned, [`Error::Spawn`] is returned and the socket is closed again.
    pub fn create_socket(&self) -> Result<(), Error> {
        self.transport.open()?;

        if let Mode::Buffered(config) = &self.mode {
            let (shutdown_tx, shutdown_rx) = bounded(1);
            let forwarder =
                Forwarder::new(config.clone(), Arc::clone(&self.state), Arc::clone(&self.transport), shutdown_rx);

            let thread = thread::Builder::new()
                .name("statsd-client-forwarder".to_string())
                .spawn(move || forwarder.run())
                .map_err(|source| {
                    self.transport.close();
                    Error::Spawn { source }
                })?;

            *self.flusher.lock() = Some(FlushHandle { shutdown: shutdown_tx, thread });
            debug!(flush_interval = ?config.flush_interval, "Started forwarder.");
        }

        *self.accepting.write() = true;
        Ok(())
    }

    /// Closes the client.
    ///
    /// Producer calls are refused from the moment `close` is called, and any producer call already in progress is
    /// allowed to finish first. In buffered mode, the background flush thread then runs one final flush before it
    /// stops, so nothing a producer call accepted is left behind. The socket is then released and the registry is torn
    /// down. The client can be reopened with [`create_socket`][Self::create_socket].
    ///
    /// Closing a client that was never opened, or has already been closed, does nothing.
    ///
    /// # Errors
    ///
    /// If any datagram of the final flush could not be written, the first write error is returned. The socket is
    /// closed regardless.
    pub fn close(&self) -> Result<(), Error> {
        *self.accepting.write() = false;

        let result = self.stop_flusher();
        debug!(events = self.state.registry().len(), "Closing client.");
        self.transport.close();
        self.state.registry().clear();

        result
    }

    /// Flushes every aggregated event immediately, rather than waiting for the next flush interval.
    ///
    /// In unbuffered mode, there is never anything to flush, and this does nothing.
    ///
    /// # Errors
    ///
    /// If any datagram could not be written, the first write error is returned. Every datagram is attempted regardless.
    pub fn flush(&self) -> Result<(), Error> {
        match &self.mode {
            Mode::Unbuffered { .. } => Ok(()),
            Mode::Buffered(config) => {
                let mut writer = self.state.payload_writer(config.max_payload_len);
                let mut telemetry = TelemetryUpdate::default();
                flush_pass(config, &self.state, &self.transport, &mut writer, &mut telemetry)
            }
        }
    }

    /// Increments a counter.
    ///
    /// # Errors
    ///
    /// See [producer errors](StatsdClient#producer-errors).
    pub fn incr(&self, key: &str, value: i64) -> Result<(), Error> {
        self.submit(Event::counter(key, value))
    }

    /// Decrements a counter.
    ///
    /// # Errors
    ///
    /// See [producer errors](StatsdClient#producer-errors).
    pub fn decr(&self, key: &str, value: i64) -> Result<(), Error> {
        self.submit(Event::counter(key, value.saturating_neg()))
    }

    /// Records an integer sample for an absolute metric.
    ///
    /// Absolute metrics are never folded together: every sample is sent as its own counter line.
    ///
    /// # Errors
    ///
    /// See [producer errors](StatsdClient#producer-errors).
    pub fn total(&self, key: &str, value: i64) -> Result<(), Error> {
        self.submit(Event::absolute(key, value as f64))
    }

    /// Records a floating-point sample for an absolute metric.
    ///
    /// # Errors
    ///
    /// See [producer errors](StatsdClient#producer-errors).
    pub fn absolute(&self, key: &str, value: f64) -> Result<(), Error> {
        check_finite(key, value)?;
        self.submit(Event::absolute(key, value))
    }

    /// Sets a gauge.
    ///
    /// # Errors
    ///
    /// See [producer errors](StatsdClient#producer-errors).
    pub fn gauge(&self, key: &str, value: f64) -> Result<(), Error> {
        check_finite(key, value)?;
        self.submit(Event::gauge(key, value))
    }

    /// Adjusts a gauge by a relative amount.
    ///
    /// # Errors
    ///
    /// See [producer errors](StatsdClient#producer-errors).
    pub fn gauge_delta(&self, key: &str, delta: f64) -> Result<(), Error> {
        check_finite(key, delta)?;
        self.submit(Event::gauge_delta(key, delta))
    }

    /// Records a duration for a timer.
    ///
    /// # Errors
    ///
    /// See [producer errors](StatsdClient#producer-errors).
    pub fn timing(&self, key: &str, duration: Duration) -> Result<(), Error> {
        self.submit(Event::timer(key, duration.as_nanos() as f64 / 1_000_000.0))
    }

    /// Records a duration for a timer, in fractional milliseconds.
    ///
    /// # Errors
    ///
    /// See [producer errors](StatsdClient#producer-errors).
    pub fn precise_timing(&self, key: &str, millis: f64) -> Result<(), Error> {
        check_finite(key, millis)?;
        self.submit(Event::timer(key, millis))
    }

    /// Adds a member to a set.
    ///
    /// # Errors
    ///
    /// See [producer errors](StatsdClient#producer-errors).
    pub fn set(&self, key: &str, member: &str) -> Result<(), Error> {
        self.submit(Event::set(key, member))
    }

    fn submit(&self, event: Event) -> Result<(), Error> {
        let accepting = self.accepting.read();
        if !*accepting {
            return Err(Error::NotConnected);
        }

        if event.metric_type().is_sampled() && !self.state.sample_mode().should_sample() {
            return Ok(());
        }

        match &self.mode {
            Mode::Buffered(_) => self.state.record(event).inspect_err(|e| warn!(error = %e, "Failed to record event.")),
            Mode::Unbuffered { max_payload_len } => {
                let mut writer = self.state.payload_writer(*max_payload_len);
                let mut telemetry = TelemetryUpdate::default();
                self.state.write_event(&mut writer, event);
                send_payloads(&self.transport, &mut writer, &mut telemetry)
            }
        }
    }

    fn stop_flusher(&self) -> Result<(), Error> {
        let Some(flusher) = self.flusher.lock().take() else {
            return Ok(());
        };

        // The forwarder also stops if the channel is disconnected, so a failed send is fine.
        let _ = flusher.shutdown.send(());
        match flusher.thread.join() {
            Ok(result) => result,
            Err(_) => {
                error!("Forwarder thread panicked before its final flush.");
                Ok(())
            }
        }
    }
}

fn check_finite(key: &str, value: f64) -> Result<(), Error> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::NonFiniteValue { key: key.to_string(), value })
    }
}

impl Drop for StatsdClient {
    fn drop(&mut self) {
        // Errors from the final flush have already been logged.
        let _ = self.stop_flusher();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::UdpSocket,
        sync::{
            atomic::{AtomicI64, Ordering},
            Arc, Barrier,
        },
        thread,
        time::Duration,
    };

    use super::StatsdClient;
    use crate::{Error, Payload};

    fn listener() -> (UdpSocket, String) {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    fn recv(listener: &UdpSocket) -> String {
        let mut buf = [0u8; 2048];
        let len = listener.recv(&mut buf).unwrap();
        String::from_utf8(buf[..len].to_vec()).unwrap()
    }

    #[test]
    fn producer_calls_require_socket() {
        let (_listener, addr) = listener();
        let client = StatsdClient::new(&addr, "", "none").unwrap();

        assert!(matches!(client.incr("hits", 1), Err(Error::NotConnected)));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let (_listener, addr) = listener();
        let client = StatsdClient::buffered(&addr, "", "none", 1432).unwrap();
        client.create_socket().unwrap();

        let result = client.gauge("depth", f64::NAN);
        assert!(matches!(result, Err(Error::NonFiniteValue { ref key, .. }) if key == "depth"));
        assert!(matches!(client.gauge_delta("depth", f64::INFINITY), Err(Error::NonFiniteValue { .. })));
        assert!(matches!(client.absolute("bytes", f64::NEG_INFINITY), Err(Error::NonFiniteValue { .. })));
        assert!(matches!(client.precise_timing("latency", f64::NAN), Err(Error::NonFiniteValue { .. })));
        assert_eq!(client.state.registry().len(), 0);

        client.close().unwrap();
    }

    #[test]
    fn unbuffered_sends_immediately() {
        let (listener, addr) = listener();
        let client = StatsdClient::new(&addr, "app.", "none").unwrap();
        client.create_socket().unwrap();

        client.decr("hits", 3).unwrap();
        assert_eq!(recv(&listener), "app.hits:-3|c");

        client.timing("latency", Duration::from_micros(2500)).unwrap();
        assert_eq!(recv(&listener), "app.latency:2.5|ms");

        client.gauge_delta("depth", -2.0).unwrap();
        assert_eq!(recv(&listener), "app.depth:-2|g");

        client.close().unwrap();
    }

    #[test]
    fn buffered_aggregates_until_flushed() {
        let (listener, addr) = listener();
        let client = StatsdClient::builder()
            .with_remote_address(&addr)
            .unwrap()
            .with_buffer_size(1432)
            .with_flush_interval(Duration::from_secs(3600))
            .build()
            .unwrap();
        client.create_socket().unwrap();

        client.incr("hits", 1).unwrap();
        client.incr("hits", 2).unwrap();
        assert_eq!(client.state.registry().get("hits").unwrap().payload(), Payload::Counter(Some(3)));

        client.flush().unwrap();
        assert_eq!(recv(&listener), "hits:3|c");

        client.close().unwrap();
    }

    #[test]
    fn close_runs_final_flush() {
        let (listener, addr) = listener();
        let client = StatsdClient::builder()
            .with_remote_address(&addr)
            .unwrap()
            .with_buffer_size(1432)
            .with_flush_interval(Duration::from_secs(3600))
            .build()
            .unwrap();
        client.create_socket().unwrap();

        client.gauge("depth", 7.0).unwrap();
        client.close().unwrap();

        assert_eq!(recv(&listener), "depth:7|g");
        assert_eq!(client.state.registry().len(), 0);
    }

    #[test]
    fn close_then_reopen() {
        let (listener, addr) = listener();
        let client = StatsdClient::buffered(&addr, "", "none", 1432).unwrap();

        client.close().unwrap();
        client.create_socket().unwrap();
        assert!(matches!(client.create_socket(), Err(Error::AlreadyConnected)));
        client.close().unwrap();
        client.close().unwrap();
        assert!(matches!(client.set("users", "alice"), Err(Error::NotConnected)));

        client.create_socket().unwrap();
        client.set("users", "alice").unwrap();
        client.set("users", "alice").unwrap();
        client.close().unwrap();
        assert_eq!(recv(&listener), "users:1|s");
    }

    #[test]
    fn updates_racing_close_are_not_lost() {
        const PRODUCERS: usize = 4;

        let (listener, addr) = listener();
        let client = StatsdClient::builder()
            .with_remote_address(&addr)
            .unwrap()
            .with_flush_interval(Duration::from_secs(3600))
            .with_buffer_size(1432)
            .build()
            .unwrap();
        client.create_socket().unwrap();

        let client = Arc::new(client);
        let accepted = Arc::new(AtomicI64::new(0));
        let started = Arc::new(Barrier::new(PRODUCERS + 1));

        let handles = (0..PRODUCERS)
            .map(|_| {
                let client = Arc::clone(&client);
                let accepted = Arc::clone(&accepted);
                let started = Arc::clone(&started);
                thread::spawn(move || {
                    started.wait();
                    loop {
                        match client.incr("hits", 1) {
                            Ok(()) => accepted.fetch_add(1, Ordering::Relaxed),
                            Err(Error::NotConnected) => break,
                            Err(e) => panic!("unexpected error: {e}"),
                        };
                    }
                })
            })
            .collect::<Vec<_>>();

        started.wait();
        thread::sleep(Duration::from_millis(20));
        client.close().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every update that was acknowledged must have made it into the final flush.
        let accepted = accepted.load(Ordering::Relaxed);
        if accepted > 0 {
            assert_eq!(recv(&listener), format!("hits:{accepted}|c"));
        }
        assert!(matches!(client.incr("hits", 1), Err(Error::NotConnected)));
    }
}
