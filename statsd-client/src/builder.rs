use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tracing::warn;

use crate::{
    client::{Mode, StatsdClient},
    forwarder::{ForwarderConfiguration, RemoteAddr, Transport},
    hostname::local_hostname,
    sampling::SampleMode,
    state::{State, StateConfiguration},
    SMALLEST_VALID_PAYLOAD,
};

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_PAYLOAD_LEN: usize = 1432;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Errors that could occur while building a statsd client.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// Failed to parse the sample mode.
    #[error("invalid sample mode: {reason}")]
    InvalidSampleMode {
        /// Details about the parsing failure.
        reason: String,
    },

    /// The buffer size is too small to hold even the shortest possible metric line.
    #[error("buffer size of {len} bytes is too small (must be {minimum} or greater)")]
    PayloadLengthTooSmall {
        /// The configured buffer size.
        len: usize,

        /// The smallest usable buffer size.
        minimum: usize,
    },

    /// The flush interval was zero.
    #[error("flush interval must be greater than zero")]
    InvalidFlushInterval,
}

/// Builder for a statsd client.
///
/// The builder only validates configuration. Nothing touches the network until [`StatsdClient::create_socket`] is
/// called on the built client.
pub struct StatsdBuilder {
    remote_addr: RemoteAddr,
    prefix: String,
    sample_mode: SampleMode,
    buffer_size: Option<usize>,
    flush_interval: Duration,
    write_timeout: Duration,
    idle_eviction: Option<u32>,
    telemetry: bool,
}

impl StatsdBuilder {
    /// Set the remote address to send metrics to.
    ///
    /// The address needs to be in the format of `<host>:<port>`. It is only checked for shape here: the host is
    /// resolved when the socket is created.
    ///
    /// Defaults to `127.0.0.1:8125`.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed as a valid address, an error will be returned indicating the
    /// reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.remote_addr = RemoteAddr::try_from(addr.as_ref())
            .map_err(|reason| BuildError::InvalidRemoteAddress { reason })?;
        Ok(self)
    }

    /// Set the prefix prepended to every metric key.
    ///
    /// The prefix is prepended as-is, so it should generally end with a separator, such as `myproject.`. The `%HOST%`
    /// token is substituted in the prefix just as it is in keys.
    ///
    /// Defaults to no prefix.
    #[must_use]
    pub fn with_prefix<P>(mut self, prefix: P) -> Self
    where
        P: Into<String>,
    {
        self.prefix = prefix.into();
        self
    }

    /// Set the sample mode.
    ///
    /// `none` (or an empty string) disables sampling. Otherwise, the mode must be a sample rate in the range `(0, 1]`.
    /// When sampling, counter, timer, and absolute updates are only recorded with the given probability, and their
    /// lines carry the sample rate so the collector can scale them back up. Gauges and sets are never sampled.
    ///
    /// Defaults to `none`.
    ///
    /// # Errors
    ///
    /// If the given mode is not able to be parsed, an error will be returned indicating the reason.
    pub fn with_sample_mode<M>(mut self, mode: M) -> Result<Self, BuildError>
    where
        M: AsRef<str>,
    {
        self.sample_mode = mode.as_ref().parse().map_err(|reason| BuildError::InvalidSampleMode { reason })?;
        Ok(self)
    }

    /// Use buffered mode, with the given buffer size.
    ///
    /// In buffered mode, updates are aggregated locally and flushed by a background thread at the configured flush
    /// interval. Serialized lines are packed into datagrams of at most `buffer_size` bytes, except for a single line
    /// that is longer than the buffer size by itself, which is sent in a datagram of its own.
    ///
    /// This should generally be set to the largest payload the network path can carry without fragmentation, such as
    /// 1432 bytes for a typical Ethernet MTU, or 512 bytes when sending over the public internet.
    ///
    /// Defaults to unbuffered mode, where every update is sent immediately in its own datagram.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Set the flush interval used in buffered mode.
    ///
    /// This controls how often aggregated metrics are sent, and so bounds how long an update can wait before it is
    /// sent. A shorter interval sends updates sooner, at the cost of more datagrams and less aggregation.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Set the write timeout for sending datagrams.
    ///
    /// When the write timeout is reached, the write is aborted and the datagram being sent at the time is dropped
    /// without retrying. A zero timeout disables the timeout entirely.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the idle eviction policy used in buffered mode.
    ///
    /// When set, an event that has seen no updates for the given number of consecutive flush intervals is removed
    /// from the registry, bounding memory use when keys are short-lived. An update for an evicted key simply starts a
    /// new event, so no updates are lost.
    ///
    /// Defaults to `None`, which keeps every event for the life of the client.
    #[must_use]
    pub fn with_idle_eviction(mut self, max_idle_intervals: Option<u32>) -> Self {
        self.idle_eviction = max_idle_intervals;
        self
    }

    /// Sets whether or not to enable telemetry for the client.
    ///
    /// When enabled, additional counters will be sent in buffered mode that provide insight into the operation of the
    /// client itself, such as the number of live events, how many lines were flushed, how many datagrams and bytes were
    /// sent or dropped, and so on. All telemetry is under the `statsd.client` namespace, and is subject to the
    /// configured prefix like any other metric.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Builds the client.
    ///
    /// The local hostname is resolved here, for substituting `%HOST%` in metric keys. If it cannot be resolved, a
    /// warning is logged and the token is sent as-is.
    ///
    /// # Errors
    ///
    /// If the buffer size is too small to hold any metric line, or the flush interval is zero, an error will be
    /// returned.
    pub fn build(self) -> Result<StatsdClient, BuildError> {
        let minimum = SMALLEST_VALID_PAYLOAD.len();
        if let Some(len) = self.buffer_size {
            if len < minimum {
                return Err(BuildError::PayloadLengthTooSmall { len, minimum });
            }
        }

        if self.flush_interval.is_zero() {
            return Err(BuildError::InvalidFlushInterval);
        }

        let hostname = match local_hostname() {
            Ok(hostname) => Some(hostname),
            Err(e) => {
                warn!(error = %e, "Failed to resolve local hostname. '%HOST%' will not be substituted.");
                None
            }
        };

        let state_config = StateConfiguration {
            prefix: self.prefix,
            sample_mode: self.sample_mode,
            hostname,
            telemetry: self.telemetry,
        };
        let state = Arc::new(State::new(state_config));

        let write_timeout = Some(self.write_timeout).filter(|timeout| !timeout.is_zero());
        let transport = Arc::new(Transport::new(self.remote_addr, write_timeout));

        let mode = match self.buffer_size {
            Some(max_payload_len) => Mode::Buffered(ForwarderConfiguration {
                max_payload_len,
                flush_interval: self.flush_interval,
                idle_eviction: self.idle_eviction,
            }),
            None => Mode::Unbuffered { max_payload_len: DEFAULT_MAX_PAYLOAD_LEN },
        };

        Ok(StatsdClient::from_parts(state, transport, mode))
    }
}

impl Default for StatsdBuilder {
    fn default() -> Self {
        StatsdBuilder {
            remote_addr: RemoteAddr::default(),
            prefix: String::new(),
            sample_mode: SampleMode::None,
            buffer_size: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            idle_eviction: None,
            telemetry: false,
        }
    }
}
