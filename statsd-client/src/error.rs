use std::io;

use thiserror::Error;

use crate::MetricType;

/// Errors that could occur while recording or sending metrics.
#[derive(Debug, Error)]
pub enum Error {
    /// An update was made with a different metric type than the one already recorded for the key.
    #[error("statsd event type conflict for '{key}': {existing} vs {incoming}")]
    TypeConflict {
        /// The metric key.
        key: String,

        /// The metric type already recorded for the key.
        existing: MetricType,

        /// The metric type of the rejected update.
        incoming: MetricType,
    },

    /// A producer call was given NaN or an infinite value, which has no representation on the wire.
    #[error("non-finite value for '{key}': {value}")]
    NonFiniteValue {
        /// The metric key.
        key: String,

        /// The rejected value.
        value: f64,
    },

    /// Failed to resolve the remote address.
    #[error("failed to resolve remote address '{address}': {source}")]
    Resolution {
        /// The address that could not be resolved.
        address: String,

        /// The underlying resolution failure.
        source: io::Error,
    },

    /// Failed to create, bind, or connect the socket.
    #[error("failed to create socket: {source}")]
    Socket {
        /// The underlying socket failure.
        source: io::Error,
    },

    /// Failed to write a datagram.
    ///
    /// The datagram, and every metric line packed inside it, is dropped. Writes are never retried.
    #[error("failed to write {len}-byte datagram: {source}")]
    Write {
        /// Length of the dropped datagram, in bytes.
        len: usize,

        /// The underlying write failure.
        source: io::Error,
    },

    /// The socket is not open, either because it was never created or because the client has been closed.
    #[error("socket is not connected")]
    NotConnected,

    /// The socket is already open.
    #[error("socket is already connected")]
    AlreadyConnected,

    /// Failed to spawn the background flush thread.
    #[error("failed to spawn background flush thread: {source}")]
    Spawn {
        /// The underlying spawn failure.
        source: io::Error,
    },
}
