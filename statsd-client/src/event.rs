use std::{fmt, mem, slice::Iter};

use hashbrown::HashSet;
use parking_lot::Mutex;

use crate::{Error, MetricType, MetricValue, MetricValueFormatter};

/// Current value of a gauge.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GaugeValue {
    /// An absolute value, replacing whatever came before it.
    Value(f64),

    /// A relative adjustment to whatever value the collector currently holds.
    Delta(f64),
}

impl GaugeValue {
    fn merge(self, incoming: GaugeValue) -> GaugeValue {
        match (self, incoming) {
            (_, GaugeValue::Value(v)) => GaugeValue::Value(v),
            (GaugeValue::Value(current), GaugeValue::Delta(delta)) => GaugeValue::Value(current + delta),
            (GaugeValue::Delta(current), GaugeValue::Delta(delta)) => GaugeValue::Delta(current + delta),
        }
    }

    fn values(self) -> Values<'static> {
        match self {
            // A leading minus sign is read as a relative change, so a negative value has to be set by zeroing the
            // gauge first and then adjusting it.
            GaugeValue::Value(v) if v < 0.0 && v.is_finite() => {
                Values::Fixed { first: Some(MetricValue::Integer(0)), second: Some(MetricValue::FloatingPoint(v)) }
            }
            GaugeValue::Value(v) => Values::single(Some(MetricValue::FloatingPoint(v))),
            GaugeValue::Delta(v) => Values::single(Some(MetricValue::Delta(v))),
        }
    }
}

/// Aggregated state of an event.
///
/// Each variant holds everything recorded for its metric type since the last reset.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Sum of all increments, or `None` if nothing has been recorded.
    Counter(Option<i64>),

    /// Every recorded duration, in milliseconds.
    Timer(Vec<f64>),

    /// Latest gauge value, or `None` if nothing has been recorded.
    Gauge(Option<GaugeValue>),

    /// Distinct members.
    Set(HashSet<String>),

    /// Every recorded sample, in the order it was recorded.
    Absolute(Vec<f64>),
}

impl Payload {
    /// Creates an empty payload for the given metric type.
    pub fn empty(metric_type: MetricType) -> Self {
        match metric_type {
            MetricType::Counter => Payload::Counter(None),
            MetricType::Timer => Payload::Timer(Vec::new()),
            MetricType::Gauge => Payload::Gauge(None),
            MetricType::Set => Payload::Set(HashSet::new()),
            MetricType::Absolute => Payload::Absolute(Vec::new()),
        }
    }

    /// Returns the metric type of this payload.
    pub fn metric_type(&self) -> MetricType {
        match self {
            Payload::Counter(_) => MetricType::Counter,
            Payload::Timer(_) => MetricType::Timer,
            Payload::Gauge(_) => MetricType::Gauge,
            Payload::Set(_) => MetricType::Set,
            Payload::Absolute(_) => MetricType::Absolute,
        }
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Counter(value) => value.is_none(),
            Payload::Gauge(value) => value.is_none(),
            Payload::Timer(values) | Payload::Absolute(values) => values.is_empty(),
            Payload::Set(members) => members.is_empty(),
        }
    }

    /// Merges `incoming` into this payload.
    ///
    /// Both payloads must be of the same metric type. Callers check this beforehand, so a mismatch is silently
    /// ignored here rather than coerced.
    fn merge(&mut self, incoming: Payload) {
        match (self, incoming) {
            (Payload::Counter(current), Payload::Counter(Some(delta))) => {
                *current = Some(current.unwrap_or(0).saturating_add(delta));
            }
            (Payload::Gauge(current), Payload::Gauge(Some(incoming))) => {
                *current = Some(match current.take() {
                    Some(existing) => existing.merge(incoming),
                    None => incoming,
                });
            }
            (Payload::Timer(current), Payload::Timer(values))
            | (Payload::Absolute(current), Payload::Absolute(values)) => current.extend(values),
            (Payload::Set(current), Payload::Set(members)) => current.extend(members),
            _ => {}
        }
    }

    /// Returns an iterator over the wire values of this payload.
    ///
    /// Each value becomes exactly one line on the wire. A negative gauge value takes two lines.
    pub(crate) fn values(&self) -> Values<'_> {
        match self {
            Payload::Counter(value) => Values::single(value.map(MetricValue::Integer)),
            Payload::Gauge(Some(value)) => value.values(),
            Payload::Gauge(None) => Values::single(None),
            Payload::Set(members) if members.is_empty() => Values::single(None),
            Payload::Set(members) => {
                let cardinality = i64::try_from(members.len()).unwrap_or(i64::MAX);
                Values::single(Some(MetricValue::Integer(cardinality)))
            }
            Payload::Timer(values) | Payload::Absolute(values) => Values::Samples(values.iter()),
        }
    }
}

pub(crate) enum Values<'a> {
    Fixed { first: Option<MetricValue>, second: Option<MetricValue> },
    Samples(Iter<'a, f64>),
}

impl Values<'_> {
    fn single(value: Option<MetricValue>) -> Self {
        Values::Fixed { first: value, second: None }
    }
}

impl Iterator for Values<'_> {
    type Item = MetricValue;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Values::Fixed { first, second } => first.take().or_else(|| second.take()),
            Values::Samples(values) => values.next().copied().map(MetricValue::FloatingPoint),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = match self {
            Values::Fixed { first, second } => usize::from(first.is_some()) + usize::from(second.is_some()),
            Values::Samples(values) => values.len(),
        };
        (len, Some(len))
    }
}

impl ExactSizeIterator for Values<'_> {}

/// Outcome of merging a payload into an event held by the registry.
pub(crate) enum Merge {
    Applied,

    // The event was evicted from the registry; the payload is handed back so it can be recorded afresh.
    Retired(Payload),
}

struct EventState {
    payload: Payload,
    idle_intervals: u32,
    retired: bool,
}

/// A single metric key and everything recorded against it.
///
/// `Event` is the unit of aggregation. Producers build a short-lived event holding one observation, and the
/// registry merges it into the long-lived event for the same key via [`Event::update`]. All access to the
/// aggregated state goes through a per-event lock, so updates to the same key are applied in lock acquisition order
/// and a flush never interleaves with an update.
pub struct Event {
    key: String,
    metric_type: MetricType,
    state: Mutex<EventState>,
}

impl Event {
    fn from_payload(key: String, payload: Payload) -> Self {
        Self {
            key,
            metric_type: payload.metric_type(),
            state: Mutex::new(EventState { payload, idle_intervals: 0, retired: false }),
        }
    }

    /// Creates an empty event of the given metric type.
    pub fn empty<K: Into<String>>(key: K, metric_type: MetricType) -> Self {
        Self::from_payload(key.into(), Payload::empty(metric_type))
    }

    /// Creates a counter event holding a single increment.
    pub fn counter<K: Into<String>>(key: K, value: i64) -> Self {
        Self::from_payload(key.into(), Payload::Counter(Some(value)))
    }

    /// Creates a timer event holding a single duration, in milliseconds.
    pub fn timer<K: Into<String>>(key: K, millis: f64) -> Self {
        Self::from_payload(key.into(), Payload::Timer(vec![millis]))
    }

    /// Creates a gauge event holding an absolute value.
    pub fn gauge<K: Into<String>>(key: K, value: f64) -> Self {
        Self::from_payload(key.into(), Payload::Gauge(Some(GaugeValue::Value(value))))
    }

    /// Creates a gauge event holding a relative adjustment.
    pub fn gauge_delta<K: Into<String>>(key: K, delta: f64) -> Self {
        Self::from_payload(key.into(), Payload::Gauge(Some(GaugeValue::Delta(delta))))
    }

    /// Creates a set event holding a single member.
    pub fn set<K: Into<String>, M: Into<String>>(key: K, member: M) -> Self {
        let mut members = HashSet::new();
        members.insert(member.into());
        Self::from_payload(key.into(), Payload::Set(members))
    }

    /// Creates an absolute event holding a single sample.
    pub fn absolute<K: Into<String>>(key: K, value: f64) -> Self {
        Self::from_payload(key.into(), Payload::Absolute(vec![value]))
    }

    /// Returns the key of this event.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the metric type of this event.
    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    /// Merges everything recorded in `other` into this event.
    ///
    /// # Errors
    ///
    /// If `other` is of a different metric type, [`Error::TypeConflict`] is returned and this event is left untouched.
    pub fn update(&self, other: &Event) -> Result<(), Error> {
        self.check_type(other.metric_type)?;

        let incoming = other.payload();
        self.state.lock().payload.merge(incoming);
        Ok(())
    }

    /// Clears everything recorded since the last reset.
    pub fn reset(&self) {
        self.state.lock().payload = Payload::empty(self.metric_type);
    }

    /// Returns a copy of everything recorded since the last reset.
    pub fn payload(&self) -> Payload {
        self.state.lock().payload.clone()
    }

    /// Returns `true` if nothing has been recorded since the last reset.
    pub fn is_empty(&self) -> bool {
        self.state.lock().payload.is_empty()
    }

    /// Renders the current state as wire lines, in the form `<key>:<value>|<type>`.
    ///
    /// No prefix, host substitution, or sample rate is applied.
    pub fn stats(&self) -> Vec<String> {
        let state = self.state.lock();
        let values = state.payload.values();
        let suffix = String::from_utf8_lossy(self.metric_type.as_bytes());

        let mut formatter = MetricValueFormatter::new();
        let mut lines = Vec::with_capacity(values.len());
        for value in values {
            lines.push(format!("{}:{}{}", self.key, formatter.format(value), suffix));
        }

        lines
    }

    fn check_type(&self, incoming: MetricType) -> Result<(), Error> {
        if incoming == self.metric_type {
            Ok(())
        } else {
            Err(Error::TypeConflict { key: self.key.clone(), existing: self.metric_type, incoming })
        }
    }

    /// Merges `payload` into this event unless it has been retired from the registry.
    pub(crate) fn merge(&self, payload: Payload) -> Result<Merge, Error> {
        self.check_type(payload.metric_type())?;

        let mut state = self.state.lock();
        if state.retired {
            return Ok(Merge::Retired(payload));
        }

        state.payload.merge(payload);
        state.idle_intervals = 0;
        Ok(Merge::Applied)
    }

    /// Takes a snapshot of the current state and resets it, as a single step.
    pub(crate) fn flush(&self) -> Payload {
        let mut state = self.state.lock();
        let snapshot = mem::replace(&mut state.payload, Payload::empty(self.metric_type));
        if snapshot.is_empty() {
            state.idle_intervals = state.idle_intervals.saturating_add(1);
        }

        snapshot
    }

    /// Marks this event as retired if it has been idle for at least `max_idle_intervals` flushes.
    ///
    /// Returns `true` if the event was retired. A retired event rejects all further merges.
    pub(crate) fn try_retire(&self, max_idle_intervals: u32) -> bool {
        let mut state = self.state.lock();
        if state.payload.is_empty() && state.idle_intervals >= max_idle_intervals {
            state.retired = true;
        }

        state.retired
    }

    pub(crate) fn into_parts(self) -> (String, Payload) {
        (self.key, self.state.into_inner().payload)
    }

    pub(crate) fn from_parts(key: String, payload: Payload) -> Self {
        Self::from_payload(key, payload)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("key", &self.key)
            .field("metric_type", &self.metric_type)
            .field("payload", &self.state.lock().payload)
            .finish()
    }
}
