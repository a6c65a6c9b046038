use std::{fmt, str::FromStr};

/// Sampling behavior for producer calls.
///
/// Sampling only applies to metric types the collector can extrapolate from: counters, timers, and absolute metrics.
/// Lines for those types carry the sample rate (`|@<rate>`) so the collector can scale them back up.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum SampleMode {
    /// Every producer call is recorded.
    #[default]
    None,

    /// Each producer call is recorded with the given probability, which is in the range `(0, 1)`.
    Fixed(f64),
}

impl SampleMode {
    /// Returns the sample rate to report on the wire, if any.
    pub fn rate(self) -> Option<f64> {
        match self {
            SampleMode::None => None,
            SampleMode::Fixed(rate) => Some(rate),
        }
    }

    /// Decides whether a single producer call should be recorded.
    pub fn should_sample(self) -> bool {
        match self {
            SampleMode::None => true,
            SampleMode::Fixed(rate) => rand::random_bool(rate),
        }
    }
}

impl FromStr for SampleMode {
    type Err = String;

    /// Parses a sample mode.
    ///
    /// `none` (or an empty string) disables sampling. Otherwise, the value must be a sample rate in the range `(0, 1]`,
    /// where a rate of exactly `1` also disables sampling.
    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        let mode = mode.trim();
        if mode.is_empty() || mode.eq_ignore_ascii_case("none") {
            return Ok(SampleMode::None);
        }

        let rate = mode
            .parse::<f64>()
            .map_err(|_| format!("'{mode}' is neither 'none' nor a sample rate"))?;
        if rate.is_nan() || rate <= 0.0 || rate > 1.0 {
            return Err(format!("sample rate {rate} must be greater than 0 and at most 1"));
        }

        if rate < 1.0 {
            Ok(SampleMode::Fixed(rate))
        } else {
            Ok(SampleMode::None)
        }
    }
}

impl fmt::Display for SampleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleMode::None => f.write_str("none"),
            SampleMode::Fixed(rate) => write!(f, "{rate}"),
        }
    }
}
