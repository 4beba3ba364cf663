//! Core data types shared by every stage of the acquisition pipeline.
//!
//! - [`Sample`]: one immutable, timestamped reading produced by an instrument.
//! - [`Sequenced`]: a sample tagged with the sequence number its channel assigned.
//! - [`JobId`]: identifier of a measurement job, used as the persistence key.
//!
//! Samples are shared as `Arc<Sample>` so fan-out to several channels (plot and
//! persistence) never copies the payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// A single reading from one instrument.
///
/// `payload` holds one value for scalar devices (cryostat temperature, beam
/// position) and one value per bin for spectra and oscilloscope traces.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Monotonic acquisition instant.
    pub timestamp: Instant,
    /// Wall clock time of the acquisition, for persistence and display.
    pub acquired_at: DateTime<Utc>,
    /// Producing channel, usually the device id.
    pub channel_id: String,
    /// Ordered readings.
    pub payload: Vec<f64>,
}

impl Sample {
    /// Create a sample stamped with the current time.
    pub fn new(channel_id: impl Into<String>, payload: Vec<f64>) -> Self {
        Self {
            timestamp: Instant::now(),
            acquired_at: Utc::now(),
            channel_id: channel_id.into(),
            payload,
        }
    }

    /// Create a scalar sample.
    pub fn scalar(channel_id: impl Into<String>, value: f64) -> Self {
        Self::new(channel_id, vec![value])
    }

    /// Derive a new sample with the same timestamps and a different payload.
    pub fn with_payload(&self, payload: Vec<f64>) -> Self {
        Self {
            timestamp: self.timestamp,
            acquired_at: self.acquired_at,
            channel_id: self.channel_id.clone(),
            payload,
        }
    }

    /// Number of values in the payload.
    pub fn width(&self) -> usize {
        self.payload.len()
    }

    /// First payload value, for scalar devices.
    pub fn value(&self) -> Option<f64> {
        self.payload.first().copied()
    }

    /// Sum of all payload values (spectrally integrated intensity).
    pub fn integrated(&self) -> f64 {
        self.payload.iter().sum()
    }

    /// Largest payload value and its bin index.
    pub fn peak(&self) -> Option<(usize, f64)> {
        self.payload
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .fold(None, |best, (i, v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((i, v)),
            })
    }
}

/// Shared, immutable sample.
pub type SharedSample = Arc<Sample>;

/// A sample as delivered by a data channel.
#[derive(Debug, Clone)]
pub struct Sequenced {
    /// Channel-local sequence number, strictly increasing per channel.
    pub seq: u64,
    /// The sample itself.
    pub sample: SharedSample,
}

/// Identifier of one measurement job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random job id.
    pub fn new() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(uuid[..12].to_string())
    }

    /// Wrap an existing id.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bin-wise average of several equally sized samples.
///
/// Returns `None` when `samples` is empty or payload widths disagree.
pub fn average_payloads<'a, I>(samples: I) -> Option<Vec<f64>>
where
    I: IntoIterator<Item = &'a Sample>,
{
    let mut iter = samples.into_iter();
    let first = iter.next()?;
    let mut sum = first.payload.clone();
    let mut count = 1usize;
    for sample in iter {
        if sample.payload.len() != sum.len() {
            return None;
        }
        for (acc, v) in sum.iter_mut().zip(&sample.payload) {
            *acc += v;
        }
        count += 1;
    }
    let n = count as f64;
    Some(sum.into_iter().map(|v| v / n).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_picks_largest_bin() {
        let s = Sample::new("spectrometer", vec![1.0, 7.5, 3.0, 7.0]);
        assert_eq!(s.peak(), Some((1, 7.5)));
        assert_eq!(Sample::new("spectrometer", vec![]).peak(), None);
    }

    #[test]
    fn average_requires_equal_widths() {
        let a = Sample::new("spectrometer", vec![1.0, 2.0]);
        let b = Sample::new("spectrometer", vec![3.0, 6.0]);
        assert_eq!(average_payloads([&a, &b]), Some(vec![2.0, 4.0]));

        let c = Sample::new("spectrometer", vec![1.0]);
        assert_eq!(average_payloads([&a, &c]), None);
        assert_eq!(average_payloads(std::iter::empty::<&Sample>()), None);
    }

    #[test]
    fn with_payload_keeps_timestamps() {
        let a = Sample::scalar("cryo", 4.2);
        let b = a.with_payload(vec![1.0, 2.0]);
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(b.width(), 2);
        assert_eq!(a.value(), Some(4.2));
    }

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
        assert_eq!(JobId::from_string("abc").as_str(), "abc");
    }
}
