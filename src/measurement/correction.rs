//! Inline spectrum processing: background subtraction followed by an optional
//! transmission or absorbance correction against a reference spectrum.

use crate::acquisition::SampleTransform;
use crate::core::Sample;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Smallest signal/reference ratio used for absorbance.
pub const MIN_RATIO: f64 = 1e-3;

/// Correction applied after background subtraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correction {
    /// Background-subtracted counts.
    #[default]
    None,
    /// `signal / reference`.
    Transmission,
    /// `-log10(signal / reference)`, ratios clamped to [`MIN_RATIO`].
    Absorbance,
}

impl Correction {
    /// Whether a reference spectrum is required.
    pub fn needs_reference(&self) -> bool {
        !matches!(self, Correction::None)
    }

    /// Apply the correction bin-wise.
    ///
    /// Without a reference of matching width the signal is returned unchanged.
    pub fn apply(&self, signal: &[f64], reference: Option<&[f64]>) -> Vec<f64> {
        let reference = match (self, reference) {
            (Correction::None, _) | (_, None) => return signal.to_vec(),
            (_, Some(r)) if r.len() != signal.len() => return signal.to_vec(),
            (_, Some(r)) => r,
        };
        signal
            .iter()
            .zip(reference)
            .map(|(s, r)| {
                let ratio = if *r != 0.0 { s / r } else { 0.0 };
                match self {
                    Correction::Transmission => ratio,
                    _ => -ratio.max(MIN_RATIO).log10(),
                }
            })
            .collect()
    }
}

/// Subtract `baseline` bin-wise. Widths must agree, otherwise the signal is
/// returned unchanged.
pub fn subtract_baseline(signal: &[f64], baseline: &[f64]) -> Vec<f64> {
    if signal.len() != baseline.len() {
        return signal.to_vec();
    }
    signal.iter().zip(baseline).map(|(s, b)| s - b).collect()
}

/// Build the per-sample transform of a streaming job, or `None` when there is
/// nothing to do.
pub fn spectrum_transform(
    baseline: Option<Arc<Vec<f64>>>,
    correction: Correction,
    reference: Option<Arc<Vec<f64>>>,
) -> Option<SampleTransform> {
    if baseline.is_none() && !correction.needs_reference() {
        return None;
    }
    Some(Arc::new(move |sample: &Sample| {
        let subtracted = match &baseline {
            Some(b) => subtract_baseline(&sample.payload, b),
            None => sample.payload.clone(),
        };
        let corrected = correction.apply(&subtracted, reference.as_deref().map(Vec::as_slice));
        sample.with_payload(corrected)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmission_and_absorbance() {
        let signal = [50.0, 100.0, 0.0];
        let reference = [100.0, 100.0, 100.0];
        assert_eq!(
            Correction::Transmission.apply(&signal, Some(&reference)),
            vec![0.5, 1.0, 0.0]
        );
        let absorbance = Correction::Absorbance.apply(&signal, Some(&reference));
        assert!((absorbance[0] - 0.30103).abs() < 1e-5);
        assert!(absorbance[1].abs() < 1e-12);
        // zero signal clamps to the minimum ratio
        assert!((absorbance[2] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn mismatched_reference_leaves_signal_alone() {
        let signal = [1.0, 2.0];
        assert_eq!(Correction::Absorbance.apply(&signal, Some(&[1.0])), signal);
        assert_eq!(Correction::Transmission.apply(&signal, None), signal);
    }

    #[test]
    fn transform_subtracts_then_corrects() {
        let transform = spectrum_transform(
            Some(Arc::new(vec![10.0, 10.0])),
            Correction::Transmission,
            Some(Arc::new(vec![20.0, 40.0])),
        )
        .unwrap();
        let sample = Sample::new("spectrometer", vec![30.0, 30.0]);
        let out = transform(&sample);
        assert_eq!(out.payload, vec![1.0, 0.5]);
        assert_eq!(out.timestamp, sample.timestamp);
    }

    #[test]
    fn no_transform_without_baseline_or_correction() {
        assert!(spectrum_transform(None, Correction::None, None).is_none());
    }
}
