//! Averaged artifact epochs and the peak/wave classifier.
//!
//! An [`ArtifactAverage`] is built once per channel and handed from stage to stage:
//! smoothing and classification consume and return it, alignment flips it in place,
//! and the affectedness strategies record their verdicts on it.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::peaks::{argmax_abs, find_bipolar_peaks};
use crate::smooth::gaussian_smooth;
use crate::{QcError, TimeAxis};

/// Peaks found on one waveform and the wave-shape verdict derived from them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PeakSummary {
    /// Positive peaks first, then negative peaks.
    pub locations: Vec<usize>,
    pub magnitudes: Vec<f64>,
    pub wave_shaped: bool,
    /// No peak passed the prominence test; `locations` holds the single
    /// absolute-maximum sample instead.
    pub fallback: bool,
}

impl PeakSummary {
    /// Find peaks of both polarities with prominence `range / prominence_divisor`
    /// and call the waveform wave-shaped when `1..=max_peaks` of them exist.
    pub fn classify(samples: &[f64], prominence_divisor: f64, max_peaks: usize) -> Self {
        let peaks = find_bipolar_peaks(samples, prominence_divisor);
        if peaks.is_empty() {
            let (locations, magnitudes) = match argmax_abs(samples) {
                Some(i) => (vec![i], vec![samples[i]]),
                None => (Vec::new(), Vec::new()),
            };
            return Self {
                locations,
                magnitudes,
                wave_shaped: false,
                fallback: true,
            };
        }
        let locations = peaks.locations();
        let magnitudes = locations.iter().map(|&i| samples[i]).collect();
        let count = locations.len();
        Self {
            locations,
            magnitudes,
            wave_shaped: (1..=max_peaks).contains(&count),
            fallback: false,
        }
    }

    /// Number of detected peaks (zero when only the fallback sample is present).
    pub fn count(&self) -> usize {
        if self.fallback {
            0
        } else {
            self.locations.len()
        }
    }

    /// Location and magnitude of the peak with the largest signed magnitude.
    pub fn strongest(&self) -> Option<(usize, f64)> {
        self.locations
            .iter()
            .zip(self.magnitudes.iter())
            .fold(None, |best: Option<(usize, f64)>, (&loc, &mag)| match best {
                Some((_, m)) if mag <= m => best,
                _ => Some((loc, mag)),
            })
    }

    /// Peak location nearest to `index` (earliest listed wins on ties).
    pub fn closest_to(&self, index: usize) -> Option<usize> {
        self.locations
            .iter()
            .copied()
            .min_by_key(|&loc| loc.abs_diff(index))
    }

    fn negate(&mut self) {
        for m in self.magnitudes.iter_mut() {
            *m = -*m;
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DominantPeak {
    pub location: usize,
    pub magnitude: f64,
}

/// One rendition (original or smoothed) of an averaged waveform.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WaveVariant {
    pub samples: Array1<f64>,
    pub peaks: Option<PeakSummary>,
    pub dominant: Option<DominantPeak>,
    pub above_threshold: Option<bool>,
}

impl WaveVariant {
    pub fn new(samples: Array1<f64>) -> Self {
        Self {
            samples,
            peaks: None,
            dominant: None,
            above_threshold: None,
        }
    }

    pub fn classify(&mut self, prominence_divisor: f64, max_peaks: usize) {
        let samples = self.samples.to_vec();
        self.peaks = Some(PeakSummary::classify(
            &samples,
            prominence_divisor,
            max_peaks,
        ));
    }

    pub fn is_wave_shaped(&self) -> bool {
        self.peaks.as_ref().map_or(false, |p| p.wave_shaped)
    }

    /// Highest (signed) peak whose time lies strictly inside `(lo, hi)`.
    pub fn dominant_in(&self, axis: &TimeAxis, lo: f64, hi: f64) -> Option<DominantPeak> {
        let peaks = self.peaks.as_ref()?;
        peaks
            .locations
            .iter()
            .filter(|&&loc| {
                let t = axis.time(loc);
                lo < t && t < hi
            })
            .map(|&loc| DominantPeak {
                location: loc,
                magnitude: self.samples[loc],
            })
            .fold(None, |best: Option<DominantPeak>, cand| match best {
                Some(b) if cand.magnitude <= b.magnitude => best,
                _ => Some(cand),
            })
    }

    /// Affected when wave-shaped and the dominant peak inside `(lo, hi)` exceeds
    /// `|threshold|`. Records the dominant peak and the verdict.
    pub fn evaluate_threshold(&mut self, threshold: f64, axis: &TimeAxis, lo: f64, hi: f64) -> bool {
        self.dominant = self.dominant_in(axis, lo, hi);
        let over = match self.dominant {
            Some(peak) => peak.magnitude > threshold.abs() && self.is_wave_shaped(),
            None => false,
        };
        self.above_threshold = Some(over);
        over
    }

    pub fn flip(&mut self) {
        self.samples.mapv_inplace(|v| -v);
        if let Some(peaks) = self.peaks.as_mut() {
            peaks.negate();
        }
        if let Some(dominant) = self.dominant.as_mut() {
            dominant.magnitude = -dominant.magnitude;
        }
    }
}

/// Cosmetic grouping used by the report layer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lobe {
    pub label: String,
    pub color: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Correlation {
    pub coefficient: f64,
    pub p_value: f64,
}

/// Mean artifact epoch of one channel (or of a group of channels).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ArtifactAverage {
    pub name: String,
    pub original: WaveVariant,
    pub smoothed: Option<WaveVariant>,
    pub correlation: Option<Correlation>,
    pub lobe: Option<Lobe>,
}

impl ArtifactAverage {
    pub fn new(name: impl Into<String>, samples: Array1<f64>) -> Self {
        Self {
            name: name.into(),
            original: WaveVariant::new(samples),
            smoothed: None,
            correlation: None,
            lobe: None,
        }
    }

    /// Average an `events x samples` epoch matrix.
    pub fn from_epochs(name: impl Into<String>, epochs: &Array2<f64>) -> Result<Self, QcError> {
        let name = name.into();
        let mean = epochs.mean_axis(Axis(0)).ok_or_else(|| {
            QcError::InsufficientData(format!("no epochs to average for {name}"))
        })?;
        Ok(Self::new(name, mean))
    }

    /// Sample-wise mean of the original waveforms of `members`.
    pub fn grand_mean(name: impl Into<String>, members: &[ArtifactAverage]) -> Result<Self, QcError> {
        let name = name.into();
        let first = members.first().ok_or_else(|| {
            QcError::InsufficientData(format!("no channels to average for {name}"))
        })?;
        let len = first.len();
        let mut sum = Array1::<f64>::zeros(len);
        for member in members {
            if member.len() != len {
                return Err(QcError::ShapeMismatch {
                    expected: len,
                    found: member.len(),
                });
            }
            sum += &member.original.samples;
        }
        sum /= members.len() as f64;
        Ok(Self::new(name, sum))
    }

    pub fn len(&self) -> usize {
        self.original.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original.samples.is_empty()
    }

    /// Attach the Gaussian-smoothed variant unless it already exists.
    pub fn smoothed(mut self, sigma: f64) -> Self {
        if self.smoothed.is_none() {
            let samples = gaussian_smooth(&self.original.samples, sigma);
            self.smoothed = Some(WaveVariant::new(samples));
        }
        self
    }

    /// Run the peak/wave classifier on every variant present.
    pub fn classified(mut self, prominence_divisor: f64, max_peaks: usize) -> Self {
        self.original.classify(prominence_divisor, max_peaks);
        if let Some(smoothed) = self.smoothed.as_mut() {
            smoothed.classify(prominence_divisor, max_peaks);
        }
        self
    }

    pub fn with_lobe(mut self, lobe: Option<Lobe>) -> Self {
        self.lobe = lobe;
        self
    }

    pub fn is_wave_shaped(&self) -> bool {
        self.original.is_wave_shaped()
    }

    pub fn is_wave_shaped_smoothed(&self) -> Option<bool> {
        self.smoothed.as_ref().map(WaveVariant::is_wave_shaped)
    }

    /// Smoothed samples when available, original samples otherwise.
    pub fn smoothed_or_original(&self) -> &Array1<f64> {
        self.smoothed
            .as_ref()
            .map_or(&self.original.samples, |s| &s.samples)
    }

    /// Negate samples and peak magnitudes of every variant.
    pub fn flip(&mut self) {
        self.original.flip();
        if let Some(smoothed) = self.smoothed.as_mut() {
            smoothed.flip();
        }
    }

    /// Absolute correlation, or 0 when not computed.
    pub fn abs_correlation(&self) -> f64 {
        self.correlation.map_or(0.0, |c| c.coefficient.abs())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Sum of Gaussian bumps `(center, width, amplitude)` over `n` samples.
    pub(crate) fn bumps(n: usize, shape: &[(f64, f64, f64)]) -> Array1<f64> {
        Array1::from_iter((0..n).map(|i| {
            shape.iter()
                .map(|&(c, w, a)| {
                    let x = (i as f64 - c) / w;
                    a * (-0.5 * x * x).exp()
                })
                .sum()
        }))
    }

    #[test]
    fn single_bump_is_wave_shaped_with_one_peak() {
        for (center, amp) in [(20.0, 1.0), (40.0, 5.0), (60.0, 0.3)] {
            let x = bumps(81, &[(center, 3.0, amp)]);
            let summary = PeakSummary::classify(&x.to_vec(), 5.0, 3);
            assert!(summary.wave_shaped);
            assert_eq!(summary.locations, vec![center as usize]);
            assert_abs_diff_eq!(summary.magnitudes[0], amp, epsilon = 1e-9);
        }
    }

    #[test]
    fn many_peaks_are_not_wave_shaped() {
        let x = Array1::from_iter((0..200).map(|i| (i as f64 * 0.5).sin()));
        let summary = PeakSummary::classify(&x.to_vec(), 5.0, 4);
        assert!(summary.count() > 4);
        assert!(!summary.wave_shaped);
    }

    #[test]
    fn flat_signal_falls_back_to_absolute_maximum() {
        let mut x = vec![0.0; 10];
        x[0] = -2.0;
        let summary = PeakSummary::classify(&x, 5.0, 3);
        assert!(summary.fallback);
        assert!(!summary.wave_shaped);
        assert_eq!(summary.locations, vec![0]);
        assert_eq!(summary.magnitudes, vec![-2.0]);
        assert_eq!(summary.count(), 0);
    }

    #[test]
    fn positive_and_negative_peaks_are_combined() {
        let x = bumps(81, &[(30.0, 3.0, 1.0), (50.0, 3.0, -1.0)]);
        let summary = PeakSummary::classify(&x.to_vec(), 5.0, 3);
        assert_eq!(summary.locations, vec![30, 50]);
        assert!(summary.wave_shaped);
        assert_eq!(summary.strongest().map(|(l, _)| l), Some(30));
        assert_eq!(summary.closest_to(45), Some(50));
    }

    #[test]
    fn flip_twice_is_identity() {
        let x = bumps(81, &[(30.0, 3.0, 1.0), (50.0, 3.0, -0.5)]);
        let avg = ArtifactAverage::new("MEG0111", x)
            .smoothed(2.0)
            .classified(5.0, 3);
        let mut flipped = avg.clone();
        flipped.flip();
        assert_abs_diff_eq!(
            flipped.original.samples[30],
            -avg.original.samples[30],
            epsilon = 1e-12
        );
        flipped.flip();
        assert_eq!(flipped, avg);
    }

    #[test]
    fn dominant_peak_respects_window() {
        let axis = TimeAxis::new(-0.04, 0.04, 1000.0).unwrap();
        let x = bumps(81, &[(20.0, 3.0, 3.0), (42.0, 3.0, 1.0)]);
        let mut avg = ArtifactAverage::new("MEG0111", x).classified(5.0, 3);
        let peak = avg.original.dominant_in(&axis, -0.01, 0.01).unwrap();
        assert_eq!(peak.location, 42);
        let whole = avg.original.dominant_in(&axis, -0.04, 0.04).unwrap();
        assert_eq!(whole.location, 20);
        assert!(avg.original.evaluate_threshold(0.5, &axis, -0.01, 0.01));
        assert!(!avg.original.evaluate_threshold(1.5, &axis, -0.01, 0.01));
    }

    #[test]
    fn averages_epochs_and_channels() {
        let epochs = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 3.0, 4.0, 5.0]).unwrap();
        let avg = ArtifactAverage::from_epochs("MEG0111", &epochs).unwrap();
        assert_eq!(avg.original.samples.to_vec(), vec![2.0, 3.0, 4.0]);

        let other = ArtifactAverage::new("MEG0121", Array1::from(vec![0.0, 1.0, 2.0]));
        let mean = ArtifactAverage::grand_mean("mean", &[avg, other]).unwrap();
        assert_eq!(mean.original.samples.to_vec(), vec![1.0, 2.0, 3.0]);

        let empty = Array2::<f64>::zeros((0, 3));
        assert!(ArtifactAverage::from_epochs("x", &empty).is_err());
    }

    #[test]
    fn grand_mean_rejects_mismatched_lengths() {
        let a = ArtifactAverage::new("a", Array1::zeros(5));
        let b = ArtifactAverage::new("b", Array1::zeros(6));
        assert!(matches!(
            ArtifactAverage::grand_mean("mean", &[a, b]),
            Err(QcError::ShapeMismatch { expected: 5, found: 6 })
        ));
    }
}
