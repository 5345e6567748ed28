//! Temporal alignment of averaged artifact epochs.
//!
//! Two problems live here: estimating a shared t0 across sensor channels and
//! flipping channels whose artifact shows up with negative polarity (used by the
//! threshold strategy), and generating time-shifted copies of the reference
//! waveform so that one of its peaks lands on the sensor-side t0 (used by the
//! correlation strategy, which then picks the best candidate).

use ndarray::Array1;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::average::ArtifactAverage;
use crate::peaks::{argmax_abs, find_bipolar_peaks};
use crate::{ArtifactParams, TimeAxis};

/// Cross-channel t0 and the acceptance window around it, in seconds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct T0Estimate {
    pub index: usize,
    pub time: f64,
    pub window_start: f64,
    pub window_end: f64,
}

impl T0Estimate {
    pub fn contains(&self, t: f64) -> bool {
        self.window_start < t && t < self.window_end
    }
}

/// Average the sample index of the largest |amplitude| inside the plausible-peak
/// window over the `t0_top_channels` channels with the largest such amplitude.
pub fn estimate_t0(
    channels: &[ArtifactAverage],
    axis: &TimeAxis,
    params: &ArtifactParams,
) -> Option<T0Estimate> {
    let window = axis.indices_within(params.peak_window_min, params.peak_window_max);
    if window.is_empty() {
        return None;
    }

    let mut maxima: Vec<(usize, f64)> = channels
        .iter()
        .filter_map(|ch| {
            let samples = ch.original.samples.as_slice()?;
            let slice = samples.get(window.clone())?;
            let local = argmax_abs(slice)?;
            Some((window.start + local, slice[local].abs()))
        })
        .collect();
    if maxima.is_empty() {
        return None;
    }
    maxima.sort_by_key(|&(_, amp)| std::cmp::Reverse(OrderedFloat(amp)));
    maxima.truncate(params.t0_top_channels);

    let mean_index =
        maxima.iter().map(|&(i, _)| i as f64).sum::<f64>() / maxima.len() as f64;
    let index = mean_index.round() as usize;
    let time = axis.time(index);
    let half = params.threshold_window_half_width;
    Some(T0Estimate {
        index,
        time,
        window_start: time - half,
        window_end: time + half,
    })
}

/// Flip every channel whose peak nearest to the estimated t0 is negative and lies
/// inside the acceptance window. Channels must already be classified.
///
/// Returns the estimate used and the number of flipped channels.
pub fn flip_channels(
    channels: &mut [ArtifactAverage],
    axis: &TimeAxis,
    params: &ArtifactParams,
) -> Option<(T0Estimate, usize)> {
    let t0 = estimate_t0(channels, axis, params)?;
    let mut flipped = 0;
    for ch in channels.iter_mut() {
        let Some(peaks) = ch.original.peaks.as_ref() else {
            continue;
        };
        let Some(closest) = peaks.closest_to(t0.index) else {
            continue;
        };
        if ch.original.samples[closest] < 0.0 && t0.contains(axis.time(closest)) {
            ch.flip();
            flipped += 1;
        }
    }
    debug!(
        t0 = t0.time,
        flipped,
        total = channels.len(),
        "aligned channel polarity"
    );
    Some((t0, flipped))
}

/// Index of the peak with the largest absolute magnitude, of either polarity.
pub fn find_t0_highest(samples: &[f64], prominence_divisor: f64) -> Option<usize> {
    let peaks = find_bipolar_peaks(samples, prominence_divisor);
    peaks
        .locations()
        .into_iter()
        .max_by_key(|&i| OrderedFloat(samples[i].abs()))
}

/// Sensor-side t0: the mean peak index of the strongest channels when their peaks
/// cluster, otherwise the peak index of the single strongest channel.
pub fn find_t0_channels(
    channels: &[ArtifactAverage],
    axis: &TimeAxis,
    params: &ArtifactParams,
) -> Option<usize> {
    let mut highest: Vec<(usize, f64)> = channels
        .iter()
        .filter_map(|ch| {
            let samples = ch.smoothed_or_original().to_vec();
            let i = find_t0_highest(&samples, params.reference_prominence_divisor)?;
            Some((i, samples[i].abs()))
        })
        .collect();
    // Stable: equal magnitudes keep channel order.
    highest.sort_by_key(|&(_, m)| std::cmp::Reverse(OrderedFloat(m)));
    highest.truncate(params.reference_top_channels);
    let &(strongest, _) = highest.first()?;

    let times: Vec<f64> = highest.iter().map(|&(i, _)| axis.time(i)).collect();
    let spread = times.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        - times.iter().copied().fold(f64::INFINITY, f64::min);
    if spread < params.t0_cluster_tolerance_s {
        let mean = highest.iter().map(|&(i, _)| i as f64).sum::<f64>() / highest.len() as f64;
        Some(mean as usize)
    } else {
        debug!(spread, "channel peaks do not cluster, using the strongest one");
        Some(strongest)
    }
}

/// Every plausible peak of the reference waveform, ascending. Falls back to the
/// absolute maximum when nothing passes the prominence test.
pub fn find_t0_mean(samples: &[f64], prominence_divisor: f64) -> Vec<usize> {
    let mut locations = find_bipolar_peaks(samples, prominence_divisor).locations();
    locations.sort_unstable();
    if locations.is_empty() {
        locations.extend(argmax_abs(samples));
    }
    locations
}

/// Rotate `samples` right by `shift` (negative rotates left).
pub fn shift_circular(samples: &Array1<f64>, shift: i64) -> Array1<f64> {
    let n = samples.len();
    if n == 0 {
        return samples.clone();
    }
    let k = shift.rem_euclid(n as i64) as usize;
    Array1::from_iter((0..n).map(|i| samples[(i + n - k) % n]))
}

/// One shifted copy of the reference waveform.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AlignmentCandidate {
    /// Reference peak that was moved onto the sensor-side t0.
    pub reference_peak: usize,
    pub shift: i64,
    pub samples: Array1<f64>,
}

/// Shifted reference candidates, one per reference peak. Without a sensor-side
/// t0 the unshifted reference is the only candidate.
pub fn reference_candidates(
    reference: &Array1<f64>,
    channels: &[ArtifactAverage],
    axis: &TimeAxis,
    params: &ArtifactParams,
) -> Vec<AlignmentCandidate> {
    let reference_peaks = find_t0_mean(&reference.to_vec(), params.reference_prominence_divisor);
    let Some(t0_channels) = find_t0_channels(channels, axis, params) else {
        return vec![AlignmentCandidate {
            reference_peak: reference_peaks.first().copied().unwrap_or(0),
            shift: 0,
            samples: reference.clone(),
        }];
    };
    debug!(
        t0 = axis.time(t0_channels),
        candidates = reference_peaks.len(),
        "reference alignment candidates"
    );
    reference_peaks
        .into_iter()
        .map(|peak| {
            let shift = t0_channels as i64 - peak as i64;
            AlignmentCandidate {
                reference_peak: peak,
                shift,
                samples: shift_circular(reference, shift),
            }
        })
        .collect()
}
