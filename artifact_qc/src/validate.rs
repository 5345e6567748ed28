//! Reference-channel validation.
//!
//! A recorded ECG/EOG channel is trusted only if its events have similar
//! amplitudes and occur neither too rarely (breaks) nor too often (bursts).

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::peaks::{find_peaks, PeakOptions};
use crate::{ArtifactKind, ArtifactParams, QcError};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelVerdict {
    Good,
    Bad,
}

impl ChannelVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelVerdict::Good => "good",
            ChannelVerdict::Bad => "bad",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub channel: String,
    pub verdict: ChannelVerdict,
    /// Event peaks, reused as the event list for the reference waveform.
    pub peaks: Vec<usize>,
    pub similar_amplitudes: bool,
    pub no_breaks: bool,
    pub no_bursts: bool,
    pub amplitude_std: f64,
    pub n_breaks: usize,
    pub n_bursts: usize,
}

impl ValidationReport {
    pub fn is_good(&self) -> bool {
        self.verdict == ChannelVerdict::Good
    }

    /// One-line description used verbatim in the report.
    pub fn describe(&self) -> String {
        format!(
            "{} is {}: 1) peaks have similar amplitude: {}, 2) tolerable number of breaks: {}, 3) tolerable number of bursts: {}",
            self.channel,
            self.verdict.as_str(),
            self.similar_amplitudes,
            self.no_breaks,
            self.no_bursts
        )
    }
}

/// Event peaks of a physiological channel: height above `mean + k * std` and at
/// least `min_spacing_s` apart.
pub fn detect_events(
    samples: &[f64],
    sfreq: f64,
    height_multiplier: f64,
    min_spacing_s: f64,
) -> Vec<usize> {
    if samples.is_empty() {
        return Vec::new();
    }
    let (mean, std) = mean_std(samples);
    let opts = PeakOptions {
        height: Some(mean + height_multiplier * std),
        distance: Some((min_spacing_s * sfreq).round().max(1.0) as usize),
        prominence: None,
    };
    find_peaks(samples, &opts)
}

/// Judge a recorded reference channel.
pub fn validate_channel(
    channel: &str,
    samples: &[f64],
    sfreq: f64,
    kind: ArtifactKind,
    params: &ArtifactParams,
) -> Result<ValidationReport, QcError> {
    if !(sfreq > 0.0) {
        return Err(QcError::InvalidParameter(format!(
            "sampling frequency must be positive, got {sfreq}"
        )));
    }
    if samples.len() < 3 {
        return Err(QcError::InsufficientData(format!(
            "{channel} has only {} samples",
            samples.len()
        )));
    }

    let peaks = detect_events(
        samples,
        sfreq,
        params.height_multiplier,
        params.min_event_spacing_s,
    );

    let amplitude_std = normalized_peak_std(samples, &peaks);
    let similar_amplitudes = amplitude_std <= params.allowed_peak_amplitude_std;

    let (burst_below, break_above) = kind.interval_bounds();
    let intervals: Vec<f64> = peaks
        .windows(2)
        .map(|w| (w[1] - w[0]) as f64 / sfreq)
        .collect();
    let n_breaks = intervals.iter().filter(|&&d| d > break_above).count();
    let n_bursts = intervals.iter().filter(|&&d| d < burst_below).count();

    let minutes = samples.len() as f64 / sfreq / 60.0;
    let allowed = params.breaks_bursts_allowed_per_10min;
    let no_breaks = per_10min(n_breaks, minutes) <= allowed;
    let no_bursts = per_10min(n_bursts, minutes) <= allowed;

    let verdict = if similar_amplitudes && no_breaks && no_bursts {
        ChannelVerdict::Good
    } else {
        ChannelVerdict::Bad
    };

    debug!(
        channel,
        events = peaks.len(),
        amplitude_std,
        n_breaks,
        n_bursts,
        "reference channel conditions"
    );
    info!(
        "{} channel {} judged {} (similar amplitudes: {}, no breaks: {}, no bursts: {})",
        kind,
        channel,
        verdict.as_str(),
        similar_amplitudes,
        no_breaks,
        no_bursts
    );

    Ok(ValidationReport {
        channel: channel.to_string(),
        verdict,
        peaks,
        similar_amplitudes,
        no_breaks,
        no_bursts,
        amplitude_std,
        n_breaks,
        n_bursts,
    })
}

fn per_10min(count: usize, minutes: f64) -> f64 {
    if count == 0 {
        0.0
    } else {
        count as f64 / minutes * 10.0
    }
}

/// Std of peak heights after min-max scaling the channel to `[0, 1]`.
fn normalized_peak_std(samples: &[f64], peaks: &[usize]) -> f64 {
    if peaks.is_empty() {
        return 0.0;
    }
    let lo = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = hi - lo;
    if !(span > 0.0) {
        return 0.0;
    }
    let scaled: Vec<f64> = peaks.iter().map(|&p| (samples[p] - lo) / span).collect();
    mean_std(&scaled).1
}

/// Population mean and standard deviation.
pub(crate) fn mean_std(x: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Flat signal with unit spikes (3 samples wide) at the given sample indices.
    pub(crate) fn spike_train(len: usize, events: &[usize]) -> Vec<f64> {
        let mut x = vec![0.0; len];
        for &e in events {
            if e >= 1 && e + 1 < len {
                x[e - 1] = 0.3;
                x[e] = 1.0;
                x[e + 1] = 0.3;
            }
        }
        x
    }

    fn regular_events(sfreq: f64, seconds: f64, period_s: f64) -> Vec<usize> {
        let step = (period_s * sfreq) as usize;
        let len = (seconds * sfreq) as usize;
        (step..len - step).step_by(step).collect()
    }

    #[test]
    fn regular_heartbeat_is_good() {
        let sfreq = 100.0;
        let events = regular_events(sfreq, 60.0, 1.0);
        let x = spike_train(6000, &events);
        let params = ArtifactParams::for_kind(ArtifactKind::Ecg);
        let report = validate_channel("ECG063", &x, sfreq, ArtifactKind::Ecg, &params).unwrap();
        assert_eq!(report.peaks, events);
        assert!(report.similar_amplitudes);
        assert!(report.no_breaks);
        assert!(report.no_bursts);
        assert!(report.is_good());
    }

    #[test]
    fn long_pause_is_a_break() {
        let sfreq = 100.0;
        let mut events = Vec::new();
        let mut t = 100;
        while t < 5900 {
            events.push(t);
            // One 5 s interval in the middle of the recording.
            t += if events.len() == 20 { 500 } else { 100 };
        }
        let x = spike_train(6000, &events);
        let params = ArtifactParams::for_kind(ArtifactKind::Ecg);
        let report = validate_channel("ECG063", &x, sfreq, ArtifactKind::Ecg, &params).unwrap();
        assert_eq!(report.n_breaks, 1);
        assert!(!report.no_breaks);
        assert!(report.no_bursts);
        assert_eq!(report.verdict, ChannelVerdict::Bad);
        assert!(report.describe().contains("tolerable number of breaks: false"));
    }

    #[test]
    fn breaks_within_allowance_are_tolerated() {
        let sfreq = 100.0;
        let mut events = Vec::new();
        let mut t = 100;
        // 20 minutes with a single 5 s pause: 0.5 breaks per 10 min.
        while t < 120_000 - 100 {
            events.push(t);
            t += if events.len() == 50 { 500 } else { 100 };
        }
        let x = spike_train(120_000, &events);
        let params = ArtifactParams::for_kind(ArtifactKind::Ecg);
        let report = validate_channel("ECG063", &x, sfreq, ArtifactKind::Ecg, &params).unwrap();
        assert_eq!(report.n_breaks, 1);
        assert!(report.no_breaks);
    }

    #[test]
    fn unequal_heights_fail_amplitude_check() {
        let sfreq = 100.0;
        let events = regular_events(sfreq, 60.0, 1.0);
        let mut x = spike_train(6000, &events);
        for (i, &e) in events.iter().enumerate() {
            if i % 2 == 0 {
                x[e] = 3.0;
            }
        }
        let params = ArtifactParams::for_kind(ArtifactKind::Ecg);
        let report = validate_channel("ECG063", &x, sfreq, ArtifactKind::Ecg, &params).unwrap();
        assert!(!report.similar_amplitudes);
        assert!(!report.is_good());
    }

    #[test]
    fn ocular_bounds_accept_slow_blinks() {
        let sfreq = 100.0;
        let events = regular_events(sfreq, 120.0, 4.0);
        let x = spike_train(12_000, &events);
        let params = ArtifactParams::for_kind(ArtifactKind::Eog);
        let report = validate_channel("EOG061", &x, sfreq, ArtifactKind::Eog, &params).unwrap();
        assert!(report.is_good());

        let ecg = ArtifactParams::for_kind(ArtifactKind::Ecg);
        let as_ecg = validate_channel("EOG061", &x, sfreq, ArtifactKind::Ecg, &ecg).unwrap();
        assert!(!as_ecg.no_breaks);
    }

    #[test]
    fn too_short_channel_is_an_error() {
        let params = ArtifactParams::default();
        assert!(validate_channel("ECG", &[1.0], 100.0, ArtifactKind::Ecg, &params).is_err());
    }
}
