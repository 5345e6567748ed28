//! Reference waveform construction and the wave-shape gate.
//!
//! The reference is the average of the physiological channel itself around its own
//! events. If that average is not wave-shaped, no channel ranking is attempted for
//! the artifact kind.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::average::ArtifactAverage;
use crate::{ArtifactKind, ArtifactParams, TimeAxis};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceSource {
    Recorded,
    Reconstructed,
}

impl ReferenceSource {
    pub fn label(&self) -> &'static str {
        match self {
            ReferenceSource::Recorded => "RECORDED",
            ReferenceSource::Reconstructed => "RECONSTRUCTED",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReferenceWaveform {
    pub source: ReferenceSource,
    pub channel: String,
    pub average: ArtifactAverage,
    pub events_used: usize,
    pub events_skipped: usize,
}

impl ReferenceWaveform {
    pub fn samples(&self) -> &Array1<f64> {
        &self.average.original.samples
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReferenceOutcome {
    Ready {
        waveform: ReferenceWaveform,
        status: String,
    },
    Aborted {
        waveform: Option<ReferenceWaveform>,
        status: String,
    },
}

impl ReferenceOutcome {
    pub fn status(&self) -> &str {
        match self {
            ReferenceOutcome::Ready { status, .. } | ReferenceOutcome::Aborted { status, .. } => {
                status
            }
        }
    }

    pub fn waveform(&self) -> Option<&ReferenceWaveform> {
        match self {
            ReferenceOutcome::Ready { waveform, .. } => Some(waveform),
            ReferenceOutcome::Aborted { waveform, .. } => waveform.as_ref(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ReferenceOutcome::Ready { .. })
    }
}

/// Sample-wise mean of the windows around `events`. Events whose window would
/// leave the signal are skipped. Returns the mean (if any window fit) and the
/// number of skipped events.
pub fn mean_event_waveform(
    samples: &[f64],
    events: &[usize],
    axis: &TimeAxis,
) -> (Option<Array1<f64>>, usize) {
    let len = axis.len();
    let offset = axis.start_offset();
    let mut sum = Array1::<f64>::zeros(len);
    let mut used = 0usize;
    let mut skipped = 0usize;
    for &event in events {
        let start = event as i64 + offset;
        if start < 0 || start as usize + len > samples.len() {
            skipped += 1;
            continue;
        }
        let start = start as usize;
        for (acc, v) in sum.iter_mut().zip(&samples[start..start + len]) {
            *acc += v;
        }
        used += 1;
    }
    if used == 0 {
        return (None, skipped);
    }
    sum /= used as f64;
    (Some(sum), skipped)
}

/// Build the reference waveform and decide whether it is wave-shaped.
pub fn build_and_gate(
    kind: ArtifactKind,
    channel: &str,
    samples: &[f64],
    events: &[usize],
    axis: &TimeAxis,
    params: &ArtifactParams,
    source: ReferenceSource,
) -> ReferenceOutcome {
    let (mean, skipped) = mean_event_waveform(samples, events, axis);
    if skipped > 0 {
        debug!(channel, skipped, "events too close to the recording edge");
    }
    let Some(mean) = mean else {
        let status = format!(
            "No {kind} events could be averaged on the {} channel, the artifact shape could not be verified.",
            source.label().to_ascii_lowercase()
        );
        warn!("{status}");
        return ReferenceOutcome::Aborted {
            waveform: None,
            status,
        };
    };

    let average = ArtifactAverage::new(format!("Mean_{}_{}", kind.label(), channel), mean)
        .classified(params.prominence_divisor, params.max_peaks_average);
    let n_peaks = average
        .original
        .peaks
        .as_ref()
        .map_or(0, |p| p.count());
    let waveform = ReferenceWaveform {
        source,
        channel: channel.to_string(),
        events_used: events.len() - skipped,
        events_skipped: skipped,
        average,
    };

    if waveform.average.is_wave_shaped() {
        let status = format!(
            "Mean event of the {} {kind} channel has the expected shape ({n_peaks} peak(s), up to {} allowed).",
            source.label(),
            params.max_peaks_average
        );
        info!("{status}");
        ReferenceOutcome::Ready { waveform, status }
    } else {
        let status = format!(
            "Mean event of the {} {kind} channel does not have the expected shape ({n_peaks} peak(s), expected 1-{}). Affected channels were not estimated.",
            source.label(),
            params.max_peaks_average
        );
        warn!("{status}");
        ReferenceOutcome::Aborted {
            waveform: Some(waveform),
            status,
        }
    }
}
