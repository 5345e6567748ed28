//! Cardiac/ocular artifact quality control for multichannel MEG recordings.
//!
//! The crate judges whether a recorded ECG/EOG channel can be trusted, builds the
//! canonical averaged artifact waveform, and ranks sensor channels by how strongly
//! that artifact contaminates them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod align;
pub mod average;
pub mod classify;
pub mod peaks;
pub mod pipeline;
pub mod recording;
pub mod reference;
pub mod smooth;
pub mod validate;

pub use average::{ArtifactAverage, Lobe, PeakSummary, WaveVariant};
pub use classify::{
    AffectednessClassifier, CorrelationClassifier, CorrelationRanking, Outcome, RankedResult,
    ThresholdClassifier, ThresholdRanking, ThresholdSplit, Tier,
};
pub use pipeline::{
    run_all, run_artifact, ArtifactReport, ArtifactSummary, ChannelValue, ModalitySummary,
};
pub use recording::{
    ChannelEpochs, InMemoryRecording, Recording, ReconstructedReference, SignalChannel,
};
pub use reference::{ReferenceOutcome, ReferenceSource, ReferenceWaveform};
pub use validate::{ChannelVerdict, ValidationReport};

#[derive(Error, Debug)]
pub enum QcError {
    #[error("waveform length mismatch: expected {expected} samples, found {found}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("unknown artifact kind: {0}")]
    UnknownArtifactKind(String),
    #[error("unknown classification method: {0}")]
    UnknownMethod(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("epoching failed: {0}")]
    Epoching(String),
}

/// Physiological artifact being analysed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Ecg,
    Eog,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Ecg, ArtifactKind::Eog];

    pub fn label(&self) -> &'static str {
        match self {
            ArtifactKind::Ecg => "ECG",
            ArtifactKind::Eog => "EOG",
        }
    }

    /// Physiologically plausible spacing between consecutive events, in seconds:
    /// `(burst_below, break_above)`.
    pub fn interval_bounds(&self) -> (f64, f64) {
        match self {
            // 100..40 bpm
            ArtifactKind::Ecg => (0.6, 1.6),
            // 60..6 blinks per minute
            ArtifactKind::Eog => (1.0, 10.0),
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ArtifactKind {
    type Err = QcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ecg" => Ok(ArtifactKind::Ecg),
            "eog" => Ok(ArtifactKind::Eog),
            _ => Err(QcError::UnknownArtifactKind(s.to_string())),
        }
    }
}

/// Sensor modality. Each modality is ranked independently.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Mag,
    Grad,
}

impl SensorType {
    pub const ALL: [SensorType; 2] = [SensorType::Mag, SensorType::Grad];

    pub fn title(&self) -> &'static str {
        match self {
            SensorType::Mag => "Magnetometers",
            SensorType::Grad => "Gradiometers",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorType::Mag => "Tesla",
            SensorType::Grad => "Tesla/m",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorType::Mag => f.write_str("mag"),
            SensorType::Grad => f.write_str("grad"),
        }
    }
}

impl FromStr for SensorType {
    type Err = QcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mag" | "mags" => Ok(SensorType::Mag),
            "grad" | "grads" => Ok(SensorType::Grad),
            _ => Err(QcError::InvalidParameter(format!("unknown sensor type: {s}"))),
        }
    }
}

/// Channel-affectedness method recorded in the summary.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    MeanThreshold,
    Correlation,
    CorrelationReconstructed,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::MeanThreshold => "mean_threshold",
            Method::Correlation => "correlation",
            Method::CorrelationReconstructed => "correlation_reconstructed",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = QcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "mean_threshold" => Ok(Method::MeanThreshold),
            "correlation" => Ok(Method::Correlation),
            "correlation_reconstructed" => Ok(Method::CorrelationReconstructed),
            _ => Err(QcError::UnknownMethod(s.to_string())),
        }
    }
}

/// Which strategy family the orchestrator should use.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyChoice {
    /// Correlation against the recorded or reconstructed reference.
    Auto,
    MeanThreshold,
}

impl Default for StrategyChoice {
    fn default() -> Self {
        StrategyChoice::Auto
    }
}

/// Time axis shared by every averaged epoch of a run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimeAxis {
    pub tmin: f64,
    pub tmax: f64,
    pub sfreq: f64,
}

impl TimeAxis {
    pub fn new(tmin: f64, tmax: f64, sfreq: f64) -> Result<Self, QcError> {
        if !(sfreq > 0.0) {
            return Err(QcError::InvalidParameter(format!(
                "sampling frequency must be positive, got {sfreq}"
            )));
        }
        if !(tmin < tmax) {
            return Err(QcError::InvalidParameter(format!(
                "epoch window must satisfy tmin < tmax, got {tmin}..{tmax}"
            )));
        }
        Ok(Self { tmin, tmax, sfreq })
    }

    pub fn len(&self) -> usize {
        ((self.tmax - self.tmin) * self.sfreq).round() as usize + 1
    }

    /// Time of sample `index`, rounded to the millisecond.
    pub fn time(&self, index: usize) -> f64 {
        round_ms(self.tmin + index as f64 / self.sfreq)
    }

    pub fn times(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.time(i)).collect()
    }

    /// Indices whose time lies strictly inside `(lo, hi)`.
    pub fn indices_within(&self, lo: f64, hi: f64) -> std::ops::Range<usize> {
        let n = self.len();
        let start = (0..n).find(|&i| self.time(i) > lo).unwrap_or(n);
        let end = (start..n).find(|&i| self.time(i) >= hi).unwrap_or(n);
        start..end
    }

    /// Offset of the window start relative to the event sample.
    pub fn start_offset(&self) -> i64 {
        (self.tmin * self.sfreq).round() as i64
    }

    pub fn seconds_to_samples(&self, seconds: f64) -> usize {
        (seconds.abs() * self.sfreq).round() as usize
    }

    pub fn check_len(&self, found: usize) -> Result<(), QcError> {
        let expected = self.len();
        if expected != found {
            return Err(QcError::ShapeMismatch { expected, found });
        }
        Ok(())
    }
}

fn round_ms(t: f64) -> f64 {
    (t * 1000.0).round() / 1000.0
}

/// Parameters for one artifact kind.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArtifactParams {
    pub tmin: f64,
    pub tmax: f64,
    /// Window around the nominal event where the artifact peak is expected (4.4a).
    pub peak_window_min: f64,
    pub peak_window_max: f64,
    /// Half-width of the acceptance window around an estimated t0, seconds.
    pub threshold_window_half_width: f64,
    pub norm_level: f64,
    pub gaussian_sigma: f64,
    pub prominence_divisor: f64,
    pub height_multiplier: f64,
    pub allowed_peak_amplitude_std: f64,
    pub breaks_bursts_allowed_per_10min: f64,
    pub max_peaks_per_100ms: f64,
    pub max_peaks_average: usize,
    pub min_event_spacing_s: f64,
    pub t0_top_channels: usize,
    pub reference_top_channels: usize,
    pub t0_cluster_tolerance_s: f64,
    pub reference_prominence_divisor: f64,
    pub alignment_top_correlations: usize,
}

impl ArtifactParams {
    pub fn for_kind(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::Ecg => Self {
                tmin: -0.04,
                tmax: 0.04,
                peak_window_min: -0.02,
                peak_window_max: 0.012,
                threshold_window_half_width: 0.02,
                norm_level: 1.0,
                gaussian_sigma: 4.0,
                prominence_divisor: 5.0,
                height_multiplier: 0.6,
                allowed_peak_amplitude_std: 0.14,
                breaks_bursts_allowed_per_10min: 3.0,
                max_peaks_per_100ms: 3.0,
                max_peaks_average: 3,
                min_event_spacing_s: 0.5,
                t0_top_channels: 5,
                reference_top_channels: 10,
                t0_cluster_tolerance_s: 0.01,
                reference_prominence_divisor: 8.0,
                alignment_top_correlations: 10,
            },
            ArtifactKind::Eog => Self {
                tmin: -0.2,
                tmax: 0.4,
                peak_window_min: -0.1,
                peak_window_max: 0.2,
                threshold_window_half_width: 0.1,
                norm_level: 1.0,
                gaussian_sigma: 6.0,
                prominence_divisor: 3.0,
                height_multiplier: 1.0,
                allowed_peak_amplitude_std: 0.14,
                breaks_bursts_allowed_per_10min: 3.0,
                max_peaks_per_100ms: 3.0,
                max_peaks_average: 5,
                min_event_spacing_s: 0.5,
                t0_top_channels: 5,
                reference_top_channels: 10,
                t0_cluster_tolerance_s: 0.01,
                reference_prominence_divisor: 8.0,
                alignment_top_correlations: 10,
            },
        }
    }

    pub fn time_axis(&self, sfreq: f64) -> Result<TimeAxis, QcError> {
        TimeAxis::new(self.tmin, self.tmax, sfreq)
    }

    /// Peak budget for a single channel average, scaled by epoch length.
    pub fn max_peaks_channel(&self) -> usize {
        (((self.tmin.abs() + self.tmax.abs()) / 0.1) * self.max_peaks_per_100ms).round() as usize
    }

    pub fn validate(&self) -> Result<(), QcError> {
        let positive = [
            ("norm_level", self.norm_level),
            ("gaussian_sigma", self.gaussian_sigma),
            ("prominence_divisor", self.prominence_divisor),
            ("reference_prominence_divisor", self.reference_prominence_divisor),
            ("breaks_bursts_allowed_per_10min", self.breaks_bursts_allowed_per_10min),
            ("threshold_window_half_width", self.threshold_window_half_width),
            ("min_event_spacing_s", self.min_event_spacing_s),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(QcError::InvalidParameter(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if !(self.tmin < self.tmax) {
            return Err(QcError::InvalidParameter(format!(
                "tmin ({}) must be below tmax ({})",
                self.tmin, self.tmax
            )));
        }
        if !(self.peak_window_min < self.peak_window_max) {
            return Err(QcError::InvalidParameter(
                "peak window must satisfy min < max".into(),
            ));
        }
        if self.max_peaks_average == 0
            || self.t0_top_channels == 0
            || self.reference_top_channels == 0
            || self.alignment_top_correlations == 0
        {
            return Err(QcError::InvalidParameter(
                "peak budgets and top-N counts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ArtifactParams {
    fn default() -> Self {
        Self::for_kind(ArtifactKind::Ecg)
    }
}

/// Parameters for a full run over both artifact kinds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QcParams {
    pub ecg: ArtifactParams,
    pub eog: ArtifactParams,
    pub sensors: Vec<SensorType>,
    pub strategy: StrategyChoice,
}

impl Default for QcParams {
    fn default() -> Self {
        Self {
            ecg: ArtifactParams::for_kind(ArtifactKind::Ecg),
            eog: ArtifactParams::for_kind(ArtifactKind::Eog),
            sensors: SensorType::ALL.to_vec(),
            strategy: StrategyChoice::Auto,
        }
    }
}

impl QcParams {
    pub fn for_kind(&self, kind: ArtifactKind) -> &ArtifactParams {
        match kind {
            ArtifactKind::Ecg => &self.ecg,
            ArtifactKind::Eog => &self.eog,
        }
    }

    pub fn validate(&self) -> Result<(), QcError> {
        self.ecg.validate()?;
        self.eog.validate()?;
        if self.sensors.is_empty() {
            return Err(QcError::InvalidParameter("no sensor types selected".into()));
        }
        Ok(())
    }

    /// SHA-256 of the serialized parameters, hex encoded.
    pub fn params_hash_sha256(&self) -> Result<String, QcError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| QcError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
