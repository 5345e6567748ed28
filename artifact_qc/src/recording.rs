//! Access to the continuous recording.
//!
//! The pipeline only needs a handful of collaborator operations: the sample rate,
//! the recorded ECG/EOG channels, epoching of sensor channels around events, a
//! reconstructed reference when the recorded one is unusable, and lobe labels.
//! [`InMemoryRecording`] implements them over plain vectors and is the bundle
//! format read by the command-line tool.

use std::collections::BTreeMap;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::average::Lobe;
use crate::{ArtifactKind, QcError, SensorType, TimeAxis};

/// Epochs of one channel: `events x samples`.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelEpochs {
    pub name: String,
    pub epochs: Array2<f64>,
}

/// Surrogate reference signal derived from sensor data, with its own events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReconstructedReference {
    #[serde(default = "default_reconstructed_name")]
    pub name: String,
    pub samples: Vec<f64>,
    pub events: Vec<usize>,
}

fn default_reconstructed_name() -> String {
    "reconstructed".to_string()
}

pub trait Recording: Sync {
    fn sample_rate(&self) -> f64;

    /// Recorded reference channels for `kind`, in acquisition order.
    fn reference_channels(&self, kind: ArtifactKind) -> Vec<(&str, &[f64])>;

    fn channel_names(&self, sensor: SensorType) -> Vec<String>;

    /// Cut every `sensor` channel around `events` on `axis`. Events whose window
    /// leaves the recording are skipped.
    fn create_epochs(
        &self,
        sensor: SensorType,
        events: &[usize],
        axis: &TimeAxis,
    ) -> Result<Vec<ChannelEpochs>, QcError>;

    fn reconstruct_reference(&self, kind: ArtifactKind) -> Option<ReconstructedReference>;

    fn lobe(&self, channel: &str) -> Option<Lobe>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignalChannel {
    pub name: String,
    pub samples: Vec<f64>,
}

impl SignalChannel {
    pub fn new(name: impl Into<String>, samples: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            samples,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InMemoryRecording {
    pub sfreq: f64,
    #[serde(default)]
    pub sensors: BTreeMap<SensorType, Vec<SignalChannel>>,
    #[serde(default)]
    pub references: BTreeMap<ArtifactKind, Vec<SignalChannel>>,
    #[serde(default)]
    pub reconstructed: BTreeMap<ArtifactKind, ReconstructedReference>,
    #[serde(default)]
    pub lobes: BTreeMap<String, Lobe>,
}

impl InMemoryRecording {
    pub fn new(sfreq: f64) -> Self {
        Self {
            sfreq,
            sensors: BTreeMap::new(),
            references: BTreeMap::new(),
            reconstructed: BTreeMap::new(),
            lobes: BTreeMap::new(),
        }
    }

    pub fn with_sensor(mut self, sensor: SensorType, channel: SignalChannel) -> Self {
        self.sensors.entry(sensor).or_default().push(channel);
        self
    }

    pub fn with_reference(mut self, kind: ArtifactKind, channel: SignalChannel) -> Self {
        self.references.entry(kind).or_default().push(channel);
        self
    }

    pub fn with_reconstructed(mut self, kind: ArtifactKind, reference: ReconstructedReference) -> Self {
        self.reconstructed.insert(kind, reference);
        self
    }
}

impl Recording for InMemoryRecording {
    fn sample_rate(&self) -> f64 {
        self.sfreq
    }

    fn reference_channels(&self, kind: ArtifactKind) -> Vec<(&str, &[f64])> {
        self.references
            .get(&kind)
            .map(|chs| {
                chs.iter()
                    .map(|c| (c.name.as_str(), c.samples.as_slice()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn channel_names(&self, sensor: SensorType) -> Vec<String> {
        self.sensors
            .get(&sensor)
            .map(|chs| chs.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    fn create_epochs(
        &self,
        sensor: SensorType,
        events: &[usize],
        axis: &TimeAxis,
    ) -> Result<Vec<ChannelEpochs>, QcError> {
        let channels = self
            .sensors
            .get(&sensor)
            .filter(|chs| !chs.is_empty())
            .ok_or_else(|| QcError::Epoching(format!("no {sensor} channels in recording")))?;

        let len = axis.len();
        let offset = axis.start_offset();
        channels
            .iter()
            .map(|ch| {
                let mut flat = Vec::with_capacity(events.len() * len);
                let mut rows = 0usize;
                for &event in events {
                    let start = event as i64 + offset;
                    if start < 0 || start as usize + len > ch.samples.len() {
                        continue;
                    }
                    let start = start as usize;
                    flat.extend_from_slice(&ch.samples[start..start + len]);
                    rows += 1;
                }
                if rows == 0 {
                    return Err(QcError::Epoching(format!(
                        "no event window fits inside channel {}",
                        ch.name
                    )));
                }
                if rows < events.len() {
                    debug!(channel = %ch.name, skipped = events.len() - rows, "edge events dropped");
                }
                let epochs = Array2::from_shape_vec((rows, len), flat)
                    .map_err(|e| QcError::Epoching(e.to_string()))?;
                Ok(ChannelEpochs {
                    name: ch.name.clone(),
                    epochs,
                })
            })
            .collect()
    }

    fn reconstruct_reference(&self, kind: ArtifactKind) -> Option<ReconstructedReference> {
        let reconstructed = self.reconstructed.get(&kind).cloned();
        if reconstructed.is_none() {
            warn!("no reconstructed {kind} reference available");
        }
        reconstructed
    }

    fn lobe(&self, channel: &str) -> Option<Lobe> {
        self.lobes.get(channel).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_recording() -> InMemoryRecording {
        let ramp: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let mut rec = InMemoryRecording::new(100.0)
            .with_sensor(SensorType::Mag, SignalChannel::new("MEG0111", ramp.clone()))
            .with_sensor(
                SensorType::Mag,
                SignalChannel::new("MEG0121", ramp.iter().map(|v| -v).collect()),
            );
        rec.lobes.insert(
            "MEG0111".into(),
            Lobe {
                label: "Left Frontal".into(),
                color: "#1f77b4".into(),
            },
        );
        rec
    }

    #[test]
    fn epochs_are_cut_around_events() {
        let rec = ramp_recording();
        let axis = TimeAxis::new(-0.02, 0.02, 100.0).unwrap();
        let epochs = rec.create_epochs(SensorType::Mag, &[10, 50], &axis).unwrap();
        assert_eq!(epochs.len(), 2);
        assert_eq!(epochs[0].epochs.dim(), (2, 5));
        assert_eq!(epochs[0].epochs.row(0).to_vec(), vec![8.0, 9.0, 10.0, 11.0, 12.0]);
        assert_eq!(epochs[1].epochs[[1, 2]], -50.0);
    }

    #[test]
    fn edge_events_are_dropped() {
        let rec = ramp_recording();
        let axis = TimeAxis::new(-0.02, 0.02, 100.0).unwrap();
        let epochs = rec.create_epochs(SensorType::Mag, &[1, 50, 98], &axis).unwrap();
        assert_eq!(epochs[0].epochs.nrows(), 1);
        assert!(rec.create_epochs(SensorType::Mag, &[0, 99], &axis).is_err());
    }

    #[test]
    fn missing_modality_is_an_epoching_error() {
        let rec = ramp_recording();
        let axis = TimeAxis::new(-0.02, 0.02, 100.0).unwrap();
        assert!(matches!(
            rec.create_epochs(SensorType::Grad, &[50], &axis),
            Err(QcError::Epoching(_))
        ));
        assert!(rec.channel_names(SensorType::Grad).is_empty());
    }

    #[test]
    fn bundle_deserializes_with_defaults() {
        let json = r#"{
            "sfreq": 1000.0,
            "sensors": {"mag": [{"name": "MEG0111", "samples": [0.0, 1.0]}]},
            "references": {"ecg": [{"name": "ECG063", "samples": [0.0, 1.0]}]},
            "reconstructed": {"eog": {"samples": [0.0], "events": []}}
        }"#;
        let rec: InMemoryRecording = serde_json::from_str(json).unwrap();
        assert_eq!(rec.channel_names(SensorType::Mag), vec!["MEG0111"]);
        assert_eq!(rec.reference_channels(ArtifactKind::Ecg)[0].0, "ECG063");
        assert!(rec.reference_channels(ArtifactKind::Eog).is_empty());
        let eog = rec.reconstruct_reference(ArtifactKind::Eog).unwrap();
        assert_eq!(eog.name, "reconstructed");
        assert!(rec.lobe("MEG0111").is_none());
    }

    #[test]
    fn lobes_are_looked_up_by_name() {
        let rec = ramp_recording();
        assert_eq!(rec.lobe("MEG0111").unwrap().label, "Left Frontal");
        assert!(rec.lobe("MEG0121").is_none());
    }
}
