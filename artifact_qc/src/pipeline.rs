//! Per-artifact orchestration and the summary record.
//!
//! For each artifact kind: validate the recorded channel (falling back to a
//! reconstructed reference), build and gate the reference waveform, choose the
//! strategy, then average, align and classify every sensor modality.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::average::ArtifactAverage;
use crate::classify::{
    AffectednessClassifier, CorrelationClassifier, Outcome, RankedResult, ThresholdClassifier,
};
use crate::recording::Recording;
use crate::reference::{build_and_gate, ReferenceOutcome, ReferenceSource, ReferenceWaveform};
use crate::validate::{validate_channel, ValidationReport};
use crate::{
    ArtifactKind, ArtifactParams, Method, QcError, QcParams, SensorType, StrategyChoice, TimeAxis,
};

/// One ranked channel as it appears in the summary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelValue {
    pub channel: String,
    /// Peak magnitude (threshold) or correlation coefficient.
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    /// `affected` for the threshold method, the correlation tier otherwise.
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lobe: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ModalitySummary {
    Details {
        channels: Vec<ChannelValue>,
        /// Strategy note, e.g. per-variant affected counts for the threshold method.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    Status(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ArtifactSummary {
    pub kind: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    pub params_hash: String,
    pub channel_status: String,
    pub reference_status: String,
    pub modalities: BTreeMap<SensorType, ModalitySummary>,
    pub description: String,
}

/// Everything produced for one artifact kind.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ArtifactReport {
    pub kind: ArtifactKind,
    pub validation: Option<ValidationReport>,
    pub reference: Option<ReferenceOutcome>,
    pub method: Option<Method>,
    pub results: BTreeMap<SensorType, RankedResult>,
    pub summary: ArtifactSummary,
}

impl ArtifactReport {
    pub fn is_aborted(&self) -> bool {
        self.method.is_none()
    }
}

struct ReferenceSignal {
    source: ReferenceSource,
    channel: String,
    samples: Vec<f64>,
    events: Vec<usize>,
}

/// Run the full analysis for one artifact kind.
pub fn run_artifact<R: Recording + ?Sized>(
    recording: &R,
    kind: ArtifactKind,
    params: &QcParams,
) -> Result<ArtifactReport, QcError> {
    params.validate()?;
    let p = params.for_kind(kind);
    let sfreq = recording.sample_rate();
    let axis = p.time_axis(sfreq)?;
    let params_hash = params.params_hash_sha256()?;

    let (validation, mut channel_status, signal) = select_reference(recording, kind, p, sfreq)?;
    let signal = match signal.or_else(|| reconstructed(recording, kind, &mut channel_status)) {
        Some(signal) => signal,
        None => {
            let reference_status =
                format!("No usable {kind} reference, affected channels were not estimated.");
            warn!("{reference_status}");
            return Ok(aborted(kind, params_hash, validation, None, channel_status, reference_status, params));
        }
    };

    let reference = build_and_gate(
        kind,
        &signal.channel,
        &signal.samples,
        &signal.events,
        &axis,
        p,
        signal.source,
    );
    if !reference.is_ready() {
        let status = reference.status().to_string();
        return Ok(aborted(kind, params_hash, validation, Some(reference), channel_status, status, params));
    }
    let waveform = reference
        .waveform()
        .cloned()
        .ok_or_else(|| QcError::InsufficientData(format!("{kind} reference has no waveform")))?;

    let method = choose_method(params.strategy, signal.source);
    info!("{kind}: using method {method}");
    let classifier: Box<dyn AffectednessClassifier> = match method {
        Method::MeanThreshold => Box::new(ThresholdClassifier::new(kind, p.clone())),
        _ => Box::new(CorrelationClassifier::new(method, p.clone())?),
    };

    let ranked: Vec<(SensorType, Result<Option<RankedResult>, QcError>)> = params
        .sensors
        .par_iter()
        .map(|&sensor| {
            let result = rank_modality(
                recording,
                sensor,
                &signal.events,
                &axis,
                p,
                classifier.as_ref(),
                &waveform,
            );
            (sensor, result)
        })
        .collect();

    let mut results = BTreeMap::new();
    let mut modalities = BTreeMap::new();
    for (sensor, result) in ranked {
        match result? {
            Some(r) => {
                modalities.insert(sensor, modality_summary(&r));
                results.insert(sensor, r);
            }
            None => {
                let status = format!("No {} found.", sensor.title().to_lowercase());
                modalities.insert(sensor, ModalitySummary::Status(status));
            }
        }
    }

    let summary = ArtifactSummary {
        kind,
        method: Some(method),
        params_hash,
        channel_status,
        reference_status: reference.status().to_string(),
        modalities,
        description: describe(kind, method),
    };

    Ok(ArtifactReport {
        kind,
        validation,
        reference: Some(reference),
        method: Some(method),
        results,
        summary,
    })
}

/// Run every kind in `kinds`, in order.
pub fn run_all<R: Recording + ?Sized>(
    recording: &R,
    kinds: &[ArtifactKind],
    params: &QcParams,
) -> Result<Vec<ArtifactReport>, QcError> {
    kinds
        .iter()
        .map(|&kind| run_artifact(recording, kind, params))
        .collect()
}

pub fn choose_method(strategy: StrategyChoice, source: ReferenceSource) -> Method {
    match (strategy, source) {
        (StrategyChoice::MeanThreshold, _) => Method::MeanThreshold,
        (StrategyChoice::Auto, ReferenceSource::Recorded) => Method::Correlation,
        (StrategyChoice::Auto, ReferenceSource::Reconstructed) => Method::CorrelationReconstructed,
    }
}

fn select_reference<R: Recording + ?Sized>(
    recording: &R,
    kind: ArtifactKind,
    p: &ArtifactParams,
    sfreq: f64,
) -> Result<(Option<ValidationReport>, String, Option<ReferenceSignal>), QcError> {
    let channels = recording.reference_channels(kind);
    let Some(&(name, samples)) = channels.first() else {
        let status = format!("No {kind} channel found.");
        info!("{status}");
        return Ok((None, status, None));
    };

    let report = validate_channel(name, samples, sfreq, kind, p)?;
    let mut status = report.describe();
    if channels.len() > 1 {
        status = format!(
            "{} {kind} channels found, using the first one. {status}",
            channels.len()
        );
    }
    if !report.is_good() {
        status.push_str(&format!(" {name} is not used."));
        return Ok((Some(report), status, None));
    }
    let signal = ReferenceSignal {
        source: ReferenceSource::Recorded,
        channel: name.to_string(),
        samples: samples.to_vec(),
        events: report.peaks.clone(),
    };
    Ok((Some(report), status, Some(signal)))
}

fn reconstructed<R: Recording + ?Sized>(
    recording: &R,
    kind: ArtifactKind,
    channel_status: &mut String,
) -> Option<ReferenceSignal> {
    let rec = recording.reconstruct_reference(kind)?;
    channel_status.push_str(&format!(
        " {kind} signal was reconstructed from the sensor data ({} events).",
        rec.events.len()
    ));
    Some(ReferenceSignal {
        source: ReferenceSource::Reconstructed,
        channel: rec.name,
        samples: rec.samples,
        events: rec.events,
    })
}

fn rank_modality<R: Recording + ?Sized>(
    recording: &R,
    sensor: SensorType,
    events: &[usize],
    axis: &TimeAxis,
    p: &ArtifactParams,
    classifier: &dyn AffectednessClassifier,
    reference: &ReferenceWaveform,
) -> Result<Option<RankedResult>, QcError> {
    if recording.channel_names(sensor).is_empty() {
        debug!("no {sensor} channels, skipping");
        return Ok(None);
    }
    let epochs = recording.create_epochs(sensor, events, axis)?;
    let max_peaks = p.max_peaks_channel();
    let channels = epochs
        .into_iter()
        .map(|ch| {
            let lobe = recording.lobe(&ch.name);
            if lobe.is_none() {
                debug!(channel = %ch.name, "no lobe metadata");
            }
            Ok(ArtifactAverage::from_epochs(ch.name, &ch.epochs)?
                .smoothed(p.gaussian_sigma)
                .classified(p.prominence_divisor, max_peaks)
                .with_lobe(lobe))
        })
        .collect::<Result<Vec<_>, QcError>>()?;
    debug!(sensor = %sensor, channels = channels.len(), "averaged artifact epochs");
    classifier.classify(sensor, channels, reference, axis).map(Some)
}

fn modality_summary(result: &RankedResult) -> ModalitySummary {
    let lobe = |ch: &ArtifactAverage| ch.lobe.as_ref().map(|l| l.label.clone());
    match &result.outcome {
        Outcome::BadAverage { status } => ModalitySummary::Status(status.clone()),
        Outcome::Threshold(t) => {
            // Original verdicts when available, otherwise the smoothed ones.
            let smoothed_only = t.original.is_none();
            let channels = t
                .primary()
                .map(|split| {
                    split
                        .affected
                        .iter()
                        .map(|&i| {
                            let ch = &t.channels[i];
                            let variant = if smoothed_only { ch.smoothed.as_ref() } else { Some(&ch.original) };
                            ChannelValue {
                                channel: ch.name.clone(),
                                value: variant.and_then(|v| v.dominant).map_or(0.0, |d| d.magnitude),
                                p_value: None,
                                group: if smoothed_only { "affected_smoothed" } else { "affected" }.to_string(),
                                lobe: lobe(ch),
                            }
                        })
                        .collect()
                })
                .unwrap_or_default();
            ModalitySummary::Details {
                channels,
                status: Some(t.status.clone()),
            }
        }
        Outcome::Correlation(c) => ModalitySummary::Details {
            channels: c
                .channels
                .iter()
                .enumerate()
                .map(|(rank, ch)| {
                    let corr = ch.correlation;
                    ChannelValue {
                        channel: ch.name.clone(),
                        value: corr.map_or(0.0, |c| c.coefficient),
                        p_value: corr.map(|c| c.p_value),
                        group: c.tiers.tier_of(rank).as_str().to_string(),
                        lobe: lobe(ch),
                    }
                })
                .collect(),
            status: None,
        },
    }
}

fn aborted(
    kind: ArtifactKind,
    params_hash: String,
    validation: Option<ValidationReport>,
    reference: Option<ReferenceOutcome>,
    channel_status: String,
    reference_status: String,
    params: &QcParams,
) -> ArtifactReport {
    let modalities = params
        .sensors
        .iter()
        .map(|&s| (s, ModalitySummary::Status(reference_status.clone())))
        .collect();
    ArtifactReport {
        kind,
        validation,
        reference,
        method: None,
        results: BTreeMap::new(),
        summary: ArtifactSummary {
            kind,
            method: None,
            params_hash,
            channel_status,
            reference_status,
            modalities,
            description: format!(
                "The {kind} artifact shape could not be verified, so no channels were ranked."
            ),
        },
    }
}

fn describe(kind: ArtifactKind, method: Method) -> String {
    match method {
        Method::MeanThreshold => format!(
            "Channels whose average {kind} artifact peak exceeds the mean artifact peak over all \
             channels divided by norm_level, listed from highest to lowest peak magnitude. \
             Channels below the threshold are not listed. Values are peak magnitudes."
        ),
        Method::Correlation => format!(
            "All channels ranked by the absolute Pearson correlation between their smoothed \
             average {kind} artifact and the averaged recorded {kind} channel. Values are \
             [coefficient, p-value]; the sign reflects sensor orientation only."
        ),
        Method::CorrelationReconstructed => format!(
            "All channels ranked by the absolute Pearson correlation between their smoothed \
             average {kind} artifact and the {kind} signal reconstructed from sensor data \
             (no usable {kind} channel was recorded). Values are [coefficient, p-value]."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{InMemoryRecording, ReconstructedReference, SignalChannel};
    use crate::validate::tests::spike_train;

    const SFREQ: f64 = 1000.0;
    const LEN: usize = 30_000;

    fn beat_events() -> Vec<usize> {
        (1..30).map(|k| k * 1000).collect()
    }

    /// Gaussian pulse of `width` samples and `amp` at every event.
    fn pulses(events: &[usize], width: f64, amp: f64) -> Vec<f64> {
        let mut x = vec![0.0; LEN];
        for &e in events {
            for d in -40i64..=40 {
                let i = (e as i64 + d) as usize;
                let z = d as f64 / width;
                x[i] += amp * (-0.5 * z * z).exp();
            }
        }
        x
    }

    fn slow_wave(freq: f64, amp: f64) -> Vec<f64> {
        (0..LEN)
            .map(|i| amp * (2.0 * std::f64::consts::PI * freq * i as f64 / SFREQ).sin())
            .collect()
    }

    /// Two pulse-contaminated magnetometers (one with inverted polarity) and four
    /// carrying only unrelated slow waves.
    fn recording(ecg: Vec<f64>) -> InMemoryRecording {
        let events = beat_events();
        let mut rec = InMemoryRecording::new(SFREQ)
            .with_reference(ArtifactKind::Ecg, SignalChannel::new("ECG063", ecg))
            .with_sensor(SensorType::Mag, SignalChannel::new("MEG0111", pulses(&events, 4.0, 5.0)))
            .with_sensor(SensorType::Mag, SignalChannel::new("MEG0121", pulses(&events, 4.0, -5.0)));
        for (k, freq) in [7.3, 11.7, 13.1, 17.9].into_iter().enumerate() {
            rec = rec.with_sensor(
                SensorType::Mag,
                SignalChannel::new(format!("MEG02{k}1"), slow_wave(freq, 0.2)),
            );
        }
        rec
    }

    fn clean_ecg() -> Vec<f64> {
        pulses(&beat_events(), 3.0, 1.0)
    }

    fn mag_details(report: &ArtifactReport) -> &[ChannelValue] {
        match &report.summary.modalities[&SensorType::Mag] {
            ModalitySummary::Details { channels, .. } => channels,
            ModalitySummary::Status(s) => panic!("unexpected status: {s}"),
        }
    }

    #[test]
    fn good_recorded_channel_uses_correlation() {
        let rec = recording(clean_ecg());
        let report = run_artifact(&rec, ArtifactKind::Ecg, &QcParams::default()).unwrap();
        assert_eq!(report.method, Some(Method::Correlation));
        assert!(report.validation.as_ref().unwrap().is_good());
        assert!(report.reference.as_ref().unwrap().is_ready());

        let details = mag_details(&report);
        assert_eq!(details.len(), 6);
        let mut top: Vec<&str> = details[..2].iter().map(|c| c.channel.as_str()).collect();
        top.sort();
        assert_eq!(top, vec!["MEG0111", "MEG0121"]);
        assert_eq!(details[0].group, "most_correlated");
        assert!(details[0].p_value.is_some());

        let inverted = details.iter().find(|c| c.channel == "MEG0121").unwrap();
        assert!(inverted.value < 0.0);

        // Grad was requested but the bundle has none.
        assert!(matches!(
            report.summary.modalities[&SensorType::Grad],
            ModalitySummary::Status(_)
        ));
        assert_eq!(report.summary.params_hash.len(), 64);
    }

    #[test]
    fn mean_threshold_finds_pulse_channels() {
        let rec = recording(clean_ecg());
        let params = QcParams {
            strategy: StrategyChoice::MeanThreshold,
            sensors: vec![SensorType::Mag],
            ..QcParams::default()
        };
        let report = run_artifact(&rec, ArtifactKind::Ecg, &params).unwrap();
        assert_eq!(report.method, Some(Method::MeanThreshold));
        let details = mag_details(&report);
        let mut names: Vec<&str> = details.iter().map(|c| c.channel.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["MEG0111", "MEG0121"]);
        assert!(details.iter().all(|c| c.value > 0.0 && c.group == "affected"));
        let ModalitySummary::Details { status: Some(status), .. } =
            &report.summary.modalities[&SensorType::Mag]
        else {
            panic!("threshold summary should carry a status");
        };
        assert!(status.starts_with("Magnetometers: 2 of 6 channels above threshold"));
    }

    #[test]
    fn bad_channel_without_reconstruction_aborts() {
        let events = beat_events();
        let mut ecg = spike_train(LEN, &events);
        for (i, &e) in events.iter().enumerate() {
            if i % 2 == 0 {
                ecg[e] = 3.0;
            }
        }
        let rec = recording(ecg);
        let report = run_artifact(&rec, ArtifactKind::Ecg, &QcParams::default()).unwrap();
        assert!(report.is_aborted());
        assert!(!report.validation.as_ref().unwrap().is_good());
        assert!(report.summary.channel_status.contains("is not used"));
        assert!(report.results.is_empty());
        for summary in report.summary.modalities.values() {
            assert!(matches!(summary, ModalitySummary::Status(_)));
        }
    }

    #[test]
    fn bad_channel_falls_back_to_reconstruction() {
        let events = beat_events();
        let mut bad = spike_train(LEN, &events);
        for (i, &e) in events.iter().enumerate() {
            if i % 2 == 0 {
                bad[e] = 3.0;
            }
        }
        let rec = recording(bad).with_reconstructed(
            ArtifactKind::Ecg,
            ReconstructedReference {
                name: "ECG_reconstructed".into(),
                samples: clean_ecg(),
                events: events.clone(),
            },
        );
        let report = run_artifact(&rec, ArtifactKind::Ecg, &QcParams::default()).unwrap();
        assert_eq!(report.method, Some(Method::CorrelationReconstructed));
        assert!(report.summary.channel_status.contains("reconstructed"));
        assert_eq!(report.reference.as_ref().unwrap().waveform().unwrap().source, ReferenceSource::Reconstructed);
    }

    #[test]
    fn missing_channel_without_reconstruction_aborts() {
        let mut rec = recording(clean_ecg());
        rec.references.clear();
        let reports = run_all(&rec, &ArtifactKind::ALL, &QcParams::default()).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(ArtifactReport::is_aborted));
        assert!(reports[0].summary.channel_status.starts_with("No ECG channel"));
        assert_eq!(reports[1].kind, ArtifactKind::Eog);
    }

    #[test]
    fn strategy_choice_follows_reference_source() {
        assert_eq!(
            choose_method(StrategyChoice::Auto, ReferenceSource::Recorded),
            Method::Correlation
        );
        assert_eq!(
            choose_method(StrategyChoice::Auto, ReferenceSource::Reconstructed),
            Method::CorrelationReconstructed
        );
        assert_eq!(
            choose_method(StrategyChoice::MeanThreshold, ReferenceSource::Recorded),
            Method::MeanThreshold
        );
    }

    #[test]
    fn summary_serializes_with_method_names() {
        let rec = recording(clean_ecg());
        let report = run_artifact(&rec, ArtifactKind::Ecg, &QcParams::default()).unwrap();
        let json = serde_json::to_value(&report.summary).unwrap();
        assert_eq!(json["method"], "correlation");
        assert_eq!(json["kind"], "ecg");
        assert!(json["modalities"]["mag"]["details"]["channels"].is_array());
        assert!(json["modalities"]["mag"]["details"].get("status").is_none());
        assert!(json["modalities"]["grad"]["status"].is_string());
    }
}
