//! Channel-affectedness strategies.
//!
//! Both strategies consume the per-channel averages of one sensor modality and
//! return a [`RankedResult`]. A failed shape gate is a value
//! ([`Outcome::BadAverage`]) rather than an error; a length mismatch between
//! waveforms is an error.

use std::ops::Range;

use ndarray::Array1;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::{debug, info, warn};

use crate::align::{flip_channels, reference_candidates, AlignmentCandidate, T0Estimate};
use crate::average::{ArtifactAverage, Correlation, WaveVariant};
use crate::reference::ReferenceWaveform;
use crate::{ArtifactKind, ArtifactParams, Method, QcError, SensorType, TimeAxis};

/// Common contract of the affectedness strategies.
pub trait AffectednessClassifier: Send + Sync {
    fn method(&self) -> Method;

    fn classify(
        &self,
        sensor: SensorType,
        channels: Vec<ArtifactAverage>,
        reference: &ReferenceWaveform,
        axis: &TimeAxis,
    ) -> Result<RankedResult, QcError>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RankedResult {
    pub method: Method,
    pub sensor: SensorType,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The grand mean or reference failed the shape gate; nothing was ranked.
    BadAverage { status: String },
    Threshold(ThresholdRanking),
    Correlation(CorrelationRanking),
}

impl RankedResult {
    pub fn status(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::BadAverage { status } => Some(status),
            Outcome::Threshold(t) => Some(&t.status),
            Outcome::Correlation(_) => None,
        }
    }

    /// Affected channels: over-threshold channels of the original variant, or the
    /// most-correlated tier. Empty when the gate failed.
    pub fn affected(&self) -> Vec<&ArtifactAverage> {
        match &self.outcome {
            Outcome::BadAverage { .. } => Vec::new(),
            Outcome::Threshold(t) => t
                .primary()
                .map(|split| split.affected.iter().map(|&i| &t.channels[i]).collect())
                .unwrap_or_default(),
            Outcome::Correlation(c) => c.channels[c.tiers.most.clone()].iter().collect(),
        }
    }
}

/// Verdicts of one threshold pass (original or smoothed).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ThresholdSplit {
    pub threshold: f64,
    /// Time of the grand-mean peak the window is centred on.
    pub t0: f64,
    pub window: (f64, f64),
    /// Indices into the ranking's channels, by in-window peak magnitude descending.
    pub affected: Vec<usize>,
    pub not_affected: Vec<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ThresholdRanking {
    pub channels: Vec<ArtifactAverage>,
    pub grand_mean: ArtifactAverage,
    pub alignment: Option<T0Estimate>,
    /// `None` when the original grand mean is not wave-shaped.
    pub original: Option<ThresholdSplit>,
    /// `None` when the smoothed grand mean is not wave-shaped.
    pub smoothed: Option<ThresholdSplit>,
    pub status: String,
}

impl ThresholdRanking {
    /// The original split, or the smoothed one when only it passed the gate.
    pub fn primary(&self) -> Option<&ThresholdSplit> {
        self.original.as_ref().or(self.smoothed.as_ref())
    }
}

/// Affected iff wave-shaped with an in-window peak above `grand mean peak / norm_level`.
#[derive(Clone, Debug)]
pub struct ThresholdClassifier {
    pub kind: ArtifactKind,
    pub params: ArtifactParams,
}

impl ThresholdClassifier {
    pub fn new(kind: ArtifactKind, params: ArtifactParams) -> Self {
        Self { kind, params }
    }

    fn split(
        &self,
        grand: &WaveVariant,
        channels: &mut [ArtifactAverage],
        axis: &TimeAxis,
        smoothed: bool,
    ) -> Option<ThresholdSplit> {
        let (peak, magnitude) = grand.peaks.as_ref()?.strongest()?;
        let threshold = magnitude / self.params.norm_level;
        let t0 = axis.time(peak);
        let half = self.params.threshold_window_half_width;
        let (lo, hi) = (t0 - half, t0 + half);

        let mut affected = Vec::new();
        let mut not_affected = Vec::new();
        for (i, ch) in channels.iter_mut().enumerate() {
            let variant = if smoothed {
                ch.smoothed.as_mut()
            } else {
                Some(&mut ch.original)
            };
            let over = variant.map_or(false, |v| v.evaluate_threshold(threshold, axis, lo, hi));
            if over {
                affected.push(i);
            } else {
                not_affected.push(i);
            }
        }

        let magnitude_of = |i: usize| {
            let ch = &channels[i];
            let variant = if smoothed { ch.smoothed.as_ref() } else { Some(&ch.original) };
            variant
                .and_then(|v| v.dominant)
                .map_or(f64::NEG_INFINITY, |d| d.magnitude)
        };
        affected.sort_by_key(|&i| std::cmp::Reverse(OrderedFloat(magnitude_of(i))));

        Some(ThresholdSplit {
            threshold,
            t0,
            window: (lo, hi),
            affected,
            not_affected,
        })
    }
}

impl AffectednessClassifier for ThresholdClassifier {
    fn method(&self) -> Method {
        Method::MeanThreshold
    }

    fn classify(
        &self,
        sensor: SensorType,
        mut channels: Vec<ArtifactAverage>,
        _reference: &ReferenceWaveform,
        axis: &TimeAxis,
    ) -> Result<RankedResult, QcError> {
        for ch in &channels {
            axis.check_len(ch.len())?;
        }
        let alignment = flip_channels(&mut channels, axis, &self.params).map(|(t0, _)| t0);

        let name = format!("Mean_{}_{}", self.kind.label(), sensor);
        let mut grand = ArtifactAverage::grand_mean(name, &channels)?
            .smoothed(self.params.gaussian_sigma)
            .classified(self.params.prominence_divisor, self.params.max_peaks_average);

        let original_shaped = grand.is_wave_shaped();
        let smoothed_shaped = grand.is_wave_shaped_smoothed() == Some(true);
        if !original_shaped && !smoothed_shaped {
            let status = format!(
                "{}: mean {} artifact over all channels is not wave-shaped, affected channels cannot be estimated.",
                sensor.title(),
                self.kind
            );
            warn!("{status}");
            return Ok(RankedResult {
                method: self.method(),
                sensor,
                outcome: Outcome::BadAverage { status },
            });
        }

        let original = if original_shaped {
            let split = self
                .split(&grand.original, &mut channels, axis, false)
                .ok_or_else(|| QcError::InsufficientData("grand mean has no peak".into()))?;
            grand.original.evaluate_threshold(split.threshold, axis, split.window.0, split.window.1);
            Some(split)
        } else {
            None
        };

        let smoothed = match grand.smoothed.take() {
            Some(mut variant) if smoothed_shaped => {
                let split = self.split(&variant, &mut channels, axis, true);
                if let Some(s) = &split {
                    variant.evaluate_threshold(s.threshold, axis, s.window.0, s.window.1);
                }
                grand.smoothed = Some(variant);
                split
            }
            other => {
                grand.smoothed = other;
                None
            }
        };

        let n = channels.len();
        let title = sensor.title();
        let status = match (&original, &smoothed) {
            (Some(o), Some(s)) => format!(
                "{title}: {} of {n} channels above threshold ({} on smoothed data).",
                o.affected.len(),
                s.affected.len()
            ),
            (Some(o), None) => format!(
                "{title}: {} of {n} channels above threshold; smoothed mean artifact is not wave-shaped.",
                o.affected.len()
            ),
            (None, Some(s)) => format!(
                "{title}: mean {} artifact is not wave-shaped on original data; {} of {n} channels above threshold on smoothed data.",
                self.kind,
                s.affected.len()
            ),
            (None, None) => {
                return Err(QcError::InsufficientData("grand mean has no peak".into()));
            }
        };
        info!("{status}");

        Ok(RankedResult {
            method: self.method(),
            sensor,
            outcome: Outcome::Threshold(ThresholdRanking {
                channels,
                grand_mean: grand,
                alignment,
                original,
                smoothed,
                status,
            }),
        })
    }
}

/// Contiguous rank ranges of the three correlation tiers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tiers {
    pub most: Range<usize>,
    pub middle: Range<usize>,
    pub least: Range<usize>,
}

impl Tiers {
    /// `n / 3` channels each in the outer tiers, the remainder in the middle.
    pub fn split(n: usize) -> Self {
        let third = n / 3;
        Self {
            most: 0..third,
            middle: third..n - third,
            least: n - third..n,
        }
    }

    pub fn tier_of(&self, rank: usize) -> Tier {
        if self.most.contains(&rank) {
            Tier::Most
        } else if self.least.contains(&rank) {
            Tier::Least
        } else {
            Tier::Middle
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Most,
    Middle,
    Least,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Most => "most_correlated",
            Tier::Middle => "middle_correlated",
            Tier::Least => "least_correlated",
        }
    }
}

/// Largest |r| in each tier; `None` for an empty tier.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TierBoundaries {
    pub most: Option<f64>,
    pub middle: Option<f64>,
    pub least: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CorrelationRanking {
    /// Sorted by |r| descending.
    pub channels: Vec<ArtifactAverage>,
    /// Reference after alignment.
    pub reference: Array1<f64>,
    pub shift: i64,
    pub mean_top_correlation: f64,
    pub tiers: Tiers,
    pub boundaries: TierBoundaries,
}

/// Ranks channels by |Pearson r| between their smoothed average and the aligned
/// reference waveform.
#[derive(Clone, Debug)]
pub struct CorrelationClassifier {
    pub method: Method,
    pub params: ArtifactParams,
}

impl CorrelationClassifier {
    pub fn new(method: Method, params: ArtifactParams) -> Result<Self, QcError> {
        match method {
            Method::Correlation | Method::CorrelationReconstructed => Ok(Self { method, params }),
            other => Err(QcError::UnknownMethod(format!(
                "{other} is not a correlation method"
            ))),
        }
    }

    fn correlate_all(
        channels: &[ArtifactAverage],
        reference: &Array1<f64>,
    ) -> Result<Vec<Correlation>, QcError> {
        let reference = reference.to_vec();
        channels
            .iter()
            .map(|ch| pearson(&ch.smoothed_or_original().to_vec(), &reference))
            .collect()
    }

    fn mean_top(&self, correlations: &[Correlation]) -> f64 {
        let mut abs: Vec<f64> = correlations.iter().map(|c| c.coefficient.abs()).collect();
        abs.sort_by_key(|&r| std::cmp::Reverse(OrderedFloat(r)));
        abs.truncate(self.params.alignment_top_correlations);
        if abs.is_empty() {
            0.0
        } else {
            abs.iter().sum::<f64>() / abs.len() as f64
        }
    }
}

impl AffectednessClassifier for CorrelationClassifier {
    fn method(&self) -> Method {
        self.method
    }

    fn classify(
        &self,
        sensor: SensorType,
        mut channels: Vec<ArtifactAverage>,
        reference: &ReferenceWaveform,
        axis: &TimeAxis,
    ) -> Result<RankedResult, QcError> {
        axis.check_len(reference.samples().len())?;
        for ch in &channels {
            if ch.len() != reference.samples().len() {
                return Err(QcError::ShapeMismatch {
                    expected: reference.samples().len(),
                    found: ch.len(),
                });
            }
        }

        if !reference.average.is_wave_shaped() {
            let status = format!(
                "{}: reference {} waveform is not wave-shaped, affected channels cannot be estimated.",
                sensor.title(),
                reference.channel
            );
            warn!("{status}");
            return Ok(RankedResult {
                method: self.method,
                sensor,
                outcome: Outcome::BadAverage { status },
            });
        }

        let mut candidates = reference_candidates(reference.samples(), &channels, axis, &self.params);
        if candidates.is_empty() {
            candidates.push(AlignmentCandidate {
                reference_peak: 0,
                shift: 0,
                samples: reference.samples().clone(),
            });
        }

        let mut best: Option<(usize, f64, Vec<Correlation>)> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            let correlations = Self::correlate_all(&channels, &candidate.samples)?;
            let score = self.mean_top(&correlations);
            debug!(shift = candidate.shift, score, "alignment candidate");
            if best.as_ref().map_or(true, |(_, s, _)| score > *s) {
                best = Some((i, score, correlations));
            }
        }
        let Some((chosen, mean_top_correlation, correlations)) = best else {
            return Err(QcError::InsufficientData("no alignment candidate".into()));
        };
        let candidate = candidates.swap_remove(chosen);

        for (ch, c) in channels.iter_mut().zip(correlations) {
            ch.correlation = Some(c);
        }
        channels.sort_by_key(|ch| std::cmp::Reverse(OrderedFloat(ch.abs_correlation())));

        let tiers = Tiers::split(channels.len());
        let boundary = |r: &Range<usize>| {
            channels[r.clone()]
                .iter()
                .map(ArtifactAverage::abs_correlation)
                .max_by_key(|&v| OrderedFloat(v))
        };
        let boundaries = TierBoundaries {
            most: boundary(&tiers.most),
            middle: boundary(&tiers.middle),
            least: boundary(&tiers.least),
        };

        info!(
            "{}: ranked {} channels by correlation with the reference (shift {} samples, mean top |r| {:.3})",
            sensor.title(),
            channels.len(),
            candidate.shift,
            mean_top_correlation
        );

        Ok(RankedResult {
            method: self.method,
            sensor,
            outcome: Outcome::Correlation(CorrelationRanking {
                channels,
                reference: candidate.samples,
                shift: candidate.shift,
                mean_top_correlation,
                tiers,
                boundaries,
            }),
        })
    }
}

/// Pearson correlation with a two-sided p-value from Student's t (n - 2 dof).
///
/// A constant input has no defined correlation; it is reported as r = 0, p = 1.
pub fn pearson(x: &[f64], y: &[f64]) -> Result<Correlation, QcError> {
    if x.len() != y.len() {
        return Err(QcError::ShapeMismatch {
            expected: x.len(),
            found: y.len(),
        });
    }
    let n = x.len();
    if n < 3 {
        return Err(QcError::InsufficientData(format!(
            "correlation needs at least 3 samples, got {n}"
        )));
    }
    let mean_x = x.iter().sum::<f64>() / n as f64;
    let mean_y = y.iter().sum::<f64>() / n as f64;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        warn!("constant waveform, correlation undefined");
        return Ok(Correlation {
            coefficient: 0.0,
            p_value: 1.0,
        });
    }
    let r = (sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0);
    if r.abs() == 1.0 {
        return Ok(Correlation {
            coefficient: r,
            p_value: 0.0,
        });
    }
    let df = (n - 2) as f64;
    let t = r * (df / (1.0 - r * r)).sqrt();
    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| QcError::InvalidParameter(e.to_string()))?;
    let p_value = (2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0);
    Ok(Correlation {
        coefficient: r,
        p_value,
    })
}
