//! One-dimensional peak detection.
//!
//! Local maxima are found first (a flat top counts once, at its middle sample),
//! then filtered by height, minimum spacing and prominence, in that order.
//! Negative peaks are found by running the same search on the negated signal.

use std::cmp::Ordering;

/// Selection criteria. `None` disables the corresponding filter.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PeakOptions {
    pub height: Option<f64>,
    /// Minimum distance in samples between kept peaks (higher peaks win).
    pub distance: Option<usize>,
    pub prominence: Option<f64>,
}

impl PeakOptions {
    pub fn prominence(prominence: f64) -> Self {
        Self {
            prominence: Some(prominence),
            ..Self::default()
        }
    }
}

/// Indices of peaks in `x` that satisfy `opts`, in ascending order.
pub fn find_peaks(x: &[f64], opts: &PeakOptions) -> Vec<usize> {
    let mut peaks = local_maxima(x);

    if let Some(height) = opts.height {
        peaks.retain(|&p| x[p] >= height);
    }

    if let Some(distance) = opts.distance {
        if distance > 1 {
            peaks = select_by_distance(x, &peaks, distance);
        }
    }

    if let Some(min_prominence) = opts.prominence {
        peaks.retain(|&p| prominence(x, p) >= min_prominence);
    }

    peaks
}

/// Positive and negative peaks with their (signed) magnitudes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BipolarPeaks {
    pub positive: Vec<usize>,
    pub negative: Vec<usize>,
}

impl BipolarPeaks {
    pub fn is_empty(&self) -> bool {
        self.positive.is_empty() && self.negative.is_empty()
    }

    /// Positive locations followed by negative locations.
    pub fn locations(&self) -> Vec<usize> {
        self.positive
            .iter()
            .chain(self.negative.iter())
            .copied()
            .collect()
    }
}

/// Peaks of both polarities using a prominence of `range(x) / divisor`.
pub fn find_bipolar_peaks(x: &[f64], divisor: f64) -> BipolarPeaks {
    if x.is_empty() {
        return BipolarPeaks::default();
    }
    let opts = PeakOptions::prominence(value_range(x) / divisor);
    let negated: Vec<f64> = x.iter().map(|v| -v).collect();
    BipolarPeaks {
        positive: find_peaks(x, &opts),
        negative: find_peaks(&negated, &opts),
    }
}

pub fn value_range(x: &[f64]) -> f64 {
    let (lo, hi) = x
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if lo.is_finite() && hi.is_finite() {
        hi - lo
    } else {
        0.0
    }
}

/// Index of the sample with the largest absolute value (first on ties).
pub fn argmax_abs(x: &[f64]) -> Option<usize> {
    x.iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if v.abs() <= b => best,
            _ => Some((i, v.abs())),
        })
        .map(|(i, _)| i)
}

fn local_maxima(x: &[f64]) -> Vec<usize> {
    let n = x.len();
    let mut peaks = Vec::new();
    if n < 3 {
        return peaks;
    }
    let i_max = n - 1;
    let mut i = 1;
    while i < i_max {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < i_max && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                let left = i;
                let right = ahead - 1;
                peaks.push((left + right) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

fn select_by_distance(x: &[f64], peaks: &[usize], distance: usize) -> Vec<usize> {
    let mut keep = vec![true; peaks.len()];
    let mut order: Vec<usize> = (0..peaks.len()).collect();
    // Highest first; stable so equal heights keep their positional order.
    order.sort_by(|&a, &b| {
        x[peaks[b]]
            .partial_cmp(&x[peaks[a]])
            .unwrap_or(Ordering::Equal)
    });
    for &i in &order {
        if !keep[i] {
            continue;
        }
        let mut j = i;
        while j > 0 && peaks[i] - peaks[j - 1] < distance {
            keep[j - 1] = false;
            j -= 1;
        }
        let mut j = i + 1;
        while j < peaks.len() && peaks[j] - peaks[i] < distance {
            keep[j] = false;
            j += 1;
        }
    }
    peaks
        .iter()
        .zip(keep)
        .filter_map(|(&p, k)| k.then_some(p))
        .collect()
}

/// Vertical distance between a peak and the higher of its two flanking minima,
/// where each flank extends until the signal rises above the peak.
pub fn prominence(x: &[f64], peak: usize) -> f64 {
    let top = x[peak];

    let mut left_min = top;
    let mut i = peak;
    loop {
        if x[i] > top {
            break;
        }
        left_min = left_min.min(x[i]);
        if i == 0 {
            break;
        }
        i -= 1;
    }

    let mut right_min = top;
    for &v in &x[peak..] {
        if v > top {
            break;
        }
        right_min = right_min.min(v);
    }

    top - left_min.max(right_min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn finds_simple_maxima() {
        let x = [0.0, 1.0, 0.0, 2.0, 0.0];
        assert_eq!(find_peaks(&x, &PeakOptions::default()), vec![1, 3]);
    }

    #[test]
    fn edges_are_never_peaks() {
        let x = [5.0, 1.0, 0.0, 1.0, 5.0];
        assert!(find_peaks(&x, &PeakOptions::default()).is_empty());
    }

    #[test]
    fn plateau_reports_middle() {
        let x = [0.0, 1.0, 1.0, 1.0, 0.0];
        assert_eq!(find_peaks(&x, &PeakOptions::default()), vec![2]);
        let x = [0.0, 1.0, 1.0, 0.0];
        assert_eq!(find_peaks(&x, &PeakOptions::default()), vec![1]);
    }

    #[test]
    fn prominence_uses_higher_base() {
        let x = [0.0, 3.0, 1.0, 4.0, 2.0, 0.0];
        assert_abs_diff_eq!(prominence(&x, 1), 2.0);
        assert_abs_diff_eq!(prominence(&x, 3), 4.0);
        let opts = PeakOptions::prominence(2.5);
        assert_eq!(find_peaks(&x, &opts), vec![3]);
    }

    #[test]
    fn distance_prefers_higher_peaks() {
        let x = [0.0, 2.0, 0.0, 3.0, 0.0, 1.0, 0.0, 0.0, 0.0, 2.0, 0.0];
        let opts = PeakOptions {
            distance: Some(3),
            ..PeakOptions::default()
        };
        assert_eq!(find_peaks(&x, &opts), vec![3, 9]);
    }

    #[test]
    fn height_filters_first() {
        let x = [0.0, 2.0, 0.0, 3.0, 0.0];
        let opts = PeakOptions {
            height: Some(2.5),
            ..PeakOptions::default()
        };
        assert_eq!(find_peaks(&x, &opts), vec![3]);
    }

    #[test]
    fn bipolar_peaks_cover_both_signs() {
        let x = [0.0, 1.0, 0.0, -1.0, 0.0];
        let peaks = find_bipolar_peaks(&x, 5.0);
        assert_eq!(peaks.positive, vec![1]);
        assert_eq!(peaks.negative, vec![3]);
        assert_eq!(peaks.locations(), vec![1, 3]);
    }

    #[test]
    fn argmax_abs_picks_largest_magnitude() {
        assert_eq!(argmax_abs(&[0.5, -2.0, 1.5]), Some(1));
        assert_eq!(argmax_abs(&[]), None);
    }
}
