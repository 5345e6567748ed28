//! Gaussian smoothing of 1-D waveforms.

use ndarray::Array1;

const TRUNCATE_SIGMAS: f64 = 4.0;

/// Normalised Gaussian kernel of radius `round(4 * sigma)`.
pub fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (TRUNCATE_SIGMAS * sigma + 0.5) as usize;
    let two_var = 2.0 * sigma * sigma;
    let mut kernel: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let x = i as f64 - radius as f64;
            (-x * x / two_var).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= sum;
    }
    kernel
}

/// Convolve `samples` with a Gaussian of standard deviation `sigma` samples.
///
/// Borders are extended by mirroring about the edge (`d c b a | a b c d | d c b a`),
/// so a constant signal stays constant. `sigma <= 0` returns the input unchanged.
pub fn gaussian_smooth(samples: &Array1<f64>, sigma: f64) -> Array1<f64> {
    let n = samples.len();
    if n == 0 || !(sigma > 0.0) {
        return samples.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as i64;
    let mut out = Array1::zeros(n);
    for i in 0..n {
        let mut acc = 0.0;
        for (k, w) in kernel.iter().enumerate() {
            let j = reflect_index(i as i64 + k as i64 - radius, n);
            acc += w * samples[j];
        }
        out[i] = acc;
    }
    out
}

fn reflect_index(mut j: i64, n: usize) -> usize {
    let n = n as i64;
    let period = 2 * n;
    j = j.rem_euclid(period);
    if j >= n {
        j = period - 1 - j;
    }
    j as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn kernel_is_normalised_and_symmetric() {
        let k = gaussian_kernel(2.0);
        assert_eq!(k.len(), 17);
        assert_abs_diff_eq!(k.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(k[0], k[16], epsilon = 1e-15);
    }

    #[test]
    fn constant_signal_unchanged() {
        let x = Array1::from_elem(10, 3.5);
        let y = gaussian_smooth(&x, 4.0);
        for v in y.iter() {
            assert_abs_diff_eq!(*v, 3.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn smoothing_lowers_spike_preserves_area() {
        let mut x = Array1::zeros(41);
        x[20] = 1.0;
        let y = gaussian_smooth(&x, 2.0);
        assert!(y[20] < 1.0);
        assert!(y[19] > 0.0 && y[21] > 0.0);
        assert_abs_diff_eq!(y.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn reflect_mirrors_edges() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(5, 4), 2);
        assert_eq!(reflect_index(9, 4), 1);
    }
}
