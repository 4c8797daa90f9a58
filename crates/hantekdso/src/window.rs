//! Spectrum analysis window functions.
//!
//! Coefficient tables applied to the voltage samples before the DFT.
//! All windows are evaluated over `0..n` with the usual symmetric
//! definition on `n - 1`.

use std::f64::consts::PI;

/// The supported window functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunction {
    /// Rectangular window (aka Dirichlet).
    Rectangular,
    Hamming,
    Hann,
    /// Cosine window (aka Sine).
    Cosine,
    /// Lanczos window (aka Sinc).
    Lanczos,
    /// Bartlett window (endpoints zero).
    Bartlett,
    /// Triangular window (endpoints non-zero).
    Triangular,
    /// Gauss window with sigma 0.4.
    Gauss,
    BartlettHann,
    /// Blackman window with alpha 0.16.
    Blackman,
    Nuttall,
    BlackmanHarris,
    BlackmanNuttall,
    FlatTop,
}

/// Compute the coefficient table for a window of length `n`.
pub fn coefficients(function: WindowFunction, n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0; n];
    }
    let end = (n - 1) as f64;
    let cosine_term = |i: f64, harmonic: f64| (harmonic * PI * i / end).cos();

    (0..n)
        .map(|position| {
            let i = position as f64;
            match function {
                WindowFunction::Rectangular => 1.0,
                WindowFunction::Hamming => 0.54 - 0.46 * cosine_term(i, 2.0),
                WindowFunction::Hann => 0.5 * (1.0 - cosine_term(i, 2.0)),
                WindowFunction::Cosine => (PI * i / end).sin(),
                WindowFunction::Lanczos => {
                    let sinc_parameter = (2.0 * i / end - 1.0) * PI;
                    if sinc_parameter == 0.0 {
                        1.0
                    } else {
                        sinc_parameter.sin() / sinc_parameter
                    }
                }
                WindowFunction::Bartlett => {
                    2.0 / end * (end / 2.0 - (i - end / 2.0).abs())
                }
                WindowFunction::Triangular => {
                    2.0 / n as f64 * (n as f64 / 2.0 - (i - end / 2.0).abs())
                }
                WindowFunction::Gauss => {
                    let sigma = 0.4;
                    (-0.5 * ((i - end / 2.0) / (sigma * end / 2.0)).powi(2)).exp()
                }
                WindowFunction::BartlettHann => {
                    0.62 - 0.48 * (i / end - 0.5).abs() - 0.38 * cosine_term(i, 2.0)
                }
                WindowFunction::Blackman => {
                    let alpha = 0.16;
                    (1.0 - alpha) / 2.0 - 0.5 * cosine_term(i, 2.0)
                        + alpha / 2.0 * cosine_term(i, 4.0)
                }
                WindowFunction::Nuttall => {
                    0.355768 - 0.487396 * cosine_term(i, 2.0) + 0.144232 * cosine_term(i, 4.0)
                        - 0.012604 * cosine_term(i, 6.0)
                }
                WindowFunction::BlackmanHarris => {
                    0.35875 - 0.48829 * cosine_term(i, 2.0) + 0.14128 * cosine_term(i, 4.0)
                        - 0.01168 * cosine_term(i, 6.0)
                }
                WindowFunction::BlackmanNuttall => {
                    0.3635819 - 0.4891775 * cosine_term(i, 2.0)
                        + 0.1365995 * cosine_term(i, 4.0)
                        - 0.0106411 * cosine_term(i, 6.0)
                }
                WindowFunction::FlatTop => {
                    1.0 - 1.93 * cosine_term(i, 2.0) + 1.29 * cosine_term(i, 4.0)
                        - 0.388 * cosine_term(i, 6.0)
                        + 0.032 * cosine_term(i, 8.0)
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [WindowFunction; 14] = [
        WindowFunction::Rectangular,
        WindowFunction::Hamming,
        WindowFunction::Hann,
        WindowFunction::Cosine,
        WindowFunction::Lanczos,
        WindowFunction::Bartlett,
        WindowFunction::Triangular,
        WindowFunction::Gauss,
        WindowFunction::BartlettHann,
        WindowFunction::Blackman,
        WindowFunction::Nuttall,
        WindowFunction::BlackmanHarris,
        WindowFunction::BlackmanNuttall,
        WindowFunction::FlatTop,
    ];

    #[test]
    fn rectangular_is_all_ones() {
        assert!(coefficients(WindowFunction::Rectangular, 64).iter().all(|&w| w == 1.0));
    }

    #[test]
    fn hamming_endpoints_and_peak() {
        let w = coefficients(WindowFunction::Hamming, 65);
        assert!((w[0] - 0.08).abs() < 1e-12);
        assert!((w[64] - 0.08).abs() < 1e-12);
        assert!((w[32] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn hann_endpoints_are_zero() {
        let w = coefficients(WindowFunction::Hann, 64);
        assert!(w[0].abs() < 1e-12);
        assert!(w[63].abs() < 1e-12);
    }

    #[test]
    fn bartlett_endpoints_zero_triangular_nonzero() {
        let bartlett = coefficients(WindowFunction::Bartlett, 64);
        assert!(bartlett[0].abs() < 1e-12);
        let triangular = coefficients(WindowFunction::Triangular, 64);
        assert!(triangular[0] > 0.0);
    }

    #[test]
    fn flattop_center_value() {
        let w = coefficients(WindowFunction::FlatTop, 65);
        // 1 + 1.93 + 1.29 + 0.388 + 0.032 at the center.
        assert!((w[32] - 4.64).abs() < 1e-9);
    }

    #[test]
    fn all_windows_are_symmetric() {
        for function in ALL {
            let w = coefficients(function, 129);
            for i in 0..w.len() / 2 {
                assert!(
                    (w[i] - w[w.len() - 1 - i]).abs() < 1e-9,
                    "{function:?} asymmetric at {i}"
                );
            }
        }
    }

    #[test]
    fn degenerate_lengths() {
        for function in ALL {
            assert!(coefficients(function, 0).is_empty());
            assert_eq!(coefficients(function, 1), vec![1.0]);
        }
    }
}
