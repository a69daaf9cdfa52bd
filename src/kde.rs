//! # Cell-calling threshold by kernel density estimation
//!
//! Finds the knee separating real cells from ambient barcodes: the
//! per-barcode totals are log10-transformed, the long tail below the
//! primary mode is dropped, a Gaussian KDE is computed by FFT convolution
//! on a power-of-two grid, and the threshold is read off a suitable local
//! minimum of the density. Thresholds outside the plausible range for the
//! given mode fall back to a fixed safety value.
use anyhow::{bail, Result};
use ndarray::prelude::*;

const BANDWIDTH: f64 = 0.1;
const N_USER: usize = 10_000;
/// The kernel extends 4 bandwidths past the data range on both sides.
const EXTENSION: f64 = 4.0;

/// Threshold domain, selecting the safety clamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    Bead,
    Jaccard,
}

/// Compute the (safety, raw) threshold for the given per-barcode counts.
/// The raw threshold is in count space (the log10 transform is undone);
/// the safety value replaces implausible raw thresholds.
pub fn density_threshold(input: &[f64], kind: ThresholdKind) -> Result<(f64, f64)> {
    if input.is_empty() {
        bail!("No data for density estimation");
    }

    let mut data: Vec<f64> = input.iter().map(|v| v.log10()).collect();
    filter_tail(&mut data);
    if data.is_empty() {
        bail!("All data filtered out during density estimation");
    }
    let min = *data.last().unwrap();
    let max = data[0];

    let n = (N_USER as f64).log2().ceil().exp2() as usize;
    let kords = fft_density(&data, min, max, n);

    // Interpolate the grid density onto the user grid over [min, max].
    let xlo = min - EXTENSION * BANDWIDTH;
    let xhi = max + EXTENSION * BANDWIDTH;
    let grid_step = (xhi - xlo) / (n - 1) as f64;
    let user_step = (max - min) / (N_USER - 1) as f64;
    let mut density = Array1::<f64>::zeros(N_USER);
    let mut grid_x = Array1::<f64>::zeros(N_USER);
    for i in 0..N_USER {
        let x = min + user_step * i as f64;
        density[i] = linear_interpolation(&kords, xlo, grid_step, x);
        grid_x[i] = x;
    }

    let minima = local_minima(&density);

    let mut local_min = 0usize;
    for &x in minima.iter().rev() {
        if x >= N_USER / 5 && ((max - grid_x[x]) > 0.5 || grid_x[x] < max / 2.0) {
            local_min = x;
            break;
        }
    }

    let threshold = if local_min != 0 {
        10f64.powf(grid_x[local_min])
    } else {
        0.0
    };

    let mut safety = 0.0;
    match kind {
        ThresholdKind::Bead => {
            if !(100.0..=100_000.0).contains(&threshold) {
                safety = 500.0;
            }
        }
        ThresholdKind::Jaccard => {
            if !(0.000_001..=0.5).contains(&threshold) {
                safety = 0.005;
            }
        }
    }
    if safety <= 0.0 {
        safety = threshold;
    }

    Ok((safety, threshold))
}

/// Sort descending and drop the trailing values at or below the primary
/// mode minus 3 (one thousandth of the mode in linear space).
fn filter_tail(data: &mut Vec<f64>) {
    data.sort_by(|a, b| b.partial_cmp(a).unwrap());
    let threshold = primary_mode(data) - 3.0;
    while let Some(last) = data.last() {
        if *last <= threshold {
            data.pop();
        } else {
            break;
        }
    }
}

/// The most frequent value of the descending-sorted data; run lengths are
/// counted from the small end so ties resolve to the larger value.
fn primary_mode(data: &[f64]) -> f64 {
    let mut count = 1usize;
    let mut max_count = 1usize;
    let mut mode = *data.last().unwrap();
    let mut prev = mode;
    for &value in data.iter().rev().skip(1) {
        if value == prev {
            count += 1;
            if max_count <= count {
                max_count = count;
                mode = value;
            }
        } else {
            count = 1;
        }
        prev = value;
    }
    mode
}

/// Gaussian KDE on `n` grid points over [min − 4h, max + 4h], computed by
/// circular convolution of the binned data with the sampled kernel in the
/// frequency domain. Returns the first `n` (clamped non-negative) values.
fn fft_density(data: &[f64], min: f64, max: f64, n: usize) -> Array1<f64> {
    let num = 2 * n;
    let xlo = min - EXTENSION * BANDWIDTH;
    let xhi = max + EXTENSION * BANDWIDTH;

    // Binned data with linear interpolation between adjacent bins.
    let mut y_re = bin_distribution(data, xlo, xhi, n);
    let mut y_im = vec![0.0; num];
    fft(&mut y_re, &mut y_im, false);

    // Sampled Gaussian kernel, mirrored onto the upper half.
    let diff = 2.0 * (xhi - xlo) / (num - 1) as f64;
    let mut k_re = vec![0.0; num];
    let mut k_im = vec![0.0; num];
    for (i, value) in k_re.iter_mut().enumerate().take(n + 1) {
        *value = gauss_pdf(i as f64 * diff);
    }
    for i in n + 1..num {
        k_re[i] = k_re[num - i];
    }
    fft(&mut k_re, &mut k_im, false);

    // Multiply by the conjugate of the kernel transform.
    let mut out_re = vec![0.0; num];
    let mut out_im = vec![0.0; num];
    for i in 0..num {
        out_re[i] = k_re[i] * y_re[i] + k_im[i] * y_im[i];
        out_im[i] = k_re[i] * y_im[i] - k_im[i] * y_re[i];
    }
    fft(&mut out_re, &mut out_im, true);

    let mut kords = Array1::<f64>::zeros(n);
    for i in 0..n {
        kords[i] = (out_re[i] / num as f64).max(0.0);
    }
    kords
}

/// Distribute each data point over its two neighboring bins by fractional
/// position, with total weight 1/N per point.
fn bin_distribution(data: &[f64], xlo: f64, xhi: f64, n: usize) -> Vec<f64> {
    let w = 1.0 / data.len() as f64;
    let xdelta = (xhi - xlo) / (n - 1) as f64;
    let ixmax = n as i64 - 2;
    let mut bins = vec![0.0; 2 * n];
    for &x in data {
        let xpos = (x - xlo) / xdelta;
        let ix = xpos.floor() as i64;
        let fx = xpos - ix as f64;
        if (0..=ixmax).contains(&ix) {
            bins[ix as usize] += (1.0 - fx) * w;
            bins[ix as usize + 1] += fx * w;
        } else if ix == ixmax + 1 {
            bins[ix as usize] += (1.0 - fx) * w;
        }
    }
    bins
}

fn gauss_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    let z = x / BANDWIDTH;
    (-0.5 * z * z).exp() / BANDWIDTH * INV_SQRT_2PI
}

fn linear_interpolation(kords: &Array1<f64>, xlo: f64, step: f64, v: f64) -> f64 {
    let index = ((v - xlo) / step).round() as usize;
    let index = index.clamp(1, kords.len() - 1);
    let x_prev = xlo + step * (index - 1) as f64;
    kords[index - 1] + (kords[index] - kords[index - 1]) * (v - x_prev) / step
}

/// Indices of the local minima of the density. Sign-change points come in
/// minimum/maximum pairs; every other one is kept, with the phase chosen
/// by the initial slope.
fn local_minima(density: &Array1<f64>) -> Vec<usize> {
    let n = density.len();
    let flag = usize::from(density[1] - density[0] > 0.0);
    let mut turning: Vec<usize> = Vec::new();
    for i in 1..n - 1 {
        if (density[i] - density[i - 1]) * (density[i + 1] - density[i]) < 0.0 {
            turning.push(i);
        }
    }
    if turning.len() > 2 {
        (0..turning.len() / 2).map(|i| turning[2 * i + flag]).collect()
    } else {
        turning
    }
}

/// In-place iterative radix-2 FFT over split real/imaginary buffers.
/// Lengths must be a power of two. `inverse` omits the 1/N scale; the
/// caller divides once after the convolution.
fn fft(re: &mut [f64], im: &mut [f64], inverse: bool) {
    let n = re.len();
    debug_assert!(n.is_power_of_two());

    // Bit-reversal permutation.
    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            re.swap(i, j);
            im.swap(i, j);
        }
    }

    let sign = if inverse { 1.0 } else { -1.0 };
    let mut len = 2;
    while len <= n {
        let angle = sign * 2.0 * std::f64::consts::PI / len as f64;
        let (w_re, w_im) = (angle.cos(), angle.sin());
        for start in (0..n).step_by(len) {
            let mut cur_re = 1.0;
            let mut cur_im = 0.0;
            for k in start..start + len / 2 {
                let (u_re, u_im) = (re[k], im[k]);
                let v_re = re[k + len / 2] * cur_re - im[k + len / 2] * cur_im;
                let v_im = re[k + len / 2] * cur_im + im[k + len / 2] * cur_re;
                re[k] = u_re + v_re;
                im[k] = u_im + v_im;
                re[k + len / 2] = u_re - v_re;
                im[k + len / 2] = u_im - v_im;
                let next_re = cur_re * w_re - cur_im * w_im;
                cur_im = cur_re * w_im + cur_im * w_re;
                cur_re = next_re;
            }
        }
        len <<= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fft_round_trip_recovers_the_input() {
        let mut re = vec![1.0, 2.0, 3.0, 4.0, 0.0, -1.0, 0.5, 2.5];
        let mut im = vec![0.0; 8];
        let original = re.clone();
        fft(&mut re, &mut im, false);
        fft(&mut re, &mut im, true);
        for (value, expect) in re.iter().zip(original.iter()) {
            assert!((value / 8.0 - expect).abs() < 1e-9);
        }
    }

    fn bimodal_counts() -> Vec<f64> {
        // Ambient noise around 100 reads, cells around 30000 reads, with a
        // wide empty valley between the modes.
        let mut counts = Vec::new();
        for i in 0..8000 {
            counts.push(100.0 + (i % 30) as f64);
        }
        for i in 0..2000 {
            counts.push(30_000.0 + (i % 1000) as f64 * 10.0);
        }
        counts
    }

    #[test]
    fn bimodal_mix_thresholds_in_the_valley() {
        let (safety, raw) = density_threshold(&bimodal_counts(), ThresholdKind::Bead).unwrap();
        assert!(raw > 130.0 && raw < 30_000.0, "raw threshold {raw}");
        assert_eq!(safety, raw);
    }

    #[test]
    fn threshold_is_permutation_invariant() {
        let counts = bimodal_counts();
        let mut reversed = counts.clone();
        reversed.reverse();
        let a = density_threshold(&counts, ThresholdKind::Bead).unwrap();
        let b = density_threshold(&reversed, ThresholdKind::Bead).unwrap();
        assert!((a.0 - b.0).abs() < 1e-9);
        assert!((a.1 - b.1).abs() < 1e-9);
    }

    #[test]
    fn degenerate_data_falls_back_to_safety() {
        // A single tight mode yields no usable minimum.
        let counts = vec![10.0; 5000];
        let (safety, _) = density_threshold(&counts, ThresholdKind::Bead).unwrap();
        assert_eq!(500.0, safety);
    }

    #[test]
    fn jaccard_clamp_uses_its_own_range() {
        let counts = vec![10.0; 5000];
        let (safety, _) = density_threshold(&counts, ThresholdKind::Jaccard).unwrap();
        assert_eq!(0.005, safety);
    }
}
