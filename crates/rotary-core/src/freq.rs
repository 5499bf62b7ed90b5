//! Inverse-frequency computation and the scaling-scheme frequency reshapes.
//!
//! Everything here is a pure function over the frequency table; the cache
//! builder turns the result into position-indexed cos/sin rows.

use rotary_common::{Result, RopeError};

/// Validate the head/rotary-dim/base geometry shared by every variant.
pub fn validate_basis(base: f64, head_size: usize, rotary_dim: usize) -> Result<()> {
    if rotary_dim == 0 || rotary_dim % 2 != 0 {
        return Err(RopeError::OddRotaryDim { dim: rotary_dim });
    }
    if rotary_dim > head_size {
        return Err(RopeError::RotaryDimExceedsHeadSize {
            rotary_dim,
            head_size,
        });
    }
    if !base.is_finite() || base <= 0.0 {
        return Err(RopeError::InvalidBase { base });
    }
    Ok(())
}

/// Compute `1 / base^(2i/dim)` for `i` in `[0, dim/2)`, ascending exponent.
///
/// Strictly decreasing for `base > 1`; exponentiation runs in f64 so large
/// bases (1e7 and beyond) keep their low-frequency tail distinct.
pub fn compute_inv_freq(base: f64, rotary_dim: usize) -> Vec<f32> {
    (0..rotary_dim)
        .step_by(2)
        .map(|i| (1.0 / base.powf(i as f64 / rotary_dim as f64)) as f32)
        .collect()
}

/// Dimension index at which the table completes `num_rotations` turns over
/// the original context window. Inverse of the wavelength formula.
pub fn yarn_find_correction_dim(
    num_rotations: f64,
    rotary_dim: usize,
    base: f64,
    max_position: usize,
) -> f64 {
    (rotary_dim as f64
        * (max_position as f64 / (num_rotations * 2.0 * std::f64::consts::PI)).ln())
        / (2.0 * base.ln())
}

/// Dimension range `[low, high]` between the fast and slow rotation cutoffs,
/// clamped into the valid index range.
pub fn yarn_find_correction_range(
    low_rot: f64,
    high_rot: f64,
    rotary_dim: usize,
    base: f64,
    max_position: usize,
) -> (f64, f64) {
    let low = yarn_find_correction_dim(low_rot, rotary_dim, base, max_position).floor();
    let high = yarn_find_correction_dim(high_rot, rotary_dim, base, max_position).ceil();
    (low.max(0.0), high.min((rotary_dim - 1) as f64))
}

/// Linear 0-to-1 ramp over `len` dimensions between `low` and `high`.
///
/// Degenerate `low == high` bounds are nudged apart by 0.001 so the ramp
/// stays well-defined without raising.
pub fn yarn_linear_ramp_mask(low: f64, mut high: f64, len: usize) -> Vec<f32> {
    if low == high {
        high += 0.001;
    }
    (0..len)
        .map(|i| (((i as f64 - low) / (high - low)).clamp(0.0, 1.0)) as f32)
        .collect()
}

/// Magnitude correction for interpolated frequencies:
/// `0.1 * mscale * ln(scale) + 1` above scale 1, exactly 1 otherwise.
pub fn yarn_get_mscale(scale: f64, mscale: f64) -> f64 {
    if scale <= 1.0 {
        1.0
    } else {
        0.1 * mscale * scale.ln() + 1.0
    }
}

/// Blend interpolated and extrapolated frequencies through the ramp mask.
pub fn yarn_scale_inv_freq(
    inv_freq: &mut [f32],
    scaling_factor: f64,
    extrapolation_factor: f64,
    low: f64,
    high: f64,
) {
    let mask = yarn_linear_ramp_mask(low, high, inv_freq.len());
    for (freq, ramp) in inv_freq.iter_mut().zip(mask) {
        let extrapolation = *freq as f64;
        let interpolation = extrapolation / scaling_factor;
        // ramp 0 => pure extrapolation weight, after the (1 - ramp) flip
        let weight = (1.0 - ramp as f64) * extrapolation_factor;
        *freq = (interpolation * (1.0 - weight) + extrapolation * weight) as f32;
    }
}

/// Llama 3 wavelength-banded blend: short wavelengths untouched, long
/// wavelengths divided by the scaling factor, the mid band smoothed linearly.
pub fn llama3_scale_inv_freq(
    inv_freq: &mut [f32],
    scaling_factor: f64,
    low_freq_factor: f64,
    high_freq_factor: f64,
    orig_max_position: usize,
) {
    let orig = orig_max_position as f64;
    let low_freq_wavelen = orig / low_freq_factor;
    let high_freq_wavelen = orig / high_freq_factor;

    for freq in inv_freq.iter_mut() {
        let f = *freq as f64;
        let wavelen = 2.0 * std::f64::consts::PI / f;
        let smooth = if low_freq_factor != high_freq_factor {
            (orig / wavelen - low_freq_factor) / (high_freq_factor - low_freq_factor)
        } else {
            0.0
        };
        let scaled = if wavelen < high_freq_wavelen {
            f
        } else if wavelen > low_freq_wavelen {
            f / scaling_factor
        } else {
            (1.0 - smooth) * f / scaling_factor + smooth * f
        };
        *freq = scaled as f32;
    }
}

/// NTK base rescale exponent `dim / (dim - 2)` shared by the dynamic family.
pub fn ntk_exponent(rotary_dim: usize) -> f64 {
    rotary_dim as f64 / (rotary_dim as f64 - 2.0)
}
