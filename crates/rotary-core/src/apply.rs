//! Rotation application over flat query/key buffers.
//!
//! Buffers are viewed as `[num_tokens, num_heads, head_size]`; the first
//! `rotary_dim` values of each head are rotated in place and the tail passes
//! through untouched. Two interleaving conventions are supported: half-split
//! ("neox", first half paired with second half) and pairwise ("gpt-j",
//! even/odd interleaved elements).
//!
//! A provider registry selects an accelerated kernel at first use when the
//! host supports one; the scalar path always exists and is the ground truth
//! the accelerated paths are tested against.

use std::sync::OnceLock;

use half::f16;
use rotary_common::{Result, RopeError};
use tracing::debug;

use crate::cache::CosSinCache;

/// Float adapter so the same rotation math serves f32 and f16 buffers.
pub trait RotaryFloat: Copy {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl RotaryFloat for f32 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl RotaryFloat for f16 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

/// Rotate one head's rotary slice in place. `chunk.len() == 2 * cos.len()`.
///
/// Half-split: `(x1, x2) = (chunk[i], chunk[half + i])`.
/// Pairwise: `(x1, x2) = (chunk[2i], chunk[2i + 1])`.
/// Both apply `(x1·cos − x2·sin, x2·cos + x1·sin)`.
#[inline]
pub fn rotate_token<T: RotaryFloat>(chunk: &mut [T], cos: &[T], sin: &[T], is_neox_style: bool) {
    let half = cos.len();
    debug_assert_eq!(chunk.len(), 2 * half);
    debug_assert_eq!(sin.len(), half);

    if is_neox_style {
        for i in 0..half {
            let x1 = chunk[i].to_f32();
            let x2 = chunk[half + i].to_f32();
            let c = cos[i].to_f32();
            let s = sin[i].to_f32();
            chunk[i] = T::from_f32(x1 * c - x2 * s);
            chunk[half + i] = T::from_f32(x2 * c + x1 * s);
        }
    } else {
        for i in 0..half {
            let x1 = chunk[2 * i].to_f32();
            let x2 = chunk[2 * i + 1].to_f32();
            let c = cos[i].to_f32();
            let s = sin[i].to_f32();
            chunk[2 * i] = T::from_f32(x1 * c - x2 * s);
            chunk[2 * i + 1] = T::from_f32(x2 * c + x1 * s);
        }
    }
}

/// Rotation kernel provider. Implementations must match the scalar path up
/// to floating-point rounding.
pub trait RotationProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
    fn rotate(&self, chunk: &mut [f32], cos: &[f32], sin: &[f32], is_neox_style: bool);
}

/// Portable scalar kernel; always available, ground truth for the rest.
pub struct ScalarProvider;

impl RotationProvider for ScalarProvider {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn rotate(&self, chunk: &mut [f32], cos: &[f32], sin: &[f32], is_neox_style: bool) {
        rotate_token(chunk, cos, sin, is_neox_style);
    }
}

/// AVX2+FMA kernel for the half-split convention on x86-64. The pairwise
/// convention falls back to scalar (its stride-2 access defeats wide loads).
#[cfg(target_arch = "x86_64")]
pub struct Avx2Provider;

#[cfg(target_arch = "x86_64")]
impl RotationProvider for Avx2Provider {
    fn name(&self) -> &'static str {
        "avx2"
    }

    fn is_available(&self) -> bool {
        is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
    }

    fn rotate(&self, chunk: &mut [f32], cos: &[f32], sin: &[f32], is_neox_style: bool) {
        if is_neox_style && cos.len() >= 8 {
            // Safety: availability checked at provider selection time.
            unsafe { rotate_neox_avx2(chunk, cos, sin) }
        } else {
            rotate_token(chunk, cos, sin, is_neox_style);
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn rotate_neox_avx2(chunk: &mut [f32], cos: &[f32], sin: &[f32]) {
    use std::arch::x86_64::*;

    let half = cos.len();
    let ptr = chunk.as_mut_ptr();
    let mut i = 0;
    while i + 8 <= half {
        let c = _mm256_loadu_ps(cos.as_ptr().add(i));
        let s = _mm256_loadu_ps(sin.as_ptr().add(i));
        let x1 = _mm256_loadu_ps(ptr.add(i));
        let x2 = _mm256_loadu_ps(ptr.add(half + i));
        let o1 = _mm256_fmsub_ps(x1, c, _mm256_mul_ps(x2, s));
        let o2 = _mm256_fmadd_ps(x2, c, _mm256_mul_ps(x1, s));
        _mm256_storeu_ps(ptr.add(i), o1);
        _mm256_storeu_ps(ptr.add(half + i), o2);
        i += 8;
    }
    while i < half {
        let x1 = *ptr.add(i);
        let x2 = *ptr.add(half + i);
        *ptr.add(i) = x1 * cos[i] - x2 * sin[i];
        *ptr.add(half + i) = x2 * cos[i] + x1 * sin[i];
        i += 1;
    }
}

/// Selects the best available rotation provider once per process.
pub struct RotationKernel {
    providers: Vec<Box<dyn RotationProvider>>,
    selected: OnceLock<usize>,
}

impl RotationKernel {
    pub fn new() -> Self {
        #[allow(unused_mut)]
        let mut providers: Vec<Box<dyn RotationProvider>> = Vec::new();
        #[cfg(target_arch = "x86_64")]
        providers.push(Box::new(Avx2Provider));
        providers.push(Box::new(ScalarProvider));
        Self {
            providers,
            selected: OnceLock::new(),
        }
    }

    fn select(&self) -> &dyn RotationProvider {
        let idx = *self.selected.get_or_init(|| {
            let idx = self
                .providers
                .iter()
                .position(|p| p.is_available())
                .unwrap_or(self.providers.len() - 1);
            debug!(provider = self.providers[idx].name(), "selected rotation kernel");
            idx
        });
        self.providers[idx].as_ref()
    }

    pub fn selected_name(&self) -> &'static str {
        self.select().name()
    }

    #[inline]
    pub fn rotate(&self, chunk: &mut [f32], cos: &[f32], sin: &[f32], is_neox_style: bool) {
        self.select().rotate(chunk, cos, sin, is_neox_style);
    }
}

impl Default for RotationKernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide kernel instance shared by every variant.
pub fn rotation_kernel() -> &'static RotationKernel {
    static KERNEL: OnceLock<RotationKernel> = OnceLock::new();
    KERNEL.get_or_init(RotationKernel::new)
}

/// Validate a buffer against token count and head size; returns head count.
pub(crate) fn heads_in_buffer(len: usize, num_tokens: usize, head_size: usize) -> Result<usize> {
    let token_stride = num_tokens * head_size;
    if token_stride == 0 || len % token_stride != 0 {
        return Err(RopeError::ShapeMismatch {
            len,
            num_tokens,
            head_size,
        });
    }
    Ok(len / token_stride)
}

/// Rotate every head of a buffer using one cache row per token.
pub(crate) fn apply_rows_f32(
    cache: &CosSinCache,
    rows: &[usize],
    head_size: usize,
    rotary_dim: usize,
    is_neox_style: bool,
    buf: &mut [f32],
) -> Result<()> {
    let num_tokens = rows.len();
    let heads = heads_in_buffer(buf.len(), num_tokens, head_size)?;
    let kernel = rotation_kernel();
    for (token, &row) in rows.iter().enumerate() {
        let (cos, sin) = cache.row(row)?;
        for head in 0..heads {
            let offset = (token * heads + head) * head_size;
            let chunk = &mut buf[offset..offset + rotary_dim];
            kernel.rotate(chunk, cos, sin, is_neox_style);
        }
    }
    Ok(())
}

/// Half-precision sibling of [`apply_rows_f32`]; triggers the cache's lazy
/// f16 materialization and computes through the scalar path.
pub(crate) fn apply_rows_f16(
    cache: &CosSinCache,
    rows: &[usize],
    head_size: usize,
    rotary_dim: usize,
    is_neox_style: bool,
    buf: &mut [f16],
) -> Result<()> {
    let num_tokens = rows.len();
    let heads = heads_in_buffer(buf.len(), num_tokens, head_size)?;
    for (token, &row) in rows.iter().enumerate() {
        let (cos, sin) = cache.row_f16(row)?;
        for head in 0..heads {
            let offset = (token * heads + head) * head_size;
            let chunk = &mut buf[offset..offset + rotary_dim];
            rotate_token(chunk, cos, sin, is_neox_style);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freq::compute_inv_freq;

    fn cache(dim: usize, max_pos: usize) -> CosSinCache {
        let inv_freq = compute_inv_freq(10_000.0, dim);
        CosSinCache::from_positions(&inv_freq, (0..max_pos).map(|p| p as f64), 1.0)
    }

    fn norm(values: &[f32]) -> f32 {
        values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    #[test]
    fn rotation_preserves_norm_both_styles() {
        let cache = cache(8, 16);
        let (cos, sin) = cache.row(5).unwrap();
        for style in [true, false] {
            let mut chunk: Vec<f32> = (0..8).map(|i| i as f32 * 0.3 - 1.0).collect();
            let before = norm(&chunk);
            rotate_token(&mut chunk, cos, sin, style);
            let after = norm(&chunk);
            assert!((before - after).abs() < 1e-4, "style neox={style}");
        }
    }

    #[test]
    fn neox_and_gptj_disagree_at_nonzero_positions() {
        let cache = cache(8, 16);
        let (cos, sin) = cache.row(3).unwrap();
        let base: Vec<f32> = (0..8).map(|i| (i + 1) as f32).collect();
        let mut neox = base.clone();
        let mut gptj = base;
        rotate_token(&mut neox, cos, sin, true);
        rotate_token(&mut gptj, cos, sin, false);
        assert_ne!(neox, gptj);
    }

    #[test]
    fn position_zero_is_identity() {
        let cache = cache(8, 4);
        let (cos, sin) = cache.row(0).unwrap();
        let base: Vec<f32> = (0..8).map(|i| i as f32 * 1.7).collect();
        let mut rotated = base.clone();
        rotate_token(&mut rotated, cos, sin, true);
        for (a, b) in base.iter().zip(&rotated) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn pass_through_tail_is_bit_identical() {
        let cache = cache(8, 16);
        let head_size = 12; // rotary_dim 8, tail 4
        let mut buf: Vec<f32> = (0..2 * head_size).map(|i| i as f32 * 0.11).collect();
        let tail_before: Vec<u32> = buf
            .iter()
            .enumerate()
            .filter(|(i, _)| i % head_size >= 8)
            .map(|(_, v)| v.to_bits())
            .collect();
        apply_rows_f32(&cache, &[3, 7], head_size, 8, true, &mut buf).unwrap();
        let tail_after: Vec<u32> = buf
            .iter()
            .enumerate()
            .filter(|(i, _)| i % head_size >= 8)
            .map(|(_, v)| v.to_bits())
            .collect();
        assert_eq!(tail_before, tail_after);
    }

    #[test]
    fn buffer_shape_mismatch_is_fatal() {
        let cache = cache(8, 16);
        let mut buf = vec![0.0f32; 10];
        let err = apply_rows_f32(&cache, &[0], 8, 8, true, &mut buf).unwrap_err();
        assert!(matches!(err, RopeError::ShapeMismatch { len: 10, .. }));
    }

    #[test]
    fn selected_provider_matches_scalar_when_accelerated() {
        let kernel = rotation_kernel();
        let cache = cache(32, 8);
        let (cos, sin) = cache.row(6).unwrap();
        let base: Vec<f32> = (0..32).map(|i| (i as f32 * 0.37).sin()).collect();

        let mut fast = base.clone();
        kernel.rotate(&mut fast, cos, sin, true);

        let mut portable = base;
        rotate_token(&mut portable, cos, sin, true);

        for (a, b) in fast.iter().zip(&portable) {
            assert!(
                (a - b).abs() < 1e-5,
                "{} kernel diverged from scalar: {a} vs {b}",
                kernel.selected_name()
            );
        }
    }

    #[test]
    fn f16_path_matches_f32_within_half_precision() {
        let cache = cache(8, 16);
        let head_size = 8;
        let base: Vec<f32> = (0..head_size).map(|i| i as f32 * 0.25 - 0.5).collect();

        let mut full = base.clone();
        apply_rows_f32(&cache, &[2], head_size, 8, true, &mut full).unwrap();

        let mut half_buf: Vec<f16> = base.iter().map(|&v| f16::from_f32(v)).collect();
        apply_rows_f16(&cache, &[2], head_size, 8, true, &mut half_buf).unwrap();

        for (a, b) in full.iter().zip(&half_buf) {
            assert!((a - b.to_f32()).abs() < 1e-2, "{a} vs {}", b.to_f32());
        }
    }
}
