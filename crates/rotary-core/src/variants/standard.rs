//! The single-table rotary embedding family: unscaled default plus every
//! scaling scheme that still resolves positions through one cos/sin table
//! (NTK, dynamic NTK, YaRN, Deepseek-YaRN, Llama 3).

use half::f16;
use rotary_common::{DType, Result};
use tracing::debug;

use crate::apply::{apply_rows_f16, apply_rows_f32};
use crate::cache::CosSinCache;
use crate::freq::{
    compute_inv_freq, llama3_scale_inv_freq, ntk_exponent, validate_basis, yarn_find_correction_range,
    yarn_get_mscale, yarn_scale_inv_freq,
};

/// YaRN construction parameters with the conventional defaults filled in by
/// the configuration layer.
#[derive(Debug, Clone, Copy)]
pub struct YarnParams {
    pub factor: f64,
    pub original_max_position: usize,
    pub extrapolation_factor: f64,
    pub attn_factor: f64,
    pub beta_fast: f64,
    pub beta_slow: f64,
}

/// Deepseek YaRN adds the two-sided magnitude correction exponents.
#[derive(Debug, Clone, Copy)]
pub struct DeepseekYarnParams {
    pub yarn: YarnParams,
    pub mscale: f64,
    pub mscale_all_dim: f64,
}

/// Llama 3 wavelength-blend construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct Llama3Params {
    pub factor: f64,
    pub low_freq_factor: f64,
    pub high_freq_factor: f64,
    pub original_max_position: usize,
}

/// Rotary embedding backed by a single position-indexed cache.
#[derive(Debug)]
pub struct RotaryEmbedding {
    head_size: usize,
    rotary_dim: usize,
    is_neox_style: bool,
    dtype: DType,
    cache: CosSinCache,
}

impl RotaryEmbedding {
    /// Unscaled rotary embedding, one cache row per position.
    pub fn new(
        head_size: usize,
        rotary_dim: usize,
        max_position: usize,
        base: f64,
        is_neox_style: bool,
        dtype: DType,
    ) -> Result<Self> {
        validate_basis(base, head_size, rotary_dim)?;
        let inv_freq = compute_inv_freq(base, rotary_dim);
        let cache = CosSinCache::from_positions(&inv_freq, (0..max_position).map(|p| p as f64), 1.0);
        Ok(Self {
            head_size,
            rotary_dim,
            is_neox_style,
            dtype,
            cache,
        })
    }

    /// Fixed NTK scaling. Without `mixed_b` the base is multiplied by the
    /// factor and the resulting frequencies divided by `factor^(2/dim)`;
    /// with `mixed_b` each dimension gets its own exponential correction
    /// `exp(ln(factor) / (dim/2)^b * i^b)` for `i` in `1..=dim/2`.
    pub fn new_ntk(
        head_size: usize,
        rotary_dim: usize,
        max_position: usize,
        base: f64,
        is_neox_style: bool,
        dtype: DType,
        factor: f64,
        mixed_b: Option<f64>,
    ) -> Result<Self> {
        validate_basis(base, head_size, rotary_dim)?;
        let inv_freq = match mixed_b {
            None => {
                let mut inv_freq = compute_inv_freq(base * factor, rotary_dim);
                let correction = factor.powf(2.0 / rotary_dim as f64) as f32;
                for f in inv_freq.iter_mut() {
                    *f /= correction;
                }
                inv_freq
            }
            Some(b) => {
                let mut inv_freq = compute_inv_freq(base, rotary_dim);
                let a = factor.ln() / (rotary_dim as f64 / 2.0).powf(b);
                for (i, f) in inv_freq.iter_mut().enumerate() {
                    let lambda = (a * ((i + 1) as f64).powf(b)).exp();
                    *f = (*f as f64 / lambda) as f32;
                }
                inv_freq
            }
        };
        let cache = CosSinCache::from_positions(&inv_freq, (0..max_position).map(|p| p as f64), 1.0);
        Ok(Self {
            head_size,
            rotary_dim,
            is_neox_style,
            dtype,
            cache,
        })
    }

    /// Dynamic NTK with an explicit interpolation factor. The table covers
    /// the extended window `max_position * factor` and the base is rescaled
    /// once for that full extent.
    pub fn new_dynamic_factor(
        head_size: usize,
        rotary_dim: usize,
        max_position: usize,
        base: f64,
        is_neox_style: bool,
        dtype: DType,
        factor: f64,
    ) -> Result<Self> {
        validate_basis(base, head_size, rotary_dim)?;
        let max_len = (max_position as f64 * factor) as usize;
        let rescaled = base
            * ((factor * max_len as f64 / max_position as f64) - (factor - 1.0))
                .powf(ntk_exponent(rotary_dim));
        debug!(base, rescaled, max_len, "dynamic ntk base rescale");
        let inv_freq = compute_inv_freq(rescaled, rotary_dim);
        let cache = CosSinCache::from_positions(&inv_freq, (0..max_len).map(|p| p as f64), 1.0);
        Ok(Self {
            head_size,
            rotary_dim,
            is_neox_style,
            dtype,
            cache,
        })
    }

    /// Dynamic NTK parameterized by `alpha`: the base is multiplied by
    /// `alpha^(dim/(dim-2))` and the table keeps its original extent.
    pub fn new_dynamic_alpha(
        head_size: usize,
        rotary_dim: usize,
        max_position: usize,
        base: f64,
        is_neox_style: bool,
        dtype: DType,
        alpha: f64,
    ) -> Result<Self> {
        validate_basis(base, head_size, rotary_dim)?;
        let rescaled = base * alpha.powf(ntk_exponent(rotary_dim));
        debug!(base, rescaled, alpha, "dynamic ntk alpha rescale");
        let inv_freq = compute_inv_freq(rescaled, rotary_dim);
        let cache = CosSinCache::from_positions(&inv_freq, (0..max_position).map(|p| p as f64), 1.0);
        Ok(Self {
            head_size,
            rotary_dim,
            is_neox_style,
            dtype,
            cache,
        })
    }

    /// YaRN. The table spans `original_max * factor` rows and every entry is
    /// premultiplied by the magnitude correction.
    pub fn new_yarn(
        head_size: usize,
        rotary_dim: usize,
        base: f64,
        is_neox_style: bool,
        dtype: DType,
        params: YarnParams,
    ) -> Result<Self> {
        validate_basis(base, head_size, rotary_dim)?;
        let mscale =
            (yarn_get_mscale(params.factor, 1.0) * params.attn_factor) as f32;
        let cache = Self::yarn_cache(rotary_dim, base, params, mscale);
        Ok(Self {
            head_size,
            rotary_dim,
            is_neox_style,
            dtype,
            cache,
        })
    }

    /// YaRN with Deepseek's magnitude-correction ratio in place of the plain
    /// mscale.
    pub fn new_deepseek_yarn(
        head_size: usize,
        rotary_dim: usize,
        base: f64,
        is_neox_style: bool,
        dtype: DType,
        params: DeepseekYarnParams,
    ) -> Result<Self> {
        validate_basis(base, head_size, rotary_dim)?;
        let mscale = (yarn_get_mscale(params.yarn.factor, params.mscale)
            / yarn_get_mscale(params.yarn.factor, params.mscale_all_dim)
            * params.yarn.attn_factor) as f32;
        let cache = Self::yarn_cache(rotary_dim, base, params.yarn, mscale);
        Ok(Self {
            head_size,
            rotary_dim,
            is_neox_style,
            dtype,
            cache,
        })
    }

    fn yarn_cache(rotary_dim: usize, base: f64, params: YarnParams, mscale: f32) -> CosSinCache {
        let mut inv_freq = compute_inv_freq(base, rotary_dim);
        let (low, high) = yarn_find_correction_range(
            params.beta_fast,
            params.beta_slow,
            rotary_dim,
            base,
            params.original_max_position,
        );
        yarn_scale_inv_freq(
            &mut inv_freq,
            params.factor,
            params.extrapolation_factor,
            low,
            high,
        );
        let rows = (params.original_max_position as f64 * params.factor) as usize;
        debug!(rows, mscale, low, high, "yarn cache");
        CosSinCache::from_positions(&inv_freq, (0..rows).map(|p| p as f64), mscale)
    }

    /// Llama 3 wavelength-banded blend over an unextended table.
    pub fn new_llama3(
        head_size: usize,
        rotary_dim: usize,
        max_position: usize,
        base: f64,
        is_neox_style: bool,
        dtype: DType,
        params: Llama3Params,
    ) -> Result<Self> {
        validate_basis(base, head_size, rotary_dim)?;
        let mut inv_freq = compute_inv_freq(base, rotary_dim);
        llama3_scale_inv_freq(
            &mut inv_freq,
            params.factor,
            params.low_freq_factor,
            params.high_freq_factor,
            params.original_max_position,
        );
        let cache = CosSinCache::from_positions(&inv_freq, (0..max_position).map(|p| p as f64), 1.0);
        Ok(Self {
            head_size,
            rotary_dim,
            is_neox_style,
            dtype,
            cache,
        })
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }

    pub fn is_neox_style(&self) -> bool {
        self.is_neox_style
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn cache(&self) -> &CosSinCache {
        &self.cache
    }

    /// Rotate query (and optionally key) in place, one cache row per token.
    pub fn apply(
        &self,
        positions: &[usize],
        query: &mut [f32],
        key: Option<&mut [f32]>,
    ) -> Result<()> {
        self.apply_rows(positions, query, key)
    }

    /// Half-precision sibling of [`RotaryEmbedding::apply`].
    pub fn apply_f16(
        &self,
        positions: &[usize],
        query: &mut [f16],
        key: Option<&mut [f16]>,
    ) -> Result<()> {
        apply_rows_f16(
            &self.cache,
            positions,
            self.head_size,
            self.rotary_dim,
            self.is_neox_style,
            query,
        )?;
        if let Some(key) = key {
            apply_rows_f16(
                &self.cache,
                positions,
                self.head_size,
                self.rotary_dim,
                self.is_neox_style,
                key,
            )?;
        }
        Ok(())
    }

    /// Row-index application shared with offsetting wrappers (linear scaling
    /// sub-tables, long-context region selection).
    pub(crate) fn apply_rows(
        &self,
        rows: &[usize],
        query: &mut [f32],
        key: Option<&mut [f32]>,
    ) -> Result<()> {
        apply_rows_f32(
            &self.cache,
            rows,
            self.head_size,
            self.rotary_dim,
            self.is_neox_style,
            query,
        )?;
        if let Some(key) = key {
            apply_rows_f32(
                &self.cache,
                rows,
                self.head_size,
                self.rotary_dim,
                self.is_neox_style,
                key,
            )?;
        }
        Ok(())
    }
}
