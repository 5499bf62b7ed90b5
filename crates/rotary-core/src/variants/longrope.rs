//! Dual-regime long-context scaling (the Phi-3 "longrope" family).
//!
//! Two per-dimension rescale-factor lists build two tables: a short one
//! spanning the original context window and a long one spanning the extended
//! window, stacked `[short ++ long]`. The regime is picked per batch: if any
//! position exceeds the original window, every lookup shifts into the long
//! region.

use half::f16;
use rotary_common::{DType, Result, RopeError};
use tracing::debug;

use crate::apply::{apply_rows_f16, apply_rows_f32};
use crate::cache::CosSinCache;
use crate::freq::validate_basis;

#[derive(Debug)]
pub struct LongRopeScaledRotaryEmbedding {
    head_size: usize,
    rotary_dim: usize,
    dtype: DType,
    original_max_position: usize,
    cache: CosSinCache,
    short_mscale: f64,
    long_mscale: f64,
}

impl LongRopeScaledRotaryEmbedding {
    /// Only the half-split convention is supported; the interleaved layout
    /// is rejected as a configuration error.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        head_size: usize,
        rotary_dim: usize,
        max_position: usize,
        original_max_position: usize,
        base: f64,
        is_neox_style: bool,
        dtype: DType,
        short_factor: Vec<f64>,
        long_factor: Vec<f64>,
        short_mscale: Option<f64>,
        long_mscale: Option<f64>,
    ) -> Result<Self> {
        if !is_neox_style {
            return Err(RopeError::NeoxStyleRequired { variant: "longrope" });
        }
        validate_basis(base, head_size, rotary_dim)?;

        let scale = max_position as f64 / original_max_position as f64;
        let default_mscale = if scale <= 1.0 {
            1.0
        } else {
            (1.0 + scale.ln() / (original_max_position as f64).ln()).sqrt()
        };
        let short_mscale = short_mscale.unwrap_or(default_mscale);
        let long_mscale = long_mscale.unwrap_or(default_mscale);
        debug!(short_mscale, long_mscale, "longrope magnitude scales");

        let short = Self::regime_cache(
            base,
            rotary_dim,
            &short_factor,
            original_max_position,
            short_mscale as f32,
        );
        let long = Self::regime_cache(base, rotary_dim, &long_factor, max_position, long_mscale as f32);
        let cache = CosSinCache::concat(vec![short, long]);

        Ok(Self {
            head_size,
            rotary_dim,
            dtype,
            original_max_position,
            cache,
            short_mscale,
            long_mscale,
        })
    }

    /// One regime's table: `inv_freq[i] = 1 / (rescale[i] * base^(2i/dim))`.
    fn regime_cache(
        base: f64,
        rotary_dim: usize,
        rescale_factors: &[f64],
        rows: usize,
        mscale: f32,
    ) -> CosSinCache {
        let inv_freq: Vec<f32> = (0..rotary_dim)
            .step_by(2)
            .zip(rescale_factors)
            .map(|(i, &rescale)| {
                (1.0 / (rescale * base.powf(i as f64 / rotary_dim as f64))) as f32
            })
            .collect();
        CosSinCache::from_positions(&inv_freq, (0..rows).map(|p| p as f64), mscale)
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn cache(&self) -> &CosSinCache {
        &self.cache
    }

    pub fn short_mscale(&self) -> f64 {
        self.short_mscale
    }

    pub fn long_mscale(&self) -> f64 {
        self.long_mscale
    }

    /// Row offset for a batch: the long region starts at `original_max` and
    /// is selected when any position in the batch exceeds that window.
    fn batch_offset(&self, positions: &[usize]) -> usize {
        if positions.iter().any(|&p| p > self.original_max_position) {
            self.original_max_position
        } else {
            0
        }
    }

    pub fn apply(
        &self,
        positions: &[usize],
        query: &mut [f32],
        key: Option<&mut [f32]>,
    ) -> Result<()> {
        let offset = self.batch_offset(positions);
        let rows: Vec<usize> = positions.iter().map(|&p| p + offset).collect();
        apply_rows_f32(&self.cache, &rows, self.head_size, self.rotary_dim, true, query)?;
        if let Some(key) = key {
            apply_rows_f32(&self.cache, &rows, self.head_size, self.rotary_dim, true, key)?;
        }
        Ok(())
    }

    pub fn apply_f16(
        &self,
        positions: &[usize],
        query: &mut [f16],
        key: Option<&mut [f16]>,
    ) -> Result<()> {
        let offset = self.batch_offset(positions);
        let rows: Vec<usize> = positions.iter().map(|&p| p + offset).collect();
        apply_rows_f16(&self.cache, &rows, self.head_size, self.rotary_dim, true, query)?;
        if let Some(key) = key {
            apply_rows_f16(&self.cache, &rows, self.head_size, self.rotary_dim, true, key)?;
        }
        Ok(())
    }
}
