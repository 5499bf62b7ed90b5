//! Position-interpolation ("linear") scaling with one sub-table per factor.
//!
//! Each factor `f` contributes `max_position * f` rows built over
//! `t = position / f`; the sub-tables are stacked in factor order and an
//! offset map locates each factor's region, so batches mixing adapters with
//! different context extensions share one cache.

use std::collections::HashMap;

use half::f16;
use rotary_common::{DType, Result};
use tracing::debug;

use crate::apply::{apply_rows_f16, apply_rows_f32};
use crate::cache::CosSinCache;
use crate::freq::{compute_inv_freq, validate_basis};

#[derive(Debug)]
pub struct LinearScalingRotaryEmbedding {
    head_size: usize,
    rotary_dim: usize,
    is_neox_style: bool,
    dtype: DType,
    cache: CosSinCache,
    scaling_factors: Vec<f64>,
    /// Factor (as bit pattern, factors are exact config values) to the row
    /// offset of its sub-table.
    factor_to_offset: HashMap<u64, usize>,
}

impl LinearScalingRotaryEmbedding {
    pub fn new(
        head_size: usize,
        rotary_dim: usize,
        max_position: usize,
        base: f64,
        is_neox_style: bool,
        dtype: DType,
        scaling_factors: Vec<f64>,
    ) -> Result<Self> {
        validate_basis(base, head_size, rotary_dim)?;
        let inv_freq = compute_inv_freq(base, rotary_dim);

        let mut parts = Vec::with_capacity(scaling_factors.len());
        let mut factor_to_offset = HashMap::with_capacity(scaling_factors.len());
        let mut offset = 0usize;
        for &factor in &scaling_factors {
            let rows = (max_position as f64 * factor) as usize;
            let part = CosSinCache::from_positions(
                &inv_freq,
                (0..rows).map(|p| p as f64 / factor),
                1.0,
            );
            factor_to_offset.insert(factor.to_bits(), offset);
            offset += rows;
            parts.push(part);
        }
        debug!(
            factors = scaling_factors.len(),
            total_rows = offset,
            "linear scaling cache"
        );

        Ok(Self {
            head_size,
            rotary_dim,
            is_neox_style,
            dtype,
            cache: CosSinCache::concat(parts),
            scaling_factors,
            factor_to_offset,
        })
    }

    pub fn scaling_factors(&self) -> &[f64] {
        &self.scaling_factors
    }

    /// Row offset of a factor's sub-table, if that factor was configured.
    pub fn offset_for_factor(&self, factor: f64) -> Option<usize> {
        self.factor_to_offset.get(&factor.to_bits()).copied()
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

    /// Rotate against the first configured factor's sub-table.
    pub fn apply(
        &self,
        positions: &[usize],
        query: &mut [f32],
        key: Option<&mut [f32]>,
    ) -> Result<()> {
        self.apply_with_offset(0, positions, query, key)
    }

    /// Rotate with an explicit row offset from [`Self::offset_for_factor`].
    pub fn apply_with_offset(
        &self,
        offset: usize,
        positions: &[usize],
        query: &mut [f32],
        key: Option<&mut [f32]>,
    ) -> Result<()> {
        let rows: Vec<usize> = positions.iter().map(|&p| p + offset).collect();
        apply_rows_f32(
            &self.cache,
            &rows,
            self.head_size,
            self.rotary_dim,
            self.is_neox_style,
            query,
        )?;
        if let Some(key) = key {
            apply_rows_f32(
                &self.cache,
                &rows,
                self.head_size,
                self.rotary_dim,
                self.is_neox_style,
                key,
            )?;
        }
        Ok(())
    }

    pub fn apply_f16(
        &self,
        positions: &[usize],
        query: &mut [f16],
        key: Option<&mut [f16]>,
    ) -> Result<()> {
        self.apply_with_offset_f16(0, positions, query, key)
    }

    /// Half-precision sibling of [`Self::apply_with_offset`].
    pub fn apply_with_offset_f16(
        &self,
        offset: usize,
        positions: &[usize],
        query: &mut [f16],
        key: Option<&mut [f16]>,
    ) -> Result<()> {
        let rows: Vec<usize> = positions.iter().map(|&p| p + offset).collect();
        apply_rows_f16(
            &self.cache,
            &rows,
            self.head_size,
            self.rotary_dim,
            self.is_neox_style,
            query,
        )?;
        if let Some(key) = key {
            apply_rows_f16(
                &self.cache,
                &rows,
                self.head_size,
                self.rotary_dim,
                self.is_neox_style,
                key,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rope(factors: Vec<f64>) -> LinearScalingRotaryEmbedding {
        LinearScalingRotaryEmbedding::new(8, 8, 16, 10_000.0, true, DType::F32, factors).unwrap()
    }

    #[test]
    fn sub_tables_stack_with_cumulative_offsets() {
        let rope = rope(vec![1.0, 2.0, 4.0]);
        assert_eq!(rope.cache().rows(), 16 + 32 + 64);
        assert_eq!(rope.offset_for_factor(1.0), Some(0));
        assert_eq!(rope.offset_for_factor(2.0), Some(16));
        assert_eq!(rope.offset_for_factor(4.0), Some(48));
        assert_eq!(rope.offset_for_factor(8.0), None);
    }

    #[test]
    fn factor_region_interpolates_positions() {
        let rope = rope(vec![1.0, 2.0]);
        // in the factor-2 region, row (offset + 2) encodes t = 1.0, which
        // must equal row 1 of the unscaled region
        let offset = rope.offset_for_factor(2.0).unwrap();
        let (unscaled_cos, unscaled_sin) = rope.cache().row(1).unwrap();
        let (scaled_cos, scaled_sin) = rope.cache().row(offset + 2).unwrap();
        for (a, b) in unscaled_cos.iter().zip(scaled_cos) {
            assert!((a - b).abs() < 1e-6);
        }
        for (a, b) in unscaled_sin.iter().zip(scaled_sin) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn single_factor_behaves_like_scalar_config() {
        let rope = rope(vec![2.0]);
        assert_eq!(rope.scaling_factors(), &[2.0]);
        assert_eq!(rope.cache().rows(), 32);
        assert_eq!(rope.offset_for_factor(2.0), Some(0));
    }

    #[test]
    fn f16_apply_with_offset_matches_f32_region() {
        let rope = rope(vec![1.0, 2.0]);
        let base: Vec<f32> = (0..8).map(|i| i as f32 * 0.25 - 0.5).collect();
        let offset = rope.offset_for_factor(2.0).unwrap();

        let mut full = base.clone();
        rope.apply_with_offset(offset, &[3], &mut full, None).unwrap();

        let mut half_buf: Vec<f16> = base.iter().map(|&v| f16::from_f32(v)).collect();
        rope.apply_with_offset_f16(offset, &[3], &mut half_buf, None)
            .unwrap();

        for (a, b) in full.iter().zip(&half_buf) {
            assert!((a - b.to_f32()).abs() < 1e-2);
        }
    }

    #[test]
    fn apply_with_offset_selects_region() {
        let rope = rope(vec![1.0, 2.0]);
        let base: Vec<f32> = (0..8).map(|i| i as f32 * 0.3).collect();

        let mut unscaled = base.clone();
        rope.apply_with_offset(0, &[1], &mut unscaled, None).unwrap();

        // factor-2 region at doubled raw position matches the unscaled row
        let offset = rope.offset_for_factor(2.0).unwrap();
        let mut scaled = base;
        rope.apply_with_offset(offset, &[2], &mut scaled, None).unwrap();

        for (a, b) in unscaled.iter().zip(&scaled) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
