//! Precomputed cos/sin lookup tables.
//!
//! A cache is a flat row-major table: one row per absolute position, each row
//! the cosine half followed by the sine half. Rows are built once in `f32` at
//! construction and are immutable afterwards; a half-precision view is
//! materialized lazily the first time an `f16` consumer asks for it.

use std::sync::OnceLock;

use half::f16;
use rotary_common::{Result, RopeError};
use tracing::debug;

/// Position-indexed cos/sin table.
#[derive(Debug)]
pub struct CosSinCache {
    half_dim: usize,
    rows: usize,
    /// `rows * 2 * half_dim` values, per row `[cos .. | sin ..]`.
    data: Vec<f32>,
    data_f16: OnceLock<Vec<f16>>,
}

impl CosSinCache {
    /// Build from an inverse-frequency vector and a position sequence.
    ///
    /// Every angle is `position * inv_freq[i]`; `mscale` premultiplies the
    /// stored cos/sin values (1.0 for unscaled schemes).
    pub fn from_positions<I>(inv_freq: &[f32], positions: I, mscale: f32) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let half_dim = inv_freq.len();
        let mut data = Vec::new();
        let mut rows = 0;
        for pos in positions {
            for &freq in inv_freq {
                data.push((pos * freq as f64).cos() as f32 * mscale);
            }
            for &freq in inv_freq {
                data.push((pos * freq as f64).sin() as f32 * mscale);
            }
            rows += 1;
        }
        debug!(rows, half_dim, "built cos/sin cache");
        Self {
            half_dim,
            rows,
            data,
            data_f16: OnceLock::new(),
        }
    }

    /// Build from explicit per-row angle vectors (vision patch grids, where
    /// the row index is a flattened 2-D coordinate rather than a position).
    pub fn from_angle_rows<I>(half_dim: usize, angle_rows: I) -> Self
    where
        I: IntoIterator<Item = Vec<f32>>,
    {
        let mut data = Vec::new();
        let mut rows = 0;
        for angles in angle_rows {
            debug_assert_eq!(angles.len(), half_dim);
            for &a in &angles {
                data.push(a.cos());
            }
            for &a in &angles {
                data.push(a.sin());
            }
            rows += 1;
        }
        debug!(rows, half_dim, "built cos/sin cache from angle rows");
        Self {
            half_dim,
            rows,
            data,
            data_f16: OnceLock::new(),
        }
    }

    /// Concatenate caches row-wise. All parts must share `half_dim`.
    pub fn concat(parts: Vec<CosSinCache>) -> Self {
        debug_assert!(!parts.is_empty());
        let half_dim = parts[0].half_dim;
        let mut data = Vec::new();
        let mut rows = 0;
        for part in parts {
            debug_assert_eq!(part.half_dim, half_dim);
            rows += part.rows;
            data.extend(part.data);
        }
        Self {
            half_dim,
            rows,
            data,
            data_f16: OnceLock::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn half_dim(&self) -> usize {
        self.half_dim
    }

    /// Cos and sin halves for one position. Out-of-bounds positions are a
    /// fatal error, never a wrap.
    pub fn row(&self, position: usize) -> Result<(&[f32], &[f32])> {
        if position >= self.rows {
            return Err(RopeError::PositionOutOfBounds {
                position,
                rows: self.rows,
            });
        }
        let stride = 2 * self.half_dim;
        let start = position * stride;
        let cos = &self.data[start..start + self.half_dim];
        let sin = &self.data[start + self.half_dim..start + stride];
        Ok((cos, sin))
    }

    /// Half-precision view of the table, converted once on first use.
    ///
    /// The conversion is idempotent: concurrent callers converge on a single
    /// materialization and later calls return the same buffer.
    pub fn materialize_f16(&self) -> &[f16] {
        self.data_f16
            .get_or_init(|| self.data.iter().map(|&v| f16::from_f32(v)).collect())
    }

    /// Cos and sin halves at half precision for one position.
    pub fn row_f16(&self, position: usize) -> Result<(&[f16], &[f16])> {
        if position >= self.rows {
            return Err(RopeError::PositionOutOfBounds {
                position,
                rows: self.rows,
            });
        }
        let table = self.materialize_f16();
        let stride = 2 * self.half_dim;
        let start = position * stride;
        let cos = &table[start..start + self.half_dim];
        let sin = &table[start + self.half_dim..start + stride];
        Ok((cos, sin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freq::compute_inv_freq;

    fn default_cache(dim: usize, max_pos: usize) -> CosSinCache {
        let inv_freq = compute_inv_freq(10_000.0, dim);
        CosSinCache::from_positions(&inv_freq, (0..max_pos).map(|p| p as f64), 1.0)
    }

    #[test]
    fn row_zero_is_identity() {
        let cache = default_cache(8, 4);
        let (cos, sin) = cache.row(0).unwrap();
        assert!(cos.iter().all(|&c| (c - 1.0).abs() < 1e-7));
        assert!(sin.iter().all(|&s| s.abs() < 1e-7));
    }

    #[test]
    fn table_shape_matches_config() {
        let cache = default_cache(8, 16);
        assert_eq!(cache.rows(), 16);
        assert_eq!(cache.half_dim(), 4);
    }

    #[test]
    fn trig_identity_holds_per_row() {
        let cache = default_cache(16, 32);
        for pos in 0..32 {
            let (cos, sin) = cache.row(pos).unwrap();
            for (c, s) in cos.iter().zip(sin) {
                let norm = c * c + s * s;
                assert!((norm - 1.0).abs() < 1e-5, "pos {pos}: cos²+sin²={norm}");
            }
        }
    }

    #[test]
    fn out_of_bounds_position_is_fatal() {
        let cache = default_cache(8, 4);
        assert!(matches!(
            cache.row(4),
            Err(RopeError::PositionOutOfBounds { position: 4, rows: 4 })
        ));
    }

    #[test]
    fn f16_materialization_is_idempotent() {
        let cache = default_cache(8, 4);
        let first = cache.materialize_f16().as_ptr();
        let second = cache.materialize_f16().as_ptr();
        assert_eq!(first, second, "second call must reuse the same buffer");
        let (cos, _) = cache.row_f16(0).unwrap();
        assert!(cos.iter().all(|&c| (c.to_f32() - 1.0).abs() < 1e-3));
    }

    #[test]
    fn concat_stacks_rows() {
        let a = default_cache(8, 4);
        let b = default_cache(8, 6);
        let joined = CosSinCache::concat(vec![a, b]);
        assert_eq!(joined.rows(), 10);
        // row 4 of the joined table is row 0 of the second part
        let (cos, sin) = joined.row(4).unwrap();
        assert!(cos.iter().all(|&c| (c - 1.0).abs() < 1e-7));
        assert!(sin.iter().all(|&s| s.abs() < 1e-7));
    }

    #[test]
    fn mscale_premultiplies_values() {
        let inv_freq = compute_inv_freq(10_000.0, 8);
        let cache = CosSinCache::from_positions(&inv_freq, (0..2).map(|p| p as f64), 0.5);
        let (cos, _) = cache.row(0).unwrap();
        assert!(cos.iter().all(|&c| (c - 0.5).abs() < 1e-7));
    }
}
