//! Rotary embedding for dual chunk attention.
//!
//! Queries are materialized in five rotations at once, one per attention
//! branch: within-chunk, successive-chunk (clamped), inter-chunk (constant
//! boundary row), and the two critical variants (unclamped successive and
//! chunk-size-shifted inter). Keys use a single modular table indexed by raw
//! position. The query output is therefore five times wider than the input,
//! with the five rotations laid out back to back per head.

use rotary_common::{DType, DualChunkConfig, Result, RopeError};
use tracing::debug;

use crate::apply::{heads_in_buffer, rotation_kernel};
use crate::cache::CosSinCache;
use crate::freq::{compute_inv_freq, validate_basis};

/// Number of query rotations produced per token.
pub const QUERY_BRANCHES: usize = 5;

#[derive(Debug)]
pub struct DualChunkRotaryEmbedding {
    head_size: usize,
    rotary_dim: usize,
    is_neox_style: bool,
    dtype: DType,
    chunk_len: usize,
    /// Within-chunk positions `0..chunk_len`.
    q_cache: CosSinCache,
    /// Successive-chunk positions `chunk_len..`, clamped at `chunk_size`.
    qc_cache: CosSinCache,
    /// Key table over raw positions, modular in `chunk_len`.
    k_cache: CosSinCache,
    /// Successive-chunk positions without the clamp.
    qc_no_clamp_cache: CosSinCache,
    /// Positions shifted by a full `chunk_size`.
    q_inter_cache: CosSinCache,
}

impl DualChunkRotaryEmbedding {
    pub fn new(
        head_size: usize,
        rotary_dim: usize,
        max_position: usize,
        base: f64,
        is_neox_style: bool,
        dtype: DType,
        config: DualChunkConfig,
    ) -> Result<Self> {
        validate_basis(base, head_size, rotary_dim)?;
        if config.chunk_size <= config.local_size {
            return Err(RopeError::InvalidDualChunk {
                chunk_size: config.chunk_size,
                local_size: config.local_size,
            });
        }
        let chunk_len = config.chunk_len();
        let chunk_size = config.chunk_size;
        let inv_freq = compute_inv_freq(base, rotary_dim);

        let positions = |f: &dyn Fn(usize) -> f64, n: usize| -> Vec<f64> {
            (0..n).map(f).collect()
        };
        let q_cache = CosSinCache::from_positions(
            &inv_freq,
            positions(&|i| i as f64, chunk_len),
            1.0,
        );
        let qc_cache = CosSinCache::from_positions(
            &inv_freq,
            positions(&|i| (i + chunk_len).min(chunk_size) as f64, chunk_len),
            1.0,
        );
        let k_cache = CosSinCache::from_positions(
            &inv_freq,
            positions(&|i| (i % chunk_len) as f64, max_position),
            1.0,
        );
        let qc_no_clamp_cache = CosSinCache::from_positions(
            &inv_freq,
            positions(&|i| (i + chunk_len) as f64, chunk_len),
            1.0,
        );
        let q_inter_cache = CosSinCache::from_positions(
            &inv_freq,
            positions(&|i| (i + chunk_size) as f64, chunk_len),
            1.0,
        );
        debug!(chunk_len, chunk_size, max_position, "dual chunk caches");

        Ok(Self {
            head_size,
            rotary_dim,
            is_neox_style,
            dtype,
            chunk_len,
            q_cache,
            qc_cache,
            k_cache,
            qc_no_clamp_cache,
            q_inter_cache,
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

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Rotate keys in place and return the five-branch query expansion.
    ///
    /// The output holds, per token and head, five `head_size` segments in
    /// branch order: within-chunk, successive, inter (boundary row),
    /// successive-critical, inter-critical.
    pub fn apply(
        &self,
        positions: &[usize],
        query: &[f32],
        key: &mut [f32],
    ) -> Result<Vec<f32>> {
        let num_tokens = positions.len();
        let q_heads = heads_in_buffer(query.len(), num_tokens, self.head_size)?;
        let k_heads = heads_in_buffer(key.len(), num_tokens, self.head_size)?;
        let kernel = rotation_kernel();

        // keys: modular table by raw position
        for (token, &pos) in positions.iter().enumerate() {
            let (cos, sin) = self.k_cache.row(pos)?;
            for head in 0..k_heads {
                let start = (token * k_heads + head) * self.head_size;
                let chunk = &mut key[start..start + self.rotary_dim];
                kernel.rotate(chunk, cos, sin, self.is_neox_style);
            }
        }

        let boundary = self.chunk_len - 1;
        let mut out = vec![0.0f32; QUERY_BRANCHES * query.len()];
        for (token, &pos) in positions.iter().enumerate() {
            let local = pos % self.chunk_len;
            let branch_rows = [
                self.q_cache.row(local)?,
                self.qc_cache.row(local)?,
                self.qc_cache.row(boundary)?,
                self.qc_no_clamp_cache.row(local)?,
                self.q_inter_cache.row(local)?,
            ];
            for head in 0..q_heads {
                let src = (token * q_heads + head) * self.head_size;
                let src_chunk = &query[src..src + self.head_size];
                let dst_base = (token * q_heads + head) * QUERY_BRANCHES * self.head_size;
                for (branch, &(cos, sin)) in branch_rows.iter().enumerate() {
                    let dst = dst_base + branch * self.head_size;
                    let dst_chunk = &mut out[dst..dst + self.head_size];
                    dst_chunk.copy_from_slice(src_chunk);
                    kernel.rotate(&mut dst_chunk[..self.rotary_dim], cos, sin, self.is_neox_style);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rope() -> DualChunkRotaryEmbedding {
        let config = DualChunkConfig {
            chunk_size: 8,
            local_size: 2,
        };
        DualChunkRotaryEmbedding::new(8, 8, 64, 10_000.0, true, DType::F32, config).unwrap()
    }

    #[test]
    fn rejects_chunk_not_larger_than_local() {
        let config = DualChunkConfig {
            chunk_size: 4,
            local_size: 4,
        };
        let err = DualChunkRotaryEmbedding::new(8, 8, 64, 10_000.0, true, DType::F32, config)
            .unwrap_err();
        assert!(matches!(
            err,
            RopeError::InvalidDualChunk { chunk_size: 4, local_size: 4 }
        ));
    }

    #[test]
    fn table_extents_follow_chunk_geometry() {
        let rope = rope();
        assert_eq!(rope.chunk_len(), 6);
        assert_eq!(rope.q_cache.rows(), 6);
        assert_eq!(rope.qc_cache.rows(), 6);
        assert_eq!(rope.k_cache.rows(), 64);
        assert_eq!(rope.qc_no_clamp_cache.rows(), 6);
        assert_eq!(rope.q_inter_cache.rows(), 6);
    }

    #[test]
    fn successive_table_clamps_at_chunk_size() {
        let rope = rope();
        // rows 2..6 encode positions 8 (the clamp), so they are identical
        let (cos_a, sin_a) = rope.qc_cache.row(2).unwrap();
        let (cos_b, sin_b) = rope.qc_cache.row(5).unwrap();
        assert_eq!(cos_a, cos_b);
        assert_eq!(sin_a, sin_b);
        // the unclamped table keeps them distinct
        let (nc_a, _) = rope.qc_no_clamp_cache.row(2).unwrap();
        let (nc_b, _) = rope.qc_no_clamp_cache.row(5).unwrap();
        assert_ne!(nc_a, nc_b);
    }

    #[test]
    fn query_output_is_five_branches_wide() {
        let rope = rope();
        let query: Vec<f32> = (0..16).map(|i| i as f32 * 0.2).collect();
        let mut key = query.clone();
        let out = rope.apply(&[1, 9], &query, &mut key).unwrap();
        assert_eq!(out.len(), QUERY_BRANCHES * query.len());
    }

    #[test]
    fn key_uses_modular_positions() {
        let rope = rope();
        let base: Vec<f32> = (0..8).map(|i| i as f32 * 0.3 + 0.1).collect();

        // positions 1 and 7 share 1 % 6 == 7 % 6 for keys
        let mut key_a = base.clone();
        rope.apply(&[1], &base, &mut key_a).unwrap();
        let mut key_b = base.clone();
        rope.apply(&[7], &base, &mut key_b).unwrap();
        for (a, b) in key_a.iter().zip(&key_b) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn inter_branch_is_position_independent() {
        let rope = rope();
        let base: Vec<f32> = (0..8).map(|i| (i as f32 * 0.9).cos()).collect();
        let mut key = base.clone();
        let out_a = rope.apply(&[0], &base, &mut key).unwrap();
        let mut key = base.clone();
        let out_b = rope.apply(&[3], &base, &mut key).unwrap();
        // branch 2 reads the constant boundary row regardless of position
        let inter_a = &out_a[2 * 8..3 * 8];
        let inter_b = &out_b[2 * 8..3 * 8];
        assert_eq!(inter_a, inter_b);
        // branch 0 differs between the two positions
        assert_ne!(&out_a[..8], &out_b[..8]);
    }

    #[test]
    fn within_chunk_branch_matches_plain_rotation() {
        let rope = rope();
        let base: Vec<f32> = (0..8).map(|i| i as f32 * 0.4 - 1.0).collect();
        let mut key = base.clone();
        let out = rope.apply(&[3], &base, &mut key).unwrap();

        let plain = crate::variants::standard::RotaryEmbedding::new(
            8, 8, 64, 10_000.0, true, DType::F32,
        )
        .unwrap();
        let mut expected = base;
        plain.apply(&[3], &mut expected, None).unwrap();
        for (a, b) in out[..8].iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
