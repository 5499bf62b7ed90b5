//! 2-D patch-grid rotary embedding for the Llama 4 vision encoder.
//!
//! The table is indexed by flattened patch position rather than sequence
//! position: patch `idx` sits at grid coordinate `(x, y) = (idx % side,
//! idx / side)` and its row holds the angles `[(x+1)·inv_freq | (y+1)·inv_freq]`.
//! One extra row at the end is the class-token sentinel with all-zero
//! frequencies, so the class token passes through unrotated. Rotation is
//! applied pairwise over the full head: `head_size / 2` complex lanes.

use rotary_common::{DType, Result};
use tracing::debug;

use crate::apply::{heads_in_buffer, rotation_kernel};
use crate::cache::CosSinCache;
use crate::freq::{compute_inv_freq, validate_basis};

#[derive(Debug)]
pub struct VisionRotaryEmbedding {
    head_size: usize,
    /// Number of complex lanes per head, `head_size / 2`.
    rotary_dim: usize,
    dtype: DType,
    cache: CosSinCache,
}

impl VisionRotaryEmbedding {
    /// `num_patches` is the flattened square grid size,
    /// `(image_size / patch_size)^2`.
    pub fn new(
        head_size: usize,
        rotary_dim: usize,
        num_patches: usize,
        base: f64,
        dtype: DType,
    ) -> Result<Self> {
        // the full head rotates pairwise, so the rotated width is twice the
        // lane count
        validate_basis(base, head_size, 2 * rotary_dim)?;
        let inv_freq = compute_inv_freq(base, rotary_dim);
        let side = (num_patches as f64).sqrt() as usize;

        let patch_row = |idx: usize| -> Vec<f32> {
            let x = (idx % side) as f32 + 1.0;
            let y = (idx / side) as f32 + 1.0;
            let mut angles = Vec::with_capacity(rotary_dim);
            angles.extend(inv_freq.iter().map(|&f| x * f));
            angles.extend(inv_freq.iter().map(|&f| y * f));
            angles
        };
        let rows = (0..num_patches)
            .map(patch_row)
            .chain(std::iter::once(vec![0.0; rotary_dim]));
        let cache = CosSinCache::from_angle_rows(rotary_dim, rows);
        debug!(num_patches, side, "vision patch-grid cache");

        Ok(Self {
            head_size,
            rotary_dim,
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

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn cache(&self) -> &CosSinCache {
        &self.cache
    }

    /// Total tokens the cache expects per image: the patches plus the class
    /// token.
    pub fn num_tokens(&self) -> usize {
        self.cache.rows()
    }

    /// Rotate a full image's worth of tokens. Token order is patch order
    /// with the class token last; the buffers must therefore hold exactly
    /// `num_tokens()` tokens.
    pub fn apply(&self, query: &mut [f32], key: Option<&mut [f32]>) -> Result<()> {
        self.apply_buffer(query)?;
        if let Some(key) = key {
            self.apply_buffer(key)?;
        }
        Ok(())
    }

    fn apply_buffer(&self, buf: &mut [f32]) -> Result<()> {
        let num_tokens = self.cache.rows();
        let heads = heads_in_buffer(buf.len(), num_tokens, self.head_size)?;
        let kernel = rotation_kernel();
        for token in 0..num_tokens {
            let (cos, sin) = self.cache.row(token)?;
            for head in 0..heads {
                let start = (token * heads + head) * self.head_size;
                let chunk = &mut buf[start..start + self.head_size];
                // pairwise complex rotation across the whole head
                kernel.rotate(chunk, cos, sin, false);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotary_common::RopeError;

    fn rope() -> VisionRotaryEmbedding {
        // 4 patches (2x2 grid), head_size 8 -> 4 complex lanes
        VisionRotaryEmbedding::new(8, 4, 4, 10_000.0, DType::F32).unwrap()
    }

    #[test]
    fn table_has_sentinel_row() {
        let rope = rope();
        assert_eq!(rope.num_tokens(), 5);
        let (cos, sin) = rope.cache().row(4).unwrap();
        assert!(cos.iter().all(|&c| (c - 1.0).abs() < 1e-7));
        assert!(sin.iter().all(|&s| s.abs() < 1e-7));
    }

    #[test]
    fn grid_coordinates_drive_angles() {
        let rope = rope();
        let inv_freq = compute_inv_freq(10_000.0, 4);
        // patch 3 in a 2x2 grid is (x, y) = (1, 1), so both halves use
        // coordinate factor 2
        let (cos, _) = rope.cache().row(3).unwrap();
        for (i, &f) in inv_freq.iter().enumerate() {
            let expected = (2.0 * f).cos();
            assert!((cos[i] - expected).abs() < 1e-6, "x half lane {i}");
            assert!((cos[inv_freq.len() + i] - expected).abs() < 1e-6, "y half lane {i}");
        }
    }

    #[test]
    fn class_token_passes_through() {
        let rope = rope();
        let mut buf: Vec<f32> = (0..5 * 8).map(|i| i as f32 * 0.1).collect();
        let class_before: Vec<f32> = buf[4 * 8..].to_vec();
        rope.apply(&mut buf, None).unwrap();
        let class_after: Vec<f32> = buf[4 * 8..].to_vec();
        for (a, b) in class_before.iter().zip(&class_after) {
            assert!((a - b).abs() < 1e-6);
        }
        // patch tokens did rotate
        assert!(buf[8..16].iter().zip(8..16).any(|(v, i)| (v - i as f32 * 0.1).abs() > 1e-4));
    }

    #[test]
    fn wrong_token_count_is_rejected() {
        let rope = rope();
        let mut buf = vec![0.0f32; 4 * 8]; // missing the class token row
        assert!(matches!(
            rope.apply(&mut buf, None),
            Err(RopeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn rotation_preserves_norm_per_head() {
        let rope = rope();
        let mut buf: Vec<f32> = (0..5 * 8).map(|i| (i as f32 * 0.7).sin()).collect();
        let before: Vec<f32> = buf
            .chunks(8)
            .map(|head| head.iter().map(|v| v * v).sum::<f32>().sqrt())
            .collect();
        rope.apply(&mut buf, None).unwrap();
        let after: Vec<f32> = buf
            .chunks(8)
            .map(|head| head.iter().map(|v| v * v).sum::<f32>().sqrt())
            .collect();
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-4);
        }
    }
}
