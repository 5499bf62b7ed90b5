//! Three-axis multimodal rotary embedding (apply side).
//!
//! Text positions stay scalar; vision positions carry separate temporal,
//! height, and width indices. `mrope_section` splits the frequency dimensions
//! into three contiguous bands, and each band reads its cos/sin values from
//! its own axis. The table is over-allocated to four times the context window
//! because video temporal indices can run past the sequence length.

use half::f16;
use rotary_common::{DType, MultimodalPositions, Result, RopeError};
use tracing::debug;

use crate::apply::{apply_rows_f16, apply_rows_f32, heads_in_buffer, rotation_kernel};
use crate::cache::CosSinCache;
use crate::freq::{compute_inv_freq, validate_basis};

#[derive(Debug)]
pub struct MRotaryEmbedding {
    head_size: usize,
    rotary_dim: usize,
    is_neox_style: bool,
    dtype: DType,
    cache: CosSinCache,
    mrope_section: Vec<usize>,
}

impl MRotaryEmbedding {
    pub fn new(
        head_size: usize,
        rotary_dim: usize,
        max_position: usize,
        base: f64,
        is_neox_style: bool,
        dtype: DType,
        mrope_section: Vec<usize>,
    ) -> Result<Self> {
        validate_basis(base, head_size, rotary_dim)?;
        if mrope_section.len() != 3 {
            return Err(RopeError::InvalidMropeSectionCount {
                got: mrope_section.len(),
            });
        }
        let expected = rotary_dim / 2;
        let got = mrope_section.iter().sum::<usize>();
        if got != expected {
            return Err(RopeError::InvalidMropeSection { expected, got });
        }

        let inv_freq = compute_inv_freq(base, rotary_dim);
        let rows = 4 * max_position;
        debug!(rows, sections = ?mrope_section, "mrope cache");
        let cache = CosSinCache::from_positions(&inv_freq, (0..rows).map(|p| p as f64), 1.0);
        Ok(Self {
            head_size,
            rotary_dim,
            is_neox_style,
            dtype,
            cache,
            mrope_section,
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

    pub fn mrope_section(&self) -> &[usize] {
        &self.mrope_section
    }

    /// Scalar-position path: every axis carries the same index, so the table
    /// is read directly like a plain rotary embedding.
    pub fn apply_flat(
        &self,
        positions: &[usize],
        query: &mut [f32],
        key: Option<&mut [f32]>,
    ) -> Result<()> {
        apply_rows_f32(
            &self.cache,
            positions,
            self.head_size,
            self.rotary_dim,
            self.is_neox_style,
            query,
        )?;
        if let Some(key) = key {
            apply_rows_f32(
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

    pub fn apply_flat_f16(
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

    /// Three-axis path. Per token, frequency band `i` reads its cos/sin
    /// slice from the row indexed by that token's axis-`i` position.
    pub fn apply_multimodal(
        &self,
        positions: &MultimodalPositions,
        query: &mut [f32],
        mut key: Option<&mut [f32]>,
    ) -> Result<()> {
        // Flat streams short-circuit to the scalar path.
        if positions.is_flat() {
            return self.apply_flat(&positions.t, query, key);
        }

        let half_dim = self.cache.half_dim();
        let num_tokens = positions.len();
        let mut cos = vec![0.0f32; half_dim];
        let mut sin = vec![0.0f32; half_dim];

        let q_heads = heads_in_buffer(query.len(), num_tokens, self.head_size)?;
        let k_heads = match &key {
            Some(key) => Some(heads_in_buffer(key.len(), num_tokens, self.head_size)?),
            None => None,
        };
        let kernel = rotation_kernel();

        for token in 0..num_tokens {
            let axes = [positions.t[token], positions.h[token], positions.w[token]];
            let mut offset = 0;
            for (section, &axis_pos) in self.mrope_section.iter().zip(&axes) {
                let (row_cos, row_sin) = self.cache.row(axis_pos)?;
                cos[offset..offset + section].copy_from_slice(&row_cos[offset..offset + section]);
                sin[offset..offset + section].copy_from_slice(&row_sin[offset..offset + section]);
                offset += section;
            }

            for head in 0..q_heads {
                let start = (token * q_heads + head) * self.head_size;
                let chunk = &mut query[start..start + self.rotary_dim];
                kernel.rotate(chunk, &cos, &sin, self.is_neox_style);
            }
            if let (Some(key), Some(k_heads)) = (key.as_deref_mut(), k_heads) {
                for head in 0..k_heads {
                    let start = (token * k_heads + head) * self.head_size;
                    let chunk = &mut key[start..start + self.rotary_dim];
                    kernel.rotate(chunk, &cos, &sin, self.is_neox_style);
                }
            }
        }
        Ok(())
    }
}
