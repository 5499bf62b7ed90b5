//! The rotary embedding variant family.

pub mod dual_chunk;
pub mod linear;
pub mod longrope;
pub mod mrope;
pub mod standard;
pub mod vision;

use half::f16;
use rotary_common::{Result, RopeError};

pub use dual_chunk::{DualChunkRotaryEmbedding, QUERY_BRANCHES};
pub use linear::LinearScalingRotaryEmbedding;
pub use longrope::LongRopeScaledRotaryEmbedding;
pub use mrope::MRotaryEmbedding;
pub use standard::{DeepseekYarnParams, Llama3Params, RotaryEmbedding, YarnParams};
pub use vision::VisionRotaryEmbedding;

/// A constructed rotary embedding of any variant.
///
/// The flat-position variants share [`Rope::apply`]; the multimodal,
/// vision, and dual-chunk variants expose their richer signatures through
/// the `as_*` accessors.
#[derive(Debug)]
pub enum Rope {
    Standard(RotaryEmbedding),
    Linear(LinearScalingRotaryEmbedding),
    LongRope(LongRopeScaledRotaryEmbedding),
    MRope(MRotaryEmbedding),
    Vision(VisionRotaryEmbedding),
    DualChunk(DualChunkRotaryEmbedding),
}

impl Rope {
    /// Rotate query (and optionally key) in place by flat positions.
    ///
    /// For the multimodal variant this is the scalar-position path; the
    /// vision and dual-chunk variants do not take flat positions and must
    /// be reached through their accessors.
    pub fn apply(
        &self,
        positions: &[usize],
        query: &mut [f32],
        key: Option<&mut [f32]>,
    ) -> Result<()> {
        match self {
            Rope::Standard(rope) => rope.apply(positions, query, key),
            Rope::Linear(rope) => rope.apply(positions, query, key),
            Rope::LongRope(rope) => rope.apply(positions, query, key),
            Rope::MRope(rope) => rope.apply_flat(positions, query, key),
            Rope::Vision(_) => Err(RopeError::UnsupportedOperation {
                variant: "vision",
                operation: "flat apply",
            }),
            Rope::DualChunk(_) => Err(RopeError::UnsupportedOperation {
                variant: "dual_chunk",
                operation: "flat apply",
            }),
        }
    }

    /// Half-precision flat-position application.
    pub fn apply_f16(
        &self,
        positions: &[usize],
        query: &mut [f16],
        key: Option<&mut [f16]>,
    ) -> Result<()> {
        match self {
            Rope::Standard(rope) => rope.apply_f16(positions, query, key),
            Rope::Linear(rope) => rope.apply_f16(positions, query, key),
            Rope::LongRope(rope) => rope.apply_f16(positions, query, key),
            Rope::MRope(rope) => rope.apply_flat_f16(positions, query, key),
            Rope::Vision(_) => Err(RopeError::UnsupportedOperation {
                variant: "vision",
                operation: "half-precision apply",
            }),
            Rope::DualChunk(_) => Err(RopeError::UnsupportedOperation {
                variant: "dual_chunk",
                operation: "half-precision apply",
            }),
        }
    }

    pub fn as_mrope(&self) -> Option<&MRotaryEmbedding> {
        match self {
            Rope::MRope(rope) => Some(rope),
            _ => None,
        }
    }

    pub fn as_vision(&self) -> Option<&VisionRotaryEmbedding> {
        match self {
            Rope::Vision(rope) => Some(rope),
            _ => None,
        }
    }

    pub fn as_dual_chunk(&self) -> Option<&DualChunkRotaryEmbedding> {
        match self {
            Rope::DualChunk(rope) => Some(rope),
            _ => None,
        }
    }
}
