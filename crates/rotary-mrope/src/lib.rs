//! Multimodal position resolution for three-axis rotary embedding.
//!
//! Token streams interleaving text with vision (and, for the omni models,
//! audio) placeholder runs are resolved into per-token (t, h, w) position
//! triples plus the position delta that seeds decode-phase continuation.
//! The [`resolver`] module handles vision-language streams; [`omni`] adds
//! audio and the audio-in-video chunk interleaving.

pub mod omni;
pub mod resolver;

pub use omni::{resolve_omni, OmniTokenConfig};
pub use resolver::{
    extend_next_input_positions, next_input_positions, resolve, GridThw, VisionTokenConfig,
};
