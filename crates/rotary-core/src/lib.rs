//! Rotary position embedding caches, scaling variants, and rotation
//! application.
//!
//! The building blocks layer bottom-up: [`freq`] computes and reshapes
//! inverse-frequency tables, [`cache`] turns them into position-indexed
//! cos/sin rows, [`apply`] rotates query/key buffers against those rows, and
//! [`variants`] assembles the scaling schemes on top. [`registry::get_rope`]
//! is the front door: it maps a configuration onto a memoized, shared
//! variant instance.

pub mod apply;
pub mod cache;
pub mod freq;
pub mod registry;
pub mod variants;

pub use apply::{rotate_token, rotation_kernel, RotaryFloat, RotationKernel, RotationProvider, ScalarProvider};
pub use cache::CosSinCache;
pub use registry::get_rope;
pub use variants::{
    DeepseekYarnParams, DualChunkRotaryEmbedding, LinearScalingRotaryEmbedding, Llama3Params,
    LongRopeScaledRotaryEmbedding, MRotaryEmbedding, Rope, RotaryEmbedding,
    VisionRotaryEmbedding, YarnParams, QUERY_BRANCHES,
};
