//! Common types for the rotary position embedding workspace
//!
//! This crate provides the foundational types shared by the cache/apply core
//! and the multimodal position resolver: the scaling-scheme configuration
//! descriptor, the error taxonomy, numeric dtype selection, and the
//! three-axis position index produced for multimodal inputs.

pub mod config;
pub mod dtype;
pub mod error;
pub mod positions;

pub use config::*;
pub use dtype::DType;
pub use error::{Result, RopeError};
pub use positions::MultimodalPositions;
