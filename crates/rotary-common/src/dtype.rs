//! Numeric precision selector for cos/sin caches and query/key buffers.

use serde::{Deserialize, Serialize};

/// Element type a rotary cache is consumed at.
///
/// Tables are always built in `f32`; an `F16` consumer triggers a one-time
/// lazy conversion of the table (see `rotary-core`'s cache type).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    F16,
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
        }
    }
}
