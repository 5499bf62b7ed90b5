//! Memoizing factory for rotary embedding variants.
//!
//! Equal configurations resolve to the same shared instance: the lookup key
//! canonicalizes float fields to their bit patterns and list fields to fixed
//! sequences, so the map key is `Hash + Eq` without any float comparison.
//! Construction happens under the map lock; lookups are rare (once per model
//! layer group) and building a cache twice would waste far more than the
//! brief critical section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use rotary_common::{DType, DualChunkConfig, Result, RopeError, RopeParams, RopeScaling};
use tracing::debug;

use crate::variants::{
    DeepseekYarnParams, DualChunkRotaryEmbedding, LinearScalingRotaryEmbedding, Llama3Params,
    LongRopeScaledRotaryEmbedding, MRotaryEmbedding, Rope, RotaryEmbedding,
    VisionRotaryEmbedding, YarnParams,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ScalingKey {
    Default {
        mrope_section: Option<Vec<usize>>,
    },
    Linear {
        factors: Vec<u64>,
    },
    Ntk {
        factor: u64,
        mixed_b: Option<u64>,
    },
    Dynamic {
        alpha: Option<u64>,
        factor: Option<u64>,
    },
    Yarn {
        factor: u64,
        original_max: usize,
        extrapolation_factor: u64,
        attn_factor: u64,
        beta_fast: u64,
        beta_slow: u64,
    },
    DeepseekYarn {
        factor: u64,
        original_max: usize,
        extrapolation_factor: u64,
        attn_factor: u64,
        beta_fast: u64,
        beta_slow: u64,
        mscale: u64,
        mscale_all_dim: u64,
    },
    Longrope {
        short_factor: Vec<u64>,
        long_factor: Vec<u64>,
        original_max: usize,
        short_mscale: Option<u64>,
        long_mscale: Option<u64>,
    },
    Llama3 {
        factor: u64,
        low_freq_factor: u64,
        high_freq_factor: u64,
        original_max: usize,
    },
    Mllama4,
}

fn bits(values: &[f64]) -> Vec<u64> {
    values.iter().map(|v| v.to_bits()).collect()
}

impl ScalingKey {
    fn from_scaling(scaling: &RopeScaling) -> Self {
        match scaling {
            RopeScaling::Default { mrope_section } => ScalingKey::Default {
                mrope_section: mrope_section.clone(),
            },
            RopeScaling::Linear { factor } => ScalingKey::Linear {
                factors: bits(&factor.to_vec()),
            },
            RopeScaling::Ntk { factor, mixed_b } => ScalingKey::Ntk {
                factor: factor.to_bits(),
                mixed_b: mixed_b.map(f64::to_bits),
            },
            RopeScaling::Dynamic { alpha, factor } => ScalingKey::Dynamic {
                alpha: alpha.map(f64::to_bits),
                factor: factor.map(f64::to_bits),
            },
            RopeScaling::Yarn {
                factor,
                original_max_position_embeddings,
                extrapolation_factor,
                attn_factor,
                beta_fast,
                beta_slow,
            } => ScalingKey::Yarn {
                factor: factor.to_bits(),
                original_max: *original_max_position_embeddings,
                extrapolation_factor: extrapolation_factor.to_bits(),
                attn_factor: attn_factor.to_bits(),
                beta_fast: beta_fast.to_bits(),
                beta_slow: beta_slow.to_bits(),
            },
            RopeScaling::DeepseekYarn {
                factor,
                original_max_position_embeddings,
                extrapolation_factor,
                attn_factor,
                beta_fast,
                beta_slow,
                mscale,
                mscale_all_dim,
            } => ScalingKey::DeepseekYarn {
                factor: factor.to_bits(),
                original_max: *original_max_position_embeddings,
                extrapolation_factor: extrapolation_factor.to_bits(),
                attn_factor: attn_factor.to_bits(),
                beta_fast: beta_fast.to_bits(),
                beta_slow: beta_slow.to_bits(),
                mscale: mscale.to_bits(),
                mscale_all_dim: mscale_all_dim.to_bits(),
            },
            RopeScaling::Longrope {
                short_factor,
                long_factor,
                original_max_position_embeddings,
                short_mscale,
                long_mscale,
            } => ScalingKey::Longrope {
                short_factor: bits(short_factor),
                long_factor: bits(long_factor),
                original_max: *original_max_position_embeddings,
                short_mscale: short_mscale.map(f64::to_bits),
                long_mscale: long_mscale.map(f64::to_bits),
            },
            RopeScaling::Llama3 {
                factor,
                low_freq_factor,
                high_freq_factor,
                original_max_position_embeddings,
            } => ScalingKey::Llama3 {
                factor: factor.to_bits(),
                low_freq_factor: low_freq_factor.to_bits(),
                high_freq_factor: high_freq_factor.to_bits(),
                original_max: *original_max_position_embeddings,
            },
            RopeScaling::Mllama4 => ScalingKey::Mllama4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RopeKey {
    head_size: usize,
    rotary_dim: usize,
    max_position: usize,
    base: u64,
    is_neox_style: bool,
    dtype: DType,
    scaling: Option<ScalingKey>,
    dual_chunk: Option<DualChunkConfig>,
}

fn rope_dict() -> &'static Mutex<HashMap<RopeKey, Arc<Rope>>> {
    static DICT: OnceLock<Mutex<HashMap<RopeKey, Arc<Rope>>>> = OnceLock::new();
    DICT.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Resolve (building and memoizing on first use) the rotary embedding for a
/// configuration. Identical configurations return pointer-equal instances.
pub fn get_rope(params: &RopeParams) -> Result<Arc<Rope>> {
    let rotary_dim = params.effective_rotary_dim();
    if rotary_dim > params.head_size {
        return Err(RopeError::RotaryDimExceedsHeadSize {
            rotary_dim,
            head_size: params.head_size,
        });
    }

    let key = RopeKey {
        head_size: params.head_size,
        rotary_dim,
        max_position: params.max_position,
        base: params.base.to_bits(),
        is_neox_style: params.is_neox_style,
        dtype: params.dtype,
        scaling: params.scaling.as_ref().map(ScalingKey::from_scaling),
        dual_chunk: params.dual_chunk,
    };

    let dict = rope_dict();
    let mut map = match dict.lock() {
        Ok(map) => map,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(rope) = map.get(&key) {
        return Ok(Arc::clone(rope));
    }

    debug!(head_size = params.head_size, rotary_dim, "building rotary embedding");
    let rope = Arc::new(build_rope(params, rotary_dim)?);
    map.insert(key, Arc::clone(&rope));
    Ok(rope)
}

/// Test-visible count of distinct memoized instances.
#[doc(hidden)]
pub fn registry_len() -> usize {
    match rope_dict().lock() {
        Ok(map) => map.len(),
        Err(poisoned) => poisoned.into_inner().len(),
    }
}

fn build_rope(params: &RopeParams, rotary_dim: usize) -> Result<Rope> {
    let head_size = params.head_size;
    let max_position = params.max_position;
    let base = params.base;
    let is_neox_style = params.is_neox_style;
    let dtype = params.dtype;

    // Dual chunk attention overrides any frequency scaling.
    if let Some(dual_chunk) = params.dual_chunk {
        return DualChunkRotaryEmbedding::new(
            head_size,
            rotary_dim,
            max_position,
            base,
            is_neox_style,
            dtype,
            dual_chunk,
        )
        .map(Rope::DualChunk);
    }

    let Some(scaling) = &params.scaling else {
        return RotaryEmbedding::new(head_size, rotary_dim, max_position, base, is_neox_style, dtype)
            .map(Rope::Standard);
    };

    match scaling {
        RopeScaling::Default { mrope_section } => match mrope_section {
            Some(section) => MRotaryEmbedding::new(
                head_size,
                rotary_dim,
                max_position,
                base,
                is_neox_style,
                dtype,
                section.clone(),
            )
            .map(Rope::MRope),
            None => {
                RotaryEmbedding::new(head_size, rotary_dim, max_position, base, is_neox_style, dtype)
                    .map(Rope::Standard)
            }
        },
        RopeScaling::Linear { factor } => LinearScalingRotaryEmbedding::new(
            head_size,
            rotary_dim,
            max_position,
            base,
            is_neox_style,
            dtype,
            factor.to_vec(),
        )
        .map(Rope::Linear),
        RopeScaling::Ntk { factor, mixed_b } => RotaryEmbedding::new_ntk(
            head_size,
            rotary_dim,
            max_position,
            base,
            is_neox_style,
            dtype,
            *factor,
            *mixed_b,
        )
        .map(Rope::Standard),
        RopeScaling::Dynamic { alpha, factor } => match (alpha, factor) {
            // alpha wins when both are present
            (Some(alpha), _) => RotaryEmbedding::new_dynamic_alpha(
                head_size,
                rotary_dim,
                max_position,
                base,
                is_neox_style,
                dtype,
                *alpha,
            )
            .map(Rope::Standard),
            (None, Some(factor)) => RotaryEmbedding::new_dynamic_factor(
                head_size,
                rotary_dim,
                max_position,
                base,
                is_neox_style,
                dtype,
                *factor,
            )
            .map(Rope::Standard),
            (None, None) => Err(RopeError::DynamicScalingMissingField),
        },
        RopeScaling::Yarn {
            factor,
            original_max_position_embeddings,
            extrapolation_factor,
            attn_factor,
            beta_fast,
            beta_slow,
        } => RotaryEmbedding::new_yarn(
            head_size,
            rotary_dim,
            base,
            is_neox_style,
            dtype,
            YarnParams {
                factor: *factor,
                original_max_position: *original_max_position_embeddings,
                extrapolation_factor: *extrapolation_factor,
                attn_factor: *attn_factor,
                beta_fast: *beta_fast,
                beta_slow: *beta_slow,
            },
        )
        .map(Rope::Standard),
        RopeScaling::DeepseekYarn {
            factor,
            original_max_position_embeddings,
            extrapolation_factor,
            attn_factor,
            beta_fast,
            beta_slow,
            mscale,
            mscale_all_dim,
        } => RotaryEmbedding::new_deepseek_yarn(
            head_size,
            rotary_dim,
            base,
            is_neox_style,
            dtype,
            DeepseekYarnParams {
                yarn: YarnParams {
                    factor: *factor,
                    original_max_position: *original_max_position_embeddings,
                    extrapolation_factor: *extrapolation_factor,
                    attn_factor: *attn_factor,
                    beta_fast: *beta_fast,
                    beta_slow: *beta_slow,
                },
                mscale: *mscale,
                mscale_all_dim: *mscale_all_dim,
            },
        )
        .map(Rope::Standard),
        RopeScaling::Longrope {
            short_factor,
            long_factor,
            original_max_position_embeddings,
            short_mscale,
            long_mscale,
        } => LongRopeScaledRotaryEmbedding::new(
            head_size,
            rotary_dim,
            max_position,
            *original_max_position_embeddings,
            base,
            is_neox_style,
            dtype,
            short_factor.clone(),
            long_factor.clone(),
            *short_mscale,
            *long_mscale,
        )
        .map(Rope::LongRope),
        RopeScaling::Llama3 {
            factor,
            low_freq_factor,
            high_freq_factor,
            original_max_position_embeddings,
        } => RotaryEmbedding::new_llama3(
            head_size,
            rotary_dim,
            max_position,
            base,
            is_neox_style,
            dtype,
            Llama3Params {
                factor: *factor,
                low_freq_factor: *low_freq_factor,
                high_freq_factor: *high_freq_factor,
                original_max_position: *original_max_position_embeddings,
            },
        )
        .map(Rope::Standard),
        // max_position carries the patch count for the vision encoder
        RopeScaling::Mllama4 => {
            VisionRotaryEmbedding::new(head_size, rotary_dim, max_position, base, dtype)
                .map(Rope::Vision)
        }
    }
}
