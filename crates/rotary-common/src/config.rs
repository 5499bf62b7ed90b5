//! Rotary embedding configuration descriptors.
//!
//! The scaling descriptor mirrors the `rope_scaling` object found in model
//! configuration JSON: a discriminant string (`rope_type`) selecting one of a
//! closed set of schemes, plus scheme-specific fields. Modeling it as a
//! serde-tagged enum makes unknown discriminants and missing required fields
//! fail at parse time instead of deep inside cache construction.

use serde::{Deserialize, Serialize};

use crate::dtype::DType;

fn one() -> f64 {
    1.0
}

fn beta_fast_default() -> f64 {
    32.0
}

fn beta_slow_default() -> f64 {
    1.0
}

/// Linear scaling accepts a single factor or a list of factors (heterogeneous
/// adapter batches each with their own context extension).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalingFactors {
    One(f64),
    Many(Vec<f64>),
}

impl ScalingFactors {
    /// Normalized order-preserving factor list.
    pub fn to_vec(&self) -> Vec<f64> {
        match self {
            ScalingFactors::One(f) => vec![*f],
            ScalingFactors::Many(fs) => fs.clone(),
        }
    }
}

/// The closed set of frequency-scaling schemes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rope_type", rename_all = "snake_case")]
pub enum RopeScaling {
    /// No frequency rescaling. Carries an optional `mrope_section` which
    /// switches the variant to multimodal three-axis rotary embedding.
    #[serde(alias = "mrope")]
    Default {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mrope_section: Option<Vec<usize>>,
    },
    /// Position-interpolation scaling, one sub-table per factor.
    Linear { factor: ScalingFactors },
    /// Fixed NTK base rescaling, optionally blended per-dimension.
    Ntk {
        factor: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mixed_b: Option<f64>,
    },
    /// Dynamic NTK. Exactly one of `alpha` or `factor` must be present;
    /// validated at factory lookup, not here, so a parsed-but-invalid config
    /// still fails loudly at the documented boundary.
    Dynamic {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alpha: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        factor: Option<f64>,
    },
    /// YaRN frequency blending between interpolation and extrapolation.
    Yarn {
        factor: f64,
        original_max_position_embeddings: usize,
        #[serde(default = "one")]
        extrapolation_factor: f64,
        #[serde(default = "one")]
        attn_factor: f64,
        #[serde(default = "beta_fast_default")]
        beta_fast: f64,
        #[serde(default = "beta_slow_default")]
        beta_slow: f64,
    },
    /// YaRN with the Deepseek magnitude-correction ratio.
    DeepseekYarn {
        factor: f64,
        original_max_position_embeddings: usize,
        #[serde(default = "one")]
        extrapolation_factor: f64,
        #[serde(default = "one")]
        attn_factor: f64,
        #[serde(default = "beta_fast_default")]
        beta_fast: f64,
        #[serde(default = "beta_slow_default")]
        beta_slow: f64,
        #[serde(default = "one")]
        mscale: f64,
        #[serde(default)]
        mscale_all_dim: f64,
    },
    /// Dual-factor long-context scaling (short and long regimes).
    Longrope {
        short_factor: Vec<f64>,
        long_factor: Vec<f64>,
        original_max_position_embeddings: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        short_mscale: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        long_mscale: Option<f64>,
    },
    /// Wavelength-banded blending used by Llama 3 long-context models.
    Llama3 {
        factor: f64,
        low_freq_factor: f64,
        high_freq_factor: f64,
        original_max_position_embeddings: usize,
    },
    /// 2-D patch-grid rotary embedding for the Llama 4 vision encoder.
    Mllama4,
}

/// Dual chunk attention window configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DualChunkConfig {
    pub chunk_size: usize,
    pub local_size: usize,
}

impl DualChunkConfig {
    /// Within-chunk window length.
    pub fn chunk_len(&self) -> usize {
        self.chunk_size.saturating_sub(self.local_size)
    }
}

/// Full rotary embedding configuration. This tuple is the memoization
/// identity: equal params always resolve to the same shared variant instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeParams {
    pub head_size: usize,
    pub rotary_dim: usize,
    pub max_position: usize,
    pub base: f64,
    /// Half-split (neox) convention when true, interleaved (gpt-j) otherwise.
    pub is_neox_style: bool,
    pub dtype: DType,
    /// Fraction of `rotary_dim` actually rotated; the factory shrinks
    /// `rotary_dim` by this before construction when below one.
    pub partial_rotary_factor: f64,
    pub scaling: Option<RopeScaling>,
    pub dual_chunk: Option<DualChunkConfig>,
}

impl RopeParams {
    pub fn new(head_size: usize, rotary_dim: usize, max_position: usize, base: f64) -> Self {
        Self {
            head_size,
            rotary_dim,
            max_position,
            base,
            is_neox_style: true,
            dtype: DType::F32,
            partial_rotary_factor: 1.0,
            scaling: None,
            dual_chunk: None,
        }
    }

    pub fn with_scaling(mut self, scaling: RopeScaling) -> Self {
        self.scaling = Some(scaling);
        self
    }

    pub fn with_neox_style(mut self, is_neox_style: bool) -> Self {
        self.is_neox_style = is_neox_style;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_partial_rotary_factor(mut self, factor: f64) -> Self {
        self.partial_rotary_factor = factor;
        self
    }

    pub fn with_dual_chunk(mut self, dual_chunk: DualChunkConfig) -> Self {
        self.dual_chunk = Some(dual_chunk);
        self
    }

    /// Effective rotary dimension after partial-rotary shrinking.
    pub fn effective_rotary_dim(&self) -> usize {
        if self.partial_rotary_factor < 1.0 {
            (self.rotary_dim as f64 * self.partial_rotary_factor) as usize
        } else {
            self.rotary_dim
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yarn_config_with_defaults() {
        let json = r#"{
            "rope_type": "yarn",
            "factor": 4.0,
            "original_max_position_embeddings": 2048
        }"#;
        let scaling: RopeScaling = serde_json::from_str(json).unwrap();
        match scaling {
            RopeScaling::Yarn {
                factor,
                original_max_position_embeddings,
                extrapolation_factor,
                attn_factor,
                beta_fast,
                beta_slow,
            } => {
                assert_eq!(factor, 4.0);
                assert_eq!(original_max_position_embeddings, 2048);
                assert_eq!(extrapolation_factor, 1.0);
                assert_eq!(attn_factor, 1.0);
                assert_eq!(beta_fast, 32.0);
                assert_eq!(beta_slow, 1.0);
            }
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_llama3_config() {
        let json = r#"{
            "rope_type": "llama3",
            "factor": 8.0,
            "low_freq_factor": 1.0,
            "high_freq_factor": 4.0,
            "original_max_position_embeddings": 8192
        }"#;
        let scaling: RopeScaling = serde_json::from_str(json).unwrap();
        assert!(matches!(scaling, RopeScaling::Llama3 { factor, .. } if factor == 8.0));
    }

    #[test]
    fn rejects_unknown_rope_type() {
        let json = r#"{ "rope_type": "su_scaled", "factor": 2.0 }"#;
        assert!(serde_json::from_str::<RopeScaling>(json).is_err());
    }

    #[test]
    fn linear_factor_accepts_scalar_and_list() {
        let scalar: RopeScaling =
            serde_json::from_str(r#"{ "rope_type": "linear", "factor": 2.0 }"#).unwrap();
        let list: RopeScaling =
            serde_json::from_str(r#"{ "rope_type": "linear", "factor": [1.0, 2.0] }"#).unwrap();
        match (scalar, list) {
            (RopeScaling::Linear { factor: a }, RopeScaling::Linear { factor: b }) => {
                assert_eq!(a.to_vec(), vec![2.0]);
                assert_eq!(b.to_vec(), vec![1.0, 2.0]);
            }
            other => panic!("parsed wrong variants: {other:?}"),
        }
    }

    #[test]
    fn mrope_alias_maps_to_default() {
        let json = r#"{ "rope_type": "mrope", "mrope_section": [16, 24, 24] }"#;
        let scaling: RopeScaling = serde_json::from_str(json).unwrap();
        match scaling {
            RopeScaling::Default { mrope_section } => {
                assert_eq!(mrope_section, Some(vec![16, 24, 24]));
            }
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }

    #[test]
    fn partial_rotary_factor_shrinks_rotary_dim() {
        let params = RopeParams::new(128, 128, 4096, 10_000.0).with_partial_rotary_factor(0.5);
        assert_eq!(params.effective_rotary_dim(), 64);
        let full = RopeParams::new(128, 128, 4096, 10_000.0);
        assert_eq!(full.effective_rotary_dim(), 128);
    }
}
