//! Error taxonomy for rotary embedding construction and application.
//!
//! Two families: configuration errors raised at construction/lookup time and
//! shape errors raised at apply/resolve time. All are fatal; these are
//! deterministic pure computations and a failure is a caller defect, never
//! something to retry.

use thiserror::Error;

/// Errors from rotary embedding configuration, construction, and application.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RopeError {
    /// `dynamic` scaling was requested without an `alpha` or `factor` field.
    #[error("dynamic rope scaling must contain either 'alpha' or 'factor' field")]
    DynamicScalingMissingField,

    /// A variant that only supports the half-split (neox) convention was
    /// configured with the interleaved one.
    #[error("{variant} only supports the neox interleaving convention")]
    NeoxStyleRequired { variant: &'static str },

    /// Rotary dimension larger than the head it rotates.
    #[error("rotary_dim {rotary_dim} exceeds head_size {head_size}")]
    RotaryDimExceedsHeadSize { rotary_dim: usize, head_size: usize },

    /// Rotation pairs require an even rotary dimension.
    #[error("rotary dimension must be even, got {dim}")]
    OddRotaryDim { dim: usize },

    /// RoPE base must be finite and strictly positive.
    #[error("rope base must be finite and positive, got {base}")]
    InvalidBase { base: f64 },

    /// Dual-chunk attention needs a nonempty within-chunk window.
    #[error("dual chunk local_size {local_size} must be smaller than chunk_size {chunk_size}")]
    InvalidDualChunk { chunk_size: usize, local_size: usize },

    /// `mrope_section` entries must cover exactly half the rotary dimension.
    #[error("mrope_section must sum to rotary_dim/2 ({expected}), got {got}")]
    InvalidMropeSection { expected: usize, got: usize },

    /// `mrope_section` needs one frequency band per position axis.
    #[error("mrope_section must have exactly 3 entries (t, h, w), got {got}")]
    InvalidMropeSectionCount { got: usize },

    /// Position index beyond the precomputed table. Never wraps silently.
    #[error("position {position} out of bounds for cos/sin cache with {rows} rows")]
    PositionOutOfBounds { position: usize, rows: usize },

    /// Query/key buffer length inconsistent with token count and head size.
    #[error("buffer of {len} values does not divide into {num_tokens} tokens of head size {head_size}")]
    ShapeMismatch {
        len: usize,
        num_tokens: usize,
        head_size: usize,
    },

    /// The token stream references more multimodal items than grid metadata
    /// entries were supplied for.
    #[error("token stream references {modality} item {index} but only {available} grid entries were provided")]
    MissingGridMetadata {
        modality: &'static str,
        index: usize,
        available: usize,
    },

    /// More grid metadata entries were supplied than the stream consumed.
    #[error("{provided} {modality} grid entries provided but only {consumed} consumed by the token stream")]
    UnconsumedGridMetadata {
        modality: &'static str,
        provided: usize,
        consumed: usize,
    },

    /// A sentinel run length does not match the token volume of its grid.
    #[error("{modality} run of {tokens} tokens does not match grid volume {expected}")]
    GridVolumeMismatch {
        modality: &'static str,
        tokens: usize,
        expected: usize,
    },

    /// Audio sentinel encountered without a corresponding feature length.
    #[error("audio feature length missing for audio item {index}")]
    MissingAudioLength { index: usize },

    /// Audio feature too short to occupy even one placeholder token; the
    /// stream cannot advance past it.
    #[error("audio feature length {feature_len} for item {index} yields no placeholder tokens")]
    AudioFeatureTooShort { index: usize, feature_len: usize },

    /// Continuation arithmetic produced a negative absolute position.
    #[error("position continuation produced negative position {value}")]
    NegativePosition { value: i64 },

    /// A variant was driven through an entry point it does not support
    /// (e.g. flat positions on the dual-chunk or vision variants).
    #[error("{variant} does not support the {operation} entry point")]
    UnsupportedOperation {
        variant: &'static str,
        operation: &'static str,
    },
}

/// Convenience result alias used across the workspace.
pub type Result<T> = std::result::Result<T, RopeError>;
