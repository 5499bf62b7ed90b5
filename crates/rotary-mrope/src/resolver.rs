//! Vision-language position resolution.
//!
//! One pass groups the token stream into maximal runs of the same kind.
//! Text runs take consecutive scalar positions on all three axes; each
//! vision run consumes the next grid descriptor for its modality and spreads
//! its tokens over a (t, h, w) volume grounded at a single scalar start.
//! Temporal indices scale by `second_per_grid_t * tokens_per_second` for
//! video frames; images pin the temporal axis to the run start.

use serde::{Deserialize, Serialize};
use tracing::debug;

use rotary_common::{MultimodalPositions, Result, RopeError};

fn default_tokens_per_second() -> f64 {
    1.0
}

/// Placeholder token ids and vision geometry from the model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionTokenConfig {
    pub image_token_id: u32,
    pub video_token_id: u32,
    pub spatial_merge_size: usize,
    #[serde(default = "default_tokens_per_second")]
    pub tokens_per_second: f64,
}

/// Temporal/height/width extent of one image or video in vision patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridThw {
    pub t: usize,
    pub h: usize,
    pub w: usize,
}

impl GridThw {
    /// Placeholder tokens the grid occupies after spatial merging.
    pub fn token_volume(&self, spatial_merge_size: usize) -> usize {
        self.t * (self.h / spatial_merge_size) * (self.w / spatial_merge_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Text,
    Image,
    Video,
}

fn classify(token: u32, config: &VisionTokenConfig) -> TokenKind {
    if token == config.image_token_id {
        TokenKind::Image
    } else if token == config.video_token_id {
        TokenKind::Video
    } else {
        TokenKind::Text
    }
}

/// Positions for one vision run: row-major (t, h, w) broadcast from `start`,
/// with temporal indices scaled to token time.
fn vision_run(
    start: usize,
    grid: &GridThw,
    spatial_merge_size: usize,
    second_per_grid_t: f64,
    tokens_per_second: f64,
) -> MultimodalPositions {
    let grid_h = grid.h / spatial_merge_size;
    let grid_w = grid.w / spatial_merge_size;
    let mut positions = MultimodalPositions::with_capacity(grid.t * grid_h * grid_w);
    for t in 0..grid.t {
        let t_index = (t as f64 * second_per_grid_t * tokens_per_second) as usize;
        for h in 0..grid_h {
            for w in 0..grid_w {
                positions.push(start + t_index, start + h, start + w);
            }
        }
    }
    positions
}

/// Resolve a vision-language token stream into per-token position triples.
///
/// Grid descriptors are consumed in arrival order per modality; a run whose
/// length does not match its grid's token volume, a missing descriptor, or a
/// leftover descriptor are all fatal. Returns the positions restricted to
/// `[context_len, seq_len)` together with the position delta
/// `max + 1 - num_tokens` (computed before slicing).
pub fn resolve(
    tokens: &[u32],
    config: &VisionTokenConfig,
    image_grids: &[GridThw],
    video_grids: &[GridThw],
    second_per_grid_ts: &[f64],
    context_len: usize,
    seq_len: Option<usize>,
) -> Result<(MultimodalPositions, i64)> {
    let mut positions = MultimodalPositions::with_capacity(tokens.len());
    let mut image_index = 0;
    let mut video_index = 0;

    let mut start = 0;
    while start < tokens.len() {
        let kind = classify(tokens[start], config);
        let mut end = start + 1;
        while end < tokens.len() && classify(tokens[end], config) == kind {
            end += 1;
        }
        let run_len = end - start;
        let start_idx = positions.max_index().map_or(0, |max| max + 1);

        match kind {
            TokenKind::Text => {
                positions.extend(&MultimodalPositions::text_run(start_idx, run_len));
            }
            TokenKind::Image => {
                let grid = image_grids.get(image_index).ok_or(
                    RopeError::MissingGridMetadata {
                        modality: "image",
                        index: image_index,
                        available: image_grids.len(),
                    },
                )?;
                check_volume("image", run_len, grid, config.spatial_merge_size)?;
                // images carry no temporal extent: every frame maps to t = 0
                positions.extend(&vision_run(
                    start_idx,
                    grid,
                    config.spatial_merge_size,
                    0.0,
                    config.tokens_per_second,
                ));
                image_index += 1;
            }
            TokenKind::Video => {
                let grid = video_grids.get(video_index).ok_or(
                    RopeError::MissingGridMetadata {
                        modality: "video",
                        index: video_index,
                        available: video_grids.len(),
                    },
                )?;
                check_volume("video", run_len, grid, config.spatial_merge_size)?;
                let second_per_grid_t = second_per_grid_ts
                    .get(video_index)
                    .copied()
                    .unwrap_or(1.0);
                positions.extend(&vision_run(
                    start_idx,
                    grid,
                    config.spatial_merge_size,
                    second_per_grid_t,
                    config.tokens_per_second,
                ));
                video_index += 1;
            }
        }
        start = end;
    }

    if image_index < image_grids.len() {
        return Err(RopeError::UnconsumedGridMetadata {
            modality: "image",
            provided: image_grids.len(),
            consumed: image_index,
        });
    }
    if video_index < video_grids.len() {
        return Err(RopeError::UnconsumedGridMetadata {
            modality: "video",
            provided: video_grids.len(),
            consumed: video_index,
        });
    }

    let delta = positions.max_index().map_or(0, |max| max + 1) as i64 - tokens.len() as i64;
    debug!(
        tokens = tokens.len(),
        images = image_index,
        videos = video_index,
        delta,
        "resolved multimodal positions"
    );
    Ok((positions.window(context_len, seq_len), delta))
}

fn check_volume(
    modality: &'static str,
    run_len: usize,
    grid: &GridThw,
    spatial_merge_size: usize,
) -> Result<()> {
    let expected = grid.token_volume(spatial_merge_size);
    if run_len != expected {
        return Err(RopeError::GridVolumeMismatch {
            modality,
            tokens: run_len,
            expected,
        });
    }
    Ok(())
}

/// Decode-phase continuation: flat positions
/// `context_len + delta .. seq_len + delta` on all three axes.
pub fn next_input_positions(
    delta: i64,
    context_len: usize,
    seq_len: usize,
) -> Result<MultimodalPositions> {
    let first = context_len as i64 + delta;
    if first < 0 {
        return Err(RopeError::NegativePosition { value: first });
    }
    let count = seq_len.saturating_sub(context_len);
    Ok(MultimodalPositions::text_run(first as usize, count))
}

/// Append continuation positions to an existing block (the buffer-filling
/// form used when positions for several sequences share one allocation).
pub fn extend_next_input_positions(
    out: &mut MultimodalPositions,
    delta: i64,
    context_len: usize,
    num_new_tokens: usize,
) -> Result<()> {
    let first = context_len as i64 + delta;
    if first < 0 {
        return Err(RopeError::NegativePosition { value: first });
    }
    out.extend(&MultimodalPositions::text_run(first as usize, num_new_tokens));
    Ok(())
}
