//! Position resolution for omni (audio + vision + text) token streams.
//!
//! Audio occupies the temporal axis like text. With `use_audio_in_video`
//! the video and its soundtrack are split into fixed-duration chunks and
//! interleaved, vision chunk then audio chunk, sharing one temporal origin;
//! the audio bos/eos markers hug the enclosing vision markers at the same
//! position. A run's start comes from the previously emitted block, not the
//! global maximum, which matters exactly in the interleaved case where an
//! audio chunk can end below the vision chunk before it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use rotary_common::{MultimodalPositions, Result, RopeError};

use crate::resolver::GridThw;

fn default_tokens_per_second() -> f64 {
    25.0
}

/// Token ids and timing geometry of the omni thinker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmniTokenConfig {
    pub audio_token_id: u32,
    pub image_token_id: u32,
    pub video_token_id: u32,
    pub audio_start_token_id: u32,
    pub audio_end_token_id: u32,
    pub vision_start_token_id: u32,
    pub vision_end_token_id: u32,
    pub spatial_merge_size: usize,
    pub seconds_per_chunk: f64,
    #[serde(default = "default_tokens_per_second")]
    pub tokens_per_second: f64,
}

/// Placeholder tokens an audio feature of `feature_len` frames occupies
/// after the two downsampling convolutions.
fn audio_place_num(feature_len: usize) -> i64 {
    let len = feature_len as i64;
    ((len - 1).div_euclid(2) + 1 - 2).div_euclid(2) + 1
}

/// Vision positions for an explicit list of temporal indices (already
/// scaled to token time), grounded at `start`.
fn vision_block(start: usize, t_index: &[usize], grid_h: usize, grid_w: usize) -> MultimodalPositions {
    let mut positions = MultimodalPositions::with_capacity(t_index.len() * grid_h * grid_w);
    for &t in t_index {
        for h in 0..grid_h {
            for w in 0..grid_w {
                positions.push(start + t, start + h, start + w);
            }
        }
    }
    positions
}

/// Bucket temporal indices into fixed-width intervals, keeping empty
/// buckets so audio chunks are still emitted for silent stretches.
fn split_into_ranges(values: &[usize], interval: usize) -> Vec<Vec<usize>> {
    let max = values.iter().copied().max().unwrap_or(0);
    let mut ranges = vec![Vec::new(); max / interval + 1];
    for &value in values {
        ranges[value / interval].push(value);
    }
    ranges
}

/// Resolve an omni token stream into per-token position triples and the
/// decode-continuation delta.
///
/// `audio_feature_lengths` are consumed in arrival order, like grid
/// descriptors. With `use_audio_in_video`, every video placeholder run must
/// already be the interleaved form produced by
/// [`audio_in_video_updates`].
#[allow(clippy::too_many_arguments)]
pub fn resolve_omni(
    tokens: &[u32],
    config: &OmniTokenConfig,
    image_grids: &[GridThw],
    video_grids: &[GridThw],
    second_per_grid_ts: &[f64],
    audio_feature_lengths: &[usize],
    use_audio_in_video: bool,
    context_len: usize,
    seq_len: Option<usize>,
) -> Result<(MultimodalPositions, i64)> {
    let merge = config.spatial_merge_size;
    let tps = config.tokens_per_second;
    let second_per_grid = |video_index: usize| -> f64 {
        second_per_grid_ts.get(video_index).copied().unwrap_or(1.0)
    };

    let mut positions = MultimodalPositions::with_capacity(tokens.len());
    // start index for the next block: previous block's maximum plus one
    let mut last_block_max: Option<usize> = None;
    let mut audio_index = 0;
    let mut image_index = 0;
    let mut video_index = 0;

    let mut idx = 0;
    while idx < tokens.len() {
        let token = tokens[idx];
        let mut start_idx = last_block_max.map_or(0, |max| max + 1);
        let produced;

        if token != config.audio_token_id
            && token != config.video_token_id
            && token != config.image_token_id
        {
            if use_audio_in_video && idx > 0 {
                let prev = tokens[idx - 1];
                // audio bos/eos share the position of the adjacent vision marker
                if (token == config.vision_end_token_id && prev == config.audio_end_token_id)
                    || (token == config.audio_start_token_id
                        && prev == config.vision_start_token_id)
                {
                    start_idx -= 1;
                }
            }
            positions.push(start_idx, start_idx, start_idx);
            last_block_max = Some(start_idx);
            produced = 1;
        } else if token == config.audio_token_id {
            let feature_len = *audio_feature_lengths.get(audio_index).ok_or(
                RopeError::MissingAudioLength { index: audio_index },
            )?;
            let place_num = audio_place_num(feature_len);
            if place_num <= 0 {
                return Err(RopeError::AudioFeatureTooShort {
                    index: audio_index,
                    feature_len,
                });
            }
            let place_num = place_num as usize;
            let block = MultimodalPositions::text_run(start_idx, place_num);
            last_block_max = block.max_index();
            positions.extend(&block);
            audio_index += 1;
            produced = place_num;
        } else if token == config.image_token_id {
            let grid = image_grids.get(image_index).ok_or(
                RopeError::MissingGridMetadata {
                    modality: "image",
                    index: image_index,
                    available: image_grids.len(),
                },
            )?;
            let t_index: Vec<usize> = (0..grid.t).map(|t| (t as f64 * tps) as usize).collect();
            let block = vision_block(start_idx, &t_index, grid.h / merge, grid.w / merge);
            last_block_max = block.max_index();
            produced = block.len();
            positions.extend(&block);
            image_index += 1;
        } else if token == config.video_token_id && !use_audio_in_video {
            let grid = video_grids.get(video_index).ok_or(
                RopeError::MissingGridMetadata {
                    modality: "video",
                    index: video_index,
                    available: video_grids.len(),
                },
            )?;
            let spg = second_per_grid(video_index);
            let t_index: Vec<usize> =
                (0..grid.t).map(|t| (t as f64 * spg * tps) as usize).collect();
            let block = vision_block(start_idx, &t_index, grid.h / merge, grid.w / merge);
            last_block_max = block.max_index();
            produced = block.len();
            positions.extend(&block);
            video_index += 1;
        } else {
            // video with its soundtrack: chunk-interleaved vision and audio
            let feature_len = *audio_feature_lengths.get(audio_index).ok_or(
                RopeError::MissingAudioLength { index: audio_index },
            )?;
            let grid = video_grids.get(video_index).ok_or(
                RopeError::MissingGridMetadata {
                    modality: "video",
                    index: video_index,
                    available: video_grids.len(),
                },
            )?;
            let pure_audio_len = audio_place_num(feature_len);
            if pure_audio_len <= 0 {
                return Err(RopeError::AudioFeatureTooShort {
                    index: audio_index,
                    feature_len,
                });
            }
            let pure_audio_len = pure_audio_len as usize;

            let grid_h = grid.h / merge;
            let grid_w = grid.w / merge;
            let t_ntoken_per_chunk = (tps * config.seconds_per_chunk) as usize;
            let spg = second_per_grid(video_index);
            let t_index: Vec<usize> =
                (0..grid.t).map(|t| (t as f64 * spg * tps) as usize).collect();

            let mut added_audio = 0;
            let mut emitted = 0;
            let mut last_audio_end: Option<usize> = None;
            for chunk in split_into_ranges(&t_index, t_ntoken_per_chunk) {
                let vision = vision_block(start_idx, &chunk, grid_h, grid_w);
                if let Some(max) = vision.max_index() {
                    last_block_max = Some(max);
                }
                emitted += vision.len();
                positions.extend(&vision);

                let take = t_ntoken_per_chunk.min(pure_audio_len - added_audio);
                if take > 0 {
                    let audio_start = last_audio_end.map_or(start_idx, |end| end + 1);
                    let block = MultimodalPositions::text_run(audio_start, take);
                    last_audio_end = block.max_index();
                    last_block_max = block.max_index();
                    emitted += take;
                    positions.extend(&block);
                }
                added_audio += take;
            }
            if added_audio < pure_audio_len {
                let rest = pure_audio_len - added_audio;
                let rest_start = last_block_max.map_or(0, |max| max + 1);
                let block = MultimodalPositions::text_run(rest_start, rest);
                last_block_max = block.max_index();
                emitted += rest;
                positions.extend(&block);
            }
            produced = emitted;
            audio_index += 1;
            video_index += 1;
        }

        idx += produced;
    }

    let delta = positions.max_index().map_or(0, |max| max + 1) as i64 - tokens.len() as i64;
    debug!(
        tokens = tokens.len(),
        audios = audio_index,
        images = image_index,
        videos = video_index,
        delta,
        "resolved omni positions"
    );
    Ok((positions.window(context_len, seq_len), delta))
}

/// Expanded placeholder run for a video carrying its own audio: the chunked
/// interleaving of video and audio placeholder tokens, bracketed by the
/// audio markers. `audio_len` is the audio's placeholder token count.
pub fn audio_in_video_updates(
    config: &OmniTokenConfig,
    audio_len: usize,
    video_grid: &GridThw,
    video_second_per_grid_t: f64,
) -> Vec<u32> {
    let merge = config.spatial_merge_size;
    let tps = config.tokens_per_second;
    let t_ntoken_per_chunk = (tps * config.seconds_per_chunk) as usize;
    let t_index: Vec<usize> = (0..video_grid.t)
        .map(|t| (t as f64 * video_second_per_grid_t * tps) as usize)
        .collect();

    let mut updates = vec![config.audio_start_token_id];
    let mut added_audio = 0;
    for chunk in split_into_ranges(&t_index, t_ntoken_per_chunk) {
        let vision_tokens = chunk.len() * (video_grid.h / merge) * (video_grid.w / merge);
        updates.extend(std::iter::repeat(config.video_token_id).take(vision_tokens));

        let audio_chunk = t_ntoken_per_chunk.min(audio_len - added_audio);
        updates.extend(std::iter::repeat(config.audio_token_id).take(audio_chunk));
        added_audio += audio_chunk;
    }
    if added_audio < audio_len {
        updates.extend(std::iter::repeat(config.audio_token_id).take(audio_len - added_audio));
    }
    updates.push(config.audio_end_token_id);
    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: u32 = 1;
    const AUDIO: u32 = 10;
    const IMAGE: u32 = 11;
    const VIDEO: u32 = 12;
    const AUDIO_BOS: u32 = 20;
    const AUDIO_EOS: u32 = 21;
    const VISION_BOS: u32 = 22;
    const VISION_EOS: u32 = 23;

    fn config(tokens_per_second: f64, seconds_per_chunk: f64) -> OmniTokenConfig {
        OmniTokenConfig {
            audio_token_id: AUDIO,
            image_token_id: IMAGE,
            video_token_id: VIDEO,
            audio_start_token_id: AUDIO_BOS,
            audio_end_token_id: AUDIO_EOS,
            vision_start_token_id: VISION_BOS,
            vision_end_token_id: VISION_EOS,
            spatial_merge_size: 1,
            seconds_per_chunk,
            tokens_per_second,
        }
    }

    #[test]
    fn audio_placeholder_count_follows_downsampling() {
        assert_eq!(audio_place_num(3), 1);
        assert_eq!(audio_place_num(8), 2);
        assert_eq!(audio_place_num(12), 3);
        assert!(audio_place_num(1) <= 0);
    }

    #[test]
    fn audio_run_occupies_temporal_axis() {
        let (positions, delta) = resolve_omni(
            &[AUDIO, AUDIO],
            &config(1.0, 2.0),
            &[],
            &[],
            &[],
            &[8],
            false,
            0,
            None,
        )
        .unwrap();
        assert_eq!(positions.t, vec![0, 1]);
        assert!(positions.is_flat());
        assert_eq!(delta, 0);
    }

    #[test]
    fn text_resumes_after_audio() {
        let (positions, _) = resolve_omni(
            &[TEXT, AUDIO, AUDIO, TEXT],
            &config(1.0, 2.0),
            &[],
            &[],
            &[],
            &[8],
            false,
            0,
            None,
        )
        .unwrap();
        assert_eq!(positions.t, vec![0, 1, 2, 3]);
    }

    #[test]
    fn image_temporal_index_scales_by_tokens_per_second() {
        // a 2-frame image grid with tokens_per_second 25: frames land at
        // t = 0 and t = 25
        let grid = GridThw { t: 2, h: 1, w: 1 };
        let (positions, _) = resolve_omni(
            &[IMAGE, IMAGE],
            &config(25.0, 2.0),
            &[grid],
            &[],
            &[],
            &[],
            false,
            0,
            None,
        )
        .unwrap();
        assert_eq!(positions.t, vec![0, 25]);
        assert_eq!(positions.h, vec![0, 0]);
    }

    #[test]
    fn missing_audio_length_is_fatal() {
        let err = resolve_omni(
            &[AUDIO],
            &config(1.0, 2.0),
            &[],
            &[],
            &[],
            &[],
            false,
            0,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RopeError::MissingAudioLength { index: 0 }));
    }

    #[test]
    fn degenerate_audio_feature_is_fatal() {
        let err = resolve_omni(
            &[AUDIO],
            &config(1.0, 2.0),
            &[],
            &[],
            &[],
            &[1],
            false,
            0,
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RopeError::AudioFeatureTooShort { index: 0, feature_len: 1 }
        ));
    }

    #[test]
    fn audio_in_video_interleaves_chunks() {
        // video: 2 frames of 2x2 patches, 1 token per second, 2s chunks;
        // audio: 8 feature frames -> 2 placeholder tokens
        let cfg = config(1.0, 2.0);
        let grid = GridThw { t: 2, h: 2, w: 2 };

        let updates = audio_in_video_updates(&cfg, 2, &grid, 1.0);
        let mut tokens = vec![VISION_BOS];
        tokens.extend(&updates);
        tokens.push(VISION_EOS);
        assert_eq!(
            updates,
            [
                vec![AUDIO_BOS],
                vec![VIDEO; 8],
                vec![AUDIO; 2],
                vec![AUDIO_EOS],
            ]
            .concat()
        );

        let (positions, delta) = resolve_omni(
            &tokens,
            &cfg,
            &[],
            &[grid],
            &[1.0],
            &[8],
            true,
            0,
            None,
        )
        .unwrap();

        assert_eq!(
            positions.t,
            vec![0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 1, 2, 3, 3]
        );
        assert_eq!(
            positions.h,
            vec![0, 0, 1, 1, 2, 2, 1, 1, 2, 2, 1, 2, 3, 3]
        );
        assert_eq!(
            positions.w,
            vec![0, 0, 1, 2, 1, 2, 1, 2, 1, 2, 1, 2, 3, 3]
        );
        // audio bos shares the vision bos position and eos hugs vision eos
        assert_eq!(positions.t[1], positions.t[0]);
        assert_eq!(positions.t[13], positions.t[12]);
        assert_eq!(delta, 4 - 14);
    }

    #[test]
    fn trailing_audio_spills_after_chunks() {
        // 1-frame video, so a single chunk of 2 audio tokens; audio needs 3
        let cfg = config(1.0, 2.0);
        let grid = GridThw { t: 1, h: 1, w: 1 };
        // feature length 12 -> 3 placeholder tokens
        let updates = audio_in_video_updates(&cfg, 3, &grid, 1.0);
        assert_eq!(
            updates,
            [
                vec![AUDIO_BOS],
                vec![VIDEO; 1],
                vec![AUDIO; 2],
                vec![AUDIO; 1],
                vec![AUDIO_EOS],
            ]
            .concat()
        );

        let mut tokens = vec![VISION_BOS];
        tokens.extend(&updates);
        tokens.push(VISION_EOS);
        let (positions, _) = resolve_omni(
            &tokens,
            &cfg,
            &[],
            &[grid],
            &[1.0],
            &[12],
            true,
            0,
            None,
        )
        .unwrap();
        // vision frame at 1, audio chunk [1, 2], spill continues at 3
        assert_eq!(positions.t, vec![0, 0, 1, 1, 2, 3, 4, 4]);
    }

    #[test]
    fn config_defaults_tokens_per_second() {
        let json = r#"{
            "audio_token_id": 151646,
            "image_token_id": 151655,
            "video_token_id": 151656,
            "audio_start_token_id": 151647,
            "audio_end_token_id": 151648,
            "vision_start_token_id": 151652,
            "vision_end_token_id": 151653,
            "spatial_merge_size": 2,
            "seconds_per_chunk": 2.0
        }"#;
        let config: OmniTokenConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.tokens_per_second, 25.0);
    }
}
