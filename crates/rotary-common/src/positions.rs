//! Three-axis position indices for multimodal rotary embedding.
//!
//! Text tokens carry the same scalar position on all three axes; vision
//! tokens spread over a (time, height, width) volume grounded at a single
//! scalar start so interleaved text and vision segments never collide.

/// Per-token position indices on the temporal, height, and width axes.
///
/// All three vectors always have the same length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultimodalPositions {
    pub t: Vec<usize>,
    pub h: Vec<usize>,
    pub w: Vec<usize>,
}

impl MultimodalPositions {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            t: Vec::with_capacity(n),
            h: Vec::with_capacity(n),
            w: Vec::with_capacity(n),
        }
    }

    /// Flat text positions `start..start + n` broadcast to all three axes.
    pub fn text_run(start: usize, n: usize) -> Self {
        let run: Vec<usize> = (start..start + n).collect();
        Self {
            t: run.clone(),
            h: run.clone(),
            w: run,
        }
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    /// Push one token's axis triple.
    pub fn push(&mut self, t: usize, h: usize, w: usize) {
        self.t.push(t);
        self.h.push(h);
        self.w.push(w);
    }

    /// Append another block of positions.
    pub fn extend(&mut self, other: &MultimodalPositions) {
        self.t.extend_from_slice(&other.t);
        self.h.extend_from_slice(&other.h);
        self.w.extend_from_slice(&other.w);
    }

    /// Largest index assigned on any axis, if any tokens exist.
    pub fn max_index(&self) -> Option<usize> {
        let per_axis = [&self.t, &self.h, &self.w];
        per_axis
            .iter()
            .filter_map(|axis| axis.iter().copied().max())
            .max()
    }

    /// Restrict to the `[context_len, end)` token window.
    pub fn window(&self, context_len: usize, end: Option<usize>) -> Self {
        let end = end.unwrap_or(self.len()).min(self.len());
        let start = context_len.min(end);
        Self {
            t: self.t[start..end].to_vec(),
            h: self.h[start..end].to_vec(),
            w: self.w[start..end].to_vec(),
        }
    }

    /// True when every token has identical indices on all axes, i.e. the
    /// stream degenerated to flat text positions.
    pub fn is_flat(&self) -> bool {
        self.t == self.h && self.h == self.w
    }
}
