//! Materialized cache tensors.

use crate::LayerKVCache;

/// Dense `f32` tensor with shape `[batch, heads, seq, head_dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct KvTensor {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl KvTensor {
    pub fn zeros(shape: [usize; 4]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.iter().product()],
        }
    }

    /// Lay out one layer's entries as `[1, heads, capacity, head_dim]`.
    ///
    /// Valid entries occupy the last `seq_len` slots along the sequence axis;
    /// the leading slots are zero padding.
    pub(crate) fn right_aligned(layer: &LayerKVCache, entries: &[f32]) -> Self {
        let (heads, dim, cap) = (layer.n_heads, layer.head_dim, layer.capacity);
        let mut tensor = Self::zeros([1, heads, cap, dim]);
        let pad = cap - layer.seq_len;

        for s in 0..layer.seq_len {
            for h in 0..heads {
                let src = (s * heads + h) * dim;
                let dst = (h * cap + pad + s) * dim;
                tensor.data[dst..dst + dim].copy_from_slice(&entries[src..src + dim]);
            }
        }
        tensor
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element at `[b, h, s, d]`.
    pub fn get(&self, index: [usize; 4]) -> Option<f32> {
        if index.iter().zip(self.shape.iter()).any(|(i, n)| i >= n) {
            return None;
        }
        let [b, h, s, d] = index;
        let [_, heads, seq, dim] = self.shape;
        self.data.get(((b * heads + h) * seq + s) * dim + d).copied()
    }

    /// Slice of the sequence axis `[start, end)` for one head, flattened
    /// `[len, head_dim]`. `None` when the head or the range is out of bounds.
    pub fn head_rows(&self, head: usize, start: usize, end: usize) -> Option<Vec<f32>> {
        let [_, heads, seq, dim] = self.shape;
        if head >= heads || start > end || end > seq {
            return None;
        }
        let base = head * seq * dim;
        self.data.get(base + start * dim..base + end * dim).map(<[f32]>::to_vec)
    }

    /// Largest absolute elementwise difference; `None` if shapes differ.
    /// A NaN on either side counts as an infinite difference.
    pub fn max_abs_diff(&self, other: &KvTensor) -> Option<f32> {
        if self.shape != other.shape {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| {
                    let d = (a - b).abs();
                    if d.is_nan() {
                        f32::INFINITY
                    } else {
                        d
                    }
                })
                .fold(0.0, f32::max),
        )
    }
}
