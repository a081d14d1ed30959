//! Attention mask construction and application.

use anyhow::{anyhow, Result};
use ndarray::{Array2, Array4, Axis, Zip};

/// Additive bias written into blocked score positions before softmax.
pub const MASK_VALUE: f32 = -1e9;

/// Build a padding mask from per-sequence lengths.
///
/// Position `j` of sequence `i` is valid iff `j < lengths[i]`.
/// Returns `[batch, max_len]` with 1.0 for real tokens.
pub fn padding_mask_from_lengths(lengths: &[usize], max_len: usize) -> Array2<f32> {
    let mut mask = Array2::zeros((lengths.len(), max_len));
    for (i, &len) in lengths.iter().enumerate() {
        for j in 0..len.min(max_len) {
            mask[[i, j]] = 1.0;
        }
    }
    mask
}

/// Create a causal attention mask for any query/key shape.
///
/// The query at index `i` sits at absolute position `total_len - q_len + i`
/// and may attend to keys at positions `<=` its own. During incremental
/// decoding `q_len` is 1 and `total_len` is the cache length plus one.
pub fn causal_mask(q_len: usize, total_len: usize) -> Array2<f32> {
    assert!(q_len <= total_len, "more queries than total positions");
    let mut mask = Array2::zeros((q_len, total_len));
    let past_len = total_len - q_len;

    for i in 0..q_len {
        let current_abs_pos = past_len + i;
        for j in 0..total_len {
            if j <= current_abs_pos {
                mask[[i, j]] = 1.0;
            }
        }
    }
    mask
}

/// Apply a `[batch, n_keys]` padding mask to attention scores.
///
/// Masked positions get `MASK_VALUE` added so softmax drives them to zero.
pub fn apply_padding_mask(scores: &mut Array4<f32>, mask: &Array2<f32>) -> Result<()> {
    let (batch_size, num_heads, seq_q, seq_k) = scores.dim();

    if mask.shape()[0] != batch_size {
        return Err(anyhow!(
            "mask batch size {} doesn't match scores batch size {}",
            mask.shape()[0],
            batch_size
        ));
    }
    if mask.shape()[1] != seq_k {
        return Err(anyhow!(
            "mask length {} doesn't match key sequence length {}",
            mask.shape()[1],
            seq_k
        ));
    }

    // Expand mask: [batch, seq_k] -> [batch, 1, 1, seq_k] and broadcast
    let expanded = mask.view().insert_axis(Axis(1)).insert_axis(Axis(1));
    if let Some(broadcast) = expanded.broadcast((batch_size, num_heads, seq_q, seq_k)) {
        Zip::from(scores).and(&broadcast).for_each(|s, &m| {
            if m == 0.0 {
                *s += MASK_VALUE;
            }
        });
    }

    Ok(())
}

/// Apply a `[n_queries, n_keys]` causal mask to attention scores.
pub fn apply_causal_mask(scores: &mut Array4<f32>, mask: &Array2<f32>) -> Result<()> {
    let (batch_size, num_heads, seq_q, seq_k) = scores.dim();

    if mask.shape() != [seq_q, seq_k] {
        return Err(anyhow!(
            "causal mask shape {:?} doesn't match score shape [{}, {}]",
            mask.shape(),
            seq_q,
            seq_k
        ));
    }

    let expanded = mask.view().insert_axis(Axis(0)).insert_axis(Axis(0));
    if let Some(broadcast) = expanded.broadcast((batch_size, num_heads, seq_q, seq_k)) {
        Zip::from(scores).and(&broadcast).for_each(|s, &m| {
            if m == 0.0 {
                *s += MASK_VALUE;
            }
        });
    }

    Ok(())
}
