//! Greedy generation loop over the incremental decode state machine.

use anyhow::Result;
use ndarray::{Array1, Array2};

use crate::common::ExecutionMode;

use super::model::Model;
use super::state::DecodeState;

/// Generation limits.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Hard cap on emitted tokens per sequence, end-of-sequence included.
    pub max_length: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { max_length: 200 }
    }
}

/// Greedily decode a batch of source sequences into target token ids.
///
/// Every returned row ends at its first end-of-sequence id or runs to
/// `max_length`. Sequences that finish early stay in the batch and keep
/// emitting end-of-sequence; they are masked along, never terminated
/// individually.
pub fn greedy_generate(
    model: &Model,
    inp: &Array2<u32>,
    inp_len: Option<&[usize]>,
    config: &GenerationConfig,
) -> Result<Array2<u32>> {
    let t_start = std::time::Instant::now();
    let eos = model.vocab().out_eos;
    let batch = inp.nrows();

    let mut state: DecodeState = model.encode(inp, inp_len, ExecutionMode::Inference)?;
    let mut finished = vec![false; batch];

    for _ in 0..config.max_length {
        let logits = model.logits_of(&state);
        let mut words = argmax_rows(&logits);
        for (i, word) in words.iter_mut().enumerate() {
            if finished[i] {
                *word = eos;
            } else if *word == eos {
                finished[i] = true;
            }
        }

        state = model.decode(&state, Some(&words), ExecutionMode::Inference)?;
        if finished.iter().all(|&f| f) {
            break;
        }
    }

    let elapsed = t_start.elapsed();
    let num_tokens = state.out_seq.len();
    if num_tokens > 0 && elapsed.as_secs_f32() > 0.0 {
        log::info!(
            "generated {} tokens in {:?} ({:.2} t/s)",
            num_tokens,
            elapsed,
            num_tokens as f32 / elapsed.as_secs_f32()
        );
    }

    Ok(state.out_seq)
}

fn argmax_rows(logits: &Array2<f32>) -> Array1<u32> {
    Array1::from_shape_fn(logits.nrows(), |i| {
        let row = logits.row(i);
        let mut best = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for (j, &score) in row.iter().enumerate() {
            if score > best_score {
                best = j;
                best_score = score;
            }
        }
        best as u32
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_argmax_rows() {
        let logits = array![[0.1_f32, 0.9, -0.3], [2.0, -1.0, 1.5]];
        let words = argmax_rows(&logits);
        assert_eq!(words.to_vec(), vec![1, 0]);
    }
}
