//! Sinusoidal position signal, offsettable per sequence and reversible.
//!
//! The signal is a pure function of (position + offset), so generating one
//! time-step at offset `k` is numerically identical to row `k` of a full
//! sequence generated at offset 0. Incremental decoding depends on this
//! equivalence to match full-sequence scoring.

use ndarray::{Array1, Array3};
use rand::Rng;

pub const MIN_TIMESCALE: f32 = 1.0;
pub const MAX_TIMESCALE: f32 = 1.0e4;

/// Half-width of the uniform integer range the training-time random
/// position offset is drawn from. A tunable constant, independent of the
/// maximum sequence length.
pub const RANDOM_OFFSET_RANGE: i32 = 32_000;

/// Generate the signal for `length` steps of `channels` features.
///
/// `offsets` holds one position offset per batch row. Sequences flagged in
/// `reverse` get negated positions, keeping the signal phase consistent for
/// targets encoded in reverse token order. For each of `channels / 2`
/// log-spaced timescales the signal emits a sine and a cosine, all sines
/// first, then all cosines, then one zero column if `channels` is odd.
pub fn timing_signal(
    length: usize,
    channels: usize,
    offsets: &Array1<f32>,
    reverse: Option<&[bool]>,
) -> Array3<f32> {
    let batch = offsets.len();
    let num_timescales = channels / 2;
    let mut signal = Array3::zeros((batch, length, channels));
    if num_timescales == 0 {
        return signal;
    }

    let log_timescale_increment = (MAX_TIMESCALE / MIN_TIMESCALE).ln()
        / (num_timescales.max(2) - 1) as f32;
    let inv_timescales: Vec<f32> = (0..num_timescales)
        .map(|i| MIN_TIMESCALE * (-(i as f32) * log_timescale_increment).exp())
        .collect();

    for b in 0..batch {
        let flip = match reverse {
            Some(flags) if flags[b] => -1.0,
            _ => 1.0,
        };
        for t in 0..length {
            let position = (t as f32 + offsets[b]) * flip;
            for (i, &inv) in inv_timescales.iter().enumerate() {
                let scaled = position * inv;
                signal[[b, t, i]] = scaled.sin();
                signal[[b, t, num_timescales + i]] = scaled.cos();
            }
        }
    }

    signal
}

/// Add the timing signal to an embedded input in place of returning it.
pub fn add_timing_signal(
    inp: &Array3<f32>,
    offsets: &Array1<f32>,
    reverse: Option<&[bool]>,
) -> Array3<f32> {
    let (batch, length, channels) = inp.dim();
    debug_assert_eq!(batch, offsets.len());
    inp + &timing_signal(length, channels, offsets, reverse)
}

/// Per-sequence offsets drawn uniformly from the symmetric integer range.
/// Training-only; inference always uses deterministic offsets.
pub fn random_offsets(batch: usize) -> Array1<f32> {
    let mut rng = rand::thread_rng();
    Array1::from_shape_fn(batch, |_| {
        rng.gen_range(-RANDOM_OFFSET_RANGE..RANDOM_OFFSET_RANGE) as f32
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_step_matches_full_sequence_row() {
        let channels = 16;
        let full = timing_signal(10, channels, &Array1::zeros(1), None);

        for k in 0..10 {
            let step = timing_signal(1, channels, &Array1::from_elem(1, k as f32), None);
            for c in 0..channels {
                assert_eq!(
                    step[[0, 0, c]],
                    full[[0, k, c]],
                    "mismatch at position {} channel {}",
                    k,
                    c
                );
            }
        }
    }

    #[test]
    fn test_sines_then_cosines_layout() {
        let signal = timing_signal(1, 8, &Array1::zeros(1), None);
        // Position 0: all sines are 0, all cosines are 1.
        for i in 0..4 {
            assert_eq!(signal[[0, 0, i]], 0.0);
            assert_eq!(signal[[0, 0, 4 + i]], 1.0);
        }
    }

    #[test]
    fn test_odd_channel_count_pads_with_zero_column() {
        let signal = timing_signal(3, 7, &Array1::zeros(2), None);
        for b in 0..2 {
            for t in 0..3 {
                assert_eq!(signal[[b, t, 6]], 0.0);
            }
        }
    }

    #[test]
    fn test_reverse_negates_positions() {
        let offsets = Array1::zeros(2);
        let fwd = timing_signal(4, 8, &offsets, None);
        let rev = timing_signal(4, 8, &offsets, Some(&[false, true]));

        for t in 0..4 {
            for c in 0..4 {
                // Row 0 unflagged: identical. Row 1 flagged: sines negate,
                // cosines are even functions.
                assert_eq!(rev[[0, t, c]], fwd[[0, t, c]]);
                assert_eq!(rev[[1, t, c]], -fwd[[1, t, c]]);
                assert_eq!(rev[[1, t, 4 + c]], fwd[[1, t, 4 + c]]);
            }
        }
    }

    #[test]
    fn test_per_sequence_offsets() {
        let offsets = Array1::from_vec(vec![0.0, 5.0]);
        let signal = timing_signal(1, 8, &offsets, None);
        let shifted = timing_signal(6, 8, &Array1::zeros(1), None);
        for c in 0..8 {
            assert_eq!(signal[[1, 0, c]], shifted[[0, 5, c]]);
        }
    }
}
