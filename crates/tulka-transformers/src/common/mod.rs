//! Execution mode and dropout.
//!
//! The mode is an explicit parameter threaded through every forward call.
//! Inference deterministically disables all dropout; there is no ambient
//! "is training" flag anywhere in the crate.

use ndarray::{Array, Dimension};
use rand::Rng;

/// Whether a forward pass runs with stochastic regularization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Training,
    Inference,
}

impl ExecutionMode {
    #[inline]
    pub fn is_training(self) -> bool {
        matches!(self, ExecutionMode::Training)
    }
}

/// Inverted dropout on an activation tensor of any rank.
///
/// Identity in inference mode or at rate 0. Kept units are rescaled by
/// `1 / (1 - rate)` so activation magnitudes match between modes.
pub fn dropout<D: Dimension>(x: Array<f32, D>, rate: f32, mode: ExecutionMode) -> Array<f32, D> {
    if !mode.is_training() || rate <= 0.0 {
        return x;
    }
    debug_assert!(rate < 1.0, "dropout rate must be < 1");

    let keep = 1.0 - rate;
    let scale = 1.0 / keep;
    let mut rng = rand::thread_rng();
    x.mapv(|v| {
        if rng.gen::<f32>() < rate {
            0.0
        } else {
            v * scale
        }
    })
}
