//! Residual pipeline around attention and feed-forward sub-layers.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use ndarray::Array3;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::{dropout, ExecutionMode};
use crate::normalization::LayerNorm;
use crate::weights::ParamLoader;

/// One step of the residual pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualStep {
    /// Normalize the input before it reaches the inner sub-layer.
    PreNorm,
    /// Dropout on the inner sub-layer's output.
    Dropout,
    /// Add the block's original input to the inner output.
    Add,
    /// Normalize the result.
    PostNorm,
}

/// The ordered pipeline configuration.
///
/// The shipped configurations use the four-character code `ldan`
/// (layer-norm, dropout, add, normalize); each character maps to exactly
/// one named step and anything else is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidualSteps(pub Vec<ResidualStep>);

impl ResidualSteps {
    pub fn contains(&self, step: ResidualStep) -> bool {
        self.0.contains(&step)
    }
}

impl Default for ResidualSteps {
    fn default() -> Self {
        ResidualSteps(vec![
            ResidualStep::PreNorm,
            ResidualStep::Dropout,
            ResidualStep::Add,
            ResidualStep::PostNorm,
        ])
    }
}

impl FromStr for ResidualSteps {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut steps = Vec::with_capacity(s.len());
        for c in s.chars() {
            steps.push(match c {
                'l' => ResidualStep::PreNorm,
                'd' => ResidualStep::Dropout,
                'a' => ResidualStep::Add,
                'n' => ResidualStep::PostNorm,
                other => return Err(format!("unknown residual step '{}'", other)),
            });
        }
        Ok(ResidualSteps(steps))
    }
}

impl fmt::Display for ResidualSteps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.0 {
            let c = match step {
                ResidualStep::PreNorm => 'l',
                ResidualStep::Dropout => 'd',
                ResidualStep::Add => 'a',
                ResidualStep::PostNorm => 'n',
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl Serialize for ResidualSteps {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResidualSteps {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Wraps an inner sub-layer with the configured residual pipeline.
///
/// The block owns only what its pipeline needs: a pre-normalization when
/// `PreNorm` is configured, a post-normalization when `PostNorm` is, and
/// the dropout rate. The inner sub-layer itself is passed to [`apply`]
/// as a closure so attention and feed-forward callers can thread their
/// own masks and caches through.
///
/// [`apply`]: ResidualBlock::apply
impl std::fmt::Debug for ResidualBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidualBlock").finish_non_exhaustive()
    }
}

pub struct ResidualBlock {
    steps: ResidualSteps,
    pre_norm: Option<LayerNorm>,
    post_norm: Option<LayerNorm>,
    res_dropout: f32,
}

impl ResidualBlock {
    /// Build the block's norms under `{prefix}`.
    ///
    /// `in_size`/`out_size` describe the wrapped sub-layer; configuring
    /// `Add` with differing sizes is a configuration error because the
    /// residual sum needs matching shapes.
    pub fn build(
        loader: &mut ParamLoader,
        prefix: &str,
        steps: ResidualSteps,
        res_dropout: f32,
        in_size: usize,
        out_size: usize,
    ) -> Result<Self> {
        if steps.contains(ResidualStep::Add) && in_size != out_size {
            return Err(anyhow!(
                "residual add requires matching sizes, got {} -> {}",
                in_size,
                out_size
            ));
        }

        let pre_norm = if steps.contains(ResidualStep::PreNorm) {
            Some(LayerNorm::build(
                loader,
                &format!("{}.pre_norm", prefix),
                in_size,
            )?)
        } else {
            None
        };
        let post_norm = if steps.contains(ResidualStep::PostNorm) {
            Some(LayerNorm::build(
                loader,
                &format!("{}.post_norm", prefix),
                out_size,
            )?)
        } else {
            None
        };

        Ok(Self {
            steps,
            pre_norm,
            post_norm,
            res_dropout,
        })
    }

    /// The `PreNorm` step alone.
    ///
    /// Exposed because incremental decoding seeds its key/value caches
    /// from preprocessed layer inputs, outside a full pipeline run.
    pub fn preprocess(&self, input: &Array3<f32>) -> Array3<f32> {
        match &self.pre_norm {
            Some(norm) => norm.forward_3d(input),
            None => input.clone(),
        }
    }

    /// Run the pipeline around `inner`.
    ///
    /// `inner` receives the preprocessed input; the remaining configured
    /// steps are applied to its output in order.
    pub fn apply<F>(
        &self,
        input: &Array3<f32>,
        mode: ExecutionMode,
        inner: F,
    ) -> Result<Array3<f32>>
    where
        F: FnOnce(&Array3<f32>) -> Result<Array3<f32>>,
    {
        let preprocessed = self.preprocess(input);
        let mut out = inner(&preprocessed)?;

        for step in &self.steps.0 {
            match step {
                ResidualStep::PreNorm => {}
                ResidualStep::Dropout => {
                    out = dropout(out, self.res_dropout, mode);
                }
                ResidualStep::Add => {
                    if out.dim() != input.dim() {
                        return Err(anyhow!(
                            "residual add shape mismatch: {:?} vs {:?}",
                            out.dim(),
                            input.dim()
                        ));
                    }
                    out = out + input;
                }
                ResidualStep::PostNorm => {
                    if let Some(norm) = &self.post_norm {
                        out = norm.forward_3d(&out);
                    }
                }
            }
        }

        Ok(out)
    }
}
