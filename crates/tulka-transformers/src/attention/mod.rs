//! Multi-head attention with derived Q/KV projections and KV caching.

use std::str::FromStr;

use anyhow::{anyhow, Result};
use ndarray::{s, Array3, Array4};

use crate::activations::softmax_4d_inplace;
use crate::cache::KvCache;
use crate::common::{dropout, ExecutionMode};
use crate::linear_layer::Dense;
use crate::utils::linear_algebra::matmul_4d;
use crate::utils::masks::{apply_causal_mask, apply_padding_mask};
use crate::weights::ParamLoader;

/// Which projection matrices are materialized directly.
///
/// Both layouts are functionally equivalent. `Combined` owns one fused
/// `[in, 2*key + value]` matrix and derives the query and key/value
/// sub-projections as column ranges into it; `SplitQueryKv` owns a separate
/// query matrix and a key/value matrix, which lets cross-attention project
/// keys/values from a different input than the queries without touching
/// the fused layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionFormat {
    Combined,
    SplitQueryKv,
}

impl FromStr for AttentionFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "combined" => Ok(AttentionFormat::Combined),
            "split" | "use_kv" | "v1" => Ok(AttentionFormat::SplitQueryKv),
            _ => Err(format!("unexpected attention format: {}", s)),
        }
    }
}

impl std::fmt::Display for AttentionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AttentionFormat::Combined => "combined",
            AttentionFormat::SplitQueryKv => "split",
        })
    }
}

impl serde::Serialize for AttentionFormat {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for AttentionFormat {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The mask applied to attention scores before softmax.
pub enum AttnMask<'a> {
    None,
    /// `[batch, n_keys]`, marks real vs. padding key positions.
    Padding(&'a ndarray::Array2<f32>),
    /// `[n_queries, n_keys]`, lower-triangular for autoregressive decoding.
    Causal(&'a ndarray::Array2<f32>),
}

/// Where keys and values come from for one attention call.
///
/// Exactly one source per call; supplying both a memory input and a cache
/// is unrepresentable by construction.
pub enum KvSource<'a> {
    /// Self-attention: project K and V from the query input.
    SelfInput,
    /// Cross-attention: project K and V from a separate memory input.
    Input(&'a Array3<f32>),
    /// Reuse an externally grown or frozen cache.
    Cached(&'a KvCache),
}

enum Projections {
    Combined { qkv: Dense },
    Split { query: Dense, key_value: Dense },
}

impl std::fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHeadAttention").finish_non_exhaustive()
    }
}

/// Multihead scaled dot-product attention with input/output projections.
pub struct MultiHeadAttention {
    projections: Projections,
    out_proj: Dense,

    key_size: usize,
    value_size: usize,
    num_heads: usize,
    attn_dropout: f32,
    value_dropout: f32,
}

impl MultiHeadAttention {
    /// Build the attention unit under `{prefix}`.
    ///
    /// Head-count divisibility is validated before any parameter is
    /// materialized; a bad configuration never touches tensor data.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        loader: &mut ParamLoader,
        prefix: &str,
        input_size: usize,
        key_size: usize,
        value_size: usize,
        output_size: usize,
        num_heads: usize,
        attn_dropout: f32,
        value_dropout: f32,
        format: AttentionFormat,
    ) -> Result<Self> {
        if num_heads == 0 {
            return Err(anyhow!("attention needs at least one head"));
        }
        if key_size % num_heads != 0 {
            return Err(anyhow!(
                "key depth {} is not divisible by {} heads",
                key_size,
                num_heads
            ));
        }
        if value_size % num_heads != 0 {
            return Err(anyhow!(
                "value depth {} is not divisible by {} heads",
                value_size,
                num_heads
            ));
        }

        let projections = match format {
            AttentionFormat::Combined => Projections::Combined {
                qkv: Dense::build(
                    loader,
                    &format!("{}.qkv", prefix),
                    input_size,
                    2 * key_size + value_size,
                    None,
                )?,
            },
            AttentionFormat::SplitQueryKv => Projections::Split {
                query: Dense::build(loader, &format!("{}.q", prefix), input_size, key_size, None)?,
                key_value: Dense::build(
                    loader,
                    &format!("{}.kv", prefix),
                    input_size,
                    key_size + value_size,
                    None,
                )?,
            },
        };
        let out_proj = Dense::build(
            loader,
            &format!("{}.out", prefix),
            value_size,
            output_size,
            None,
        )?;

        Ok(Self {
            projections,
            out_proj,
            key_size,
            value_size,
            num_heads,
            attn_dropout,
            value_dropout,
        })
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Project queries only.
    pub fn project_query(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        match &self.projections {
            Projections::Combined { qkv } => qkv.slice_out(0..self.key_size).forward(input),
            Projections::Split { query, .. } => query.forward(input),
        }
    }

    /// Project keys and values, e.g. to seed or grow a cache.
    pub fn project_kv(&self, input: &Array3<f32>) -> Result<KvCache> {
        let fused = match &self.projections {
            Projections::Combined { qkv } => qkv
                .slice_out(self.key_size..2 * self.key_size + self.value_size)
                .forward(input)?,
            Projections::Split { key_value, .. } => key_value.forward(input)?,
        };
        self.split_kv(fused)
    }

    fn split_kv(&self, fused: Array3<f32>) -> Result<KvCache> {
        let keys = fused.slice(s![.., .., 0..self.key_size]).to_owned();
        let values = fused.slice(s![.., .., self.key_size..]).to_owned();
        KvCache::new(keys, values)
    }

    /// Scaled dot-product attention over `num_heads` heads.
    ///
    /// Returns `[batch, n_queries, output_size]`.
    pub fn attend(
        &self,
        query_inp: &Array3<f32>,
        mask: AttnMask,
        kv: KvSource,
        mode: ExecutionMode,
    ) -> Result<Array3<f32>> {
        let (q, keys, values) = match kv {
            KvSource::SelfInput => match &self.projections {
                Projections::Combined { qkv } => {
                    // One fused matmul, then split into Q / K / V.
                    let fused = qkv.forward(query_inp)?;
                    let q = fused.slice(s![.., .., 0..self.key_size]).to_owned();
                    let kv = self.split_kv(fused.slice(s![.., .., self.key_size..]).to_owned())?;
                    (q, kv.keys, kv.values)
                }
                Projections::Split { .. } => {
                    let q = self.project_query(query_inp)?;
                    let kv = self.project_kv(query_inp)?;
                    (q, kv.keys, kv.values)
                }
            },
            KvSource::Input(memory) => {
                let q = self.project_query(query_inp)?;
                let kv = self.project_kv(memory)?;
                (q, kv.keys, kv.values)
            }
            KvSource::Cached(cache) => {
                if cache.keys.shape()[2] != self.key_size
                    || cache.values.shape()[2] != self.value_size
                {
                    return Err(anyhow!(
                        "cached key/value depths {:?}/{:?} do not match attention depths {}/{}",
                        cache.keys.shape()[2],
                        cache.values.shape()[2],
                        self.key_size,
                        self.value_size
                    ));
                }
                let q = self.project_query(query_inp)?;
                (q, cache.keys.clone(), cache.values.clone())
            }
        };

        let batch_size = q.shape()[0];
        let n_queries = q.shape()[1];
        if keys.shape()[0] != batch_size {
            return Err(anyhow!(
                "query batch size {} does not match key/value batch size {}",
                batch_size,
                keys.shape()[0]
            ));
        }

        let key_depth_per_head = self.key_size / self.num_heads;
        let scale = 1.0 / (key_depth_per_head as f32).sqrt();

        let q_heads = split_heads(&(q * scale), self.num_heads)?;
        let k_heads = split_heads(&keys, self.num_heads)?;
        let v_heads = split_heads(&values, self.num_heads)?;

        let k_transposed = k_heads
            .permuted_axes([0, 1, 3, 2])
            .as_standard_layout()
            .to_owned();
        let mut scores = matmul_4d(&q_heads, &k_transposed);

        match mask {
            AttnMask::None => {}
            AttnMask::Padding(m) => apply_padding_mask(&mut scores, m)?,
            AttnMask::Causal(m) => apply_causal_mask(&mut scores, m)?,
        }

        softmax_4d_inplace(&mut scores);
        let weights = dropout(scores, self.attn_dropout, mode);

        let context = matmul_4d(&weights, &v_heads);
        let combined = context
            .permuted_axes([0, 2, 1, 3])
            .as_standard_layout()
            .to_owned()
            .into_shape_with_order((batch_size, n_queries, self.value_size))?;

        let combined = dropout(combined, self.value_dropout, mode);
        self.out_proj.forward(&combined)
    }
}

/// Split the trailing depth into heads: `[b, n, d]` -> `[b, H, n, d/H]`.
fn split_heads(x: &Array3<f32>, num_heads: usize) -> Result<Array4<f32>> {
    let (batch, n, depth) = x.dim();
    let head_dim = depth / num_heads;
    let reshaped = x
        .as_standard_layout()
        .to_owned()
        .into_shape_with_order((batch, n, num_heads, head_dim))?;
    Ok(reshaped
        .permuted_axes([0, 2, 1, 3])
        .as_standard_layout()
        .to_owned())
}
