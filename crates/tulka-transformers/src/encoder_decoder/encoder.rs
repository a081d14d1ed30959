//! Encoder stack.

use anyhow::Result;
use ndarray::{Array1, Array2, Array3};

use crate::attention::{AttentionFormat, AttnMask, KvSource, MultiHeadAttention};
use crate::common::{dropout, ExecutionMode};
use crate::embeddings::Embeddings;
use crate::feedforward::FeedForward;
use crate::normalization::LayerNorm;
use crate::positional::add_timing_signal;
use crate::residual::ResidualBlock;
use crate::utils::masks::padding_mask_from_lengths;
use crate::weights::ParamLoader;

use super::config::TransformerConfig;

/// One encoder layer: self-attention and feed-forward, each in its
/// residual pipeline.
pub struct EncoderLayer {
    self_attn: MultiHeadAttention,
    self_attn_res: ResidualBlock,
    ffn: FeedForward,
    ffn_res: ResidualBlock,
}

impl EncoderLayer {
    pub fn build(
        loader: &mut ParamLoader,
        prefix: &str,
        config: &TransformerConfig,
        in_size: usize,
    ) -> Result<Self> {
        let self_attn = MultiHeadAttention::build(
            loader,
            &format!("{}.self_attn", prefix),
            in_size,
            config.key_size(),
            config.value_size(),
            config.hidden_size,
            config.num_heads,
            config.attn_dropout,
            config.attn_value_dropout,
            AttentionFormat::Combined,
        )?;
        let self_attn_res = ResidualBlock::build(
            loader,
            &format!("{}.self_attn", prefix),
            config.res_steps.clone(),
            config.res_dropout,
            in_size,
            config.hidden_size,
        )?;
        let ffn = FeedForward::build(
            loader,
            &format!("{}.ffn", prefix),
            config.hidden_size,
            config.ff_size(),
            config.hidden_size,
            config.relu_dropout,
        )?;
        let ffn_res = ResidualBlock::build(
            loader,
            &format!("{}.ffn", prefix),
            config.res_steps.clone(),
            config.res_dropout,
            config.hidden_size,
            config.hidden_size,
        )?;

        Ok(Self {
            self_attn,
            self_attn_res,
            ffn,
            ffn_res,
        })
    }

    pub fn forward(
        &self,
        input: &Array3<f32>,
        padding_mask: &Array2<f32>,
        mode: ExecutionMode,
    ) -> Result<Array3<f32>> {
        let attended = self.self_attn_res.apply(input, mode, |x| {
            self.self_attn
                .attend(x, AttnMask::Padding(padding_mask), KvSource::SelfInput, mode)
        })?;
        self.ffn_res
            .apply(&attended, mode, |x| self.ffn.forward(x, mode))
    }
}

/// The full encoder: embeddings, position signal, layer stack.
pub struct Encoder {
    embeddings: Embeddings,
    input_bias: Option<Array1<f32>>,
    rescale_emb: bool,
    input_dropout: f32,
    layers: Vec<EncoderLayer>,
    final_norm: Option<LayerNorm>,
}

impl Encoder {
    pub fn build(
        loader: &mut ParamLoader,
        config: &TransformerConfig,
        embeddings: Embeddings,
    ) -> Result<Self> {
        let input_bias = if config.inp_emb_bias {
            Some(loader.take_1d("emb_inp.bias", config.emb_size(), 0.0)?)
        } else {
            None
        };

        let layers = (0..config.num_layers)
            .map(|i| {
                let in_size = if i == 0 {
                    config.emb_size()
                } else {
                    config.hidden_size
                };
                EncoderLayer::build(loader, &format!("encoder.layers.{}", i), config, in_size)
            })
            .collect::<Result<Vec<_>>>()?;

        let final_norm = if config.normalize_out {
            let size = if config.num_layers == 0 {
                config.emb_size()
            } else {
                config.hidden_size
            };
            Some(LayerNorm::build(loader, "encoder.final_norm", size)?)
        } else {
            None
        };

        Ok(Self {
            embeddings,
            input_bias,
            rescale_emb: config.rescale_emb,
            input_dropout: config.res_dropout,
            layers,
            final_norm,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Encode a batch of token ids.
    ///
    /// Returns the encoder output `[batch, len, hidden]` and the padding
    /// mask `[batch, len]` derived from `lengths`.
    pub fn encode(
        &self,
        input_ids: &Array2<u32>,
        lengths: &[usize],
        mode: ExecutionMode,
    ) -> Result<(Array3<f32>, Array2<f32>)> {
        let mut hidden = self.embeddings.forward(input_ids)?;
        if self.rescale_emb {
            hidden *= (self.embeddings.emb_size() as f32).sqrt();
        }
        if let Some(bias) = &self.input_bias {
            hidden += bias;
        }

        let padding_mask = padding_mask_from_lengths(lengths, input_ids.ncols());

        let offsets = Array1::zeros(input_ids.nrows());
        hidden = add_timing_signal(&hidden, &offsets, None);
        hidden = dropout(hidden, self.input_dropout, mode);

        for layer in &self.layers {
            hidden = layer.forward(&hidden, &padding_mask, mode)?;
        }

        if let Some(norm) = &self.final_norm {
            hidden = norm.forward_3d(&hidden);
        }

        Ok((hidden, padding_mask))
    }
}
