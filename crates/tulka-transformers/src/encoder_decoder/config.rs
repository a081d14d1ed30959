//! Model hyperparameters.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::attention::AttentionFormat;
use crate::residual::ResidualSteps;

/// Hyperparameters of the encoder-decoder transformer.
///
/// Every field has a documented default; unknown fields in a config file
/// are rejected at parse time rather than silently accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransformerConfig {
    /// Encoder and decoder depth.
    pub num_layers: usize,
    pub num_heads: usize,
    pub hidden_size: usize,
    /// Embedding width; defaults to `hidden_size`.
    pub emb_size: Option<usize>,
    /// Total key depth across heads; defaults to `hidden_size`.
    pub key_size: Option<usize>,
    /// Total value depth across heads; defaults to `hidden_size`.
    pub value_size: Option<usize>,
    /// Feed-forward hidden width; defaults to `hidden_size`.
    pub ff_size: Option<usize>,

    pub attn_dropout: f32,
    pub attn_value_dropout: f32,
    pub relu_dropout: f32,
    pub res_dropout: f32,

    /// One embedding table for source and target vocabularies.
    pub share_emb: bool,
    /// Tie the logits projection to the output embedding table.
    pub tie_output_emb: bool,
    /// Learned additive bias on input embeddings.
    pub inp_emb_bias: bool,
    /// Multiply embeddings by `sqrt(emb_size)`.
    pub rescale_emb: bool,
    /// Random per-sequence position offset for decoder training.
    pub dst_rand_offset: bool,
    /// Layer-normalize the final encoder/decoder outputs.
    pub normalize_out: bool,

    pub res_steps: ResidualSteps,
    /// Projection layout of the encoder-attending decoder layers.
    pub cross_attn_format: AttentionFormat,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            num_layers: 6,
            num_heads: 8,
            hidden_size: 512,
            emb_size: None,
            key_size: None,
            value_size: None,
            ff_size: None,
            attn_dropout: 0.0,
            attn_value_dropout: 0.0,
            relu_dropout: 0.0,
            res_dropout: 0.1,
            share_emb: false,
            tie_output_emb: false,
            inp_emb_bias: false,
            rescale_emb: false,
            dst_rand_offset: false,
            normalize_out: false,
            res_steps: ResidualSteps::default(),
            cross_attn_format: AttentionFormat::SplitQueryKv,
        }
    }
}

impl TransformerConfig {
    pub fn emb_size(&self) -> usize {
        self.emb_size.unwrap_or(self.hidden_size)
    }

    pub fn key_size(&self) -> usize {
        self.key_size.unwrap_or(self.hidden_size)
    }

    pub fn value_size(&self) -> usize {
        self.value_size.unwrap_or(self.hidden_size)
    }

    pub fn ff_size(&self) -> usize {
        self.ff_size.unwrap_or(self.hidden_size)
    }

    /// Reject impossible configurations before any parameter exists.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 {
            return Err(anyhow!("hidden_size must be positive"));
        }
        if self.num_heads == 0 {
            return Err(anyhow!("num_heads must be positive"));
        }
        if self.key_size() % self.num_heads != 0 {
            return Err(anyhow!(
                "key size {} is not divisible by {} heads",
                self.key_size(),
                self.num_heads
            ));
        }
        if self.value_size() % self.num_heads != 0 {
            return Err(anyhow!(
                "value size {} is not divisible by {} heads",
                self.value_size(),
                self.num_heads
            ));
        }
        if self.num_layers == 0 && self.emb_size() != self.hidden_size {
            return Err(anyhow!(
                "a zero-layer decoder feeds embeddings straight to the output \
                 projection; emb_size {} must equal hidden_size {}",
                self.emb_size(),
                self.hidden_size
            ));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Vocabulary sizes and end-of-sequence ids the model needs from its
/// tokenizer collaborators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VocabSpec {
    pub inp_size: usize,
    pub out_size: usize,
    pub inp_eos: u32,
    pub out_eos: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve_to_hidden_size() {
        let config = TransformerConfig::default();
        assert_eq!(config.emb_size(), 512);
        assert_eq!(config.key_size(), 512);
        assert_eq!(config.ff_size(), 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_head_count_rejected() {
        let config = TransformerConfig {
            hidden_size: 30,
            num_heads: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = TransformerConfig::from_json(r#"{"num_layers": 2, "inner_hid_size": 256}"#)
            .unwrap_err();
        assert!(err.to_string().contains("inner_hid_size"));
    }

    #[test]
    fn test_json_round_trip() {
        let config = TransformerConfig::from_json(
            r#"{
                "num_layers": 2,
                "num_heads": 4,
                "hidden_size": 64,
                "ff_size": 256,
                "res_steps": "ldan",
                "cross_attn_format": "v1",
                "tie_output_emb": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.num_layers, 2);
        assert_eq!(config.ff_size(), 256);
        assert_eq!(config.cross_attn_format, AttentionFormat::SplitQueryKv);
        assert!(config.tie_output_emb);
    }

    #[test]
    fn test_zero_layer_width_mismatch_rejected() {
        let config = TransformerConfig {
            num_layers: 0,
            hidden_size: 64,
            emb_size: Some(32),
            num_heads: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
