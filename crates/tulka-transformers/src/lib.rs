//! Core transformer components for encoder-decoder translation models
//!
//! This crate provides the building blocks for a sequence-to-sequence
//! transformer (embeddings, multi-head attention, residual pipelines,
//! encoder/decoder stacks) together with an incremental decode path that
//! grows per-layer key/value caches one step at a time instead of
//! recomputing the decoder over the whole prefix.

pub mod activations;
pub mod attention;
pub mod cache;
pub mod common;
pub mod embeddings;
pub mod encoder_decoder;
pub mod feedforward;
pub mod linear_layer;
pub mod lm_head;
pub mod normalization;
pub mod positional;
pub mod residual;
pub mod utils;
pub mod weights;

// Re-export commonly used items
pub use crate::{
    attention::{AttentionFormat, AttnMask, KvSource, MultiHeadAttention},
    cache::KvCache,
    common::ExecutionMode,
    embeddings::Embeddings,
    encoder_decoder::{
        DecodeState, GenerationConfig, Model, TransformerConfig, VocabSpec,
    },
    feedforward::FeedForward,
    lm_head::LmHead,
    normalization::LayerNorm,
    residual::{ResidualBlock, ResidualStep, ResidualSteps},
    weights::{ParamLoader, WeightMap},
};

// Prelude for easy imports
pub mod prelude {
    pub use crate::cache::KvCache;
    pub use crate::common::ExecutionMode;
    pub use crate::encoder_decoder::{DecodeState, Model, TransformerConfig};
    pub use crate::weights::{ParamLoader, WeightMap};
}
