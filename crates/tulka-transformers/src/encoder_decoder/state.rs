//! The incremental decode state machine.
//!
//! `encode()` builds the initial state: it runs the encoder once, freezes
//! a per-layer cross-attention cache from the encoder output, seeds empty
//! per-layer self-attention caches, then performs one decode step with a
//! zero embedding to produce the first read-out. Each `decode()` call
//! consumes a state and returns a new one with every growing cache longer
//! by exactly one step. States are never mutated in place, so forking one
//! (e.g. for beam search) is a plain clone.

use anyhow::{anyhow, Result};
use ndarray::{concatenate, s, Array1, Array2, Array3, Axis};

use crate::cache::KvCache;
use crate::common::{dropout, ExecutionMode};
use crate::utils::masks::causal_mask;
use crate::positional::add_timing_signal;

use super::decoder::encoder_bypass;
use super::model::Model;

/// Everything one sequence batch needs to continue decoding.
#[derive(Debug, Clone)]
pub struct DecodeState {
    /// Encoder output, fixed for the whole decode. `[batch, n_inp, hidden]`
    pub enc_out: Array3<f32>,
    /// Encoder padding mask. `[batch, n_inp]`
    pub enc_mask: Array2<f32>,
    /// Tokens emitted so far. `[batch, steps]`
    pub out_seq: Array2<u32>,
    /// Read-out representation of the newest step. `[batch, hidden]`
    pub rdo: Array2<f32>,
    /// Per-sequence position offsets, advanced by one each step.
    pub offsets: Array1<f32>,
    /// History of decoder input embeddings. `[batch, steps, emb]`
    pub emb_cache: Array3<f32>,
    /// Per-layer history of layer outputs. `[batch, steps, hidden]` each.
    pub layer_caches: Vec<Array3<f32>>,
    /// Per-layer self-attention caches, grown one step per decode call.
    pub self_kv: Vec<KvCache>,
    /// Per-layer cross-attention caches, frozen at encode time.
    pub cross_kv: Vec<KvCache>,
}

impl DecodeState {
    pub fn batch_size(&self) -> usize {
        self.enc_out.shape()[0]
    }

    /// Number of decode steps taken (including the initial zero-embedding
    /// step performed inside `encode`).
    pub fn steps(&self) -> usize {
        self.self_kv
            .first()
            .map(|cache| cache.len())
            .unwrap_or_else(|| self.emb_cache.shape()[1])
    }

    /// Every growing cache must be exactly `steps` long; the cross caches
    /// must keep the encoder length forever.
    fn check_consistency(&self) -> Result<()> {
        let steps = self.steps();
        if self.emb_cache.shape()[1] != steps {
            return Err(anyhow!(
                "embedding cache has {} steps, expected {}",
                self.emb_cache.shape()[1],
                steps
            ));
        }
        for (i, cache) in self.self_kv.iter().enumerate() {
            if cache.len() != steps {
                return Err(anyhow!(
                    "self-attention cache of layer {} has {} steps, expected {}",
                    i,
                    cache.len(),
                    steps
                ));
            }
        }
        for (i, cache) in self.layer_caches.iter().enumerate() {
            if cache.shape()[1] != steps {
                return Err(anyhow!(
                    "activation cache of layer {} has {} steps, expected {}",
                    i,
                    cache.shape()[1],
                    steps
                ));
            }
        }
        let n_inp = self.enc_out.shape()[1];
        for (i, cache) in self.cross_kv.iter().enumerate() {
            if cache.len() != n_inp {
                return Err(anyhow!(
                    "cross-attention cache of layer {} has {} steps, expected the \
                     encoder length {}",
                    i,
                    cache.len(),
                    n_inp
                ));
            }
        }
        Ok(())
    }
}

impl Model {
    /// Run the encoder and produce the initial decode state.
    pub fn encode(
        &self,
        inp: &Array2<u32>,
        inp_len: Option<&[usize]>,
        mode: ExecutionMode,
    ) -> Result<DecodeState> {
        let lengths = self.resolve_lengths(inp, inp_len)?;
        let (enc_out, enc_mask) = self.encoder.encode(inp, &lengths, mode)?;

        let batch = inp.nrows();
        let emb_size = self.decoder.emb_size();
        let hidden = self.config.hidden_size;
        let num_layers = self.decoder.num_layers();

        // Cross-attention caches: computed once from the encoder output,
        // reused unchanged by every subsequent step.
        let cross_kv = self
            .decoder
            .layers
            .iter()
            .map(|layer| layer.precompute_cross_kv(&enc_out))
            .collect::<Result<Vec<_>>>()?;

        // Self-attention caches are seeded from zero-length per-layer
        // inputs so every shape is well-defined before the first step.
        let self_kv = self
            .decoder
            .layers
            .iter()
            .enumerate()
            .map(|(i, layer)| {
                let width = if i == 0 { emb_size } else { hidden };
                layer.project_step_kv(&Array3::zeros((batch, 0, width)))
            })
            .collect::<Result<Vec<_>>>()?;

        let state = DecodeState {
            enc_out,
            enc_mask,
            out_seq: Array2::zeros((batch, 0)),
            rdo: Array2::zeros((batch, hidden)),
            offsets: self.decoder.initial_offsets(batch, mode),
            emb_cache: Array3::zeros((batch, 0, emb_size)),
            layer_caches: vec![Array3::zeros((batch, 0, hidden)); num_layers],
            self_kv,
            cross_kv,
        };

        // Initial decode with a zero embedding in place of a begin token.
        self.decode(&state, None, mode)
    }

    /// Advance the state by one token.
    ///
    /// `words` holds one token id per batch row; `None` means the initial
    /// step, which uses a zero embedding. The input state is unchanged.
    pub fn decode(
        &self,
        state: &DecodeState,
        words: Option<&Array1<u32>>,
        mode: ExecutionMode,
    ) -> Result<DecodeState> {
        state.check_consistency()?;
        let batch = state.batch_size();
        let emb_size = self.decoder.emb_size();

        let out_seq = match words {
            None => state.out_seq.clone(),
            Some(words) => {
                if words.len() != batch {
                    return Err(anyhow!(
                        "got {} tokens for a batch of {}",
                        words.len(),
                        batch
                    ));
                }
                let column = words.view().insert_axis(Axis(1));
                concatenate![Axis(1), state.out_seq.view(), column]
            }
        };

        let emb_t = match words {
            None => Array3::zeros((batch, 1, emb_size)),
            Some(words) => {
                let ids = words.view().insert_axis(Axis(1)).to_owned();
                self.decoder.embed_tokens(&ids)?
            }
        };

        // Position signal for the current offset only; a single step, not
        // the whole prefix.
        let mut x = add_timing_signal(&emb_t, &state.offsets, None);
        x = dropout(x, self.decoder.input_dropout(), mode);

        if self.decoder.layers.is_empty() {
            x += &encoder_bypass(&state.enc_out, &state.enc_mask);
        }

        let emb_cache = concatenate![Axis(1), state.emb_cache.view(), x.view()]
            .as_standard_layout()
            .to_owned();

        // The newest position sees the whole grown cache.
        let step_mask = causal_mask(1, state.steps() + 1);

        let mut self_kv = Vec::with_capacity(self.decoder.layers.len());
        let mut layer_caches = Vec::with_capacity(self.decoder.layers.len());

        for (i, layer) in self.decoder.layers.iter().enumerate() {
            let new_kv = layer.project_step_kv(&x)?;
            let grown = state.self_kv[i].appended(&new_kv)?;

            x = layer.forward_step(
                &x,
                &step_mask,
                &grown,
                &state.cross_kv[i],
                &state.enc_mask,
                mode,
            )?;

            layer_caches.push(
                concatenate![Axis(1), state.layer_caches[i].view(), x.view()]
                    .as_standard_layout()
                    .to_owned(),
            );
            self_kv.push(grown);
        }

        if let Some(norm) = &self.decoder.final_norm {
            x = norm.forward_3d(&x);
        }

        let rdo = x.slice(s![.., 0, ..]).to_owned();

        Ok(DecodeState {
            enc_out: state.enc_out.clone(),
            enc_mask: state.enc_mask.clone(),
            out_seq,
            rdo,
            offsets: &state.offsets + 1.0,
            emb_cache,
            layer_caches,
            self_kv,
            cross_kv: state.cross_kv.clone(),
        })
    }

    /// Next-token logits for the newest step. Stateless.
    pub fn logits_of(&self, state: &DecodeState) -> Array2<f32> {
        self.lm_head.forward_2d(&state.rdo)
    }
}
