use std::path::{Path, PathBuf};

use tulka_transformers::weights::{load_safetensors, WeightMap};
use tulka_transformers::{GenerationConfig, Model, TransformerConfig, VocabSpec};

use crate::error::{TulkaError, TulkaResult};
use crate::translator::Translator;
use crate::vocab::Vocab;

enum WeightSource {
    Map(WeightMap),
    File(PathBuf),
    Random(u64),
}

/// Assembles a [`Translator`] from config, vocabularies and weights.
pub struct TranslatorBuilder {
    config: TransformerConfig,
    generation: GenerationConfig,
    inp_voc: Option<Vocab>,
    out_voc: Option<Vocab>,
    weights: Option<WeightSource>,
}

impl std::fmt::Debug for TranslatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatorBuilder")
            .field("generation", &self.generation)
            .field("has_inp_voc", &self.inp_voc.is_some())
            .field("has_out_voc", &self.out_voc.is_some())
            .field("has_weights", &self.weights.is_some())
            .finish_non_exhaustive()
    }
}

impl TranslatorBuilder {
    pub fn new() -> Self {
        Self {
            config: TransformerConfig::default(),
            generation: GenerationConfig::default(),
            inp_voc: None,
            out_voc: None,
            weights: None,
        }
    }

    pub fn config(mut self, config: TransformerConfig) -> Self {
        self.config = config;
        self
    }

    /// Parse hyperparameters from a JSON string, rejecting unknown fields.
    pub fn config_json(mut self, json: &str) -> TulkaResult<Self> {
        self.config = TransformerConfig::from_json(json)
            .map_err(|e| TulkaError::InvalidConfig(e.to_string()))?;
        Ok(self)
    }

    pub fn generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn inp_vocab(mut self, vocab: Vocab) -> Self {
        self.inp_voc = Some(vocab);
        self
    }

    pub fn out_vocab(mut self, vocab: Vocab) -> Self {
        self.out_voc = Some(vocab);
        self
    }

    pub fn inp_vocab_file(self, path: impl AsRef<Path>) -> TulkaResult<Self> {
        let vocab = Vocab::from_file(path)?;
        Ok(self.inp_vocab(vocab))
    }

    pub fn out_vocab_file(self, path: impl AsRef<Path>) -> TulkaResult<Self> {
        let vocab = Vocab::from_file(path)?;
        Ok(self.out_vocab(vocab))
    }

    /// Use an already-loaded parameter mapping.
    pub fn weights_map(mut self, weights: WeightMap) -> Self {
        self.weights = Some(WeightSource::Map(weights));
        self
    }

    /// Load parameters from a safetensors checkpoint at build time.
    pub fn weights_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.weights = Some(WeightSource::File(path.into()));
        self
    }

    /// Seeded random initialization, for tests and experiments.
    pub fn random_init(mut self, seed: u64) -> Self {
        self.weights = Some(WeightSource::Random(seed));
        self
    }

    pub fn build(self) -> TulkaResult<Translator> {
        let inp_voc = self
            .inp_voc
            .ok_or(TulkaError::MissingComponent("input vocabulary"))?;
        let out_voc = self
            .out_voc
            .ok_or(TulkaError::MissingComponent("output vocabulary"))?;
        let weights = self
            .weights
            .ok_or(TulkaError::MissingComponent("model weights"))?;

        let vocab_spec = VocabSpec {
            inp_size: inp_voc.len(),
            out_size: out_voc.len(),
            inp_eos: inp_voc.eos(),
            out_eos: out_voc.eos(),
        };

        let model = match weights {
            WeightSource::Random(seed) => Model::random(self.config, vocab_spec, seed)
                .map_err(|e| TulkaError::InvalidConfig(e.to_string()))?,
            WeightSource::Map(map) => Model::from_weights(self.config, vocab_spec, map)
                .map_err(|source| TulkaError::CheckpointFailed { source })?,
            WeightSource::File(path) => {
                let map = load_safetensors(&path)
                    .map_err(|source| TulkaError::CheckpointFailed { source })?;
                Model::from_weights(self.config, vocab_spec, map)
                    .map_err(|source| TulkaError::CheckpointFailed { source })?
            }
        };

        log::info!(
            "built translator: {} encoder/decoder layers, {} -> {} tokens",
            model.config().num_layers,
            vocab_spec.inp_size,
            vocab_spec.out_size
        );

        Ok(Translator {
            model,
            inp_voc,
            out_voc,
            generation: self.generation,
        })
    }
}

impl Default for TranslatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
