use tulka_transformers::encoder_decoder::greedy_generate;
use tulka_transformers::{GenerationConfig, Model};

use crate::error::TulkaResult;
use crate::translator::TranslatorBuilder;
use crate::vocab::Vocab;

/// A loaded model plus its source/target vocabularies.
pub struct Translator {
    pub(crate) model: Model,
    pub(crate) inp_voc: Vocab,
    pub(crate) out_voc: Vocab,
    pub(crate) generation: GenerationConfig,
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Translator {
    pub fn builder() -> TranslatorBuilder {
        TranslatorBuilder::new()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Translate a batch of sentences.
    ///
    /// Sequences of unequal length share one batch: shorter sources are
    /// padding-masked and finished targets keep emitting end-of-sequence
    /// until the whole batch stops.
    pub fn translate_many(&self, texts: &[&str]) -> TulkaResult<Vec<String>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let (ids, lengths) = self.inp_voc.tokenize_many(texts);
        let out = greedy_generate(&self.model, &ids, Some(&lengths), &self.generation)?;
        Ok(self.out_voc.detokenize_many(&out))
    }

    /// Translate a single sentence.
    pub fn translate(&self, text: &str) -> TulkaResult<String> {
        let mut translations = self.translate_many(&[text])?;
        Ok(translations.remove(0))
    }
}
