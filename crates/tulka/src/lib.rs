//! High-level translation API.
//!
//! ```ignore
//! use tulka::Translator;
//!
//! let translator = Translator::builder()
//!     .config_json(&std::fs::read_to_string("hp.json")?)?
//!     .inp_vocab_file("data/1.voc")?
//!     .out_vocab_file("data/2.voc")?
//!     .weights_file("model.safetensors")
//!     .build()?;
//!
//! let translations = translator.translate_many(&["ich bin ein berliner"])?;
//! ```

mod error;
pub mod translator;
pub mod vocab;

pub use error::{TulkaError, TulkaResult};
pub use translator::{Translator, TranslatorBuilder};
pub use vocab::Vocab;

// The core building blocks, for callers that drive decoding themselves.
pub use tulka_transformers::{
    DecodeState, ExecutionMode, GenerationConfig, Model, TransformerConfig, VocabSpec,
};
