//! Word-level vocabulary collaborator.
//!
//! The model core only sees integer ids; this type owns the mapping in
//! both directions, the reserved marker tokens, and the batching of
//! variable-length sequences into padded id matrices.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use ndarray::Array2;

use crate::error::{TulkaError, TulkaResult};

pub const BOS_TOKEN: &str = "_BOS_";
pub const EOS_TOKEN: &str = "_EOS_";
pub const UNK_TOKEN: &str = "_UNK_";

/// A fixed word-level vocabulary with reserved begin/end/unknown ids.
#[derive(Debug, Clone)]
pub struct Vocab {
    words: Vec<String>,
    ids: HashMap<String, u32>,
}

impl Vocab {
    /// Build from plain tokens; the three marker tokens are prepended.
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        let mut words: Vec<String> = vec![
            BOS_TOKEN.to_string(),
            EOS_TOKEN.to_string(),
            UNK_TOKEN.to_string(),
        ];
        let mut ids: HashMap<String, u32> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as u32))
            .collect();

        for token in tokens {
            if !ids.contains_key(&token) {
                ids.insert(token.clone(), words.len() as u32);
                words.push(token);
            }
        }

        Self { words, ids }
    }

    /// One token per line.
    pub fn from_lines(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty()),
        )
    }

    pub fn from_file(path: impl AsRef<Path>) -> TulkaResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read {}", path.as_ref().display()))
            .map_err(|source| TulkaError::VocabFailed { source })?;
        Ok(Self::from_lines(&text))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn bos(&self) -> u32 {
        0
    }

    pub fn eos(&self) -> u32 {
        1
    }

    pub fn unk(&self) -> u32 {
        2
    }

    pub fn id_of(&self, word: &str) -> u32 {
        self.ids.get(word).copied().unwrap_or_else(|| self.unk())
    }

    pub fn token_of(&self, id: u32) -> Option<&str> {
        self.words.get(id as usize).map(|s| s.as_str())
    }

    /// Tokenize a batch into an end-of-sequence-padded id matrix.
    ///
    /// Every row is terminated with the end-of-sequence id and padded
    /// with it to the longest row; the returned lengths count the
    /// terminator but not the padding.
    pub fn tokenize_many(&self, texts: &[&str]) -> (Array2<u32>, Vec<usize>) {
        let rows: Vec<Vec<u32>> = texts
            .iter()
            .map(|text| {
                let mut row: Vec<u32> =
                    text.split_whitespace().map(|w| self.id_of(w)).collect();
                row.push(self.eos());
                row
            })
            .collect();

        let lengths: Vec<usize> = rows.iter().map(|r| r.len()).collect();
        let max_len = lengths.iter().copied().max().unwrap_or(1);

        let mut ids = Array2::from_elem((rows.len(), max_len), self.eos());
        for (i, row) in rows.iter().enumerate() {
            for (j, &id) in row.iter().enumerate() {
                ids[[i, j]] = id;
            }
        }

        (ids, lengths)
    }

    /// Detokenize a batch, stripping markers and everything after the
    /// first end-of-sequence id.
    pub fn detokenize_many(&self, ids: &Array2<u32>) -> Vec<String> {
        ids.outer_iter()
            .map(|row| {
                let mut words = Vec::new();
                for &id in row.iter() {
                    if id == self.eos() {
                        break;
                    }
                    if id == self.bos() {
                        continue;
                    }
                    words.push(self.token_of(id).unwrap_or(UNK_TOKEN));
                }
                words.join(" ")
            })
            .collect()
    }
}
