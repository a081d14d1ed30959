//! Key/value caches for incremental decoding.

use anyhow::{anyhow, Result};
use ndarray::{concatenate, Array3, Axis};

/// A pair of key/value projection tensors, `[batch, len, depth]` each.
///
/// Self-attention caches grow by exactly one time-step per decode call;
/// cross-attention caches are computed once from the encoder output and
/// never regrown. Growth is functional: [`appended`](KvCache::appended)
/// returns a new cache, leaving the input untouched so a decode state can
/// be forked (e.g. for beam search) without copy-on-write bookkeeping.
#[derive(Debug, Clone)]
pub struct KvCache {
    pub keys: Array3<f32>,
    pub values: Array3<f32>,
}

impl KvCache {
    pub fn new(keys: Array3<f32>, values: Array3<f32>) -> Result<Self> {
        if keys.shape()[0] != values.shape()[0] || keys.shape()[1] != values.shape()[1] {
            return Err(anyhow!(
                "key/value cache shapes disagree: {:?} vs {:?}",
                keys.shape(),
                values.shape()
            ));
        }
        Ok(Self { keys, values })
    }

    /// A zero-length cache with well-defined depth dimensions.
    pub fn empty(batch: usize, key_depth: usize, value_depth: usize) -> Self {
        Self {
            keys: Array3::zeros((batch, 0, key_depth)),
            values: Array3::zeros((batch, 0, value_depth)),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.keys.shape()[0]
    }

    /// Number of cached time-steps.
    pub fn len(&self) -> usize {
        self.keys.shape()[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A new cache with `new` concatenated onto the time axis.
    pub fn appended(&self, new: &KvCache) -> Result<KvCache> {
        if new.batch_size() != self.batch_size() {
            return Err(anyhow!(
                "cache batch size {} does not match appended batch size {}",
                self.batch_size(),
                new.batch_size()
            ));
        }
        if new.keys.shape()[2] != self.keys.shape()[2]
            || new.values.shape()[2] != self.values.shape()[2]
        {
            return Err(anyhow!(
                "cache depths {:?}/{:?} do not match appended depths {:?}/{:?}",
                self.keys.shape()[2],
                self.values.shape()[2],
                new.keys.shape()[2],
                new.values.shape()[2]
            ));
        }

        let keys = concatenate![Axis(1), self.keys.view(), new.keys.view()]
            .as_standard_layout()
            .to_owned();
        let values = concatenate![Axis(1), self.values.view(), new.values.view()]
            .as_standard_layout()
            .to_owned();
        Ok(KvCache { keys, values })
    }
}
