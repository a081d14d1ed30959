//! Parameter storage and the construction-time loading contract.
//!
//! Every layer in this crate is built through a [`ParamLoader`], which either
//! fetches named tensors from a checkpoint [`WeightMap`] or initializes them
//! randomly. Checkpoint loading enforces an exact name-set contract: a fetch
//! for a missing name fails immediately, and [`ParamLoader::finish`] fails if
//! the checkpoint contained names the model never asked for. Together these
//! guarantee the model's parameter set and the checkpoint's key set are equal
//! before any inference runs.

mod safetensors_loader;

pub use safetensors_loader::load_safetensors;

use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, ArrayD, Ix1, Ix2};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// A mapping from fully-qualified parameter name to tensor.
///
/// This is the output of the external `load_weights()` collaborator; the
/// core only consumes it.
#[derive(Debug, Default, Clone)]
pub struct WeightMap {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl WeightMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<D: ndarray::Dimension>(
        &mut self,
        name: impl Into<String>,
        tensor: ndarray::Array<f32, D>,
    ) {
        self.tensors.insert(name.into(), tensor.into_dyn());
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

enum Source {
    Checkpoint {
        map: WeightMap,
        consumed: HashSet<String>,
    },
    Random {
        rng: StdRng,
    },
}

/// The single construction path for model parameters.
pub struct ParamLoader {
    source: Source,
}

impl ParamLoader {
    /// Build parameters from a checkpoint mapping.
    pub fn from_map(map: WeightMap) -> Self {
        Self {
            source: Source::Checkpoint {
                map,
                consumed: HashSet::new(),
            },
        }
    }

    /// Initialize parameters randomly from a seed.
    pub fn random(seed: u64) -> Self {
        Self {
            source: Source::Random {
                rng: StdRng::seed_from_u64(seed),
            },
        }
    }

    fn fetch(&mut self, name: &str) -> Result<ArrayD<f32>> {
        match &mut self.source {
            Source::Checkpoint { map, consumed } => {
                let tensor = map
                    .get(name)
                    .ok_or_else(|| anyhow!("checkpoint is missing parameter '{}'", name))?
                    .clone();
                consumed.insert(name.to_string());
                Ok(tensor)
            }
            Source::Random { .. } => unreachable!("fetch is only used for checkpoints"),
        }
    }

    /// Take a 2D parameter by name, or draw it from `N(0, init_std)`.
    pub fn take_2d(
        &mut self,
        name: &str,
        shape: (usize, usize),
        init_std: f32,
    ) -> Result<Array2<f32>> {
        match &mut self.source {
            Source::Random { rng } => {
                if init_std > 0.0 {
                    let dist = Normal::new(0.0, init_std)
                        .map_err(|e| anyhow!("bad init distribution: {}", e))?;
                    Ok(Array2::random_using(shape, dist, rng))
                } else {
                    Ok(Array2::zeros(shape))
                }
            }
            Source::Checkpoint { .. } => {
                let tensor = self.fetch(name)?;
                let arr = tensor
                    .into_dimensionality::<Ix2>()
                    .map_err(|_| anyhow!("parameter '{}' is not 2-dimensional", name))?;
                if arr.dim() != shape {
                    return Err(anyhow!(
                        "parameter '{}' has shape {:?}, expected {:?}",
                        name,
                        arr.dim(),
                        shape
                    ));
                }
                Ok(arr)
            }
        }
    }

    /// Take a 1D parameter by name, or fill it with `init_value`.
    pub fn take_1d(&mut self, name: &str, len: usize, init_value: f32) -> Result<Array1<f32>> {
        match &mut self.source {
            Source::Random { .. } => Ok(Array1::from_elem(len, init_value)),
            Source::Checkpoint { .. } => {
                let tensor = self.fetch(name)?;
                let arr = tensor
                    .into_dimensionality::<Ix1>()
                    .map_err(|_| anyhow!("parameter '{}' is not 1-dimensional", name))?;
                if arr.len() != len {
                    return Err(anyhow!(
                        "parameter '{}' has length {}, expected {}",
                        name,
                        arr.len(),
                        len
                    ));
                }
                Ok(arr)
            }
        }
    }

    /// Verify that every checkpoint parameter was consumed.
    pub fn finish(self) -> Result<()> {
        match self.source {
            Source::Random { .. } => Ok(()),
            Source::Checkpoint { map, consumed } => {
                let unexpected: Vec<&str> = map
                    .names()
                    .filter(|name| !consumed.contains(*name))
                    .collect();
                if unexpected.is_empty() {
                    Ok(())
                } else {
                    Err(anyhow!(
                        "checkpoint contains {} parameter(s) the model does not declare: {}",
                        unexpected.len(),
                        unexpected.join(", ")
                    ))
                }
            }
        }
    }
}
