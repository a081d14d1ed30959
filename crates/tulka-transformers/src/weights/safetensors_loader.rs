//! Reads a safetensors checkpoint into a [`WeightMap`].

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;

use super::WeightMap;

/// Load every tensor of a `.safetensors` file into memory as F32.
pub fn load_safetensors(path: &Path) -> Result<WeightMap> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
    let st = SafeTensors::deserialize(&bytes)
        .with_context(|| format!("failed to parse checkpoint {}", path.display()))?;

    let mut map = WeightMap::new();
    for (name, view) in st.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(anyhow!(
                "tensor '{}' has dtype {:?}, only F32 checkpoints are supported",
                name,
                view.dtype()
            ));
        }

        let data: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let arr = ArrayD::from_shape_vec(IxDyn(view.shape()), data)
            .with_context(|| format!("tensor '{}' has inconsistent shape", name))?;
        map.insert(name, arr);
    }

    log::info!(
        "loaded {} tensors from {}",
        map.len(),
        path.display()
    );
    Ok(map)
}
