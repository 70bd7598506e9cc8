//! Non-strict loading of trained weights.
//!
//! Every tensor of the checkpoint whose name matches a variable is copied
//! into it. Variables without a tensor and tensors without a variable do not
//! stop the load, they are returned in a [`LoadReport`] instead.
//!
//! Latent diffusion checkpoints also carry an exponential moving average of
//! the denoising network under `model_ema.`, each name flattened by dropping
//! its dots: `model.diffusion_model.out.2.weight` is averaged in
//! `model_ema.diffusion_modelout2weight`. When loading with an EMA scope the
//! averages replace the raw weights of the variables under that scope.
use std::collections::HashMap;
use std::path::Path;
use tch::{nn::VarStore, Tensor};
use tracing::{info, warn};

const EMA_PREFIX: &str = "model_ema.";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Number of variables the checkpoint provided a value for.
    pub loaded: usize,
    /// Number of those values taken from the moving average.
    pub averaged: usize,
    /// Variables of the model that the checkpoint does not provide.
    pub missing: Vec<String>,
    /// Checkpoint entries that match no variable of the model.
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }

    /// Logs how much of the model the checkpoint covered. A checkpoint
    /// matching no variable at all is almost always a naming problem.
    pub fn log_summary(&self) {
        let total = self.loaded + self.missing.len();
        if self.loaded == 0 {
            warn!(
                "the checkpoint matches none of the {total} model variables, \
                 {} of its entries were ignored",
                self.unexpected.len()
            );
        } else {
            info!("loaded {}/{total} variables from the checkpoint", self.loaded);
        }
        if self.averaged > 0 {
            info!("using EMA weights for {} variables", self.averaged);
        }
    }

    pub fn log(&self) {
        if !self.missing.is_empty() {
            warn!("missing keys: {:?}", self.missing);
        }
        if !self.unexpected.is_empty() {
            warn!("unexpected keys: {:?}", self.unexpected);
        }
    }
}

/// Reads all the named tensors of a `.safetensors`, `.npz` or libtorch `.ot` file.
pub fn read_named_tensors<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<(String, Tensor)>> {
    let path = path.as_ref();
    let tensors = match path.extension().and_then(|ext| ext.to_str()) {
        Some("safetensors") => Tensor::read_safetensors(path),
        Some("npz") => Tensor::read_npz(path),
        _ => Tensor::load_multi(path),
    };
    tensors.map_err(|e| {
        let context = format!("error reading checkpoint {:?}", path.to_string_lossy());
        anyhow::Error::new(e).context(context)
    })
}

// `model.diffusion_model.out.2.weight` -> `model_ema.diffusion_modelout2weight`
fn ema_name(variable: &str) -> Option<String> {
    let (_, rest) = variable.split_once('.')?;
    Some(format!("{EMA_PREFIX}{}", rest.replace('.', "")))
}

/// Copies the checkpoint tensors into the variables of `vs` with the same
/// name. Variables under `ema_scope`, a dotted prefix such as
/// `model.diffusion_model`, take their moving average instead when the
/// checkpoint has one.
pub fn load_state_dict(
    vs: &VarStore,
    tensors: Vec<(String, Tensor)>,
    ema_scope: Option<&str>,
) -> anyhow::Result<LoadReport> {
    let mut variables = vs.variables();
    let mut tensors: HashMap<String, Tensor> = tensors.into_iter().collect();
    let mut averaged = 0;
    if let Some(scope) = ema_scope {
        let scope = format!("{scope}.");
        for name in variables.keys().filter(|name| name.starts_with(&scope)) {
            if let Some(average) = ema_name(name).and_then(|ema| tensors.remove(&ema)) {
                tensors.insert(name.clone(), average);
                averaged += 1;
            }
        }
    }

    let mut unexpected = vec![];
    let mut loaded = 0;
    tch::no_grad(|| -> anyhow::Result<()> {
        for (name, value) in tensors {
            let Some(mut variable) = variables.remove(&name) else {
                unexpected.push(name);
                continue;
            };
            if variable.size() != value.size() {
                anyhow::bail!(
                    "shape mismatch for {name}: the model expects {:?}, the checkpoint has {:?}",
                    variable.size(),
                    value.size()
                )
            }
            variable.f_copy_(&value)?;
            loaded += 1;
        }
        Ok(())
    })?;
    let mut missing: Vec<String> = variables.into_keys().collect();
    missing.sort();
    unexpected.sort();
    Ok(LoadReport { loaded, averaged, missing, unexpected })
}
