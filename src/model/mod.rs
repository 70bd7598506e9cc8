//! # Latent diffusion models
//!
//! A latent diffusion model bundles three networks: a text encoder producing
//! the conditioning, a UNet predicting the noise of a latent, and the decoder
//! half of an auto-encoder mapping latents back to pixels. The samplers and
//! the generation loop only see the [`LatentDiffusion`] trait.
pub mod checkpoint;
pub mod descriptor;
pub mod schedule;

use descriptor::ModelDescriptor;
use diffusers::models::{unet_2d, vae};
use diffusers::transformers::clip;
use std::path::Path;
use tch::{nn, nn::Module, Device, Tensor};
use tracing::info;

pub trait LatentDiffusion {
    fn device(&self) -> Device;

    /// Number of channels of the latent space.
    fn latent_channels(&self) -> i64;

    /// Cumulative product of `1 - beta`, one entry per training timestep.
    fn alphas_cumprod(&self) -> &[f64];

    /// Embeds the prompts, one batch element per prompt.
    fn learned_conditioning(&self, prompts: &[&str]) -> anyhow::Result<Tensor>;

    /// Predicts the noise contained in `xs` at the given training timestep.
    fn apply_model(&self, xs: &Tensor, timestep: usize, conditioning: &Tensor) -> Tensor;

    /// Maps latents back to pixel space, roughly in `[-1, 1]`.
    fn decode_first_stage(&self, latents: &Tensor) -> Tensor;
}

/// A latent diffusion model built from a descriptor, the weights of the
/// three networks living in a single var store.
pub struct LatentDiffusionModel {
    tokenizer: clip::Tokenizer,
    text_model: clip::ClipTextTransformer,
    unet: unet_2d::UNet2DConditionModel,
    autoencoder: vae::AutoEncoderKL,
    alphas_cumprod: Vec<f64>,
    latent_channels: i64,
    scale_factor: f64,
    vs: nn::VarStore,
}

// Checkpoint prefixes are dotted, var store paths are built one level at a time.
fn sub_path<'a>(root: nn::Path<'a>, prefix: &str) -> nn::Path<'a> {
    prefix.split('.').filter(|name| !name.is_empty()).fold(root, |path, name| path / name)
}

impl LatentDiffusionModel {
    /// Builds the model described by `descriptor` on `device` and loads the
    /// weights stored in `checkpoint`. Mismatched keys are logged when
    /// `verbose` is set.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        descriptor: P,
        checkpoint: Q,
        device: Device,
        verbose: bool,
    ) -> anyhow::Result<Self> {
        let descriptor = ModelDescriptor::from_file(descriptor)?;
        Self::from_descriptor(&descriptor, checkpoint, device, verbose)
    }

    pub fn from_descriptor<P: AsRef<Path>>(
        descriptor: &ModelDescriptor,
        checkpoint: P,
        device: Device,
        verbose: bool,
    ) -> anyhow::Result<Self> {
        info!("Loading model from {:?} on {device:?}", checkpoint.as_ref());
        let clip_config = descriptor.text_encoder.config();
        let tokenizer = clip::Tokenizer::create(&descriptor.text_encoder.vocab, &clip_config)?;

        let mut vs = nn::VarStore::new(device);
        let latent_channels = descriptor.latent_channels;
        let prefixes = &descriptor.prefixes;
        let text_model =
            clip::ClipTextTransformer::new(sub_path(vs.root(), &prefixes.cond_stage), &clip_config);
        let autoencoder = vae::AutoEncoderKL::new(
            sub_path(vs.root(), &prefixes.first_stage),
            3,
            3,
            descriptor.autoencoder.config(latent_channels),
        );
        let unet = unet_2d::UNet2DConditionModel::new(
            sub_path(vs.root(), &prefixes.diffusion),
            latent_channels,
            latent_channels,
            descriptor.unet.config(),
        );

        let tensors = checkpoint::read_named_tensors(checkpoint)?;
        let ema_scope = descriptor.use_ema.then_some(prefixes.diffusion.as_str());
        let report = checkpoint::load_state_dict(&vs, tensors, ema_scope)?;
        report.log_summary();
        if verbose {
            report.log();
        }
        vs.freeze();

        Ok(Self {
            tokenizer,
            text_model,
            unet,
            autoencoder,
            alphas_cumprod: descriptor.schedule.alphas_cumprod()?,
            latent_channels,
            scale_factor: descriptor.scale_factor,
            vs,
        })
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}

impl LatentDiffusion for LatentDiffusionModel {
    fn device(&self) -> Device {
        self.vs.device()
    }

    fn latent_channels(&self) -> i64 {
        self.latent_channels
    }

    fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    fn learned_conditioning(&self, prompts: &[&str]) -> anyhow::Result<Tensor> {
        if prompts.is_empty() {
            anyhow::bail!("cannot embed an empty batch of prompts")
        }
        let mut tokens = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let ids: Vec<i64> =
                self.tokenizer.encode(prompt)?.into_iter().map(|id| id as i64).collect();
            tokens.push(Tensor::from_slice(&ids));
        }
        let tokens = Tensor::stack(&tokens, 0).to(self.device());
        Ok(self.text_model.forward(&tokens))
    }

    fn apply_model(&self, xs: &Tensor, timestep: usize, conditioning: &Tensor) -> Tensor {
        self.unet.forward(xs, timestep as f64, conditioning)
    }

    fn decode_first_stage(&self, latents: &Tensor) -> Tensor {
        self.autoencoder.decode(&(latents / self.scale_factor))
    }
}
