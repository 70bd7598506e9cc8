//! # Model descriptors
//!
//! A descriptor is a JSON file declaring how the latent diffusion model is
//! assembled: the text encoder, the denoising UNet, the auto-encoder, the
//! training noise schedule and where each sub-model lives in the checkpoint.
use super::schedule::NoiseSchedule;
use diffusers::models::{unet_2d, vae};
use diffusers::transformers::clip;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ModelDescriptor {
    #[serde(default = "default_latent_channels")]
    pub latent_channels: i64,
    /// Latents are divided by this factor before decoding.
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default)]
    pub schedule: NoiseSchedule,
    pub text_encoder: TextEncoderDescriptor,
    pub unet: UNetDescriptor,
    pub autoencoder: AutoEncoderDescriptor,
    #[serde(default)]
    pub prefixes: CheckpointPrefixes,
    /// Sample with the moving average of the UNet weights when the
    /// checkpoint holds one.
    #[serde(default = "yes")]
    pub use_ema: bool,
}

fn default_latent_channels() -> i64 {
    4
}

fn default_scale_factor() -> f64 {
    0.18215
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ClipVersion {
    #[serde(rename = "v1_5")]
    V1_5,
    #[serde(rename = "v2_1")]
    V2_1,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextEncoderDescriptor {
    pub version: ClipVersion,
    /// The BPE vocabulary, e.g. `bpe_simple_vocab_16e6.txt`.
    pub vocab: PathBuf,
}

impl TextEncoderDescriptor {
    pub fn config(&self) -> clip::Config {
        match self.version {
            ClipVersion::V1_5 => clip::Config::v1_5(),
            ClipVersion::V2_1 => clip::Config::v2_1(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BlockDescriptor {
    pub out_channels: i64,
    pub use_cross_attn: bool,
    pub attention_head_dim: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UNetDescriptor {
    pub blocks: Vec<BlockDescriptor>,
    pub cross_attention_dim: i64,
    #[serde(default)]
    pub center_input_sample: bool,
    #[serde(default = "yes")]
    pub flip_sin_to_cos: bool,
    #[serde(default)]
    pub freq_shift: f64,
    #[serde(default = "two")]
    pub layers_per_block: i64,
    #[serde(default = "one")]
    pub downsample_padding: i64,
    #[serde(default = "unit")]
    pub mid_block_scale_factor: f64,
    #[serde(default = "thirty_two")]
    pub norm_num_groups: i64,
    #[serde(default = "norm_eps")]
    pub norm_eps: f64,
    #[serde(default)]
    pub sliced_attention_size: Option<i64>,
    #[serde(default)]
    pub use_linear_projection: bool,
}

impl UNetDescriptor {
    pub fn config(&self) -> unet_2d::UNet2DConditionModelConfig {
        let blocks = self
            .blocks
            .iter()
            .map(|b| unet_2d::BlockConfig {
                out_channels: b.out_channels,
                use_cross_attn: b.use_cross_attn,
                attention_head_dim: b.attention_head_dim,
            })
            .collect();
        unet_2d::UNet2DConditionModelConfig {
            center_input_sample: self.center_input_sample,
            flip_sin_to_cos: self.flip_sin_to_cos,
            freq_shift: self.freq_shift,
            blocks,
            layers_per_block: self.layers_per_block,
            downsample_padding: self.downsample_padding,
            mid_block_scale_factor: self.mid_block_scale_factor,
            norm_num_groups: self.norm_num_groups,
            norm_eps: self.norm_eps,
            cross_attention_dim: self.cross_attention_dim,
            sliced_attention_size: self.sliced_attention_size,
            use_linear_projection: self.use_linear_projection,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoEncoderDescriptor {
    pub block_out_channels: Vec<i64>,
    #[serde(default = "two")]
    pub layers_per_block: i64,
    #[serde(default = "thirty_two")]
    pub norm_num_groups: i64,
}

impl AutoEncoderDescriptor {
    pub fn config(&self, latent_channels: i64) -> vae::AutoEncoderKLConfig {
        vae::AutoEncoderKLConfig {
            block_out_channels: self.block_out_channels.clone(),
            layers_per_block: self.layers_per_block,
            latent_channels,
            norm_num_groups: self.norm_num_groups,
        }
    }
}

/// Dotted variable prefixes of the sub-models inside the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CheckpointPrefixes {
    pub cond_stage: String,
    pub first_stage: String,
    pub diffusion: String,
}

impl Default for CheckpointPrefixes {
    fn default() -> Self {
        Self {
            cond_stage: "cond_stage_model".to_string(),
            first_stage: "first_stage_model".to_string(),
            diffusion: "model.diffusion_model".to_string(),
        }
    }
}

fn yes() -> bool {
    true
}

fn one() -> i64 {
    1
}

fn unit() -> f64 {
    1.
}

fn two() -> i64 {
    2
}

fn thirty_two() -> i64 {
    32
}

fn norm_eps() -> f64 {
    1e-5
}

impl ModelDescriptor {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = crate::utils::file_open(path.as_ref())?;
        let descriptor = serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| {
            anyhow::Error::new(e).context(format!("invalid model descriptor {:?}", path.as_ref()))
        })?;
        Ok(descriptor)
    }
}
