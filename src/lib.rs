//! # Latent diffusion text-to-image sampling
//!
//! Drives a pretrained latent diffusion checkpoint from a text prompt to PNG
//! files on disk, using Torch via [tch-rs](https://github.com/LaurentMazare/tch-rs)
//! and the network definitions of the [diffusers](https://crates.io/crates/diffusers) crate.
//!
//! This library includes:
//! - An option loader accepting either a command line or an in-memory mapping.
//! - A model loader building the text encoder, UNet and auto-encoder from a JSON
//!   descriptor and a single checkpoint.
//! - DDIM and PLMS samplers with classifier-free guidance.
//! - The generation loop writing individual samples and a contact-sheet grid.

pub mod diagnostics;
pub mod error;
pub mod image_utils;
pub mod model;
pub mod options;
pub mod output;
pub mod pipeline;
pub mod samplers;
pub mod utils;

pub use error::Error;
pub use model::{LatentDiffusion, LatentDiffusionModel};
pub use options::Options;
pub use pipeline::{generate, generate_with};
