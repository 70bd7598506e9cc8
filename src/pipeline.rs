//! # The text-to-image generation loop
//!
//! Each iteration embeds the prompt, samples a batch of latents, decodes them
//! and writes every image to `<outdir>/samples/NNNN.png`. Once all iterations
//! are done the decoded batches are laid out as a grid written to
//! `<outdir>/<slug>.png`.
use crate::diagnostics::{best_effort, memory_stats};
use crate::image_utils::{make_grid, save_png};
use crate::model::{LatentDiffusion, LatentDiffusionModel};
use crate::options::Options;
use crate::output::{count_entries, mk_slug, sample_file_name};
use crate::samplers::{self, SampleParams, Sampler};
use crate::utils::select_device;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Instant;
use tch::{Device, Tensor};
use tracing::info;

/// Pixels between the images of the grid.
const GRID_PADDING: i64 = 2;

/// Runs the pipeline, loading the model from the paths in `options` unless
/// one is given. The model is handed back so that it can be reused.
pub fn generate(
    model: Option<LatentDiffusionModel>,
    options: &Options,
) -> anyhow::Result<(LatentDiffusionModel, PathBuf)> {
    let model = match model {
        Some(model) => model,
        None => {
            let device = select_device(options.cpu);
            info!("Using device {device:?}");
            LatentDiffusionModel::load(&options.config, &options.ckpt, device, true)?
        }
    };
    let grid_path = generate_with(&model, options)?;
    Ok((model, grid_path))
}

/// Runs the pipeline with an already loaded model and returns the path of
/// the grid image.
pub fn generate_with<M: LatentDiffusion>(model: &M, options: &Options) -> anyhow::Result<PathBuf> {
    let _no_grad_guard = tch::no_grad_guard();
    if let Some(seed) = options.seed {
        tch::manual_seed(seed);
    }
    let sampler = samplers::select(model, options.plms);

    let sample_path = options.outdir.join("samples");
    std::fs::create_dir_all(&sample_path)?;
    let mut base_count = count_entries(&sample_path)?;

    let batch_size = options.n_samples;
    let uc = if options.scale != 1.0 {
        Some(model.learned_conditioning(&vec![""; batch_size])?)
    } else {
        None
    };
    let prompts = vec![options.prompt.as_str(); batch_size];
    let shape = [model.latent_channels(), options.height / 8, options.width / 8];
    info!(
        "Sampling {} batches of {batch_size} with {}, latent shape {shape:?}",
        options.n_iter,
        sampler.name()
    );

    let progress = ProgressBar::new(options.n_iter as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("Sampling {spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    let mut all_samples = Vec::with_capacity(options.n_iter);
    for iteration in 0..options.n_iter {
        let start = Instant::now();
        best_effort("memory statistics", || memory_stats(model.device()));

        let c = model.learned_conditioning(&prompts)?;
        let params = SampleParams {
            steps: options.ddim_steps,
            conditioning: &c,
            batch_size: batch_size as i64,
            shape,
            guidance_scale: options.scale,
            unconditional_conditioning: uc.as_ref(),
            eta: options.ddim_eta,
        };
        let (samples, _) = sampler.sample(&params)?;

        let x_samples = model.decode_first_stage(&samples);
        let x_samples = ((x_samples + 1.) / 2.).clamp(0., 1.).to_device(Device::Cpu);
        for index in 0..x_samples.size()[0] {
            save_png(&x_samples.get(index), sample_path.join(sample_file_name(base_count)))?;
            base_count += 1;
        }
        all_samples.push(x_samples);
        info!("Iteration {iteration} done in {:.2?}", start.elapsed());
        progress.inc(1);
    }
    progress.finish_and_clear();

    let grid = make_grid(&Tensor::cat(&all_samples, 0), batch_size as i64, GRID_PADDING)?;
    let grid_path = options.outdir.join(format!("{}.png", mk_slug(&options.prompt, None)));
    save_png(&grid, &grid_path)?;
    info!("Your samples are ready in {:?}, grid written to {:?}", options.outdir, grid_path);
    Ok(grid_path)
}
