// Text-to-image sampling with a latent diffusion checkpoint.
//
// The model is described by a JSON descriptor. The bundled one,
// configs/latent-diffusion/txt2img-sd-v1.json, is the Stable Diffusion v1
// layout (CLIP text encoder, 768-wide cross attention). Its weights are read
// from a single checkpoint holding the text encoder under `cond_stage_model`,
// the auto-encoder under `first_stage_model` and the UNet under
// `model.diffusion_model`. Below these prefixes the names must follow the
// module naming of the diffusers crate (e.g. `down_blocks.0.resnets.0...`);
// CompVis names such as `input_blocks.*` match nothing and the load reports
// zero variables loaded. EMA weights stored under `model_ema.` are used for
// the UNet when present. The CLIP vocabulary is expected in data/:
//
// mkdir -p data && cd data
// wget https://github.com/openai/CLIP/raw/main/clip/bpe_simple_vocab_16e6.txt.gz
// gunzip bpe_simple_vocab_16e6.txt.gz
//
// Then run, for example:
//   cargo run --release -- --prompt "a virus monster playing guitar" --n_samples 4 --ddim_steps 50
use ldm_txt2img::{generate, Options};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = Options::from_args(std::env::args()).unwrap_or_else(|err| err.exit());
    tch::maybe_init_cuda();
    info!("Cuda available: {}", tch::Cuda::is_available());
    info!("Cudnn available: {}", tch::Cuda::cudnn_is_available());

    let (_model, grid_path) = generate(None, &options)?;
    println!(
        "Your samples are ready and waiting for you here:\n{}\nGrid: {}\nEnjoy.",
        options.outdir.display(),
        grid_path.display()
    );
    Ok(())
}
