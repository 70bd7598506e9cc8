use image::GenericImageView;
use ldm_txt2img::model::schedule::NoiseSchedule;
use ldm_txt2img::{generate_with, Error, LatentDiffusion, Options};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use tch::{kind, Device, Tensor};

/// A stand-in for a trained model: the noise prediction is a fraction of the
/// input and decoding yields a ramp from -3 to 3, well outside `[-1, 1]`.
struct ToyModel {
    alphas_cumprod: Vec<f64>,
    conditioning_calls: Cell<usize>,
    fail_after: Option<usize>,
}

impl ToyModel {
    fn new() -> Self {
        Self {
            alphas_cumprod: NoiseSchedule::default().alphas_cumprod().unwrap(),
            conditioning_calls: Cell::new(0),
            fail_after: None,
        }
    }

    fn failing_after(calls: usize) -> Self {
        Self { fail_after: Some(calls), ..Self::new() }
    }
}

impl LatentDiffusion for ToyModel {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn latent_channels(&self) -> i64 {
        4
    }

    fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    fn learned_conditioning(&self, prompts: &[&str]) -> anyhow::Result<Tensor> {
        let calls = self.conditioning_calls.get() + 1;
        self.conditioning_calls.set(calls);
        if self.fail_after.map_or(false, |limit| calls > limit) {
            anyhow::bail!("text encoder failure")
        }
        Ok(Tensor::ones([prompts.len() as i64, 2, 8], kind::FLOAT_CPU))
    }

    fn apply_model(&self, xs: &Tensor, _timestep: usize, _conditioning: &Tensor) -> Tensor {
        xs * 0.1
    }

    fn decode_first_stage(&self, latents: &Tensor) -> Tensor {
        let (batch, _, height, width) = latents.size4().unwrap();
        let (height, width) = (height * 8, width * 8);
        Tensor::linspace(-3., 3., 3 * height * width, kind::FLOAT_CPU)
            .view([1, 3, height, width])
            .repeat([batch, 1, 1, 1])
    }
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ldm-txt2img-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn options(outdir: &Path, n_iter: usize, n_samples: usize) -> Options {
    Options::from_map([
        ("outdir", outdir.display().to_string()),
        ("n_iter", n_iter.to_string()),
        ("n_samples", n_samples.to_string()),
        ("H", "16".to_string()),
        ("W", "24".to_string()),
        ("ddim_steps", "4".to_string()),
        ("seed", "0".to_string()),
    ])
    .unwrap()
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn one_file_per_sample_and_a_grid() {
    let outdir = scratch_dir("grid");
    let grid_path = generate_with(&ToyModel::new(), &options(&outdir, 2, 3)).unwrap();

    let samples = entries(&outdir.join("samples"));
    assert_eq!(samples, ["0000.png", "0001.png", "0002.png", "0003.png", "0004.png", "0005.png"]);
    assert_eq!(image::open(outdir.join("samples/0003.png")).unwrap().dimensions(), (24, 16));

    assert_eq!(grid_path.parent(), Some(outdir.as_path()));
    let grid_name = grid_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(grid_name.contains("a_painting_of_a_virus_monster_playing_guitar"));
    assert!(grid_name.ends_with(".png"));
    // three columns and two rows of 24x16 images with 2 pixels of padding
    assert_eq!(image::open(&grid_path).unwrap().dimensions(), (3 * 26 + 2, 2 * 18 + 2));
    std::fs::remove_dir_all(outdir).unwrap();
}

#[test]
fn single_sample_grid_is_the_sample() {
    let outdir = scratch_dir("single");
    let grid_path = generate_with(&ToyModel::new(), &options(&outdir, 1, 1)).unwrap();
    assert_eq!(entries(&outdir.join("samples")), ["0000.png"]);
    assert_eq!(image::open(grid_path).unwrap().dimensions(), (24, 16));
    std::fs::remove_dir_all(outdir).unwrap();
}

#[test]
fn numbering_continues_across_runs() {
    let outdir = scratch_dir("rerun");
    let samples_dir = outdir.join("samples");
    std::fs::create_dir_all(&samples_dir).unwrap();
    std::fs::write(samples_dir.join("notes.txt"), "kept").unwrap();
    std::fs::write(samples_dir.join("other.txt"), "kept").unwrap();

    let model = ToyModel::new();
    generate_with(&model, &options(&outdir, 2, 3)).unwrap();
    let samples = entries(&samples_dir);
    assert_eq!(samples.len(), 8);
    assert_eq!(samples.first().map(String::as_str), Some("0002.png"));
    assert!(samples.contains(&"0007.png".to_string()));

    // The directories exist by now, running again appends.
    generate_with(&model, &options(&outdir, 2, 3)).unwrap();
    let samples = entries(&samples_dir);
    assert_eq!(samples.len(), 14);
    assert!(samples.contains(&"0013.png".to_string()));
    assert!(samples.contains(&"notes.txt".to_string()));
    std::fs::remove_dir_all(outdir).unwrap();
}

#[test]
fn decoded_values_are_clamped() {
    let outdir = scratch_dir("clamp");
    generate_with(&ToyModel::new(), &options(&outdir, 1, 2)).unwrap();
    for name in ["0000.png", "0001.png"] {
        let sample = image::open(outdir.join("samples").join(name)).unwrap().to_rgb8();
        // the ramp starts at -3 in the red plane and ends at 3 in the blue one
        assert_eq!(sample.get_pixel(0, 0).0[0], 0);
        assert_eq!(sample.get_pixel(23, 15).0[2], 255);
        let red: Vec<u8> = sample.pixels().map(|p| p.0[0]).collect();
        assert!(red.iter().all(|&v| v == 0));
        let blue: Vec<u8> = sample.pixels().map(|p| p.0[2]).collect();
        assert!(blue.iter().all(|&v| v == 255));
    }
    std::fs::remove_dir_all(outdir).unwrap();
}

#[test]
fn unconditional_embedding_only_with_guidance() {
    let outdir = scratch_dir("guidance");
    let model = ToyModel::new();
    generate_with(&model, &options(&outdir, 3, 1)).unwrap();
    assert_eq!(model.conditioning_calls.get(), 4);

    let model = ToyModel::new();
    let mut unguided = options(&outdir, 3, 1);
    unguided.scale = 1.0;
    generate_with(&model, &unguided).unwrap();
    assert_eq!(model.conditioning_calls.get(), 3);
    std::fs::remove_dir_all(outdir).unwrap();
}

#[test]
fn ddim_with_eta() {
    let outdir = scratch_dir("ddim");
    let mut ddim = options(&outdir, 1, 2);
    ddim.plms = false;
    ddim.ddim_eta = 0.5;
    generate_with(&ToyModel::new(), &ddim).unwrap();
    assert_eq!(entries(&outdir.join("samples")).len(), 2);

    // PLMS has no stochastic variant.
    let mut plms = ddim.clone();
    plms.plms = true;
    let err = generate_with(&ToyModel::new(), &plms).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::PlmsEta(_))));
    std::fs::remove_dir_all(outdir).unwrap();
}

#[test]
fn failure_keeps_written_samples() {
    let outdir = scratch_dir("failure");
    // the unconditional embedding and the first iteration succeed
    let model = ToyModel::failing_after(2);
    let err = generate_with(&model, &options(&outdir, 3, 2)).unwrap_err();
    assert_eq!(err.to_string(), "text encoder failure");
    assert_eq!(entries(&outdir.join("samples")), ["0000.png", "0001.png"]);
    assert_eq!(entries(&outdir), ["samples"]);
    std::fs::remove_dir_all(outdir).unwrap();
}
