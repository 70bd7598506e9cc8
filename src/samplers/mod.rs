//! # Samplers
//!
//! Samplers run the reverse diffusion process: starting from gaussian noise
//! they repeatedly query the model for the noise it sees in the current
//! latent and move the latent towards a clean sample. DDIM and PLMS share the
//! same sub-sampled timestep schedule and only differ in how successive noise
//! predictions are combined.
use crate::error::Error;
use crate::model::LatentDiffusion;
use tch::{Kind, Tensor};

pub mod ddim;
pub mod plms;

pub use ddim::DdimSampler;
pub use plms::PlmsSampler;

/// Intermediate latents are recorded every this many steps.
const LOG_EVERY_T: usize = 100;

/// The arguments of a sampling run.
#[derive(Debug)]
pub struct SampleParams<'a> {
    /// Number of denoising steps.
    pub steps: usize,
    pub conditioning: &'a Tensor,
    pub batch_size: i64,
    /// Shape of a single latent: channels, height / 8, width / 8.
    pub shape: [i64; 3],
    pub guidance_scale: f64,
    pub unconditional_conditioning: Option<&'a Tensor>,
    /// Amount of fresh noise injected at each step, 0 is deterministic.
    pub eta: f64,
}

/// Trace of a sampling run.
#[derive(Debug, Default)]
pub struct Intermediates {
    pub x_inter: Vec<Tensor>,
    pub pred_x0: Vec<Tensor>,
}

impl Intermediates {
    fn starting_from(xs: &Tensor) -> Self {
        Self { x_inter: vec![xs.shallow_clone()], pred_x0: vec![xs.shallow_clone()] }
    }

    fn record(&mut self, index: usize, total: usize, xs: &Tensor, pred_x0: &Tensor) {
        if index % LOG_EVERY_T == 0 || index + 1 == total {
            self.x_inter.push(xs.shallow_clone());
            self.pred_x0.push(pred_x0.shallow_clone());
        }
    }
}

pub trait Sampler {
    fn name(&self) -> &'static str;

    /// Produces a batch of latents of shape `(batch_size, shape...)`.
    fn sample(&self, params: &SampleParams) -> anyhow::Result<(Tensor, Intermediates)>;
}

/// Either of the samplers, picked at runtime.
pub enum AnySampler<'a, M> {
    Ddim(DdimSampler<'a, M>),
    Plms(PlmsSampler<'a, M>),
}

pub fn select<M: LatentDiffusion>(model: &M, plms: bool) -> AnySampler<'_, M> {
    if plms {
        AnySampler::Plms(PlmsSampler::new(model))
    } else {
        AnySampler::Ddim(DdimSampler::new(model))
    }
}

impl<M: LatentDiffusion> Sampler for AnySampler<'_, M> {
    fn name(&self) -> &'static str {
        match self {
            Self::Ddim(sampler) => sampler.name(),
            Self::Plms(sampler) => sampler.name(),
        }
    }

    fn sample(&self, params: &SampleParams) -> anyhow::Result<(Tensor, Intermediates)> {
        match self {
            Self::Ddim(sampler) => sampler.sample(params),
            Self::Plms(sampler) => sampler.sample(params),
        }
    }
}

/// The training timesteps visited at inference, uniformly spaced, with the
/// alpha products and noise levels used at each of them.
#[derive(Debug, Clone)]
pub struct StepSchedule {
    timesteps: Vec<usize>,
    alphas: Vec<f64>,
    alphas_prev: Vec<f64>,
    sigmas: Vec<f64>,
}

impl StepSchedule {
    pub fn new(alphas_cumprod: &[f64], steps: usize, eta: f64) -> Result<Self, Error> {
        let train_timesteps = alphas_cumprod.len();
        let invalid = Error::InvalidSteps { steps, max: train_timesteps };
        if steps == 0 || steps > train_timesteps {
            return Err(invalid);
        }
        let stride = train_timesteps / steps;
        let timesteps: Vec<usize> = (0..train_timesteps)
            .step_by(stride)
            .map(|t| t + 1)
            .filter(|&t| t < train_timesteps)
            .collect();
        if timesteps.is_empty() {
            return Err(invalid);
        }
        let alphas: Vec<f64> = timesteps.iter().map(|&t| alphas_cumprod[t]).collect();
        let alphas_prev: Vec<f64> = std::iter::once(alphas_cumprod[0])
            .chain(alphas[..alphas.len() - 1].iter().copied())
            .collect();
        let sigmas = alphas
            .iter()
            .zip(alphas_prev.iter())
            .map(|(&a, &a_prev)| eta * ((1. - a_prev) / (1. - a) * (1. - a / a_prev)).sqrt())
            .collect();
        Ok(Self { timesteps, alphas, alphas_prev, sigmas })
    }

    pub fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }

    pub fn sigma(&self, index: usize) -> f64 {
        self.sigmas[index]
    }

    /// Moves `xs` from the timestep at `index` to the previous one given the
    /// predicted noise, returning the new latent and the predicted clean one.
    pub fn step(&self, index: usize, xs: &Tensor, e_t: &Tensor, sigma: f64) -> (Tensor, Tensor) {
        let a_t = self.alphas[index];
        let a_prev = self.alphas_prev[index];
        let pred_x0 = (xs - (1. - a_t).sqrt() * e_t) / a_t.sqrt();
        // direction pointing to x_t
        let dir_xt = (1. - a_prev - sigma * sigma).sqrt() * e_t;
        let x_prev = a_prev.sqrt() * &pred_x0 + dir_xt;
        if sigma > 0. {
            (x_prev + Tensor::randn_like(xs) * sigma, pred_x0)
        } else {
            (x_prev, pred_x0)
        }
    }
}

fn initial_noise<M: LatentDiffusion>(model: &M, params: &SampleParams) -> Tensor {
    let [channels, height, width] = params.shape;
    Tensor::randn([params.batch_size, channels, height, width], (Kind::Float, model.device()))
}

/// Noise prediction with classifier-free guidance, the unconditional and
/// conditional passes share a single batch.
fn guided_noise<M: LatentDiffusion>(
    model: &M,
    xs: &Tensor,
    timestep: usize,
    params: &SampleParams,
) -> Tensor {
    match params.unconditional_conditioning {
        Some(uc) if params.guidance_scale != 1.0 => {
            let xs_in = Tensor::cat(&[xs, xs], 0);
            let c_in = Tensor::cat(&[uc, params.conditioning], 0);
            let noise = model.apply_model(&xs_in, timestep, &c_in).chunk(2, 0);
            let (uncond, cond) = (&noise[0], &noise[1]);
            uncond + (cond - uncond) * params.guidance_scale
        }
        _ => model.apply_model(xs, timestep, params.conditioning),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::schedule::NoiseSchedule;
    use std::cell::{Cell, RefCell};
    use tch::{kind, Device};

    /// Predicts a fixed fraction of its input as noise and counts its calls.
    pub(crate) struct CountingModel {
        alphas_cumprod: Vec<f64>,
        pub calls: Cell<usize>,
        pub batch_sizes: RefCell<Vec<i64>>,
    }

    impl CountingModel {
        pub(crate) fn new() -> Self {
            Self {
                alphas_cumprod: NoiseSchedule::default().alphas_cumprod().unwrap(),
                calls: Cell::new(0),
                batch_sizes: RefCell::new(vec![]),
            }
        }
    }

    impl LatentDiffusion for CountingModel {
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
            Ok(Tensor::ones([prompts.len() as i64, 2, 8], kind::FLOAT_CPU))
        }

        fn apply_model(&self, xs: &Tensor, _timestep: usize, conditioning: &Tensor) -> Tensor {
            self.calls.set(self.calls.get() + 1);
            assert_eq!(xs.size()[0], conditioning.size()[0]);
            self.batch_sizes.borrow_mut().push(xs.size()[0]);
            xs * 0.1
        }

        fn decode_first_stage(&self, latents: &Tensor) -> Tensor {
            latents.shallow_clone()
        }
    }

    pub(crate) fn params<'a>(
        conditioning: &'a Tensor,
        unconditional_conditioning: Option<&'a Tensor>,
        steps: usize,
        eta: f64,
    ) -> SampleParams<'a> {
        SampleParams {
            steps,
            conditioning,
            batch_size: conditioning.size()[0],
            shape: [4, 2, 3],
            guidance_scale: 5.0,
            unconditional_conditioning,
            eta,
        }
    }

    #[test]
    fn uniform_timesteps() {
        let alphas = NoiseSchedule::default().alphas_cumprod().unwrap();
        let schedule = StepSchedule::new(&alphas, 200, 0.).unwrap();
        assert_eq!(schedule.len(), 200);
        assert_eq!(schedule.timesteps()[0], 1);
        assert_eq!(schedule.timesteps()[199], 996);
        assert!((0..200).all(|i| schedule.sigma(i) == 0.));

        // The last strided timestep would fall outside the training range.
        let schedule = StepSchedule::new(&alphas, 300, 0.).unwrap();
        assert_eq!(schedule.len(), 333);
        assert_eq!(*schedule.timesteps().last().unwrap(), 997);
    }

    #[test]
    fn eta_adds_noise_levels() {
        let alphas = NoiseSchedule::default().alphas_cumprod().unwrap();
        let schedule = StepSchedule::new(&alphas, 50, 1.).unwrap();
        assert!((0..schedule.len()).all(|i| schedule.sigma(i) > 0.));
    }

    #[test]
    fn invalid_step_counts() {
        let alphas = NoiseSchedule::default().alphas_cumprod().unwrap();
        for steps in [0, 1001] {
            let err = StepSchedule::new(&alphas, steps, 0.).unwrap_err();
            assert!(matches!(err, Error::InvalidSteps { max: 1000, .. }));
        }
    }

    #[test]
    fn selection() {
        let model = CountingModel::new();
        assert_eq!(select(&model, true).name(), "PLMS");
        assert_eq!(select(&model, false).name(), "DDIM");
    }

    #[test]
    fn guidance_doubles_the_batch() {
        let model = CountingModel::new();
        let c = Tensor::ones([3, 2, 8], kind::FLOAT_CPU);
        let uc = Tensor::zeros([3, 2, 8], kind::FLOAT_CPU);
        let xs = Tensor::ones([3, 4, 2, 3], kind::FLOAT_CPU);
        let noise = guided_noise(&model, &xs, 1, &params(&c, Some(&uc), 1, 0.));
        assert_eq!(noise.size(), vec![3, 4, 2, 3]);
        assert_eq!(*model.batch_sizes.borrow(), vec![6]);

        // Without an unconditional embedding there is a single pass.
        let _ = guided_noise(&model, &xs, 1, &params(&c, None, 1, 0.));
        assert_eq!(*model.batch_sizes.borrow(), vec![6, 3]);
    }
}
