//! # Denoising Diffusion Implicit Models
//!
//! The Denoising Diffusion Implicit Models (DDIM) sampler generalizes the
//! Markovian reverse process of DDPM to non-Markovian guidance, allowing
//! large jumps between timesteps. With `eta = 0` the process is
//! deterministic given the initial noise.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use super::{guided_noise, initial_noise, Intermediates, SampleParams, Sampler, StepSchedule};
use crate::model::LatentDiffusion;
use tch::Tensor;
use tracing::{debug, trace};

pub struct DdimSampler<'a, M> {
    model: &'a M,
}

impl<'a, M: LatentDiffusion> DdimSampler<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self { model }
    }
}

impl<M: LatentDiffusion> Sampler for DdimSampler<'_, M> {
    fn name(&self) -> &'static str {
        "DDIM"
    }

    fn sample(&self, params: &SampleParams) -> anyhow::Result<(Tensor, Intermediates)> {
        let schedule = StepSchedule::new(self.model.alphas_cumprod(), params.steps, params.eta)?;
        let total = schedule.len();
        debug!("Running DDIM sampling with {total} timesteps, eta {}", params.eta);

        let mut xs = initial_noise(self.model, params);
        let mut intermediates = Intermediates::starting_from(&xs);
        for index in (0..total).rev() {
            let timestep = schedule.timesteps()[index];
            trace!("DDIM step {index} at timestep {timestep}");
            let e_t = guided_noise(self.model, &xs, timestep, params);
            let (x_prev, pred_x0) = schedule.step(index, &xs, &e_t, schedule.sigma(index));
            xs = x_prev;
            intermediates.record(index, total, &xs, &pred_x0);
        }
        Ok((xs, intermediates))
    }
}
