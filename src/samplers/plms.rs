//! # Pseudo Linear Multi-Step sampling
//!
//! PLMS reuses the noise predicted at previous steps and combines them with
//! linear multi-step (Adams-Bashforth) coefficients of increasing order. The
//! first step has no history and uses a pseudo improved Euler step instead,
//! costing one extra model evaluation.
//!
//! Pseudo Numerical Methods for Diffusion Models on Manifolds, L. Liu et al, 2022.
//! https://arxiv.org/abs/2202.09778
use super::{guided_noise, initial_noise, Intermediates, SampleParams, Sampler, StepSchedule};
use crate::error::Error;
use crate::model::LatentDiffusion;
use tch::Tensor;
use tracing::{debug, trace};

pub struct PlmsSampler<'a, M> {
    model: &'a M,
}

impl<'a, M: LatentDiffusion> PlmsSampler<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self { model }
    }
}

impl<M: LatentDiffusion> Sampler for PlmsSampler<'_, M> {
    fn name(&self) -> &'static str {
        "PLMS"
    }

    fn sample(&self, params: &SampleParams) -> anyhow::Result<(Tensor, Intermediates)> {
        if params.eta != 0. {
            return Err(Error::PlmsEta(params.eta).into());
        }
        let schedule = StepSchedule::new(self.model.alphas_cumprod(), params.steps, 0.)?;
        let total = schedule.len();
        debug!("Running PLMS sampling with {total} timesteps");

        let mut xs = initial_noise(self.model, params);
        let mut intermediates = Intermediates::starting_from(&xs);
        // at most the last three noise predictions, oldest first
        let mut old_eps: Vec<Tensor> = Vec::with_capacity(4);
        for index in (0..total).rev() {
            let timestep = schedule.timesteps()[index];
            trace!("PLMS step {index} at timestep {timestep}");
            let e_t = guided_noise(self.model, &xs, timestep, params);
            let e_t_prime = match old_eps.as_slice() {
                [] => {
                    let (x_prev, _) = schedule.step(index, &xs, &e_t, 0.);
                    let next_timestep = schedule.timesteps()[index.saturating_sub(1)];
                    let e_t_next = guided_noise(self.model, &x_prev, next_timestep, params);
                    (&e_t + e_t_next) / 2.
                }
                [e_1] => (3. * &e_t - e_1) / 2.,
                [e_2, e_1] => (23. * &e_t - 16. * e_1 + 5. * e_2) / 12.,
                [e_3, e_2, e_1, ..] => (55. * &e_t - 59. * e_1 + 37. * e_2 - 9. * e_3) / 24.,
            };
            let (x_prev, pred_x0) = schedule.step(index, &xs, &e_t_prime, 0.);
            old_eps.push(e_t);
            if old_eps.len() > 3 {
                old_eps.remove(0);
            }
            xs = x_prev;
            intermediates.record(index, total, &xs, &pred_x0);
        }
        Ok((xs, intermediates))
    }
}
