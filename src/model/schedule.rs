//! The noise schedule the model was trained with.
use serde::Deserialize;
use tch::{kind, Kind, Tensor};

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct NoiseSchedule {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// Number of diffusion steps used to train the model.
    pub train_timesteps: usize,
}

impl Default for NoiseSchedule {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            train_timesteps: 1000,
        }
    }
}

impl NoiseSchedule {
    pub fn betas(&self) -> Tensor {
        let steps = self.train_timesteps as i64;
        match self.beta_schedule {
            BetaSchedule::ScaledLinear => Tensor::linspace(
                self.beta_start.sqrt(),
                self.beta_end.sqrt(),
                steps,
                kind::DOUBLE_CPU,
            )
            .square(),
            BetaSchedule::Linear => {
                Tensor::linspace(self.beta_start, self.beta_end, steps, kind::DOUBLE_CPU)
            }
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(self.train_timesteps, 0.999),
        }
    }

    /// The cumulative product of `1 - beta`, one entry per training timestep.
    pub fn alphas_cumprod(&self) -> anyhow::Result<Vec<f64>> {
        let alphas: Tensor = 1. - self.betas();
        Ok(Vec::<f64>::try_from(alphas.cumprod(0, Kind::Double))?)
    }
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Tensor {
    let alpha_bar = |time: f64| f64::cos((time + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
    let n = num_diffusion_timesteps as f64;
    let betas: Vec<f64> = (0..num_diffusion_timesteps)
        .map(|i| {
            let (t1, t2) = (i as f64 / n, (i + 1) as f64 / n);
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect();
    Tensor::from_slice(&betas)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphas_cumprod_decrease() {
        for beta_schedule in
            [BetaSchedule::Linear, BetaSchedule::ScaledLinear, BetaSchedule::SquaredcosCapV2]
        {
            let schedule = NoiseSchedule { beta_schedule, ..Default::default() };
            let alphas = schedule.alphas_cumprod().unwrap();
            assert_eq!(alphas.len(), 1000);
            assert!(alphas[0] < 1.0 && alphas[0] > 0.9);
            assert!(alphas.windows(2).all(|w| w[1] < w[0]), "{beta_schedule:?}");
            assert!(alphas[999] > 0.0);
        }
    }

    #[test]
    fn scaled_linear_endpoints() {
        let alphas = NoiseSchedule::default().alphas_cumprod().unwrap();
        assert!((alphas[0] - (1.0 - 0.00085)).abs() < 1e-9);
    }
}
