//! # K-LMS discrete scheduler
//!
//! The linear multistep scheduler advances the sampling trajectory with a
//! weighted history of past ODE derivatives, the weights being integrals of
//! Lagrange basis polynomials over each sigma interval.

use std::collections::VecDeque;

use super::integrate::integrate;
use super::{log_sigmas_from_betas, sigma_to_timestep, BetaSchedule, PredictionType, SchedulerError};
use tch::Tensor;

const INTEGRATION_TOL: f64 = 1e-4;
const MAX_REFINEMENTS: usize = 100;

#[derive(Debug, Clone)]
pub struct LMSDiscreteSchedulerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// Beta values recorded at training time, overriding `beta_schedule`
    /// when non-empty.
    pub trained_betas: Option<Vec<f64>>,
    /// number of diffusion steps used to train the model.
    pub train_timesteps: usize,
    /// maximum number of past derivatives used by a multistep update.
    pub order: usize,
    /// prediction type of the scheduler function
    pub prediction_type: PredictionType,
}

impl Default for LMSDiscreteSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            trained_betas: None,
            train_timesteps: 1000,
            order: 4,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

pub struct LMSDiscreteScheduler {
    timesteps: Vec<i64>,
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
    derivatives: VecDeque<Tensor>,
    pub config: LMSDiscreteSchedulerConfig,
}

impl LMSDiscreteScheduler {
    /// Builds the sigma schedule for a run of `inference_steps` steps.
    ///
    /// The schedule holds `inference_steps + 1` strictly decreasing sigmas
    /// with a terminal 0, obtained by interpolating the log-sigma table at
    /// evenly spaced positions over the reversed training timestep axis.
    pub fn new(
        inference_steps: usize,
        config: LMSDiscreteSchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        if inference_steps == 0 {
            return Err(SchedulerError::InvalidStepCount);
        }
        let log_sigmas = log_sigmas_from_betas(
            config.beta_start,
            config.beta_end,
            config.beta_schedule,
            config.train_timesteps,
            config.trained_betas.as_deref(),
        )?;

        let t_max = (log_sigmas.len() - 1) as f64;
        let delta = if inference_steps > 1 { t_max / (inference_steps - 1) as f64 } else { 0. };
        let mut sigmas = Vec::with_capacity(inference_steps + 1);
        for i in 0..inference_steps {
            let t = t_max - i as f64 * delta;
            let low_idx = (t.floor() as usize).min(log_sigmas.len() - 1);
            let high_idx = (t.ceil() as usize).min(log_sigmas.len() - 1);
            let w = t - t.floor();
            sigmas.push(((1. - w) * log_sigmas[low_idx] + w * log_sigmas[high_idx]).exp());
        }
        sigmas.push(0.);

        let timesteps =
            sigmas[..inference_steps].iter().map(|&s| sigma_to_timestep(&log_sigmas, s)).collect();

        // standard deviation of the initial noise distribution
        let init_noise_sigma = sigmas[0];

        Ok(Self {
            timesteps,
            sigmas,
            init_noise_sigma,
            derivatives: VecDeque::new(),
            config,
        })
    }

    /// The training timestep fed to the noise predictor at each step of the
    /// run, derived from the sigma schedule by inverse lookup.
    pub fn timesteps(&self) -> &[i64] {
        self.timesteps.as_slice()
    }

    /// The sigma schedule, `inference_steps + 1` values ending in 0.
    pub fn sigmas(&self) -> &[f64] {
        self.sigmas.as_slice()
    }

    pub fn inference_steps(&self) -> usize {
        self.timesteps.len()
    }

    /// Scales the denoising model input by `1 / (sigma^2 + 1)^0.5` to match
    /// the K-LMS algorithm.
    pub fn scale_model_input(&self, sample: &Tensor, step_index: usize) -> Tensor {
        let sigma = self.sigmas[step_index];
        sample / (sigma.powi(2) + 1.).sqrt()
    }

    /// Compute a linear multistep coefficient by integrating the Lagrange
    /// basis polynomial for `current_order` over `[sigmas[t], sigmas[t+1]]`.
    fn get_lms_coefficient(&self, order: usize, t: usize, current_order: usize) -> f64 {
        let lms_derivative = |tau: f64| -> f64 {
            let mut prod = 1.0;
            for k in 0..order {
                if current_order == k {
                    continue;
                }
                prod *= (tau - self.sigmas[t - k])
                    / (self.sigmas[t - current_order] - self.sigmas[t - k]);
            }
            prod
        };

        integrate(
            lms_derivative,
            self.sigmas[t],
            self.sigmas[t + 1],
            INTEGRATION_TOL,
            MAX_REFINEMENTS,
        )
    }

    /// Advances the latent by one multistep update.
    ///
    /// `sample` is the current latent and `model_output` the guided noise
    /// prediction for this step. The scheduler keeps the run's derivative
    /// history, so a fresh instance must be used for each generation.
    pub fn step(
        &mut self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
    ) -> Result<Tensor, SchedulerError> {
        let steps = self.timesteps.len();
        if step_index >= steps {
            return Err(SchedulerError::StepIndexOutOfRange { step_index, steps });
        }
        let sigma = self.sigmas[step_index];
        if sigma == 0. {
            // the schedule only vanishes at its terminal entry
            return Err(SchedulerError::ZeroSigma { step_index });
        }

        // 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
        let pred_original_sample = match self.config.prediction_type {
            PredictionType::Epsilon => sample - sigma * model_output,
            PredictionType::VPrediction => {
                model_output * (-sigma / (sigma.powi(2) + 1.).sqrt())
                    + (sample / (sigma.powi(2) + 1.))
            }
        };

        // 2. Convert to an ODE derivative
        let derivative = (sample - pred_original_sample) / sigma;
        self.derivatives.push_back(derivative);
        if self.derivatives.len() > self.config.order {
            self.derivatives.pop_front();
        }

        // 3. compute linear multistep coefficients
        let order = self.config.order.min(step_index + 1);
        let lms_coeffs: Vec<_> =
            (0..order).map(|o| self.get_lms_coefficient(order, step_index, o)).collect();

        // 4. compute previous sample based on the derivatives path, pairing
        // each coefficient with the matching derivative, most recent first
        let deriv_sum: Tensor = lms_coeffs
            .iter()
            .zip(self.derivatives.iter().rev())
            .map(|(coeff, derivative)| *coeff * derivative)
            .sum();

        Ok(sample + deriv_sum)
    }

    pub fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    /// Noises `original_samples` up to the noise level of the given step.
    pub fn add_noise(&self, original_samples: &Tensor, noise: Tensor, step_index: usize) -> Tensor {
        let sigma = self.sigmas[step_index];
        original_samples + noise * sigma
    }
}
