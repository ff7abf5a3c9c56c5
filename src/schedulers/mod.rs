//! # Noise schedulers
//!
//! Noise schedulers can be used to set the trade-off between
//! inference speed and quality.

use tch::{kind, Kind, Tensor};

mod integrate;
pub mod lms_discrete;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

#[derive(Debug, Clone, Copy)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

/// Failures surfaced while building or driving a scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("beta schedule {0:?} is not supported by the LMS scheduler")]
    UnsupportedBetaSchedule(BetaSchedule),
    #[error("at least one inference step is required")]
    InvalidStepCount,
    #[error("step index {step_index} is out of range for a run of {steps} steps")]
    StepIndexOutOfRange { step_index: usize, steps: usize },
    #[error("sigma vanished at non-terminal step {step_index}")]
    ZeroSigma { step_index: usize },
}

/// Builds the per-training-timestep log-sigma table from the beta schedule
/// hyper-parameters.
///
/// A non-empty `trained_betas` sequence takes precedence over the analytic
/// schedules and is used verbatim. The resulting table is strictly
/// increasing in the underlying sigma domain.
pub fn log_sigmas_from_betas(
    beta_start: f64,
    beta_end: f64,
    beta_schedule: BetaSchedule,
    train_timesteps: usize,
    trained_betas: Option<&[f64]>,
) -> Result<Vec<f64>, SchedulerError> {
    let betas = match trained_betas {
        Some(betas) if !betas.is_empty() => Tensor::from_slice(betas),
        _ => match beta_schedule {
            BetaSchedule::ScaledLinear => Tensor::linspace(
                beta_start.sqrt(),
                beta_end.sqrt(),
                train_timesteps as i64,
                kind::FLOAT_CPU,
            )
            .square(),
            BetaSchedule::Linear => {
                Tensor::linspace(beta_start, beta_end, train_timesteps as i64, kind::FLOAT_CPU)
            }
            BetaSchedule::SquaredcosCapV2 => {
                return Err(SchedulerError::UnsupportedBetaSchedule(beta_schedule))
            }
        },
    };

    let alphas: Tensor = 1. - betas;
    let alphas_cumprod = alphas.cumprod(0, Kind::Double);
    let sigmas = ((1. - &alphas_cumprod) as Tensor / &alphas_cumprod).sqrt();
    let sigmas: Vec<f64> = sigmas.try_into().unwrap();
    Ok(sigmas.iter().map(|s| s.ln()).collect())
}

/// Maps a sigma value back to a timestep of the training schedule by
/// piecewise-linear inversion of the log-sigma table.
///
/// Exact at table-aligned sigmas, saturating at both table ends.
pub fn sigma_to_timestep(log_sigmas: &[f64], sigma: f64) -> i64 {
    let log_sigma = sigma.ln();

    // rightmost table entry at or below the target, keeping the upper
    // neighbor within bounds
    let low_idx =
        log_sigmas.iter().rposition(|&ls| log_sigma >= ls).unwrap_or(0).min(log_sigmas.len() - 2);
    let high_idx = low_idx + 1;

    let low = log_sigmas[low_idx];
    let high = log_sigmas[high_idx];
    let w = ((low - log_sigma) / (low - high)).clamp(0., 1.);

    ((1. - w) * low_idx as f64 + w * high_idx as f64).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_table() -> Vec<f64> {
        log_sigmas_from_betas(0.00085, 0.012, BetaSchedule::ScaledLinear, 1000, None).unwrap()
    }

    #[test]
    fn log_sigma_table_is_strictly_increasing() {
        let log_sigmas = default_table();
        assert_eq!(log_sigmas.len(), 1000);
        for pair in log_sigmas.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        // sigmas themselves are positive and finite
        for ls in &log_sigmas {
            let sigma = ls.exp();
            assert!(sigma.is_finite() && sigma > 0.);
        }
    }

    #[test]
    fn linear_schedule_also_increases() {
        let log_sigmas =
            log_sigmas_from_betas(0.0001, 0.02, BetaSchedule::Linear, 500, None).unwrap();
        assert_eq!(log_sigmas.len(), 500);
        for pair in log_sigmas.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn trained_betas_take_precedence() {
        let betas: Vec<f64> = (0..10).map(|i| 0.0001 + i as f64 * 0.001).collect();
        let from_override =
            log_sigmas_from_betas(0.5, 0.9, BetaSchedule::ScaledLinear, 1000, Some(&betas))
                .unwrap();
        assert_eq!(from_override.len(), 10);

        // manual recomputation over the explicit betas
        let mut cumprod = 1.;
        for (i, beta) in betas.iter().enumerate() {
            cumprod *= 1. - beta;
            let expected = ((1. - cumprod) / cumprod).sqrt().ln();
            assert!((from_override[i] - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn empty_trained_betas_fall_back_to_schedule() {
        let empty: &[f64] = &[];
        let with_empty =
            log_sigmas_from_betas(0.00085, 0.012, BetaSchedule::ScaledLinear, 1000, Some(empty))
                .unwrap();
        assert_eq!(with_empty, default_table());
    }

    #[test]
    fn cosine_schedule_is_rejected() {
        let res = log_sigmas_from_betas(0.00085, 0.012, BetaSchedule::SquaredcosCapV2, 1000, None);
        assert!(matches!(res, Err(SchedulerError::UnsupportedBetaSchedule(_))));
    }

    #[test]
    fn timestep_mapping_is_exact_on_table_entries() {
        let log_sigmas = default_table();
        for k in [0usize, 1, 499, 998, 999] {
            let sigma = log_sigmas[k].exp();
            assert_eq!(sigma_to_timestep(&log_sigmas, sigma), k as i64);
        }
    }

    #[test]
    fn timestep_mapping_saturates_at_table_ends() {
        let log_sigmas = default_table();
        let below = log_sigmas[0].exp() / 2.;
        let above = log_sigmas[999].exp() * 2.;
        assert_eq!(sigma_to_timestep(&log_sigmas, below), 0);
        assert_eq!(sigma_to_timestep(&log_sigmas, above), 999);
    }
}
