//! # Text-to-image sampling
//!
//! The denoising loop: at each step the latent is scaled to the model input
//! space, handed to the noise predictor in a guidance-doubled batch, the two
//! predictions are merged under classifier-free guidance and the scheduler
//! advances the latent.

use crate::schedulers::lms_discrete::LMSDiscreteScheduler;
use tch::Tensor;

pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;

/// The external denoising network.
///
/// `latent_model_input` carries the unconditional branch at batch index 0
/// and the text-conditional branch at index 1; `encoder_hidden_states` is
/// laid out the same way. The prediction keeps the input shape.
pub trait NoisePredictor {
    fn infer(
        &self,
        timestep: i64,
        latent_model_input: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> anyhow::Result<Tensor>;
}

impl<F> NoisePredictor for F
where
    F: Fn(i64, &Tensor, &Tensor) -> anyhow::Result<Tensor>,
{
    fn infer(
        &self,
        timestep: i64,
        latent_model_input: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> anyhow::Result<Tensor> {
        self(timestep, latent_model_input, encoder_hidden_states)
    }
}

/// Merges the unconditional and text-conditional noise predictions.
///
/// A scale of 0 keeps the unconditional prediction, 1 the conditional one,
/// anything above 1 strengthens prompt adherence.
pub fn classifier_free_guidance(
    noise_pred_uncond: &Tensor,
    noise_pred_text: &Tensor,
    guidance_scale: f64,
) -> Tensor {
    noise_pred_uncond + (noise_pred_text - noise_pred_uncond) * guidance_scale
}

/// Runs the full denoising loop and returns the final latent.
///
/// `latents` must already be scaled by the scheduler's
/// `init_noise_sigma()`; `text_embeddings` concatenates the unconditional
/// and conditional embeddings along the batch dimension. The scheduler
/// instance carries the derivative history of this run, so a fresh one is
/// required per generated image.
pub fn sample<P: NoisePredictor>(
    predictor: &P,
    scheduler: &mut LMSDiscreteScheduler,
    text_embeddings: &Tensor,
    mut latents: Tensor,
    guidance_scale: f64,
) -> anyhow::Result<Tensor> {
    for step_index in 0..scheduler.inference_steps() {
        let timestep = scheduler.timesteps()[step_index];
        let latent_model_input = scheduler.scale_model_input(&latents, step_index);
        let latent_model_input = Tensor::cat(&[&latent_model_input, &latent_model_input], 0);

        let noise_pred = predictor.infer(timestep, &latent_model_input, text_embeddings)?;
        let noise_pred = noise_pred.chunk(2, 0);
        let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
        let noise_pred =
            classifier_free_guidance(noise_pred_uncond, noise_pred_text, guidance_scale);

        latents = scheduler.step(&noise_pred, step_index, &latents)?;
    }
    Ok(latents)
}
