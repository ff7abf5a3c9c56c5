//! # K-LMS diffusion sampling
//!
//! This library implements the sampling side of a latent diffusion pipeline
//! using Torch via the [tch-rs](https://github.com/LaurentMazare/tch-rs)
//! bindings: the K-LMS noise scheduler together with a classifier-free
//! guidance sampling loop.
//!
//! The denoising network itself is not part of this crate. It is consumed
//! through the [`pipelines::text_to_image::NoisePredictor`] trait, so any
//! UNet implementation (tch module, TorchScript trace, remote service) can
//! drive the loop.

pub mod pipelines;
pub mod schedulers;
