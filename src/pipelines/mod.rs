//! # Pipelines

pub mod text_to_image;
