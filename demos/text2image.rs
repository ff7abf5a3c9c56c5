// Text-to-image generation with the K-LMS sampler.
//
// The neural networks are not defined in this crate: the UNet noise
// predictor and the VAE decoder are loaded as TorchScript modules, and the
// prompt is consumed as precomputed text embeddings. From a Python
// environment with diffusers installed, export the three files once:
//
//   import numpy as np
//   import torch
//   from diffusers import StableDiffusionPipeline
//
//   pipe = StableDiffusionPipeline.from_pretrained("runwayml/stable-diffusion-v1-5")
//
//   class UNet(torch.nn.Module):
//       def __init__(self): super().__init__(); self.unet = pipe.unet
//       def forward(self, l, t, e): return self.unet(l, t, e).sample
//   class Decoder(torch.nn.Module):
//       def __init__(self): super().__init__(); self.vae = pipe.vae
//       def forward(self, l): return self.vae.decode(l).sample
//
//   torch.jit.trace(UNet(), (torch.randn(2, 4, 64, 64), torch.tensor(999),
//       torch.randn(2, 77, 768))).save("data/unet.pt")
//   torch.jit.trace(Decoder(), torch.randn(1, 4, 64, 64)).save("data/vae_decoder.pt")
//
//   tokens = pipe.tokenizer(["", "a rusty robot holding a fire torch"],
//       padding="max_length", max_length=77, return_tensors="pt")
//   embeddings = pipe.text_encoder(tokens.input_ids)[0]
//   np.save("data/text_embeddings.npy", embeddings.detach().numpy())
//
// Then generate an image with:
//
//   cargo run --example text2image --features clap
use clap::Parser;
use ksampler::pipelines::text_to_image::{self, NoisePredictor};
use ksampler::schedulers::lms_discrete::LMSDiscreteScheduler;
use tch::{CModule, Device, Kind, Tensor};

const HEIGHT: i64 = 512;
const WIDTH: i64 = 512;
const VAE_SCALING_FACTOR: f64 = 0.18215;

struct TracedUNet {
    module: CModule,
}

impl NoisePredictor for TracedUNet {
    fn infer(
        &self,
        timestep: i64,
        latent_model_input: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> anyhow::Result<Tensor> {
        let timestep = Tensor::from(timestep);
        Ok(self.module.forward_ts(&[latent_model_input, &timestep, encoder_hidden_states])?)
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The traced UNet noise predictor.
    #[arg(long, value_name = "FILE", default_value = "data/unet.pt")]
    unet: String,

    /// The traced VAE decoder.
    #[arg(long, value_name = "FILE", default_value = "data/vae_decoder.pt")]
    vae: String,

    /// Precomputed text embeddings in npy format, unconditional then
    /// conditional, concatenated along the batch dimension.
    #[arg(long, value_name = "FILE", default_value = "data/text_embeddings.npy")]
    text_embeddings: String,

    /// Components to run on the CPU even if a CUDA device is available:
    /// all, unet, vae.
    #[arg(long)]
    cpu: Vec<String>,

    /// The number of steps to run the diffusion for.
    #[arg(long, default_value_t = 30)]
    n_steps: usize,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = text_to_image::DEFAULT_GUIDANCE_SCALE)]
    guidance_scale: f64,

    /// The random seed for the initial latent.
    #[arg(long, default_value_t = 32)]
    seed: i64,

    /// The name of the final image to generate.
    #[arg(long, value_name = "FILE", default_value = "sd_final.png")]
    final_image: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tch::maybe_init_cuda();
    println!("Cuda available: {}", tch::Cuda::is_available());
    println!("Cudnn available: {}", tch::Cuda::cudnn_is_available());
    let cuda_device = Device::cuda_if_available();
    let cpu_or_cuda = |name: &str| {
        if args.cpu.iter().any(|c| c == "all" || c == name) {
            Device::Cpu
        } else {
            cuda_device
        }
    };
    let unet_device = cpu_or_cuda("unet");
    let vae_device = cpu_or_cuda("vae");

    let no_grad_guard = tch::no_grad_guard();

    println!("Loading the traced UNet.");
    let mut unet = CModule::load_on_device(&args.unet, unet_device)?;
    unet.set_eval();
    let unet = TracedUNet { module: unet };
    println!("Loading the traced VAE decoder.");
    let mut vae = CModule::load_on_device(&args.vae, vae_device)?;
    vae.set_eval();

    let text_embeddings = Tensor::read_npy(&args.text_embeddings)?.to(unet_device);
    println!("Text embeddings: {:?}", text_embeddings);

    let mut scheduler = LMSDiscreteScheduler::new(args.n_steps, Default::default())?;

    tch::manual_seed(args.seed);
    let latents = Tensor::randn(&[1, 4, HEIGHT / 8, WIDTH / 8], (Kind::Float, unet_device))
        * scheduler.init_noise_sigma();

    println!("Sampling with {} steps.", args.n_steps);
    let latents = text_to_image::sample(
        &unet,
        &mut scheduler,
        &text_embeddings,
        latents,
        args.guidance_scale,
    )?;

    let latents = (latents / VAE_SCALING_FACTOR).to(vae_device);
    let image = vae.forward_ts(&[latents])?;
    let image = (image / 2 + 0.5).clamp(0., 1.).to_device(Device::Cpu);
    let image = (image * 255.).to_kind(Kind::Uint8);
    tch::vision::image::save(&image, args.final_image)?;

    drop(no_grad_guard);
    Ok(())
}
