//! CLI for training and sampling denoising diffusion models on images.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tch::{Device, Kind};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use diffusion_image::{
    data::{DataLoader, ImageDataset},
    model::{Denoiser, Diffusion, NoiseSchedule},
    training::{LossType, Trainer, TrainingConfig},
    utils::{Checkpoint, Config},
};

#[derive(Parser)]
#[command(name = "diffusion-image")]
#[command(about = "Denoising diffusion probabilistic models for image generation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration file
    Init {
        /// Output path for config file
        #[arg(short, long, default_value = "config.json")]
        output: String,
    },

    /// Train the denoiser
    Train {
        /// Directory holding the MNIST ubyte files
        #[arg(short, long, default_value = "data")]
        data: String,

        /// Number of training epochs (overrides config)
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Configuration file (optional)
        #[arg(short, long)]
        config: Option<String>,

        /// Checkpoint directory
        #[arg(long, default_value = "checkpoints")]
        checkpoint_dir: String,

        /// Use GPU if available
        #[arg(long)]
        gpu: bool,
    },

    /// Generate images with a trained model
    Sample {
        /// Path to trained model weights
        #[arg(short, long)]
        model: String,

        /// Number of images to generate
        #[arg(short, long, default_value = "64")]
        num_images: i64,

        /// Output directory for PNG files
        #[arg(short, long, default_value = "samples")]
        output: String,

        /// Configuration file (optional)
        #[arg(short, long)]
        config: Option<String>,

        /// Use GPU if available
        #[arg(long)]
        gpu: bool,
    },
}

fn load_config(path: Option<String>) -> Result<Config> {
    match path {
        Some(p) => Config::from_file(p),
        None => Ok(Config::default()),
    }
}

fn select_device(gpu: bool) -> Device {
    if gpu && tch::Cuda::is_available() {
        info!("Using CUDA GPU");
        Device::Cuda(0)
    } else {
        info!("Using CPU");
        Device::Cpu
    }
}

fn build_schedule(cfg: &Config) -> Result<NoiseSchedule> {
    let schedule = match cfg.model.noise_schedule.as_str() {
        "cosine" => NoiseSchedule::cosine(cfg.model.n_timesteps)?,
        _ => NoiseSchedule::linear(cfg.model.beta_min, cfg.model.beta_max, cfg.model.n_timesteps)?,
    };
    Ok(schedule)
}

fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output } => {
            info!("Creating default configuration...");
            let config = Config::default();
            config.to_file(&output)?;
            info!("Configuration saved to: {}", output);
        }

        Commands::Train {
            data,
            epochs,
            config,
            checkpoint_dir,
            gpu,
        } => {
            let cfg = load_config(config)?;
            let device = select_device(gpu);

            // Fail on a bad loss selector before touching data or weights
            let loss_type: LossType = cfg.model.loss_type.parse()?;

            info!("Loading MNIST from: {}", data);
            let dataset = ImageDataset::mnist(&data, true, device)?;
            info!("Loaded {} images", dataset.len());

            let mut loader = DataLoader::new(dataset, cfg.data.batch_size, true);

            let schedule = build_schedule(&cfg)?;
            let diffusion = Diffusion::new(schedule, cfg.image_resolution(), device);
            let denoiser = Denoiser::new(
                cfg.image_resolution(),
                cfg.model.hidden_dim,
                cfg.model.time_emb_dim,
                cfg.model.n_layers,
                device,
            );

            let train_config = TrainingConfig {
                epochs: epochs.unwrap_or(cfg.training.epochs),
                learning_rate: cfg.training.learning_rate,
                grad_clip: cfg.training.grad_clip,
                checkpoint_dir: checkpoint_dir.clone(),
                ..Default::default()
            };

            info!(
                "Training for {} epochs with {} diffusion steps ({} loss)...",
                train_config.epochs, cfg.model.n_timesteps, cfg.model.loss_type
            );

            let epochs_run = train_config.epochs;
            let mut trainer = Trainer::new(denoiser, diffusion, loss_type, train_config)?;
            let losses = trainer.train(&mut loader)?;

            let checkpoint = Checkpoint::new(
                format!("{}/denoiser_final.pt", checkpoint_dir),
                epochs_run,
                trainer.best_loss(),
                cfg,
                losses,
            );
            let meta_path = format!("{}/checkpoint.json", checkpoint_dir);
            checkpoint.save(&meta_path)?;
            info!("Checkpoint metadata saved to: {}", meta_path);
        }

        Commands::Sample {
            model,
            num_images,
            output,
            config,
            gpu,
        } => {
            let cfg = load_config(config)?;
            let device = select_device(gpu);

            let schedule = build_schedule(&cfg)?;
            let diffusion = Diffusion::new(schedule, cfg.image_resolution(), device);

            let mut denoiser = Denoiser::new(
                cfg.image_resolution(),
                cfg.model.hidden_dim,
                cfg.model.time_emb_dim,
                cfg.model.n_layers,
                device,
            );
            info!("Loading model from: {}", model);
            denoiser.load(&model)?;

            info!(
                "Sampling {} images over {} steps...",
                num_images, cfg.model.n_timesteps
            );
            let images = tch::no_grad(|| diffusion.sample(&denoiser, num_images))?;

            std::fs::create_dir_all(&output)?;
            for i in 0..num_images {
                let img = (images.get(i) * 255.0).clamp(0.0, 255.0).to_kind(Kind::Uint8);
                let path = format!("{}/sample_{:03}.png", output, i);
                tch::vision::image::save(&img, &path)?;
            }
            info!("Wrote {} images to: {}", num_images, output);
        }
    }

    Ok(())
}
