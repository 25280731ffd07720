use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{Augmenter, FaceDetector, LbphRecognizer, Recognizer};
use rollcall_service::EngineConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Classroom face recognition tools")]
struct Cli {
    /// TOML config file; falls back to ROLLCALL_* environment variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from a dataset of per-student image folders
    Train {
        /// Dataset root: {studentId}/*.jpg|png
        dataset: PathBuf,
        /// Directory to write the model artifact pair into
        #[arg(short, long)]
        model_dir: PathBuf,
    },
    /// Identify the face in an image against a trained model
    Recognize {
        /// Directory holding the model artifact pair
        #[arg(short, long)]
        model_dir: PathBuf,
        /// Image containing the face to identify
        image: PathBuf,
    },
    /// Detect faces in an image and print their bounding boxes
    Detect {
        image: PathBuf,
    },
    /// Write the augmented training variants of one image
    Augment {
        image: PathBuf,
        /// Output directory for the variants
        #[arg(short, long)]
        out_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::from_env(),
    };

    match cli.command {
        Commands::Train { dataset, model_dir } => {
            let mut recognizer = LbphRecognizer::new(config.lbph_params());
            recognizer
                .train(&dataset)
                .with_context(|| format!("training from {}", dataset.display()))?;
            recognizer.save_model(&model_dir)?;
            println!(
                "trained {} students, model written to {}",
                recognizer.labels().len(),
                model_dir.display()
            );
        }
        Commands::Recognize { model_dir, image } => {
            let mut recognizer = LbphRecognizer::new(config.lbph_params());
            recognizer.load_model(&model_dir)?;
            anyhow::ensure!(
                recognizer.is_trained(),
                "no trained model in {}",
                model_dir.display()
            );
            let img = image::open(&image)
                .with_context(|| format!("opening {}", image.display()))?;
            let prediction = recognizer.recognize(&img);
            println!("{} (distance {:.4})", prediction.label, prediction.distance);
        }
        Commands::Detect { image } => {
            let detector = FaceDetector::open(
                config.primary_cascade.as_deref(),
                config.fallback_cascade.as_deref(),
                config.detector_config(),
            );
            anyhow::ensure!(
                detector.has_classifier(),
                "no cascade model configured (set ROLLCALL_PRIMARY_CASCADE)"
            );
            let img = image::open(&image)
                .with_context(|| format!("opening {}", image.display()))?;
            let faces = detector.detect(&img);
            if faces.is_empty() {
                println!("no faces found");
            }
            for face in faces {
                println!(
                    "{}x{} at ({}, {})",
                    face.width, face.height, face.x, face.y
                );
            }
        }
        Commands::Augment { image, out_dir } => {
            let img = image::open(&image)
                .with_context(|| format!("opening {}", image.display()))?;
            let augmenter = Augmenter::new(config.blur_threshold, 3);
            let variants = augmenter.augment(&img.to_luma8());
            anyhow::ensure!(!variants.is_empty(), "image rejected by the sharpness gate");
            std::fs::create_dir_all(&out_dir)?;
            for (i, variant) in variants.iter().enumerate() {
                let path = out_dir.join(format!("variant-{i:02}.png"));
                variant.save(&path)?;
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}
