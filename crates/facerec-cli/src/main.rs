use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facerec_core::OnnxRecognizer;

#[derive(Parser)]
#[command(name = "facerec", about = "Face recognition diagnostics CLI")]
struct Cli {
    /// Directory containing the ONNX model artifacts
    #[arg(short, long, env = "FACEREC_MODEL_DIR", default_value = "models")]
    models: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize all faces in an image and print them as JSON
    Recognize {
        /// Path to the image file (JPEG, PNG, ...)
        image: PathBuf,
        /// Number of jittered embedding evaluations per face
        #[arg(short, long, default_value_t = 0)]
        jitter: u32,
        /// Skip images with more than this many faces (0 = unlimited)
        #[arg(short = 'n', long, default_value_t = 0)]
        max_faces: u32,
    },
    /// Compare the single face of two images and print their distance
    Compare {
        first: PathBuf,
        second: PathBuf,
        /// Number of jittered embedding evaluations per face
        #[arg(short, long, default_value_t = 0)]
        jitter: u32,
    },
    /// Check that the model directory holds loadable artifacts
    Check,
}

fn load_image(path: &PathBuf) -> Result<image::RgbImage> {
    let img = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8();
    Ok(img)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let recognizer = OnnxRecognizer::open(&cli.models)
        .with_context(|| format!("failed to load models from {}", cli.models.display()))?;

    match cli.command {
        Commands::Recognize { image, jitter, max_faces } => {
            let img = load_image(&image)?;
            let faces = recognizer.recognize(&img, max_faces, jitter)?;
            tracing::info!(faces = faces.len(), "recognition complete");
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
        Commands::Compare { first, second, jitter } => {
            let face_a = recognizer
                .recognize_single(&load_image(&first)?, jitter)?
                .with_context(|| format!("{} does not hold exactly one face", first.display()))?;
            let face_b = recognizer
                .recognize_single(&load_image(&second)?, jitter)?
                .with_context(|| format!("{} does not hold exactly one face", second.display()))?;

            let distance = face_a.descriptor.euclidean_distance(&face_b.descriptor);
            let probability = face_a.descriptor.similarity_probability(&face_b.descriptor);
            println!(
                "{}",
                serde_json::json!({
                    "distance": distance,
                    "probability": probability,
                    "same_person": distance <= 0.6,
                })
            );
        }
        Commands::Check => {
            // Models loaded above; exercise the pipeline on a blank image.
            let blank = image::RgbImage::new(64, 64);
            let faces = recognizer.recognize(&blank, 0, 0)?;
            if !faces.is_empty() {
                bail!("detector reported {} faces on a blank image", faces.len());
            }
            println!("ok: models load and the pipeline runs");
        }
    }

    Ok(())
}
