use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use idverify_compare::ComparisonClient;
use idverify_flow::{Config, FlowBuilder, FlowHandle, FlowSnapshot, FlowState, ImageSource};
use idverify_media::{capture_image, list_devices, CameraSession, CaptureSlot, PreviewStore, V4lBackend};
use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "idverify", about = "Identity document capture and face comparison")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare a selfie against the photo on an identity document
    Compare {
        /// Image of the document front (JPEG or PNG)
        #[arg(short, long)]
        document: PathBuf,
        /// Selfie image file
        #[arg(short, long, required_unless_present = "camera", conflicts_with = "camera")]
        selfie: Option<PathBuf>,
        /// Take the selfie from a camera (configured device if none given)
        #[arg(long, num_args = 0..=1, default_missing_value = "")]
        camera: Option<String>,
        /// Minimum similarity for a match (0-100)
        #[arg(short, long)]
        threshold: Option<f64>,
    },
    /// List V4L2 capture devices
    Devices,
    /// Capture one frame and save it as JPEG
    Test {
        /// Device path (defaults to the configured camera)
        #[arg(long)]
        device: Option<String>,
        #[arg(short, long, default_value = "front-capture.jpg")]
        output: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Compare {
            document,
            selfie,
            camera,
            threshold,
        } => {
            let selfie = match (selfie, camera) {
                (Some(path), _) => file_source(&path)?,
                (None, Some(device)) => {
                    let mut constraints = config.device_constraints();
                    if !device.is_empty() {
                        constraints.device = device;
                    }
                    ImageSource::Camera(constraints)
                }
                (None, None) => bail!("either --selfie or --camera is required"),
            };
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            run_compare(&config, file_source(&document)?, selfie, threshold).await?;
        }
        Commands::Devices => {
            let devices = list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} (driver {}, bus {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Test { device, output } => {
            let mut constraints = config.device_constraints();
            if let Some(device) = device {
                constraints.device = device;
            }
            println!("Capturing from {}...", constraints.device);

            let session = CameraSession::open(&V4lBackend, &constraints)?;
            let image = tokio::task::spawn_blocking(move || {
                let image = capture_image(&session, &PreviewStore::new(), CaptureSlot::FRONT);
                session.close();
                image
            })
            .await??;

            std::fs::write(&output, image.encoded())
                .with_context(|| format!("failed to write {}", output.display()))?;
            let (width, height) = image.pixels().dimensions();
            println!(
                "Saved {width}x{height} frame ({} bytes) to {}",
                image.encoded().len(),
                output.display()
            );
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        }
    }

    Ok(())
}

fn file_source(path: &Path) -> Result<ImageSource> {
    let format = ImageFormat::from_path(path)
        .with_context(|| format!("unrecognized image type: {}", path.display()))?;
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(ImageSource::named_file(bytes, format.to_mime_type(), name))
}

async fn run_compare(config: &Config, document: ImageSource, selfie: ImageSource, threshold: f64) -> Result<()> {
    let client = ComparisonClient::new(&config.api_base_url, config.request_timeout())?;
    tracing::info!(endpoint = client.endpoint(), threshold, "starting face comparison");

    let flow = FlowBuilder::face_comparison(Arc::new(client), threshold)
        .with_config(config)
        .spawn();
    let progress = tokio::spawn(print_feedback(flow.subscribe()));

    flow.acquire(CaptureSlot::FRONT, document).await?;
    wait_for_selfie_prompt(&flow).await?;
    flow.acquire(CaptureSlot::Selfie, selfie).await?;
    let result = flow.settled().await;
    progress.abort();

    let result = result?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if let Some(report) = &result.comparison {
        if !report.is_match() {
            eprintln!("No matching face found");
        }
    }
    Ok(())
}

async fn wait_for_selfie_prompt(flow: &FlowHandle) -> Result<()> {
    let mut rx = flow.subscribe();
    loop {
        {
            let snapshot = rx.borrow_and_update();
            match &snapshot.state {
                FlowState::AwaitingSelfie => return Ok(()),
                FlowState::Failed(e) => return Err(e.clone().into()),
                _ => {}
            }
        }
        rx.changed().await.context("verification flow stopped")?;
    }
}

async fn print_feedback(mut rx: watch::Receiver<FlowSnapshot>) {
    let mut last = None;
    while rx.changed().await.is_ok() {
        let feedback = rx.borrow_and_update().feedback.clone();
        if feedback != last {
            if let Some(text) = &feedback {
                eprintln!("{text}");
            }
            last = feedback;
        }
    }
}
