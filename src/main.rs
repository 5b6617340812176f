use std::{fs, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use image::{DynamicImage, ImageFormat, RgbaImage};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, Level};

use sam2_seg::{
    ArtifactStore, Config, DirectoryCache, HttpFetcher, InteractiveSession, Point, Sam2Model,
    SessionEvent,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let image = image::open(&config.image)
        .with_context(|| format!("Failed to open image: {}", config.image.display()))?
        .into_rgba8();

    let store = ArtifactStore::new(
        DirectoryCache::new(config.cache_root()?),
        HttpFetcher::default(),
    );
    let model = Sam2Model::new(store, config.artifacts(), config.build_backends());
    let mut session = InteractiveSession::spawn(model, config.channel_capacity)?;

    let progress = ProgressBar::new_spinner();
    progress.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] {msg}",
    )?);
    progress.enable_steady_tick(Duration::from_millis(120));

    session.initialize()?;
    progress.set_message(session.status().to_string());
    wait_for(&mut session, &progress).await?;

    session.set_image(image)?;
    session.encode_image()?;
    progress.set_message(session.status().to_string());
    wait_for(&mut session, &progress).await?;

    let side = session.geometry().image_side;
    for source_point in &config.points {
        let padded = session.image().context("Image was not retained")?;
        let (x, y) = padded.source_to_model(source_point.x, source_point.y, side);
        session.add_point(Point {
            x,
            y,
            label: source_point.label,
        })?;
        progress.set_message(session.status().to_string());
        if let SessionEvent::MaskUpdated { best_index, score } =
            wait_for(&mut session, &progress).await?
        {
            info!(
                "Point ({}, {}) -> mask {best_index} (iou {score:.3})",
                source_point.x, source_point.y
            );
        }
    }
    progress.finish_and_clear();

    fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "Failed to create output directory: {}",
            config.output_dir.display()
        )
    })?;
    let stem = config
        .image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let format = config.output_format();

    let mask_path = config
        .output_dir
        .join(format!("{stem}_mask.{}", config.format));
    save(session.mask_for_source()?, &mask_path, format)?;
    let crop_path = config
        .output_dir
        .join(format!("{stem}_crop.{}", config.format));
    save(session.crop()?, &crop_path, format)?;
    info!(
        "Wrote {} and {}",
        mask_path.display(),
        crop_path.display()
    );

    session.shutdown()?;
    Ok(())
}

/// Wait for the outcome of the request in flight, updating the spinner on the way.
async fn wait_for(session: &mut InteractiveSession, progress: &ProgressBar) -> Result<SessionEvent> {
    loop {
        let event = session
            .next_event()
            .await
            .context("Worker stopped unexpectedly")?;
        match event {
            SessionEvent::Loading(stage) => progress.set_message(stage.to_string()),
            SessionEvent::Failed { message, .. } => bail!(message),
            other => return Ok(other),
        }
    }
}

fn save(image: RgbaImage, path: &Path, format: ImageFormat) -> Result<()> {
    let image = DynamicImage::ImageRgba8(image);
    // JPEG has no alpha channel.
    let image = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
        _ => image,
    };
    image
        .save_with_format(path, format)
        .with_context(|| format!("Failed to save image: {}", path.display()))
}
