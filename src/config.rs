use clap::Parser;
use image::ImageFormat;
use std::path::PathBuf;

use crate::{
    artifact::{DirectoryCache, ModelArtifact, ModelArtifacts, DECODER_URL, ENCODER_URL},
    errors::{Result, SegmentError},
    protocol::PointLabel,
    session::{BackendKind, OrtBackend, DEFAULT_BACKENDS},
    traits::ExecutionBackend,
    worker::DEFAULT_CHANNEL_CAPACITY,
};

/// Prompt point given on the command line, in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourcePoint {
    pub x: f32,
    pub y: f32,
    pub label: PointLabel,
}

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Image to segment
    pub image: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    /// `x,y` adds a foreground point, `x,y,0` a background point (source pixels)
    #[arg(short, long = "point", value_parser = parse_point, required = true)]
    pub points: Vec<SourcePoint>,

    #[arg(long, default_value = ENCODER_URL)]
    pub encoder_url: String,

    #[arg(long, default_value = DECODER_URL)]
    pub decoder_url: String,

    /// Load the encoder from a local file instead of downloading it
    #[arg(long)]
    pub encoder_path: Option<PathBuf>,

    /// Load the decoder from a local file instead of downloading it
    #[arg(long)]
    pub decoder_path: Option<PathBuf>,

    /// Model cache directory (defaults to the platform cache dir)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Execution backends, tried in order
    #[arg(
        short,
        long,
        value_enum,
        value_delimiter = ',',
        default_values_t = DEFAULT_BACKENDS.to_vec()
    )]
    pub backends: Vec<BackendKind>,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,

    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn artifacts(&self) -> ModelArtifacts {
        let defaults = ModelArtifacts::default();
        let pick = |name: &str, path: &Option<PathBuf>, url: &str| match path {
            Some(path) => ModelArtifact::local(name, path),
            None => ModelArtifact::remote(name, url),
        };
        ModelArtifacts {
            encoder: pick(&defaults.encoder.name, &self.encoder_path, &self.encoder_url),
            decoder: pick(&defaults.decoder.name, &self.decoder_path, &self.decoder_url),
        }
    }

    pub fn cache_root(&self) -> Result<PathBuf> {
        self.cache_dir
            .clone()
            .or_else(DirectoryCache::default_location)
            .ok_or_else(|| SegmentError::Configuration {
                message: "no cache directory available; pass --cache-dir".to_string(),
            })
    }

    pub fn build_backends(&self) -> Vec<Box<dyn ExecutionBackend>> {
        OrtBackend::candidates(&self.backends, self.device_id)
    }

    pub fn output_format(&self) -> ImageFormat {
        ImageFormat::from_extension(&self.format).unwrap_or(ImageFormat::Png)
    }
}

fn parse_point(s: &str) -> std::result::Result<SourcePoint, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let coordinate = |value: &str| {
        value
            .parse::<f32>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .ok_or(format!("`{value}` is not a valid pixel coordinate"))
    };

    let (x, y, label) = match parts.as_slice() {
        [x, y] => (*x, *y, PointLabel::Foreground),
        [x, y, label] => {
            let label = match *label {
                "1" | "fg" | "foreground" => PointLabel::Foreground,
                "0" | "bg" | "background" => PointLabel::Background,
                other => return Err(format!("`{other}` is not a point label (use 1 or 0)")),
            };
            (*x, *y, label)
        }
        _ => return Err(format!("`{s}` is not a point; expected x,y or x,y,label")),
    };

    Ok(SourcePoint {
        x: coordinate(x)?,
        y: coordinate(y)?,
        label,
    })
}

fn check_format(s: &str) -> std::result::Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}
