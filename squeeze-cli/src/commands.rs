use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use sq_common::{CompressionConfig, Resizer, VideoQuality};

#[derive(Debug, Parser, Clone)]
#[command(author, version, about = "Inspect and prepare MP4 files for compression", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the metadata of a video file
    Probe(ProbeArgs),
    /// Show the resolution and bitrate a compression would target
    Plan(PlanArgs),
    /// Move the moov box in front of the media data
    #[command(name = "faststart")]
    FastStart(FastStartArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ProbeArgs {
    #[clap(help = "Path to the video file")]
    pub file: PathBuf,
    #[clap(long, help = "Print JSON instead of text")]
    pub json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum QualityArg {
    VeryLow,
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}

impl From<QualityArg> for VideoQuality {
    fn from(quality: QualityArg) -> Self {
        match quality {
            QualityArg::VeryLow => Self::VeryLow,
            QualityArg::Low => Self::Low,
            QualityArg::Medium => Self::Medium,
            QualityArg::High => Self::High,
            QualityArg::VeryHigh => Self::VeryHigh,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct PlanArgs {
    #[clap(help = "Path to the video file")]
    pub file: PathBuf,
    #[clap(long, short, value_enum, default_value = "medium")]
    pub quality: QualityArg,
    #[clap(long, requires = "height", help = "Target width in pixels")]
    pub width: Option<f64>,
    #[clap(long, requires = "width", help = "Target height in pixels")]
    pub height: Option<f64>,
    #[clap(long, help = "Target bitrate in Mbps")]
    pub bitrate: Option<f64>,
    #[clap(long, conflicts_with_all = ["limit", "keep_size"], help = "Scale both dimensions by this factor")]
    pub scale: Option<f64>,
    #[clap(long, conflicts_with = "keep_size", help = "Fit inside a square of this many pixels")]
    pub limit: Option<f64>,
    #[clap(long, help = "Keep the source resolution")]
    pub keep_size: bool,
    #[clap(long, help = "Allow sources below the minimum bitrate")]
    pub no_min_bitrate: bool,
    #[clap(long, help = "Print JSON instead of text")]
    pub json: bool,
}

impl PlanArgs {
    pub fn config(&self) -> CompressionConfig {
        let resizer = if self.keep_size {
            None
        } else if let Some(factor) = self.scale {
            Some(Resizer::scale(factor))
        } else if let Some(limit) = self.limit {
            Some(Resizer::limit_size(limit))
        } else {
            Some(Resizer::Auto)
        };

        let mut config = CompressionConfig {
            min_bitrate_check: !self.no_min_bitrate,
            resizer,
            ..Default::default()
        }
        .with_quality(self.quality.into());
        if let (Some(width), Some(height)) = (self.width, self.height) {
            config = config.with_dimensions(width, height);
        }
        if let Some(mbps) = self.bitrate {
            config = config.with_bitrate_mbps(mbps);
        }
        config
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct FastStartArgs {
    #[clap(help = "Input MP4 file")]
    pub input: PathBuf,
    #[clap(help = "Output file; defaults to rewriting the input")]
    pub output: Option<PathBuf>,
    #[clap(long, conflicts_with = "output", help = "Rewrite the input file")]
    pub in_place: bool,
}
