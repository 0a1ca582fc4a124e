//! Target bitrate and resolution selection.
//!
//! Everything here is a pure function of the probed [`VideoMetadata`] and
//! the caller's [`CompressionConfig`]; no file or codec is touched. The
//! transcoder only ever sees the resulting [`CompressionPlan`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use sq_common::{CompressionConfig, Micros, Resizer, Resolution, Rotation, VideoMetadata, VideoQuality};

use crate::error::{CompressError, CompressResult};

/// Sources at or below this bitrate are rejected while the minimum bitrate
/// check is enabled.
pub const MIN_BITRATE: u64 = 2_000_000;

/// Output dimensions are aligned to macroblock boundaries.
const DIMENSION_ALIGNMENT: f64 = 16.0;

/// Fraction of the source bitrate kept for a quality tier.
pub fn quality_factor(quality: VideoQuality) -> f64 {
    match quality {
        VideoQuality::VeryLow => 0.1,
        VideoQuality::Low => 0.2,
        VideoQuality::Medium => 0.3,
        VideoQuality::High => 0.4,
        VideoQuality::VeryHigh => 0.6,
    }
}

pub fn bitrate_for_quality(source_bitrate: u64, quality: VideoQuality) -> u64 {
    (source_bitrate as f64 * quality_factor(quality)).round() as u64
}

/// Scale factor used by [`Resizer::Auto`], picked from the larger dimension.
pub fn auto_scale_factor(width: f64, height: f64) -> f64 {
    let larger = width.max(height);
    if larger >= 1920.0 {
        0.5
    } else if larger >= 1280.0 {
        0.75
    } else if larger >= 960.0 {
        0.95
    } else {
        0.9
    }
}

/// Round to the nearest multiple of 16, then up to an even number.
pub fn align_dimension(value: f64) -> u32 {
    let aligned = (value / DIMENSION_ALIGNMENT).round().max(0.0) as u32 * DIMENSION_ALIGNMENT as u32;
    (aligned + 1) & !1
}

/// Fit `width`x`height` into the `box_width`x`box_height` box without
/// changing its aspect ratio.
fn fit_keep_aspect(width: f64, height: f64, box_width: f64, box_height: f64) -> (f64, f64) {
    let source_aspect = width / height;
    let box_aspect = box_width / box_height;
    if box_aspect <= source_aspect {
        (box_width, box_width / source_aspect)
    } else {
        (box_height * source_aspect, box_height)
    }
}

/// Unaligned output dimensions produced by `resizer` for a source.
pub fn resize(resizer: &Resizer, width: f64, height: f64) -> (f64, f64) {
    match *resizer {
        Resizer::Auto => {
            let factor = auto_scale_factor(width, height);
            (width * factor, height * factor)
        }
        Resizer::Scale { factor } => (width * factor, height * factor),
        Resizer::LimitSize {
            max_width,
            max_height,
        } => {
            if width < max_width && height < max_height {
                (width, height)
            } else {
                fit_keep_aspect(width, height, max_width, max_height)
            }
        }
        Resizer::MatchSize {
            width: target_width,
            height: target_height,
            stretch,
        } => {
            if stretch {
                (target_width, target_height)
            } else {
                fit_keep_aspect(width, height, target_width, target_height)
            }
        }
    }
}

/// Output dimensions before rotation handling.
pub fn target_dimensions(source: Resolution, config: &CompressionConfig) -> Resolution {
    if let Some((width, height)) = config.explicit_dimensions() {
        return Resolution::new(width.round() as u32, height.round() as u32);
    }
    match &config.resizer {
        Some(resizer) => {
            let (width, height) = resize(resizer, source.width as f64, source.height as f64);
            Resolution::new(align_dimension(width), align_dimension(height))
        }
        None => source,
    }
}

/// Everything the transcoder needs to know about its output.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionPlan {
    /// Encoder frame size, already swapped for quarter-turn sources.
    pub resolution: Resolution,
    pub bitrate: u64,
    /// Rotation written into the output track header.
    pub rotation: Rotation,
    pub duration: Micros,
}

/// Decide the output of one compression job.
///
/// Quarter-turn sources come out of the decoder upright, so their target
/// dimensions are swapped and the output carries no rotation. A half turn
/// is likewise baked into the frames.
pub fn plan(metadata: &VideoMetadata, config: &CompressionConfig) -> CompressResult<CompressionPlan> {
    config.validate()?;

    if config.min_bitrate_check && metadata.bitrate <= MIN_BITRATE {
        return Err(CompressError::BitrateTooLow {
            bitrate: metadata.bitrate,
        });
    }

    let bitrate = config
        .video_bitrate
        .unwrap_or_else(|| bitrate_for_quality(metadata.bitrate, config.quality));

    let mut resolution = target_dimensions(metadata.resolution, config);
    if resolution.is_empty() {
        return Err(CompressError::InvalidConfig(format!(
            "target resolution {resolution} for a {} source is empty",
            metadata.resolution
        )));
    }

    let rotation = match metadata.rotation {
        r if r.swaps_dimensions() => {
            resolution = resolution.transposed();
            Rotation::None
        }
        Rotation::Cw180 => Rotation::None,
        r => r,
    };

    debug!(
        source = %metadata.resolution,
        target = %resolution,
        source_bitrate = metadata.bitrate,
        bitrate,
        source_rotation = %metadata.rotation,
        "Planned compression"
    );

    Ok(CompressionPlan {
        resolution,
        bitrate,
        rotation,
        duration: metadata.duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(width: u32, height: u32, rotation: Rotation, bitrate: u64) -> VideoMetadata {
        VideoMetadata {
            resolution: Resolution::new(width, height),
            rotation,
            bitrate,
            duration: Micros(10_000_000),
            has_audio: true,
            frame_rate: Some(30),
        }
    }

    #[test]
    fn quality_factors() {
        let got: Vec<u64> = VideoQuality::ALL
            .iter()
            .map(|q| bitrate_for_quality(10_000_000, *q))
            .collect();
        assert_eq!(got, vec![1_000_000, 2_000_000, 3_000_000, 4_000_000, 6_000_000]);
        assert_eq!(bitrate_for_quality(5, VideoQuality::Medium), 2);
    }

    #[test]
    fn auto_factors_by_larger_dimension() {
        assert_eq!(auto_scale_factor(1920.0, 1080.0), 0.5);
        assert_eq!(auto_scale_factor(1080.0, 1920.0), 0.5);
        assert_eq!(auto_scale_factor(1280.0, 720.0), 0.75);
        assert_eq!(auto_scale_factor(960.0, 540.0), 0.95);
        assert_eq!(auto_scale_factor(640.0, 360.0), 0.9);
    }

    #[test]
    fn alignment_rounds_to_sixteen() {
        assert_eq!(align_dimension(960.0), 960);
        assert_eq!(align_dimension(540.0), 544);
        assert_eq!(align_dimension(519.0), 512);
        assert_eq!(align_dimension(3.0), 0);
    }

    #[test]
    fn full_hd_auto_plan() {
        let plan = plan(
            &metadata(1920, 1080, Rotation::None, 10_000_000),
            &CompressionConfig::default(),
        )
        .unwrap();
        assert_eq!(plan.resolution, Resolution::new(960, 544));
        assert_eq!(plan.bitrate, 3_000_000);
        assert_eq!(plan.rotation, Rotation::None);
        assert_eq!(plan.duration, Micros(10_000_000));
    }

    #[test]
    fn quarter_turns_swap_dimensions() {
        for rotation in [Rotation::Cw90, Rotation::Cw270] {
            let plan = plan(
                &metadata(1920, 1080, rotation, 10_000_000),
                &CompressionConfig::default(),
            )
            .unwrap();
            assert_eq!(plan.resolution, Resolution::new(544, 960));
            assert_eq!(plan.rotation, Rotation::None);
        }
    }

    #[test]
    fn half_turn_is_baked_in() {
        let plan = plan(
            &metadata(1280, 720, Rotation::Cw180, 10_000_000),
            &CompressionConfig::default(),
        )
        .unwrap();
        assert_eq!(plan.resolution, Resolution::new(960, 544));
        assert_eq!(plan.rotation, Rotation::None);
    }

    #[test]
    fn low_bitrate_is_rejected_when_checked() {
        let meta = metadata(1920, 1080, Rotation::None, MIN_BITRATE);
        let err = plan(&meta, &CompressionConfig::default()).unwrap_err();
        assert!(matches!(err, CompressError::BitrateTooLow { bitrate: MIN_BITRATE }));

        let config = CompressionConfig {
            min_bitrate_check: false,
            ..Default::default()
        };
        assert_eq!(plan(&meta, &config).unwrap().bitrate, 600_000);
    }

    #[test]
    fn explicit_overrides_bypass_policy() {
        let config = CompressionConfig::default()
            .with_dimensions(639.6, 480.2)
            .with_bitrate_mbps(1.5);
        let plan = plan(&metadata(1920, 1080, Rotation::None, 10_000_000), &config).unwrap();
        assert_eq!(plan.resolution, Resolution::new(640, 480));
        assert_eq!(plan.bitrate, 1_500_000);
    }

    #[test]
    fn no_resizer_keeps_source_size() {
        let config = CompressionConfig {
            resizer: None,
            ..Default::default()
        };
        let plan = plan(&metadata(1918, 1078, Rotation::None, 10_000_000), &config).unwrap();
        assert_eq!(plan.resolution, Resolution::new(1918, 1078));
    }

    #[test]
    fn partial_dimensions_fail_validation() {
        let config = CompressionConfig {
            video_width: Some(640.0),
            ..Default::default()
        };
        let err = plan(&metadata(1920, 1080, Rotation::None, 10_000_000), &config).unwrap_err();
        assert!(matches!(err, CompressError::Config(_)));
    }

    #[test]
    fn limit_size_keeps_small_sources() {
        assert_eq!(
            resize(&Resizer::limit_size(1280.0), 640.0, 360.0),
            (640.0, 360.0)
        );
    }

    #[test]
    fn resizers_keep_aspect_ratio() {
        let source = Resolution::HD;
        let resizers = [
            Resizer::scale(0.33),
            Resizer::limit_size(1280.0),
            Resizer::LimitSize {
                max_width: 4000.0,
                max_height: 720.0,
            },
            Resizer::match_size(800.0, 800.0, false),
        ];
        for resizer in resizers {
            let config = CompressionConfig {
                resizer: Some(resizer.clone()),
                ..Default::default()
            };
            let out = target_dimensions(source, &config);
            // 16-pixel alignment bounds the error on each side
            let tolerance = 16.0 / out.height as f64 * source.aspect_ratio() + 0.05;
            assert!(
                (out.aspect_ratio() - source.aspect_ratio()).abs() < tolerance,
                "{resizer:?} gave {out}"
            );
        }
    }

    #[test]
    fn limit_size_fits_the_box() {
        let config = CompressionConfig {
            resizer: Some(Resizer::limit_size(1280.0)),
            ..Default::default()
        };
        assert_eq!(
            target_dimensions(Resolution::HD, &config),
            Resolution::new(1280, 720)
        );
    }

    #[test]
    fn match_size_stretch_ignores_aspect() {
        let config = CompressionConfig {
            resizer: Some(Resizer::match_size(500.0, 500.0, true)),
            ..Default::default()
        };
        assert_eq!(
            target_dimensions(Resolution::HD, &config),
            Resolution::new(496, 496)
        );
    }

    #[test]
    fn degenerate_target_is_rejected() {
        let config = CompressionConfig {
            resizer: Some(Resizer::scale(0.001)),
            ..Default::default()
        };
        let err = plan(&metadata(1920, 1080, Rotation::None, 10_000_000), &config).unwrap_err();
        assert!(matches!(err, CompressError::InvalidConfig(_)));
    }
}
