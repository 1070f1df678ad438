use std::{env, path::PathBuf, time::Duration};

use crate::types::{DevicePosition, PixelFormat, Rotation};

// Minimum overall score to keep a pose result. Applied both when the
// scheduler clears low-score results and when the overlay suppresses the
// skeleton, so the two paths can never disagree.
pub const DEFAULT_MIN_POSE_SCORE: f32 = 0.2;

#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    /// Nominal rate used for encoder tuning only; actual presentation
    /// times come from frame timestamps.
    pub fps_hint: u32,
    pub video_bitrate_kbps: u32,
    pub pixel_format: PixelFormat,
    pub audio_rate: u32,
    pub audio_channels: u16,
    /// Directory that receives the per-session temporary container files.
    pub scratch_dir: PathBuf,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            width: 1280,
            height: 720,
            fps_hint: 30,
            video_bitrate_kbps: 4000,
            pixel_format: PixelFormat::Bgra,
            audio_rate: 44_100,
            audio_channels: 2,
            scratch_dir: env::temp_dir(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub camera_position: DevicePosition,
    pub rotation: Rotation,
    pub min_pose_score: f32,
    pub capture_audio: bool,
    pub encoder: EncoderConfig,
    /// Where finished recordings are persisted by the media library.
    pub library_dir: PathBuf,
    pub model_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            camera_position: DevicePosition::Back,
            rotation: Rotation::None,
            min_pose_score: DEFAULT_MIN_POSE_SCORE,
            capture_audio: true,
            encoder: EncoderConfig::default(),
            library_dir: PathBuf::from("recordings"),
            model_path: crate::model_fetch::default_model_path(),
        }
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_label_formats_like_a_stopwatch() {
        assert_eq!(format_elapsed(Duration::ZERO), "00:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(5)), "00:00:05");
        assert_eq!(format_elapsed(Duration::from_secs(65)), "00:01:05");
        assert_eq!(format_elapsed(Duration::from_secs(3600 + 61)), "01:01:01");
        assert_eq!(format_elapsed(Duration::from_millis(999)), "00:00:00");
    }

    #[test]
    fn encoder_defaults_match_the_playback_contract() {
        let config = EncoderConfig::default();
        assert_eq!(config.audio_channels, 2);
        assert_eq!(config.audio_rate, 44_100);
        assert_eq!(config.pixel_format, PixelFormat::Bgra);
    }
}
