#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

#[cfg(feature = "audio-cpal")]
mod audio;
mod bridge;
mod config;
mod error;
mod estimator;
mod model_fetch;
mod overlay;
mod pipeline;
mod recording;
mod scheduler;
mod source;
mod storage;
mod types;

use anyhow::Result;

fn main() -> Result<()> {
    env_logger::init();
    run()
}

#[cfg(all(feature = "camera-nokhwa", feature = "encoder-gst"))]
fn run() -> Result<()> {
    use std::{
        env,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        thread,
        time::{Duration, Instant},
    };

    use parking_lot::Mutex;

    use crate::{
        config::PipelineConfig,
        estimator::OrtEstimator,
        pipeline::{DisplaySink, Pipeline},
        recording::SessionStatus,
        recording::gst::GstEncoderFactory,
        source::NokhwaBackend,
        storage::MediaLibrary,
        types::{DevicePosition, Image, Rotation},
    };

    /// Headless display binding: counts frames and logs the recording
    /// scalars, standing in for a real UI surface.
    #[derive(Default)]
    struct LogDisplay {
        frames: AtomicU64,
        last_label: Mutex<String>,
    }

    impl DisplaySink for LogDisplay {
        fn publish_image(&self, image: &Image) {
            let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 120 == 0 {
                log::info!("{count} frames displayed ({}x{})", image.width, image.height);
            }
        }

        fn set_recording(&self, recording: bool) {
            log::info!(
                "recording indicator: {}",
                if recording { "on" } else { "off" }
            );
        }

        fn set_elapsed(&self, label: &str) {
            let mut last = self.last_label.lock();
            if *last != label {
                *last = label.to_string();
                log::info!("recording {label}");
            }
        }
    }

    let mut config = PipelineConfig::default();
    if let Ok(dir) = env::var("POSE_CAMERA_LIBRARY_DIR") {
        config.library_dir = dir.into();
    }
    if let Ok(position) = env::var("POSE_CAMERA_CAMERA") {
        config.camera_position = match position.as_str() {
            "front" => DevicePosition::Front,
            _ => DevicePosition::Back,
        };
    }
    if let Ok(rotation) = env::var("POSE_CAMERA_ROTATION") {
        config.rotation = match rotation.as_str() {
            "90" => Rotation::Cw90,
            "180" => Rotation::Cw180,
            "270" => Rotation::Cw270,
            _ => Rotation::None,
        };
    }
    if env::var("POSE_CAMERA_NO_AUDIO").is_ok() {
        config.capture_audio = false;
    }
    let record_secs: Option<u64> = env::var("POSE_CAMERA_RECORD_SECS")
        .ok()
        .and_then(|value| value.parse().ok());

    model_fetch::ensure_model_available(&config.model_path)?;
    let estimator = OrtEstimator::new(&config.model_path)?;
    let library_dir = config.library_dir.clone();

    let pipeline = Pipeline::start(
        config,
        Box::new(NokhwaBackend),
        Box::new(estimator),
        Box::new(GstEncoderFactory),
        Arc::new(MediaLibrary::new(library_dir)),
        Arc::new(LogDisplay::default()),
    )?;

    let wait_for_status = |status: SessionStatus, timeout: Duration| -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pipeline.session_status() == status {
                return true;
            }
            while let Ok(event) = pipeline.source_events().try_recv() {
                log::info!("camera: {event:?}");
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    };

    match record_secs {
        Some(secs) => {
            log::info!("recording a {secs}s clip");
            pipeline.arm();
            if !wait_for_status(SessionStatus::Armed, Duration::from_secs(15)) {
                anyhow::bail!("recording session never armed");
            }
            pipeline.begin_recording();
            thread::sleep(Duration::from_secs(secs));
            pipeline.end_recording();
            if !wait_for_status(SessionStatus::Armed, Duration::from_secs(30)) {
                log::warn!("recording did not finalize in time");
            }
        }
        None => {
            log::info!(
                "live preview running; commands: record, stop, switch, status, quit"
            );
            let mut line = String::new();
            loop {
                while let Ok(event) = pipeline.source_events().try_recv() {
                    log::info!("camera: {event:?}");
                }

                line.clear();
                if std::io::stdin().read_line(&mut line)? == 0 {
                    break;
                }
                match line.trim() {
                    "record" => {
                        if pipeline.session_status() == SessionStatus::Idle {
                            pipeline.arm();
                            if !wait_for_status(SessionStatus::Armed, Duration::from_secs(15)) {
                                log::error!("recording session never armed");
                                continue;
                            }
                        }
                        pipeline.begin_recording();
                    }
                    "stop" => {
                        pipeline.end_recording();
                    }
                    "switch" => {
                        pipeline.switch_camera();
                    }
                    "status" => {
                        let size = pipeline
                            .latest_image()
                            .map(|image| format!("{}x{}", image.width, image.height))
                            .unwrap_or_else(|| "no frames yet".into());
                        log::info!(
                            "session {:?}, camera {:?}, frame {size}",
                            pipeline.session_status(),
                            pipeline.camera_position(),
                        );
                    }
                    "quit" | "q" => break,
                    "" => {}
                    other => log::warn!("unknown command {other:?}"),
                }
            }
        }
    }

    pipeline.stop();
    Ok(())
}

#[cfg(not(all(feature = "camera-nokhwa", feature = "encoder-gst")))]
fn run() -> Result<()> {
    anyhow::bail!("pose-camera was built without the camera-nokhwa and encoder-gst features")
}
