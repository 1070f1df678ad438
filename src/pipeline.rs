use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::{
    bridge,
    config::{PipelineConfig, format_elapsed},
    error::DeviceError,
    estimator::Estimator,
    overlay::OverlayRenderer,
    recording::{
        RecordingEvent, Recorder, SessionStatus,
        encoder::EncoderFactory,
    },
    scheduler::{InferenceScheduler, PoseSlot},
    source::{CameraBackend, FrameSource, SourceEvent},
    storage::StorageSink,
    types::{DevicePosition, Frame, Image, PixelFormat, PoseEstimationResult, StreamClock},
};

/// Live-updating UI binding surface: an image sink plus the two
/// recording scalars. Implementations must not block; they are called
/// from the delivery context.
pub trait DisplaySink: Send + Sync {
    fn publish_image(&self, image: &Image);
    fn set_recording(&self, recording: bool);
    fn set_elapsed(&self, label: &str);
}

/// Everything the per-frame path needs, behind one Arc so the capture
/// callback stays a thin closure.
struct Wiring {
    scheduler: InferenceScheduler,
    pose_slot: PoseSlot,
    latest_pose: Mutex<Option<PoseEstimationResult>>,
    overlay: OverlayRenderer,
    recorder: Recorder,
    recording_events: Receiver<RecordingEvent>,
    display: Arc<dyn DisplaySink>,
    encoder_format: PixelFormat,
    was_recording: AtomicBool,
}

impl Wiring {
    /// One pipeline tick, run on the delivery thread for every captured
    /// frame: submit to inference (drop-on-busy), render the overlay
    /// with the freshest available pose, publish, and only then feed the
    /// recording session. Recording problems never reach the display
    /// path.
    fn on_frame(&self, frame: &Frame) {
        self.scheduler.submit(frame);

        if let Some(update) = self.pose_slot.lock().take() {
            if let Some(timing) = update.timing {
                log::debug!(
                    "inference {:.1}ms (prep {:.1}ms, model {:.1}ms)",
                    timing.total.as_secs_f64() * 1000.0,
                    timing.preprocess.as_secs_f64() * 1000.0,
                    timing.inference.as_secs_f64() * 1000.0
                );
            }
            *self.latest_pose.lock() = update.result;
        }

        let image = match bridge::to_renderable(&frame.buffer) {
            Ok(image) => image,
            Err(err) => {
                log::warn!("dropping undisplayable frame: {err}");
                return;
            }
        };
        let rendered = {
            let pose = self.latest_pose.lock();
            self.overlay.render(&image, pose.as_ref())
        };
        self.display.publish_image(&rendered);

        self.drain_recording_events();

        let recording = self.recorder.is_recording();
        if recording {
            match bridge::to_native_buffer(&rendered, self.encoder_format) {
                Ok(native) => self.recorder.append_video(&native, frame.timestamp),
                Err(err) => log::warn!("dropping unencodable frame: {err}"),
            }
            self.display
                .set_elapsed(&format_elapsed(self.recorder.elapsed()));
        }
        if self.was_recording.swap(recording, Ordering::AcqRel) != recording {
            self.display.set_recording(recording);
        }
    }

    fn drain_recording_events(&self) {
        while let Ok(event) = self.recording_events.try_recv() {
            match event {
                RecordingEvent::Armed => log::info!("recording session armed"),
                RecordingEvent::Started => log::info!("recording started"),
                RecordingEvent::Stopped => log::info!("recording stopped, finalizing"),
                RecordingEvent::Finished(path) => {
                    log::info!("recording finished: {}", path.display())
                }
                RecordingEvent::SetupFailed(err) => {
                    log::error!("recording session setup failed: {err}")
                }
                RecordingEvent::FinishFailed(err) => {
                    log::error!("recording finalize failed: {err}")
                }
                RecordingEvent::StorageFailed { error, retained } => log::error!(
                    "recording kept at {} after storage failure: {error}",
                    retained.display()
                ),
                RecordingEvent::ForceEnded(err) => {
                    log::error!("recording force-ended: {err}")
                }
            }
        }
    }
}

/// Wires the frame source, inference scheduler, overlay renderer and
/// recording session together and owns their lifetimes.
pub struct Pipeline {
    source: Option<FrameSource>,
    source_events: Receiver<SourceEvent>,
    recorder: Recorder,
    latest_image: Arc<Mutex<Option<Image>>>,
    #[cfg(feature = "audio-cpal")]
    microphone: Option<crate::audio::MicrophoneCapture>,
}

impl Pipeline {
    pub fn start(
        config: PipelineConfig,
        backend: Box<dyn CameraBackend>,
        estimator: Box<dyn Estimator>,
        factory: Box<dyn EncoderFactory>,
        storage: Arc<dyn StorageSink>,
        display: Arc<dyn DisplaySink>,
    ) -> Result<Self, DeviceError> {
        let clock = StreamClock::new();

        // The callback needs the recorder, but the encoder wants the
        // camera's real resolution, which we only know once the source
        // is up. Frames delivered during this wiring window are dropped.
        let wiring: Arc<OnceLock<Arc<Wiring>>> = Arc::new(OnceLock::new());
        let callback_wiring = wiring.clone();
        let sink = Box::new(move |frame: Frame| {
            if let Some(wiring) = callback_wiring.get() {
                wiring.on_frame(&frame);
            }
        });

        let (source, source_events) = FrameSource::start(
            backend,
            config.camera_position,
            config.rotation,
            clock.clone(),
            sink,
        )?;
        let (width, height) = source.resolution();

        let mut encoder_config = config.encoder.clone();
        encoder_config.width = width;
        encoder_config.height = height;
        #[cfg(feature = "audio-cpal")]
        if config.capture_audio {
            if let Some((rate, channels)) = crate::audio::input_format() {
                encoder_config.audio_rate = rate;
                encoder_config.audio_channels = channels;
            }
        }
        let encoder_format = encoder_config.pixel_format;

        let (recorder, recording_events) = Recorder::new(factory, encoder_config, storage);

        #[cfg(feature = "audio-cpal")]
        let microphone = if config.capture_audio {
            let audio_recorder = recorder.clone();
            match crate::audio::MicrophoneCapture::start(
                clock.clone(),
                Box::new(move |samples, timestamp| {
                    audio_recorder.append_audio(samples, timestamp);
                }),
            ) {
                Ok(microphone) => Some(microphone),
                Err(err) => {
                    log::warn!("recording without audio: {err}");
                    None
                }
            }
        } else {
            None
        };

        let scheduler = InferenceScheduler::start(estimator, config.min_pose_score);
        let pose_slot = scheduler.latest_slot();
        let overlay = OverlayRenderer::new(config.min_pose_score);
        let latest_image = overlay.latest_handle();

        let assembled = Arc::new(Wiring {
            scheduler,
            pose_slot,
            latest_pose: Mutex::new(None),
            overlay,
            recorder: recorder.clone(),
            recording_events,
            display,
            encoder_format,
            was_recording: AtomicBool::new(false),
        });
        if wiring.set(assembled).is_err() {
            unreachable!("pipeline wiring installed twice");
        }

        Ok(Pipeline {
            source: Some(source),
            source_events,
            recorder,
            latest_image,
            #[cfg(feature = "audio-cpal")]
            microphone,
        })
    }

    pub fn arm(&self) -> bool {
        self.recorder.arm()
    }

    pub fn begin_recording(&self) -> bool {
        self.recorder.begin_recording()
    }

    pub fn end_recording(&self) -> bool {
        self.recorder.end_recording()
    }

    pub fn session_status(&self) -> SessionStatus {
        self.recorder.status()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn switch_camera(&self) -> bool {
        match &self.source {
            Some(source) => source.switch_device(),
            None => false,
        }
    }

    pub fn camera_position(&self) -> Option<DevicePosition> {
        self.source.as_ref().map(|s| s.position())
    }

    pub fn source_events(&self) -> &Receiver<SourceEvent> {
        &self.source_events
    }

    /// Most recent rendered image, for surfaces that poll.
    pub fn latest_image(&self) -> Option<Image> {
        self.latest_image.lock().clone()
    }

    /// Stop capture immediately. An in-flight inference finishes on its
    /// own; a recording in progress keeps finalizing in the background.
    pub fn stop(mut self) {
        if self.recorder.is_recording() {
            self.recorder.end_recording();
        }
        if let Some(source) = self.source.take() {
            source.stop();
        }
        #[cfg(feature = "audio-cpal")]
        if let Some(microphone) = self.microphone.take() {
            microphone.stop();
        }
    }
}
