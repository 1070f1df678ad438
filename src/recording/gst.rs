use std::{
    cell::Cell,
    path::{Path, PathBuf},
    time::Duration,
};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use uuid::Uuid;

use crate::{
    config::EncoderConfig,
    error::EncoderError,
    types::{PixelBuffer, PixelFormat},
};

use super::encoder::{EncoderFactory, MediaEncoder};

// Backpressure window on the raw video appsrc; roughly four BGRA frames
// at 1080p. When the queue is fuller than this the session drops frames
// instead of letting them pile up.
const VIDEO_QUEUE_BYTES: u64 = 4 * 1920 * 1080 * 4;

pub struct GstEncoderFactory;

impl EncoderFactory for GstEncoderFactory {
    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn MediaEncoder>, EncoderError> {
        Ok(Box::new(GstEncoder::new(config)?))
    }
}

/// H.264 + stereo AAC MP4 writer:
/// appsrc ! videoconvert ! x264enc ! h264parse ! mp4mux ! filesink
/// with a second appsrc ! audioconvert ! audioresample ! aac branch into
/// the muxer. Presentation times come from the buffers we push, not from
/// a fixed frame rate.
pub struct GstEncoder {
    pipeline: gst::Pipeline,
    video_src: gst_app::AppSrc,
    audio_src: gst_app::AppSrc,
    output_path: PathBuf,
    pixel_format: PixelFormat,
    frame_len: usize,
    audio_rate: u32,
    audio_channels: u16,
    started: bool,
    failed: Cell<bool>,
}

impl GstEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self, EncoderError> {
        gst::init().map_err(|err| EncoderError::Setup(format!("gstreamer init failed: {err}")))?;

        if config.width == 0 || config.height == 0 {
            return Err(EncoderError::Setup("zero encoder dimensions".into()));
        }

        let output_path = config
            .scratch_dir
            .join(format!("pose-camera-{}.mp4", Uuid::new_v4()));

        let pipeline = gst::Pipeline::new();

        let video_caps = gst::Caps::builder("video/x-raw")
            .field("format", format_name(config.pixel_format)?)
            .field("width", config.width as i32)
            .field("height", config.height as i32)
            // Variable rate; every buffer carries its own PTS.
            .field("framerate", gst::Fraction::new(0, 1))
            .build();
        let video_src = gst_app::AppSrc::builder()
            .name("video-src")
            .caps(&video_caps)
            .format(gst::Format::Time)
            .is_live(true)
            .build();
        video_src.set_max_bytes(VIDEO_QUEUE_BYTES);

        let videoconvert = make_element("videoconvert")?;
        let x264enc = make_element("x264enc")?;
        x264enc.set_property("bitrate", config.video_bitrate_kbps);
        x264enc.set_property("key-int-max", config.fps_hint.max(1) * 2);
        x264enc.set_property_from_str("tune", "zerolatency");
        x264enc.set_property_from_str("speed-preset", "veryfast");
        let h264parse = make_element("h264parse")?;

        let mp4mux = make_element("mp4mux")?;
        mp4mux.set_property("faststart", true);
        let filesink = make_element("filesink")?;
        filesink.set_property("location", output_path.to_string_lossy().to_string());
        filesink.set_property("async", false);

        let audio_caps = gst::Caps::builder("audio/x-raw")
            .field("format", "S16LE")
            .field("rate", config.audio_rate as i32)
            .field("channels", config.audio_channels as i32)
            .field("layout", "interleaved")
            .build();
        let audio_src = gst_app::AppSrc::builder()
            .name("audio-src")
            .caps(&audio_caps)
            .format(gst::Format::Time)
            .is_live(true)
            .build();

        let audioconvert = make_element("audioconvert")?;
        let audioresample = make_element("audioresample")?;
        // The container contract is stereo AAC at 44.1 kHz regardless of
        // what the microphone delivers.
        let contract_caps = gst::Caps::builder("audio/x-raw")
            .field("rate", 44_100i32)
            .field("channels", 2i32)
            .build();
        let audio_capsfilter = make_element("capsfilter")?;
        audio_capsfilter.set_property("caps", contract_caps);
        let aacenc = make_first_available(&["avenc_aac", "voaacenc", "fdkaacenc"])?;
        let aacparse = make_element("aacparse")?;

        pipeline
            .add_many([
                video_src.upcast_ref(),
                &videoconvert,
                &x264enc,
                &h264parse,
                &mp4mux,
                &filesink,
                audio_src.upcast_ref(),
                &audioconvert,
                &audioresample,
                &audio_capsfilter,
                &aacenc,
                &aacparse,
            ])
            .map_err(|err| EncoderError::Setup(format!("failed to add elements: {err}")))?;

        gst::Element::link_many([
            video_src.upcast_ref(),
            &videoconvert,
            &x264enc,
            &h264parse,
        ])
        .map_err(|err| EncoderError::Setup(format!("failed to link video branch: {err}")))?;
        h264parse
            .link(&mp4mux)
            .map_err(|err| EncoderError::Setup(format!("failed to link video to muxer: {err}")))?;

        gst::Element::link_many([
            audio_src.upcast_ref(),
            &audioconvert,
            &audioresample,
            &audio_capsfilter,
            &aacenc,
            &aacparse,
        ])
        .map_err(|err| EncoderError::Setup(format!("failed to link audio branch: {err}")))?;
        aacparse
            .link(&mp4mux)
            .map_err(|err| EncoderError::Setup(format!("failed to link audio to muxer: {err}")))?;

        mp4mux
            .link(&filesink)
            .map_err(|err| EncoderError::Setup(format!("failed to link muxer to sink: {err}")))?;

        Ok(GstEncoder {
            pipeline,
            video_src,
            audio_src,
            output_path,
            pixel_format: config.pixel_format,
            frame_len: config.width as usize * config.height as usize * 4,
            audio_rate: config.audio_rate,
            audio_channels: config.audio_channels,
            started: false,
            failed: Cell::new(false),
        })
    }

    fn poll_bus(&self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = msg.view() {
                log::error!("encoder pipeline error: {} ({:?})", err.error(), err.debug());
                self.failed.set(true);
            }
        }
    }
}

impl MediaEncoder for GstEncoder {
    fn start(&mut self) -> Result<(), EncoderError> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|err| EncoderError::Setup(format!("failed to start pipeline: {err}")))?;
        self.started = true;
        Ok(())
    }

    fn video_ready(&self) -> bool {
        if !self.started || self.failed.get() {
            return false;
        }
        let queued = self.video_src.property::<u64>("current-level-bytes");
        let limit = self.video_src.property::<u64>("max-bytes");
        queued < limit
    }

    fn append_video(&mut self, buffer: &PixelBuffer, pts: Duration) -> Result<(), EncoderError> {
        if buffer.format != self.pixel_format || buffer.data.len() < self.frame_len {
            return Err(EncoderError::Write(format!(
                "frame does not match encoder input: {:?} {} bytes",
                buffer.format,
                buffer.data.len()
            )));
        }

        let mut gst_buffer = gst::Buffer::from_slice(buffer.data.clone());
        {
            let buffer_ref = gst_buffer.get_mut().unwrap();
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts.as_nanos() as u64));
        }

        self.video_src
            .push_buffer(gst_buffer)
            .map_err(|err| EncoderError::Write(format!("video push rejected: {err:?}")))?;
        self.poll_bus();
        Ok(())
    }

    fn append_audio(&mut self, samples: &[i16], pts: Duration) -> Result<(), EncoderError> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }

        let sample_frames = samples.len() as u64 / self.audio_channels.max(1) as u64;
        let duration_ns = sample_frames * 1_000_000_000 / self.audio_rate.max(1) as u64;

        let mut gst_buffer = gst::Buffer::from_slice(bytes);
        {
            let buffer_ref = gst_buffer.get_mut().unwrap();
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts.as_nanos() as u64));
            buffer_ref.set_duration(gst::ClockTime::from_nseconds(duration_ns));
        }

        self.audio_src
            .push_buffer(gst_buffer)
            .map_err(|err| EncoderError::Write(format!("audio push rejected: {err:?}")))?;
        Ok(())
    }

    fn is_failed(&self) -> bool {
        self.poll_bus();
        self.failed.get()
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn finish(self: Box<Self>) -> Result<PathBuf, EncoderError> {
        if let Err(err) = self.video_src.end_of_stream() {
            log::warn!("video EOS rejected: {err:?}");
        }
        if let Err(err) = self.audio_src.end_of_stream() {
            log::warn!("audio EOS rejected: {err:?}");
        }

        let mut pipeline_error: Option<String> = None;
        if let Some(bus) = self.pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(10)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => break,
                    gst::MessageView::Error(err) => {
                        pipeline_error =
                            Some(format!("{} ({:?})", err.error(), err.debug()));
                        break;
                    }
                    _ => {}
                }
            }
        }

        let _ = self.pipeline.set_state(gst::State::Null);

        match pipeline_error {
            Some(err) => Err(EncoderError::Finalize(err)),
            None => Ok(self.output_path.clone()),
        }
    }
}

impl Drop for GstEncoder {
    fn drop(&mut self) {
        // Covers error paths where finish() never ran.
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn make_element(name: &str) -> Result<gst::Element, EncoderError> {
    gst::ElementFactory::make(name)
        .build()
        .map_err(|err| EncoderError::Setup(format!("failed to create {name}: {err}")))
}

fn make_first_available(names: &[&str]) -> Result<gst::Element, EncoderError> {
    for name in names {
        if let Ok(element) = gst::ElementFactory::make(name).build() {
            return Ok(element);
        }
    }
    Err(EncoderError::Setup(format!(
        "no AAC encoder available (tried {names:?})"
    )))
}

fn format_name(format: PixelFormat) -> Result<&'static str, EncoderError> {
    match format {
        PixelFormat::Bgra => Ok("BGRA"),
        PixelFormat::Rgba => Ok("RGBA"),
        other => Err(EncoderError::Setup(format!(
            "{other:?} is not an encoder input format"
        ))),
    }
}
