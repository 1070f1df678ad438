use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Pixel layouts the pipeline moves between. The first five are what
/// capture backends hand us; `Rgba`/`Bgra` are what the renderer and the
/// encoder input consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba,
    Bgra,
    Rgb,
    Bgr,
    Gray,
    Nv12,
    Yuyv,
    Mjpeg,
}

#[derive(Clone, Debug)]
pub struct PixelBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// A renderable RGBA image, the common currency of the overlay and the
/// display surface.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// One captured frame. The timestamp is elapsed time on the shared stream
/// clock, which is also the encoder's time base.
#[derive(Clone, Debug)]
pub struct Frame {
    pub buffer: PixelBuffer,
    pub timestamp: Duration,
}

/// Monotonic clock shared by the frame source, the audio capture and the
/// recording session so their timestamps live in one time base.
#[derive(Clone, Debug)]
pub struct StreamClock {
    origin: Arc<Instant>,
}

impl StreamClock {
    pub fn new() -> Self {
        StreamClock {
            origin: Arc::new(Instant::now()),
        }
    }

    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for StreamClock {
    fn default() -> Self {
        StreamClock::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevicePosition {
    Front,
    Back,
}

impl DevicePosition {
    pub fn opposite(&self) -> DevicePosition {
        match self {
            DevicePosition::Front => DevicePosition::Back,
            DevicePosition::Back => DevicePosition::Front,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DevicePosition::Front => "front",
            DevicePosition::Back => "back",
        }
    }
}

/// Rotation applied once at capture so downstream components never reason
/// about device orientation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rotation {
    None,
    Cw90,
    Cw180,
    Cw270,
}

pub const NUM_KEYPOINTS: usize = 17;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeypointKind {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

pub const KEYPOINT_ORDER: [KeypointKind; NUM_KEYPOINTS] = [
    KeypointKind::Nose,
    KeypointKind::LeftEye,
    KeypointKind::RightEye,
    KeypointKind::LeftEar,
    KeypointKind::RightEar,
    KeypointKind::LeftShoulder,
    KeypointKind::RightShoulder,
    KeypointKind::LeftElbow,
    KeypointKind::RightElbow,
    KeypointKind::LeftWrist,
    KeypointKind::RightWrist,
    KeypointKind::LeftHip,
    KeypointKind::RightHip,
    KeypointKind::LeftKnee,
    KeypointKind::RightKnee,
    KeypointKind::LeftAnkle,
    KeypointKind::RightAnkle,
];

impl KeypointKind {
    #[allow(dead_code)]
    pub fn display_name(&self) -> &'static str {
        match self {
            KeypointKind::Nose => "nose",
            KeypointKind::LeftEye => "left eye",
            KeypointKind::RightEye => "right eye",
            KeypointKind::LeftEar => "left ear",
            KeypointKind::RightEar => "right ear",
            KeypointKind::LeftShoulder => "left shoulder",
            KeypointKind::RightShoulder => "right shoulder",
            KeypointKind::LeftElbow => "left elbow",
            KeypointKind::RightElbow => "right elbow",
            KeypointKind::LeftWrist => "left wrist",
            KeypointKind::RightWrist => "right wrist",
            KeypointKind::LeftHip => "left hip",
            KeypointKind::RightHip => "right hip",
            KeypointKind::LeftKnee => "left knee",
            KeypointKind::RightKnee => "right knee",
            KeypointKind::LeftAnkle => "left ankle",
            KeypointKind::RightAnkle => "right ankle",
        }
    }
}

/// One detected keypoint. Coordinates are normalized to 0..1 of the frame;
/// the overlay scales them to pixels when drawing.
#[derive(Clone, Copy, Debug)]
pub struct Keypoint {
    pub kind: KeypointKind,
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

/// Result of one pose estimation pass over one frame. Immutable once
/// produced.
#[derive(Clone, Debug)]
pub struct PoseEstimationResult {
    pub keypoints: Vec<Keypoint>,
    pub score: f32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct InferenceTiming {
    pub preprocess: Duration,
    pub inference: Duration,
    pub total: Duration,
}
