use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{config::EncoderConfig, error::EncoderError, types::PixelBuffer};

/// A video+audio encoder pair bound to one output container. Instances
/// are single-use: once `finish` runs the encoder is gone for good, which
/// is why the session constructs a fresh one per recording.
pub trait MediaEncoder: Send {
    /// Open the writing session. Called once, between construction and
    /// the first append.
    fn start(&mut self) -> Result<(), EncoderError>;

    /// Whether the video input can take another frame right now. Frames
    /// arriving while this is false are dropped by the session.
    fn video_ready(&self) -> bool;

    fn append_video(&mut self, buffer: &PixelBuffer, pts: Duration) -> Result<(), EncoderError>;

    /// Interleaved S16 samples sharing the video time base.
    fn append_audio(&mut self, samples: &[i16], pts: Duration) -> Result<(), EncoderError>;

    /// True once the encoder itself has gone bad, as opposed to a single
    /// rejected write.
    fn is_failed(&self) -> bool;

    fn output_path(&self) -> &Path;

    /// Flush everything to the output target and hand back its path.
    fn finish(self: Box<Self>) -> Result<PathBuf, EncoderError>;
}

pub trait EncoderFactory: Send + Sync {
    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn MediaEncoder>, EncoderError>;
}
