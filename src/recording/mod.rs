//! Recording session state machine.
//!
//! `Idle -> Warming -> Armed -> Recording -> Finishing`, then a brand-new
//! encoder is warmed so the session is armed again for the next take.
//! Arming runs a throwaway open/close pass over a freshly built encoder
//! to surface configuration errors before the user-visible recording;
//! a finalized encoder is never restarted.

pub mod encoder;
#[cfg(feature = "encoder-gst")]
pub mod gst;

use std::{
    fs,
    sync::Arc,
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::{
    config::EncoderConfig,
    error::EncoderError,
    storage::StorageSink,
    types::PixelBuffer,
};

use self::encoder::{EncoderFactory, MediaEncoder};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Warming,
    Armed,
    Recording,
    Finishing,
}

#[derive(Clone, Debug)]
pub enum RecordingEvent {
    /// Warm-up finished; the session can begin recording.
    Armed,
    Started,
    /// End requested; finalization is running in the background.
    Stopped,
    /// The finished file was handed to storage; path is its new home.
    Finished(std::path::PathBuf),
    /// Warm-up or session open failed; the session is idle again.
    SetupFailed(String),
    FinishFailed(String),
    /// Persistence failed; the temporary file is kept for recovery.
    StorageFailed {
        error: String,
        retained: std::path::PathBuf,
    },
    /// The encoder went bad mid-recording and the session ended itself.
    ForceEnded(String),
}

struct SessionState {
    status: SessionStatus,
    encoder: Option<Box<dyn MediaEncoder>>,
    /// First accepted frame timestamp; the zero point for everything
    /// written during this recording. Set exactly once.
    anchor: Option<Duration>,
    last_pts: Option<Duration>,
    elapsed: Duration,
}

struct RecorderInner {
    factory: Box<dyn EncoderFactory>,
    config: EncoderConfig,
    storage: Arc<dyn StorageSink>,
    state: Mutex<SessionState>,
    events: Sender<RecordingEvent>,
}

impl RecorderInner {
    fn send(&self, event: RecordingEvent) {
        if self.events.try_send(event).is_err() {
            log::warn!("recording event dropped: receiver backed up");
        }
    }
}

/// Owns the encoder pair and the session lifecycle. All output-file I/O
/// in the pipeline happens behind this type.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<RecorderInner>,
}

impl Recorder {
    pub fn new(
        factory: Box<dyn EncoderFactory>,
        config: EncoderConfig,
        storage: Arc<dyn StorageSink>,
    ) -> (Self, Receiver<RecordingEvent>) {
        let (events, events_rx) = bounded(64);
        let recorder = Recorder {
            inner: Arc::new(RecorderInner {
                factory,
                config,
                storage,
                state: Mutex::new(SessionState {
                    status: SessionStatus::Idle,
                    encoder: None,
                    anchor: None,
                    last_pts: None,
                    elapsed: Duration::ZERO,
                }),
                events,
            }),
        };
        (recorder, events_rx)
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status
    }

    pub fn is_recording(&self) -> bool {
        self.status() == SessionStatus::Recording
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.state.lock().elapsed
    }

    /// Begin warming an encoder. Returns false when the session is not
    /// idle. Completion is reported through `RecordingEvent::Armed` or
    /// `RecordingEvent::SetupFailed`.
    pub fn arm(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.status != SessionStatus::Idle {
                log::warn!("arm ignored in {:?}", state.status);
                return false;
            }
            state.status = SessionStatus::Warming;
        }

        let inner = self.inner.clone();
        thread::spawn(move || warm_and_arm(&inner));
        true
    }

    /// Open the real encoding session. No timestamps are committed until
    /// the first frame arrives, so a delay between this call and frame
    /// delivery cannot skew the recording.
    pub fn begin_recording(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.status != SessionStatus::Armed {
            log::warn!("begin_recording ignored in {:?}", state.status);
            return false;
        }
        let Some(encoder) = state.encoder.as_mut() else {
            state.status = SessionStatus::Idle;
            drop(state);
            self.inner
                .send(RecordingEvent::SetupFailed("armed without encoder".into()));
            return false;
        };

        match encoder.start() {
            Ok(()) => {
                state.status = SessionStatus::Recording;
                drop(state);
                self.inner.send(RecordingEvent::Started);
                true
            }
            Err(err) => {
                state.status = SessionStatus::Idle;
                state.encoder = None;
                drop(state);
                self.inner
                    .send(RecordingEvent::SetupFailed(err.to_string()));
                false
            }
        }
    }

    /// Append an overlay frame. Only accepted while recording and while
    /// the encoder's video input reports readiness; everything else is
    /// dropped in favor of freshness. Never blocks the caller beyond the
    /// encoder's own non-blocking push.
    pub fn append_video(&self, buffer: &PixelBuffer, timestamp: Duration) {
        let mut force_end: Option<String> = None;
        {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            if state.status != SessionStatus::Recording {
                return;
            }
            let config = &self.inner.config;
            if buffer.width != config.width || buffer.height != config.height {
                log::debug!(
                    "dropping {}x{} frame against a {}x{} encoder",
                    buffer.width,
                    buffer.height,
                    config.width,
                    config.height
                );
                return;
            }
            let Some(encoder) = state.encoder.as_mut() else {
                return;
            };
            if !encoder.video_ready() {
                log::trace!("video input not ready, frame dropped");
                return;
            }

            let anchor = state.anchor.unwrap_or(timestamp);
            let Some(pts) = timestamp.checked_sub(anchor) else {
                log::debug!("frame predates the session anchor, dropped");
                return;
            };
            if let Some(last) = state.last_pts {
                if pts <= last {
                    log::debug!("non-increasing frame timestamp, dropped");
                    return;
                }
            }

            match encoder.append_video(buffer, pts) {
                Ok(()) => {
                    state.anchor = Some(anchor);
                    state.last_pts = Some(pts);
                    state.elapsed = pts;
                }
                Err(err) => {
                    log::warn!("video append failed, frame dropped: {err}");
                    if encoder.is_failed() {
                        force_end = Some(err.to_string());
                    }
                }
            }
        }

        if let Some(reason) = force_end {
            self.finish_with(RecordingEvent::ForceEnded(reason));
        }
    }

    /// Append microphone samples. Shares the video anchor; audio arriving
    /// before the first accepted frame has no time base yet and is
    /// dropped.
    pub fn append_audio(&self, samples: &[i16], timestamp: Duration) {
        let mut state = self.inner.state.lock();
        if state.status != SessionStatus::Recording {
            return;
        }
        let Some(anchor) = state.anchor else {
            return;
        };
        let Some(pts) = timestamp.checked_sub(anchor) else {
            return;
        };
        let Some(encoder) = state.encoder.as_mut() else {
            return;
        };
        if let Err(err) = encoder.append_audio(samples, pts) {
            log::warn!("audio append failed, chunk dropped: {err}");
        }
    }

    /// Stop accepting media and flush asynchronously. Completion and the
    /// storage handoff are reported through events; afterwards a fresh
    /// session is warmed automatically.
    pub fn end_recording(&self) -> bool {
        self.finish_with(RecordingEvent::Stopped)
    }

    fn finish_with(&self, event: RecordingEvent) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.status != SessionStatus::Recording {
                log::warn!("end_recording ignored in {:?}", state.status);
                return false;
            }
            state.status = SessionStatus::Finishing;
        }
        self.inner.send(event);

        let inner = self.inner.clone();
        thread::spawn(move || finish_session(&inner));
        true
    }
}

fn warm_and_arm(inner: &Arc<RecorderInner>) {
    match warm_up(inner) {
        Ok(encoder) => {
            let mut state = inner.state.lock();
            state.status = SessionStatus::Armed;
            state.encoder = Some(encoder);
            state.anchor = None;
            state.last_pts = None;
            state.elapsed = Duration::ZERO;
            drop(state);
            inner.send(RecordingEvent::Armed);
        }
        Err(err) => {
            log::error!("encoder warm-up failed: {err}");
            inner.state.lock().status = SessionStatus::Idle;
            inner.send(RecordingEvent::SetupFailed(err.to_string()));
        }
    }
}

/// The warm-up pass: build an encoder, open a throwaway session, push a
/// single black primer frame so the whole encode path negotiates, then
/// finalize and discard the file. Configuration errors surface here
/// instead of mid-recording. The encoder handed back is a second, fresh
/// instance.
fn warm_up(inner: &Arc<RecorderInner>) -> Result<Box<dyn MediaEncoder>, EncoderError> {
    let config = &inner.config;
    let mut throwaway = inner.factory.create(config)?;
    throwaway.start()?;

    let primer = PixelBuffer {
        data: vec![0u8; config.width as usize * config.height as usize * 4],
        width: config.width,
        height: config.height,
        format: config.pixel_format,
    };
    throwaway
        .append_video(&primer, Duration::ZERO)
        .map_err(|err| EncoderError::Setup(err.to_string()))?;

    let path = throwaway.finish()?;
    if let Err(err) = fs::remove_file(&path) {
        log::debug!("could not remove warm-up file {}: {err}", path.display());
    }

    inner.factory.create(&inner.config)
}

fn finish_session(inner: &Arc<RecorderInner>) {
    let encoder = inner.state.lock().encoder.take();

    if let Some(encoder) = encoder {
        match encoder.finish() {
            Ok(path) => match inner.storage.persist(&path) {
                Ok(dest) => {
                    if let Err(err) = fs::remove_file(&path) {
                        log::debug!("could not remove temp file {}: {err}", path.display());
                    }
                    inner.send(RecordingEvent::Finished(dest));
                }
                Err(err) => {
                    log::error!("failed to persist recording: {err}");
                    inner.send(RecordingEvent::StorageFailed {
                        error: err.to_string(),
                        retained: path,
                    });
                }
            },
            Err(err) => {
                log::error!("failed to finalize recording: {err}");
                inner.send(RecordingEvent::FinishFailed(err.to_string()));
            }
        }
    }

    // Finalized encoders are not restartable; warm a new session so the
    // next recording starts from Armed.
    inner.state.lock().status = SessionStatus::Warming;
    warm_and_arm(inner);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::types::PixelFormat;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone, Debug, PartialEq)]
    enum Op {
        Start,
        Video(u128),
        Audio(u128, usize),
        Finish,
    }

    #[derive(Default)]
    struct Knobs {
        fail_creates: AtomicUsize,
        fail_start: AtomicBool,
        not_ready: AtomicBool,
        fail_appends: AtomicUsize,
        encoder_failed: AtomicBool,
        fail_finishes: AtomicUsize,
    }

    struct FakeEncoder {
        ops: Arc<Mutex<Vec<Op>>>,
        knobs: Arc<Knobs>,
        path: PathBuf,
    }

    impl MediaEncoder for FakeEncoder {
        fn start(&mut self) -> Result<(), EncoderError> {
            if self.knobs.fail_start.load(Ordering::SeqCst) {
                return Err(EncoderError::Setup("scripted start failure".into()));
            }
            self.ops.lock().push(Op::Start);
            Ok(())
        }

        fn video_ready(&self) -> bool {
            !self.knobs.not_ready.load(Ordering::SeqCst)
        }

        fn append_video(&mut self, _: &PixelBuffer, pts: Duration) -> Result<(), EncoderError> {
            let remaining = self.knobs.fail_appends.load(Ordering::SeqCst);
            if remaining > 0 {
                self.knobs.fail_appends.store(remaining - 1, Ordering::SeqCst);
                return Err(EncoderError::Write("scripted write failure".into()));
            }
            self.ops.lock().push(Op::Video(pts.as_millis()));
            Ok(())
        }

        fn append_audio(&mut self, samples: &[i16], pts: Duration) -> Result<(), EncoderError> {
            self.ops.lock().push(Op::Audio(pts.as_millis(), samples.len()));
            Ok(())
        }

        fn is_failed(&self) -> bool {
            self.knobs.encoder_failed.load(Ordering::SeqCst)
        }

        fn output_path(&self) -> &Path {
            &self.path
        }

        fn finish(self: Box<Self>) -> Result<PathBuf, EncoderError> {
            let remaining = self.knobs.fail_finishes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.knobs.fail_finishes.store(remaining - 1, Ordering::SeqCst);
                return Err(EncoderError::Finalize("scripted finish failure".into()));
            }
            self.ops.lock().push(Op::Finish);
            fs::write(&self.path, b"mp4").unwrap();
            Ok(self.path)
        }
    }

    struct FakeFactory {
        ops: Arc<Mutex<Vec<Op>>>,
        knobs: Arc<Knobs>,
        dir: PathBuf,
        created: AtomicUsize,
    }

    impl EncoderFactory for FakeFactory {
        fn create(&self, _: &EncoderConfig) -> Result<Box<dyn MediaEncoder>, EncoderError> {
            let remaining = self.knobs.fail_creates.load(Ordering::SeqCst);
            if remaining > 0 {
                self.knobs.fail_creates.store(remaining - 1, Ordering::SeqCst);
                return Err(EncoderError::Setup("scripted create failure".into()));
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeEncoder {
                ops: self.ops.clone(),
                knobs: self.knobs.clone(),
                path: self.dir.join(format!("session-{n}.mp4")),
            }))
        }
    }

    struct FakeStorage {
        persisted: Mutex<Vec<PathBuf>>,
        dir: PathBuf,
        fail: AtomicBool,
    }

    impl StorageSink for FakeStorage {
        fn persist(&self, file: &Path) -> Result<PathBuf, StorageError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StorageError::Unauthorized("scripted denial".into()));
            }
            let dest = self.dir.join(file.file_name().unwrap());
            fs::copy(file, &dest).unwrap();
            self.persisted.lock().push(dest.clone());
            Ok(dest)
        }
    }

    struct Rig {
        recorder: Recorder,
        events: Receiver<RecordingEvent>,
        ops: Arc<Mutex<Vec<Op>>>,
        knobs: Arc<Knobs>,
        storage: Arc<FakeStorage>,
        _scratch: tempfile::TempDir,
        _library: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let scratch = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        let ops = Arc::new(Mutex::new(Vec::new()));
        let knobs = Arc::new(Knobs::default());
        let storage = Arc::new(FakeStorage {
            persisted: Mutex::new(Vec::new()),
            dir: library.path().to_path_buf(),
            fail: AtomicBool::new(false),
        });
        let factory = FakeFactory {
            ops: ops.clone(),
            knobs: knobs.clone(),
            dir: scratch.path().to_path_buf(),
            created: AtomicUsize::new(0),
        };
        let config = EncoderConfig {
            width: 2,
            height: 2,
            scratch_dir: scratch.path().to_path_buf(),
            ..EncoderConfig::default()
        };
        let (recorder, events) = Recorder::new(Box::new(factory), config, storage.clone());
        Rig {
            recorder,
            events,
            ops,
            knobs,
            storage,
            _scratch: scratch,
            _library: library,
        }
    }

    fn frame_buffer() -> PixelBuffer {
        PixelBuffer {
            data: vec![0u8; 16],
            width: 2,
            height: 2,
            format: PixelFormat::Bgra,
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    /// Video PTS values appended after the most recent warm-up pass
    /// finalized, i.e. by the live session under test.
    fn session_video_pts(rig: &Rig) -> Vec<u128> {
        let ops = rig.ops.lock().clone();
        let cut = ops
            .iter()
            .rposition(|op| matches!(op, Op::Finish))
            .map(|i| i + 1)
            .unwrap_or(0);
        ops[cut..]
            .iter()
            .filter_map(|op| match op {
                Op::Video(pts) => Some(*pts),
                _ => None,
            })
            .collect()
    }

    fn wait_for(events: &Receiver<RecordingEvent>, pred: impl Fn(&RecordingEvent) -> bool) -> RecordingEvent {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(_) => continue,
            }
        }
        panic!("expected recording event never arrived");
    }

    fn arm_and_wait(rig: &Rig) {
        assert!(rig.recorder.arm());
        wait_for(&rig.events, |e| matches!(e, RecordingEvent::Armed));
        assert_eq!(rig.recorder.status(), SessionStatus::Armed);
    }

    #[test]
    fn arming_runs_a_warmup_pass_and_discards_its_file() {
        let rig = rig();
        arm_and_wait(&rig);

        // The throwaway session was opened, primed and finalized once.
        let ops = rig.ops.lock().clone();
        assert_eq!(ops, vec![Op::Start, Op::Video(0), Op::Finish]);
        // Its file is gone and storage never saw it.
        assert!(fs::read_dir(rig._scratch.path()).unwrap().next().is_none());
        assert!(rig.storage.persisted.lock().is_empty());
    }

    #[test]
    fn warmup_failure_resets_to_idle_and_is_retryable() {
        let rig = rig();
        rig.knobs.fail_creates.store(1, Ordering::SeqCst);

        assert!(rig.recorder.arm());
        wait_for(&rig.events, |e| matches!(e, RecordingEvent::SetupFailed(_)));
        assert_eq!(rig.recorder.status(), SessionStatus::Idle);
        assert!(rig.storage.persisted.lock().is_empty());

        // The failure consumed the scripted error; a retry arms cleanly.
        arm_and_wait(&rig);
    }

    #[test]
    fn first_frame_anchors_zero_and_deltas_follow() {
        let rig = rig();
        arm_and_wait(&rig);
        assert!(rig.recorder.begin_recording());
        assert!(rig.recorder.is_recording());

        let buffer = frame_buffer();
        rig.recorder.append_video(&buffer, ms(1000));
        rig.recorder.append_video(&buffer, ms(1033));
        rig.recorder.append_video(&buffer, ms(1066));

        assert_eq!(session_video_pts(&rig), vec![0, 33, 66]);
        assert_eq!(rig.recorder.elapsed(), ms(66));
    }

    #[test]
    fn ending_persists_and_rearms_a_fresh_session() {
        let rig = rig();
        arm_and_wait(&rig);
        assert!(rig.recorder.begin_recording());
        rig.recorder.append_video(&frame_buffer(), ms(1000));
        assert!(rig.recorder.end_recording());

        let finished = wait_for(&rig.events, |e| matches!(e, RecordingEvent::Finished(_)));
        let RecordingEvent::Finished(dest) = finished else {
            unreachable!()
        };
        assert!(dest.exists());
        assert_eq!(rig.storage.persisted.lock().len(), 1);

        // A new session warms automatically; the old temp file is gone.
        wait_for(&rig.events, |e| matches!(e, RecordingEvent::Armed));
        assert_eq!(rig.recorder.status(), SessionStatus::Armed);
        assert!(fs::read_dir(rig._scratch.path()).unwrap().next().is_none());
        assert_eq!(rig.recorder.elapsed(), Duration::ZERO);
    }

    #[test]
    fn non_increasing_timestamps_are_dropped() {
        let rig = rig();
        arm_and_wait(&rig);
        assert!(rig.recorder.begin_recording());

        let buffer = frame_buffer();
        rig.recorder.append_video(&buffer, ms(2000));
        rig.recorder.append_video(&buffer, ms(1990));
        rig.recorder.append_video(&buffer, ms(2000));
        rig.recorder.append_video(&buffer, ms(2010));

        assert_eq!(session_video_pts(&rig), vec![0, 10]);
    }

    #[test]
    fn frames_while_not_ready_are_dropped_without_anchoring() {
        let rig = rig();
        arm_and_wait(&rig);
        assert!(rig.recorder.begin_recording());

        let buffer = frame_buffer();
        rig.knobs.not_ready.store(true, Ordering::SeqCst);
        rig.recorder.append_video(&buffer, ms(500));
        rig.knobs.not_ready.store(false, Ordering::SeqCst);
        rig.recorder.append_video(&buffer, ms(800));

        // The dropped frame did not become the anchor.
        assert_eq!(session_video_pts(&rig), vec![0]);
    }

    #[test]
    fn mismatched_frame_dimensions_are_dropped() {
        let rig = rig();
        arm_and_wait(&rig);
        assert!(rig.recorder.begin_recording());

        let wrong = PixelBuffer {
            data: vec![0u8; 4 * 4 * 4],
            width: 4,
            height: 4,
            format: PixelFormat::Bgra,
        };
        rig.recorder.append_video(&wrong, ms(100));
        assert!(session_video_pts(&rig).is_empty());
    }

    #[test]
    fn audio_before_the_anchor_is_dropped() {
        let rig = rig();
        arm_and_wait(&rig);
        assert!(rig.recorder.begin_recording());

        rig.recorder.append_audio(&[0i16; 32], ms(900));
        rig.recorder.append_video(&frame_buffer(), ms(1000));
        rig.recorder.append_audio(&[0i16; 32], ms(1050));

        let audio: Vec<Op> = rig
            .ops
            .lock()
            .iter()
            .filter(|op| matches!(op, Op::Audio(..)))
            .cloned()
            .collect();
        assert_eq!(audio, vec![Op::Audio(50, 32)]);
    }

    #[test]
    fn appends_outside_recording_are_ignored() {
        let rig = rig();
        rig.recorder.append_video(&frame_buffer(), ms(100));
        arm_and_wait(&rig);
        rig.recorder.append_video(&frame_buffer(), ms(200));
        assert!(session_video_pts(&rig).is_empty());
    }

    #[test]
    fn write_failures_drop_the_frame_but_keep_recording() {
        let rig = rig();
        arm_and_wait(&rig);
        assert!(rig.recorder.begin_recording());

        let buffer = frame_buffer();
        rig.knobs.fail_appends.store(1, Ordering::SeqCst);
        rig.recorder.append_video(&buffer, ms(1000));
        assert!(rig.recorder.is_recording());

        rig.recorder.append_video(&buffer, ms(1100));
        assert_eq!(session_video_pts(&rig), vec![0]);
    }

    #[test]
    fn a_failed_encoder_force_ends_the_session() {
        let rig = rig();
        arm_and_wait(&rig);
        assert!(rig.recorder.begin_recording());

        rig.knobs.fail_appends.store(1, Ordering::SeqCst);
        rig.knobs.encoder_failed.store(true, Ordering::SeqCst);
        rig.recorder.append_video(&frame_buffer(), ms(1000));

        wait_for(&rig.events, |e| matches!(e, RecordingEvent::ForceEnded(_)));
        // Finalize of the broken encoder is scripted to still succeed
        // here; either way the session must recover to a usable state.
        wait_for(&rig.events, |e| matches!(e, RecordingEvent::Armed));
        assert_eq!(rig.recorder.status(), SessionStatus::Armed);
    }

    #[test]
    fn storage_failure_retains_the_temp_file() {
        let rig = rig();
        arm_and_wait(&rig);
        assert!(rig.recorder.begin_recording());
        rig.recorder.append_video(&frame_buffer(), ms(1000));

        rig.storage.fail.store(true, Ordering::SeqCst);
        assert!(rig.recorder.end_recording());

        let event = wait_for(&rig.events, |e| matches!(e, RecordingEvent::StorageFailed { .. }));
        let RecordingEvent::StorageFailed { retained, .. } = event else {
            unreachable!()
        };
        assert!(retained.exists());
        assert!(rig.storage.persisted.lock().is_empty());

        // Future recordings still work.
        wait_for(&rig.events, |e| matches!(e, RecordingEvent::Armed));
    }

    #[test]
    fn finalize_failure_still_rearms() {
        let rig = rig();
        arm_and_wait(&rig);
        assert!(rig.recorder.begin_recording());
        rig.recorder.append_video(&frame_buffer(), ms(1000));

        rig.knobs.fail_finishes.store(1, Ordering::SeqCst);
        assert!(rig.recorder.end_recording());
        wait_for(&rig.events, |e| matches!(e, RecordingEvent::FinishFailed(_)));

        // The scripted failure was consumed, so the automatic re-warm
        // finalizes its throwaway session cleanly.
        wait_for(&rig.events, |e| matches!(e, RecordingEvent::Armed));
        assert_eq!(rig.recorder.status(), SessionStatus::Armed);
    }

    #[test]
    fn session_open_failure_invalidates_the_attempt() {
        let rig = rig();
        arm_and_wait(&rig);

        rig.knobs.fail_start.store(true, Ordering::SeqCst);
        assert!(!rig.recorder.begin_recording());
        wait_for(&rig.events, |e| matches!(e, RecordingEvent::SetupFailed(_)));
        assert_eq!(rig.recorder.status(), SessionStatus::Idle);

        // Re-arming works once the underlying problem clears.
        rig.knobs.fail_start.store(false, Ordering::SeqCst);
        arm_and_wait(&rig);
        assert!(rig.recorder.begin_recording());
    }

    #[test]
    fn ending_twice_is_rejected() {
        let rig = rig();
        arm_and_wait(&rig);
        assert!(rig.recorder.begin_recording());
        assert!(rig.recorder.end_recording());
        assert!(!rig.recorder.end_recording());
    }
}
