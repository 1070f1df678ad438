use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::{
    bridge,
    error::DeviceError,
    types::{DevicePosition, Frame, PixelBuffer, PixelFormat, Rotation, StreamClock},
};

// Consecutive read failures before the source reports itself degraded.
// The loop keeps retrying either way; the event is for the UI layer.
const READ_FAILURE_REPORT_THRESHOLD: u32 = 30;

#[derive(Clone, Debug)]
pub struct CameraDescriptor {
    pub id: String,
    pub label: String,
    pub position: DevicePosition,
}

/// One bound capture device. Lives and dies on the capture thread;
/// `next_frame` blocks until the device produces one.
pub trait CameraDevice {
    fn descriptor(&self) -> &CameraDescriptor;
    fn resolution(&self) -> (u32, u32);
    fn next_frame(&mut self) -> Result<PixelBuffer, DeviceError>;
}

/// Device registry: enumerate what exists, bind one. Two operations are
/// all the hot-switch path needs.
pub trait CameraBackend: Send {
    fn enumerate(&self) -> Result<Vec<CameraDescriptor>, DeviceError>;
    fn open(&self, descriptor: &CameraDescriptor) -> Result<Box<dyn CameraDevice>, DeviceError>;
}

#[derive(Clone, Debug)]
pub enum SourceEvent {
    DeviceSwitched(CameraDescriptor),
    /// The previous device is still active.
    SwitchFailed(String),
    /// The bound device keeps failing reads; delivery continues when it
    /// recovers.
    ReadDegraded(String),
}

pub type FrameSink = Box<dyn FnMut(Frame) + Send>;

enum Control {
    Switch,
}

/// Owns the capture thread. Frames are pushed into the registered sink;
/// device switching happens between frames on the same thread, which
/// bounds the gap to one reconfiguration and serializes switches for
/// free.
pub struct FrameSource {
    stop: Arc<AtomicBool>,
    ctrl_tx: Sender<Control>,
    position: Arc<Mutex<DevicePosition>>,
    resolution: (u32, u32),
    handle: Option<thread::JoinHandle<()>>,
}

impl FrameSource {
    pub fn start(
        backend: Box<dyn CameraBackend>,
        position: DevicePosition,
        rotation: Rotation,
        clock: StreamClock,
        mut sink: FrameSink,
    ) -> Result<(Self, Receiver<SourceEvent>), DeviceError> {
        let devices = backend.enumerate()?;
        let descriptor = pick_device(&devices, position)?.clone();

        // Fail fast before spawning, so permission problems surface to
        // the caller instead of dying silently on the capture thread.
        // The probe device is dropped here; capture devices are only
        // ever driven by the thread that opened them.
        let raw_resolution = {
            let probe = backend.open(&descriptor)?;
            probe.resolution()
        };
        let resolution = match rotation {
            Rotation::Cw90 | Rotation::Cw270 => (raw_resolution.1, raw_resolution.0),
            _ => raw_resolution,
        };

        let stop = Arc::new(AtomicBool::new(false));
        let (ctrl_tx, ctrl_rx) = bounded(1);
        let (events_tx, events_rx) = bounded(16);
        let current_position = Arc::new(Mutex::new(descriptor.position));

        let stop_flag = stop.clone();
        let shared_position = current_position.clone();
        let handle = thread::spawn(move || {
            let mut device = match backend.open(&descriptor) {
                Ok(device) => device,
                Err(err) => {
                    log::error!("failed to open camera: {err}");
                    return;
                }
            };

            let mut consecutive_failures: u32 = 0;
            while !stop_flag.load(Ordering::Relaxed) {
                match ctrl_rx.try_recv() {
                    Ok(Control::Switch) => handle_switch(
                        backend.as_ref(),
                        &mut device,
                        &shared_position,
                        &events_tx,
                    ),
                    Err(crossbeam_channel::TryRecvError::Empty) => {}
                    Err(crossbeam_channel::TryRecvError::Disconnected) => break,
                }

                let native = match device.next_frame() {
                    Ok(buffer) => {
                        consecutive_failures = 0;
                        buffer
                    }
                    Err(err) => {
                        log::warn!("camera frame read failed: {err}");
                        consecutive_failures += 1;
                        if consecutive_failures == READ_FAILURE_REPORT_THRESHOLD {
                            let _ = events_tx.try_send(SourceEvent::ReadDegraded(err.to_string()));
                        }
                        continue;
                    }
                };

                let image = match bridge::to_renderable(&native) {
                    Ok(image) => image,
                    Err(err) => {
                        log::warn!("failed to decode camera frame: {err}");
                        continue;
                    }
                };
                let image = bridge::rotate_upright(image, rotation);

                let frame = Frame {
                    buffer: PixelBuffer {
                        data: image.rgba,
                        width: image.width,
                        height: image.height,
                        format: PixelFormat::Rgba,
                    },
                    timestamp: clock.now(),
                };
                sink(frame);
            }
        });

        Ok((
            FrameSource {
                stop,
                ctrl_tx,
                position: current_position,
                resolution,
                handle: Some(handle),
            },
            events_rx,
        ))
    }

    /// Delivered frame size after orientation correction.
    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    pub fn position(&self) -> DevicePosition {
        *self.position.lock()
    }

    /// Request a switch to the opposite camera. Returns false when a
    /// switch is already pending; the outcome arrives as a SourceEvent.
    pub fn switch_device(&self) -> bool {
        self.ctrl_tx.try_send(Control::Switch).is_ok()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn handle_switch(
    backend: &dyn CameraBackend,
    device: &mut Box<dyn CameraDevice>,
    shared_position: &Arc<Mutex<DevicePosition>>,
    events: &Sender<SourceEvent>,
) {
    let target = device.descriptor().position.opposite();
    let result = backend
        .enumerate()
        .and_then(|devices| match find_by_position(&devices, target) {
            Some(descriptor) => backend.open(descriptor),
            None => Err(DeviceError::NotFound(target)),
        });

    match result {
        Ok(new_device) => {
            log::info!(
                "switched camera to {} ({})",
                new_device.descriptor().label,
                target.label()
            );
            *device = new_device;
            *shared_position.lock() = target;
            let _ = events.try_send(SourceEvent::DeviceSwitched(device.descriptor().clone()));
        }
        Err(err) => {
            log::warn!("camera switch failed, keeping current device: {err}");
            let _ = events.try_send(SourceEvent::SwitchFailed(err.to_string()));
        }
    }
}

pub fn find_by_position(
    devices: &[CameraDescriptor],
    position: DevicePosition,
) -> Option<&CameraDescriptor> {
    devices.iter().find(|d| d.position == position)
}

fn pick_device(
    devices: &[CameraDescriptor],
    position: DevicePosition,
) -> Result<&CameraDescriptor, DeviceError> {
    if devices.is_empty() {
        return Err(DeviceError::NotFound(position));
    }
    match find_by_position(devices, position) {
        Some(descriptor) => Ok(descriptor),
        None => {
            let fallback = &devices[0];
            log::warn!(
                "no {} camera found, using {}",
                position.label(),
                fallback.label
            );
            Ok(fallback)
        }
    }
}

/// Consumer backends rarely expose facing metadata, so position comes
/// from label keywords with an index-parity fallback.
pub fn infer_position(label: &str, index: usize) -> DevicePosition {
    let lower = label.to_lowercase();
    if ["front", "facetime", "integrated", "user"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return DevicePosition::Front;
    }
    if ["back", "rear", "environment", "world"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return DevicePosition::Back;
    }
    if index == 0 {
        DevicePosition::Front
    } else {
        DevicePosition::Back
    }
}

#[cfg(feature = "camera-nokhwa")]
pub use nokhwa_backend::NokhwaBackend;

#[cfg(feature = "camera-nokhwa")]
mod nokhwa_backend {
    use nokhwa::{
        Camera,
        pixel_format::RgbFormat,
        query,
        utils::{ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
    };

    use super::*;

    // Prefer pixel formats that are widely supported; some built-in
    // cameras reject YUYV even though the backend reports it.
    const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
        FrameFormat::RAWRGB,
        FrameFormat::RAWBGR,
        FrameFormat::GRAY,
        FrameFormat::YUYV,
        FrameFormat::NV12,
        FrameFormat::MJPEG,
    ];

    fn requested_formats() -> [RequestedFormat<'static>; 4] {
        [
            RequestedFormat::with_formats(
                RequestedFormatType::AbsoluteHighestFrameRate,
                PREFERRED_PIXEL_FORMATS,
            ),
            RequestedFormat::with_formats(
                RequestedFormatType::AbsoluteHighestResolution,
                PREFERRED_PIXEL_FORMATS,
            ),
            // Fall back to anything decodable, preferring higher FPS to
            // avoid very low default rates some drivers pick.
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
        ]
    }

    pub struct NokhwaBackend;

    struct NokhwaDevice {
        camera: Camera,
        descriptor: CameraDescriptor,
    }

    impl CameraDevice for NokhwaDevice {
        fn descriptor(&self) -> &CameraDescriptor {
            &self.descriptor
        }

        fn resolution(&self) -> (u32, u32) {
            let resolution = self.camera.resolution();
            (resolution.width_x, resolution.height_y)
        }

        fn next_frame(&mut self) -> Result<PixelBuffer, DeviceError> {
            let frame = self
                .camera
                .frame()
                .map_err(|err| DeviceError::Read(err.to_string()))?;
            Ok(bridge::from_camera_frame(&frame))
        }
    }

    impl CameraBackend for NokhwaBackend {
        fn enumerate(&self) -> Result<Vec<CameraDescriptor>, DeviceError> {
            let cameras =
                query(ApiBackend::Auto).map_err(|err| classify_open_error(&err.to_string()))?;
            Ok(cameras
                .into_iter()
                .enumerate()
                .map(|(index, info)| {
                    let id = match info.index() {
                        CameraIndex::Index(n) => n.to_string(),
                        CameraIndex::String(s) => s.clone(),
                    };
                    let label = info.human_name();
                    let position = infer_position(&label, index);
                    CameraDescriptor {
                        id,
                        label,
                        position,
                    }
                })
                .collect())
        }

        fn open(&self, descriptor: &CameraDescriptor) -> Result<Box<dyn CameraDevice>, DeviceError> {
            let index = match descriptor.id.parse::<u32>() {
                Ok(n) => CameraIndex::Index(n),
                Err(_) => CameraIndex::String(descriptor.id.clone()),
            };

            let mut last_err: Option<DeviceError> = None;
            for requested in requested_formats() {
                match Camera::new(index.clone(), requested) {
                    Ok(mut camera) => match camera.open_stream() {
                        Ok(()) => {
                            return Ok(Box::new(NokhwaDevice {
                                camera,
                                descriptor: descriptor.clone(),
                            }));
                        }
                        Err(err) => last_err = Some(classify_open_error(&err.to_string())),
                    },
                    Err(err) => last_err = Some(classify_open_error(&err.to_string())),
                }
            }

            Err(last_err.unwrap_or_else(|| {
                DeviceError::Open("failed to open camera with any supported format".into())
            }))
        }
    }
}

pub fn classify_open_error(message: &str) -> DeviceError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        DeviceError::PermissionDenied(message.to_string())
    } else {
        DeviceError::Open(message.to_string())
    }
}
