use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::{error::DeviceError, types::StreamClock};

/// Receives interleaved S16 chunks stamped on the shared stream clock.
pub type AudioSink = Box<dyn Fn(&[i16], Duration) + Send>;

/// Reports the default input device's native format so the encoder can
/// be configured before capture starts.
pub fn input_format() -> Option<(u32, u16)> {
    let device = cpal::default_host().default_input_device()?;
    let config = device.default_input_config().ok()?;
    Some((config.sample_rate().0, config.channels()))
}

/// Microphone capture. The cpal stream is not Send, so it lives on its
/// own thread for its whole life and is stopped through a flag.
pub struct MicrophoneCapture {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MicrophoneCapture {
    pub fn start(clock: StreamClock, sink: AudioSink) -> Result<Self, DeviceError> {
        // Fail fast before spawning the capture thread.
        if cpal::default_host().default_input_device().is_none() {
            return Err(DeviceError::Open("no default input device".into()));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::spawn(move || {
            let host = cpal::default_host();
            let Some(device) = host.default_input_device() else {
                log::error!("input device disappeared before capture started");
                return;
            };
            let supported = match device.default_input_config() {
                Ok(config) => config,
                Err(err) => {
                    log::error!("failed to query input config: {err}");
                    return;
                }
            };

            let config = supported.config();
            let err_fn = |err| log::error!("audio stream error: {err}");

            let stream = match supported.sample_format() {
                cpal::SampleFormat::F32 => {
                    let stopped = stop_flag.clone();
                    let clock = clock.clone();
                    device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            if stopped.load(Ordering::Relaxed) {
                                return;
                            }
                            sink(&f32_to_i16(data), clock.now());
                        },
                        err_fn,
                        None,
                    )
                }
                cpal::SampleFormat::I16 => {
                    let stopped = stop_flag.clone();
                    let clock = clock.clone();
                    device.build_input_stream(
                        &config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            if stopped.load(Ordering::Relaxed) {
                                return;
                            }
                            sink(data, clock.now());
                        },
                        err_fn,
                        None,
                    )
                }
                cpal::SampleFormat::U16 => {
                    let stopped = stop_flag.clone();
                    let clock = clock.clone();
                    device.build_input_stream(
                        &config,
                        move |data: &[u16], _: &cpal::InputCallbackInfo| {
                            if stopped.load(Ordering::Relaxed) {
                                return;
                            }
                            sink(&u16_to_i16(data), clock.now());
                        },
                        err_fn,
                        None,
                    )
                }
                other => {
                    log::error!("unsupported input sample format {other:?}");
                    return;
                }
            };

            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    log::error!("failed to build input stream: {err}");
                    return;
                }
            };
            if let Err(err) = stream.play() {
                log::error!("failed to start input stream: {err}");
                return;
            }

            log::info!(
                "microphone capture started ({} Hz, {} ch)",
                config.sample_rate.0,
                config.channels
            );
            while !stop_flag.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(50));
            }
        });

        Ok(MicrophoneCapture {
            stop,
            handle: Some(handle),
        })
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

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

fn u16_to_i16(samples: &[u16]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (*s as i32 - 32_768) as i16)
        .collect()
}
