use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;

use crate::{
    bridge,
    estimator::Estimator,
    types::{Frame, InferenceTiming, PoseEstimationResult},
};

/// Outcome of one inference pass. `result` is None when nothing was
/// detected: a low overall score, a conversion failure or a model error
/// all look the same downstream.
#[derive(Clone, Debug)]
pub struct PoseUpdate {
    pub result: Option<PoseEstimationResult>,
    pub timing: Option<InferenceTiming>,
}

pub type PoseSlot = Arc<Mutex<Option<PoseUpdate>>>;

/// Feeds frames to the estimator one at a time. A frame submitted while
/// another is in flight is dropped, never queued; the estimator is not
/// assumed reentrant and backlog would only add latency.
pub struct InferenceScheduler {
    in_flight: Arc<AtomicBool>,
    frame_tx: Option<Sender<Frame>>,
    slot: PoseSlot,
    handle: Option<thread::JoinHandle<()>>,
}

impl InferenceScheduler {
    pub fn start(mut estimator: Box<dyn Estimator>, min_score: f32) -> Self {
        let (frame_tx, frame_rx) = bounded::<Frame>(1);
        let in_flight = Arc::new(AtomicBool::new(false));
        let slot: PoseSlot = Arc::new(Mutex::new(None));

        let worker_flag = in_flight.clone();
        let worker_slot = slot.clone();
        let handle = thread::spawn(move || {
            for frame in frame_rx.iter() {
                let update = run_once(estimator.as_mut(), &frame, min_score);
                // Clear the flag before publishing so a frame arriving
                // right behind the result is not dropped spuriously.
                worker_flag.store(false, Ordering::Release);
                *worker_slot.lock() = Some(update);
            }
        });

        InferenceScheduler {
            in_flight,
            frame_tx: Some(frame_tx),
            slot,
            handle: Some(handle),
        }
    }

    /// Hand a frame to the worker. Returns false when the frame was
    /// dropped because an inference is already in flight.
    pub fn submit(&self, frame: &Frame) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let Some(tx) = &self.frame_tx else {
            self.in_flight.store(false, Ordering::Release);
            return false;
        };
        if tx.try_send(frame.clone()).is_err() {
            self.in_flight.store(false, Ordering::Release);
            return false;
        }
        true
    }

    pub fn latest_slot(&self) -> PoseSlot {
        self.slot.clone()
    }

    #[allow(dead_code)]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn shutdown(&mut self) {
        self.frame_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InferenceScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_once(estimator: &mut dyn Estimator, frame: &Frame, min_score: f32) -> PoseUpdate {
    let image = match bridge::to_renderable(&frame.buffer) {
        Ok(image) => image,
        Err(err) => {
            log::warn!("failed to convert frame for inference: {err}");
            return PoseUpdate {
                result: None,
                timing: None,
            };
        }
    };

    match estimator.estimate(&image) {
        Ok((result, timing)) => {
            let result = if result.score < min_score {
                log::debug!("pose below minimum score ({:.2}), cleared", result.score);
                None
            } else {
                Some(result)
            };
            PoseUpdate {
                result,
                timing: Some(timing),
            }
        }
        Err(err) => {
            log::warn!("pose inference failed: {err}");
            PoseUpdate {
                result: None,
                timing: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use crate::types::{KEYPOINT_ORDER, Keypoint, PixelBuffer, PixelFormat};
    use crossbeam_channel::{Receiver, unbounded};
    use std::time::Duration;

    fn frame(id: u8) -> Frame {
        Frame {
            buffer: PixelBuffer {
                data: vec![id, 0, 0, 255],
                width: 1,
                height: 1,
                format: PixelFormat::Rgba,
            },
            timestamp: Duration::from_millis(id as u64),
        }
    }

    fn pose(score: f32) -> PoseEstimationResult {
        PoseEstimationResult {
            keypoints: KEYPOINT_ORDER
                .iter()
                .map(|kind| Keypoint {
                    kind: *kind,
                    x: 0.5,
                    y: 0.5,
                    score,
                })
                .collect(),
            score,
        }
    }

    /// Estimator that records which frames it saw and blocks until the
    /// test releases it, so in-flight windows are deterministic.
    struct GatedEstimator {
        seen: Arc<Mutex<Vec<u8>>>,
        gate: Receiver<()>,
        score: f32,
        fail: bool,
    }

    impl Estimator for GatedEstimator {
        fn estimate(
            &mut self,
            image: &crate::types::Image,
        ) -> Result<(PoseEstimationResult, InferenceTiming), InferenceError> {
            self.seen.lock().push(image.rgba[0]);
            self.gate.recv().ok();
            if self.fail {
                return Err(InferenceError::Model("scripted failure".into()));
            }
            Ok((pose(self.score), InferenceTiming::default()))
        }
    }

    fn wait_for_update(slot: &PoseSlot) -> PoseUpdate {
        for _ in 0..500 {
            if let Some(update) = slot.lock().take() {
                return update;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("no pose update arrived");
    }

    #[test]
    fn colliding_frames_never_reach_the_estimator() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = unbounded();
        let scheduler = InferenceScheduler::start(
            Box::new(GatedEstimator {
                seen: seen.clone(),
                gate,
                score: 0.9,
                fail: false,
            }),
            0.2,
        );
        let slot = scheduler.latest_slot();

        assert!(scheduler.submit(&frame(1)));
        // Give the worker time to pick up frame 1 before bursting.
        for _ in 0..500 {
            if !seen.lock().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!scheduler.submit(&frame(2)));
        assert!(!scheduler.submit(&frame(3)));

        release.send(()).unwrap();
        let update = wait_for_update(&slot);
        assert!(update.result.is_some());

        assert!(scheduler.submit(&frame(4)));
        release.send(()).unwrap();
        wait_for_update(&slot);

        assert_eq!(*seen.lock(), vec![1, 4]);
        drop(scheduler);
    }

    #[test]
    fn low_score_results_are_cleared() {
        let (release, gate) = unbounded();
        let scheduler = InferenceScheduler::start(
            Box::new(GatedEstimator {
                seen: Arc::new(Mutex::new(Vec::new())),
                gate,
                score: 0.1,
                fail: false,
            }),
            0.2,
        );
        let slot = scheduler.latest_slot();

        assert!(scheduler.submit(&frame(1)));
        release.send(()).unwrap();
        let update = wait_for_update(&slot);
        assert!(update.result.is_none());
        assert!(update.timing.is_some());
        drop(scheduler);
    }

    #[test]
    fn estimator_failure_is_no_detection_and_not_fatal() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = unbounded();
        let scheduler = InferenceScheduler::start(
            Box::new(GatedEstimator {
                seen: seen.clone(),
                gate,
                score: 0.9,
                fail: true,
            }),
            0.2,
        );
        let slot = scheduler.latest_slot();

        assert!(scheduler.submit(&frame(1)));
        release.send(()).unwrap();
        assert!(wait_for_update(&slot).result.is_none());

        // The scheduler keeps accepting frames after a failure.
        assert!(scheduler.submit(&frame(2)));
        release.send(()).unwrap();
        wait_for_update(&slot);
        assert_eq!(*seen.lock(), vec![1, 2]);
        drop(scheduler);
    }

    #[test]
    fn conversion_failure_is_absorbed() {
        let (release, gate) = unbounded();
        drop(release);
        let scheduler = InferenceScheduler::start(
            Box::new(GatedEstimator {
                seen: Arc::new(Mutex::new(Vec::new())),
                gate,
                score: 0.9,
                fail: false,
            }),
            0.2,
        );
        let slot = scheduler.latest_slot();

        let bad = Frame {
            buffer: PixelBuffer {
                data: vec![0u8; 2],
                width: 4,
                height: 4,
                format: PixelFormat::Rgba,
            },
            timestamp: Duration::ZERO,
        };
        assert!(scheduler.submit(&bad));
        let update = wait_for_update(&slot);
        assert!(update.result.is_none());
        // In-flight was released, so new frames are accepted.
        assert!(scheduler.submit(&bad));
        drop(scheduler);
    }
}
