use std::{path::Path, time::Instant};

use fast_image_resize as fir;
use ndarray::Array4;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use rayon::prelude::*;

use crate::{
    error::InferenceError,
    types::{Image, InferenceTiming, KEYPOINT_ORDER, Keypoint, NUM_KEYPOINTS, PoseEstimationResult},
};

pub const INPUT_SIZE: u32 = 256;

/// The external pose estimation capability. Implementations are driven
/// from the single inference worker and never called concurrently.
pub trait Estimator: Send {
    fn estimate(
        &mut self,
        image: &Image,
    ) -> Result<(PoseEstimationResult, InferenceTiming), InferenceError>;
}

#[derive(Clone, Debug)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

/// Letterbox an RGBA image into a square model input tensor, NHWC f32
/// normalized to 0..1.
pub fn prepare_image(
    image: &Image,
    target_size: u32,
) -> Result<(Array4<f32>, Letterbox), InferenceError> {
    let expected_len = (image.width as usize)
        .saturating_mul(image.height as usize)
        .saturating_mul(4);
    if image.width == 0 || image.height == 0 || image.rgba.len() != expected_len {
        return Err(InferenceError::BadOutput(format!(
            "frame buffer size mismatch: got {}, expected {}",
            image.rgba.len(),
            expected_len
        )));
    }

    let scale = target_size as f32 / (image.width.max(image.height) as f32);
    let new_w = (image.width as f32 * scale).round().max(1.0) as u32;
    let new_h = (image.height as f32 * scale).round().max(1.0) as u32;

    let src_image = fir::images::Image::from_vec_u8(
        image.width,
        image.height,
        image.rgba.clone(),
        fir::PixelType::U8x4,
    )
    .map_err(|err| InferenceError::Model(format!("resize source rejected: {err}")))?;
    let mut dst_image = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x4);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .map_err(|err| InferenceError::Model(format!("resize failed: {err}")))?;
    let resized = dst_image.into_vec();

    let pad_x = ((target_size as i64 - new_w as i64) / 2).max(0) as usize;
    let pad_y = ((target_size as i64 - new_h as i64) / 2).max(0) as usize;
    let mut canvas = vec![0u8; (target_size as usize) * (target_size as usize) * 4];
    for px in canvas.chunks_mut(4) {
        px[3] = 255;
    }
    let dst_stride = target_size as usize * 4;
    let src_stride = new_w as usize * 4;
    for row in 0..(new_h as usize) {
        let dst_offset = (pad_y + row) * dst_stride + pad_x * 4;
        let src_offset = row * src_stride;
        canvas[dst_offset..dst_offset + src_stride]
            .copy_from_slice(&resized[src_offset..src_offset + src_stride]);
    }

    let normalized: Vec<f32> = canvas
        .par_chunks_exact(4)
        .flat_map_iter(|px| {
            [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ]
        })
        .collect();
    let input = Array4::<f32>::from_shape_vec(
        (1, target_size as usize, target_size as usize, 3),
        normalized,
    )
    .map_err(|err| InferenceError::Model(format!("failed to build input tensor: {err}")))?;

    let letterbox = Letterbox {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
        orig_w: image.width,
        orig_h: image.height,
    };

    Ok((input, letterbox))
}

/// Decode the model's flat [1,1,17,3] (y, x, score) output into a pose
/// result with coordinates normalized to the original frame.
pub fn decode_pose(
    flat: &[f32],
    letterbox: &Letterbox,
    input_size: u32,
) -> Result<PoseEstimationResult, InferenceError> {
    if flat.len() < NUM_KEYPOINTS * 3 {
        return Err(InferenceError::BadOutput(format!(
            "unexpected keypoint tensor length: got {}, need {}",
            flat.len(),
            NUM_KEYPOINTS * 3
        )));
    }

    let mut keypoints = Vec::with_capacity(NUM_KEYPOINTS);
    let mut score_sum = 0.0f32;
    for (chunk, kind) in flat
        .chunks_exact(3)
        .take(NUM_KEYPOINTS)
        .zip(KEYPOINT_ORDER.iter())
    {
        let (y, x, score) = (chunk[0], chunk[1], chunk[2]);

        // Model coordinates are relative to the letterboxed square; undo
        // the padding and scale, then renormalize to the frame.
        let frame_x = (x * input_size as f32 - letterbox.pad_x) / letterbox.scale;
        let frame_y = (y * input_size as f32 - letterbox.pad_y) / letterbox.scale;
        let norm_x = (frame_x / letterbox.orig_w as f32).clamp(0.0, 1.0);
        let norm_y = (frame_y / letterbox.orig_h as f32).clamp(0.0, 1.0);

        score_sum += score;
        keypoints.push(Keypoint {
            kind: *kind,
            x: norm_x,
            y: norm_y,
            score,
        });
    }

    Ok(PoseEstimationResult {
        keypoints,
        score: score_sum / NUM_KEYPOINTS as f32,
    })
}

/// ONNX Runtime single-person pose estimator. The model is consumed as an
/// opaque capability: any network with a [1,S,S,3] f32 input and a
/// [1,1,17,3] (y, x, score) output fits.
pub struct OrtEstimator {
    session: Session,
    input_size: u32,
}

impl OrtEstimator {
    pub fn new(model_path: &Path) -> Result<Self, InferenceError> {
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(2))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|err| {
                InferenceError::Model(format!(
                    "failed to load model from {}: {err}",
                    model_path.display()
                ))
            })?;

        Ok(OrtEstimator {
            session,
            input_size: INPUT_SIZE,
        })
    }
}

impl Estimator for OrtEstimator {
    fn estimate(
        &mut self,
        image: &Image,
    ) -> Result<(PoseEstimationResult, InferenceTiming), InferenceError> {
        let started = Instant::now();
        let (input, letterbox) = prepare_image(image, self.input_size)?;
        let preprocess = started.elapsed();

        let inference_started = Instant::now();
        let tensor = Tensor::from_array(input)
            .map_err(|err| InferenceError::Model(format!("tensor build failed: {err}")))?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|err| InferenceError::Model(format!("session run failed: {err}")))?;
        let inference = inference_started.elapsed();

        if outputs.len() < 1 {
            return Err(InferenceError::BadOutput("model returned no outputs".into()));
        }
        let coords = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|err| InferenceError::BadOutput(format!("output extract failed: {err}")))?;
        let flattened: Vec<f32> = coords.iter().copied().collect();

        let result = decode_pose(&flattened, &letterbox, self.input_size)?;
        let timing = InferenceTiming {
            preprocess,
            inference,
            total: started.elapsed(),
        };
        Ok((result, timing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_image(width: u32, height: u32) -> Image {
        Image {
            rgba: vec![128u8; (width * height * 4) as usize],
            width,
            height,
        }
    }

    fn flat_output(x: f32, y: f32, score: f32) -> Vec<f32> {
        let mut flat = Vec::with_capacity(NUM_KEYPOINTS * 3);
        for _ in 0..NUM_KEYPOINTS {
            flat.extend_from_slice(&[y, x, score]);
        }
        flat
    }

    #[test]
    fn prepare_builds_square_tensor() {
        let image = solid_image(64, 48);
        let (input, letterbox) = prepare_image(&image, 32).unwrap();
        assert_eq!(input.shape(), &[1, 32, 32, 3]);
        assert_eq!(letterbox.orig_w, 64);
        assert_eq!(letterbox.orig_h, 48);
        // Width dominates, so padding is vertical only.
        assert_eq!(letterbox.pad_x, 0.0);
        assert!(letterbox.pad_y > 0.0);
    }

    #[test]
    fn prepare_rejects_mismatched_buffer() {
        let image = Image {
            rgba: vec![0u8; 10],
            width: 4,
            height: 4,
        };
        assert!(prepare_image(&image, 32).is_err());
    }

    #[test]
    fn decode_on_square_frame_is_identity() {
        let letterbox = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            orig_w: 256,
            orig_h: 256,
        };
        let result = decode_pose(&flat_output(0.5, 0.25, 0.8), &letterbox, 256).unwrap();
        let nose = &result.keypoints[0];
        assert!((nose.x - 0.5).abs() < 1e-5);
        assert!((nose.y - 0.25).abs() < 1e-5);
        assert!((result.score - 0.8).abs() < 1e-5);
    }

    #[test]
    fn decode_compensates_for_letterbox_padding() {
        // A 128x64 frame letterboxed into 128: scale 1.0, pad_y 32.
        let letterbox = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 32.0,
            orig_w: 128,
            orig_h: 64,
        };
        // Center of the padded square maps to center of the frame.
        let result = decode_pose(&flat_output(0.5, 0.5, 1.0), &letterbox, 128).unwrap();
        let nose = &result.keypoints[0];
        assert!((nose.x - 0.5).abs() < 1e-5);
        assert!((nose.y - 0.5).abs() < 1e-5);
    }

    #[test]
    fn decode_clamps_out_of_frame_points() {
        let letterbox = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 32.0,
            orig_w: 128,
            orig_h: 64,
        };
        // A point inside the top padding band clamps to the frame edge.
        let result = decode_pose(&flat_output(0.5, 0.05, 1.0), &letterbox, 128).unwrap();
        assert_eq!(result.keypoints[0].y, 0.0);
    }

    #[test]
    fn decode_rejects_short_output() {
        let letterbox = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            orig_w: 64,
            orig_h: 64,
        };
        assert!(matches!(
            decode_pose(&[0.0; 12], &letterbox, 64),
            Err(InferenceError::BadOutput(_))
        ));
    }

    #[test]
    fn overall_score_is_the_keypoint_mean() {
        let letterbox = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            orig_w: 64,
            orig_h: 64,
        };
        let mut flat = flat_output(0.5, 0.5, 0.0);
        // One confident keypoint among sixteen at zero.
        flat[2] = 1.0;
        let result = decode_pose(&flat, &letterbox, 64).unwrap();
        assert!((result.score - 1.0 / NUM_KEYPOINTS as f32).abs() < 1e-5);
    }
}
