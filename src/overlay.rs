use parking_lot::Mutex;
use std::sync::Arc;

use crate::types::{Image, KeypointKind, PoseEstimationResult};

use crate::types::KeypointKind::*;

/// Skeleton edges over the 17-keypoint topology, expressed as indices
/// into the fixed keypoint order.
pub const SKELETON_EDGES: &[(KeypointKind, KeypointKind)] = &[
    (Nose, LeftEye),
    (Nose, RightEye),
    (LeftEye, LeftEar),
    (RightEye, RightEar),
    (Nose, LeftShoulder),
    (Nose, RightShoulder),
    (LeftShoulder, RightShoulder),
    (LeftShoulder, LeftElbow),
    (LeftElbow, LeftWrist),
    (RightShoulder, RightElbow),
    (RightElbow, RightWrist),
    (LeftShoulder, LeftHip),
    (RightShoulder, RightHip),
    (LeftHip, RightHip),
    (LeftHip, LeftKnee),
    (LeftKnee, LeftAnkle),
    (RightHip, RightKnee),
    (RightKnee, RightAnkle),
];

pub const SKELETON_LINE_THICKNESS: i32 = 6;
// Individual keypoints below this confidence are not drawn even when the
// overall pose passes the minimum score.
const KEYPOINT_DRAW_THRESHOLD: f32 = 0.3;

const LINE_COLOR: [u8; 4] = [56, 189, 248, 255];
const POINT_COLOR: [u8; 4] = [248, 113, 113, 255];

/// Combines a frame with an optional pose result. Pure transform; also
/// retains the most recent output so the display surface always has a
/// value between frames.
pub struct OverlayRenderer {
    min_score: f32,
    latest: Arc<Mutex<Option<Image>>>,
}

impl OverlayRenderer {
    pub fn new(min_score: f32) -> Self {
        OverlayRenderer {
            min_score,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn render(&self, frame: &Image, result: Option<&PoseEstimationResult>) -> Image {
        let mut output = frame.clone();
        if let Some(pose) = result {
            if pose.score >= self.min_score {
                draw_pose(&mut output.rgba, output.width, output.height, pose);
            }
        }
        *self.latest.lock() = Some(output.clone());
        output
    }

    #[allow(dead_code)]
    pub fn latest(&self) -> Option<Image> {
        self.latest.lock().clone()
    }

    pub fn latest_handle(&self) -> Arc<Mutex<Option<Image>>> {
        self.latest.clone()
    }
}

fn draw_pose(buffer: &mut [u8], width: u32, height: u32, pose: &PoseEstimationResult) {
    let scale = |kp: &crate::types::Keypoint| -> (f32, f32) {
        (kp.x * width as f32, kp.y * height as f32)
    };

    for &(a, b) in SKELETON_EDGES {
        let pa = pose.keypoints.iter().find(|kp| kp.kind == a);
        let pb = pose.keypoints.iter().find(|kp| kp.kind == b);
        if let (Some(pa), Some(pb)) = (pa, pb) {
            if pa.score < KEYPOINT_DRAW_THRESHOLD || pb.score < KEYPOINT_DRAW_THRESHOLD {
                continue;
            }
            draw_line(
                buffer,
                width,
                height,
                &scale(pa),
                &scale(pb),
                LINE_COLOR,
                SKELETON_LINE_THICKNESS,
            );
        }
    }

    let point_radius = (SKELETON_LINE_THICKNESS / 2).max(3) + 1;
    for kp in &pose.keypoints {
        if kp.score < KEYPOINT_DRAW_THRESHOLD {
            continue;
        }
        let (x, y) = scale(kp);
        draw_circle(
            buffer,
            width,
            height,
            (x as i32, y as i32),
            point_radius,
            POINT_COLOR,
        );
    }
}

fn draw_line(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    p0: &(f32, f32),
    p1: &(f32, f32),
    color: [u8; 4],
    thickness: i32,
) {
    let (mut x0, mut y0) = (p0.0 as i32, p0.1 as i32);
    let (x1, y1) = (p1.0 as i32, p1.1 as i32);
    let dx = (x1 - x0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let dy = -(y1 - y0).abs();
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let radius = (thickness.max(1) - 1) / 2;

    loop {
        put_pixel_safe(buffer, width, height, x0, y0, color);
        if radius > 0 {
            for ox in -radius..=radius {
                for oy in -radius..=radius {
                    if ox == 0 && oy == 0 {
                        continue;
                    }
                    if ox.abs() + oy.abs() <= radius {
                        put_pixel_safe(buffer, width, height, x0 + ox, y0 + oy, color);
                    }
                }
            }
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn draw_circle(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    center: (i32, i32),
    radius: i32,
    color: [u8; 4],
) {
    let (cx, cy) = center;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                put_pixel_safe(buffer, width, height, cx + dx, cy + dy, color);
            }
        }
    }
}

fn put_pixel_safe(buffer: &mut [u8], width: u32, height: u32, x: i32, y: i32, color: [u8; 4]) {
    if x < 0 || y < 0 {
        return;
    }
    let (ux, uy) = (x as u32, y as u32);
    if ux >= width || uy >= height {
        return;
    }
    let idx = ((uy * width + ux) as usize) * 4;
    if idx + 3 < buffer.len() {
        buffer[idx..idx + 4].copy_from_slice(&color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KEYPOINT_ORDER, Keypoint};

    fn blank_frame(width: u32, height: u32) -> Image {
        Image {
            rgba: vec![0u8; (width * height * 4) as usize],
            width,
            height,
        }
    }

    fn pose_with_score(score: f32) -> PoseEstimationResult {
        let keypoints = KEYPOINT_ORDER
            .iter()
            .enumerate()
            .map(|(i, kind)| Keypoint {
                kind: *kind,
                x: 0.2 + 0.03 * i as f32,
                y: 0.2 + 0.03 * i as f32,
                score: 0.9,
            })
            .collect();
        PoseEstimationResult { keypoints, score }
    }

    #[test]
    fn confident_pose_changes_pixels() {
        let renderer = OverlayRenderer::new(0.2);
        let frame = blank_frame(64, 64);
        let rendered = renderer.render(&frame, Some(&pose_with_score(0.9)));
        assert_ne!(rendered.rgba, frame.rgba);
    }

    #[test]
    fn low_score_pose_is_identical_to_no_result() {
        let renderer = OverlayRenderer::new(0.2);
        let frame = blank_frame(64, 64);
        let with_low = renderer.render(&frame, Some(&pose_with_score(0.1)));
        let without = renderer.render(&frame, None);
        assert_eq!(with_low, without);
        assert_eq!(with_low.rgba, frame.rgba);
    }

    #[test]
    fn weak_keypoints_are_suppressed_individually() {
        let renderer = OverlayRenderer::new(0.2);
        let frame = blank_frame(64, 64);
        let mut pose = pose_with_score(0.9);
        for kp in &mut pose.keypoints {
            kp.score = 0.05;
        }
        let rendered = renderer.render(&frame, Some(&pose));
        assert_eq!(rendered.rgba, frame.rgba);
    }

    #[test]
    fn keypoints_are_scaled_from_normalized_space() {
        let renderer = OverlayRenderer::new(0.2);
        let frame = blank_frame(100, 100);
        let pose = PoseEstimationResult {
            keypoints: vec![Keypoint {
                kind: KeypointKind::Nose,
                x: 0.5,
                y: 0.5,
                score: 0.9,
            }],
            score: 0.9,
        };
        let rendered = renderer.render(&frame, Some(&pose));
        let idx = ((50 * 100 + 50) * 4) as usize;
        assert_eq!(&rendered.rgba[idx..idx + 4], &POINT_COLOR);
        // Far corner untouched.
        assert_eq!(&rendered.rgba[0..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn renderer_retains_latest_output() {
        let renderer = OverlayRenderer::new(0.2);
        assert!(renderer.latest().is_none());
        let frame = blank_frame(8, 8);
        let rendered = renderer.render(&frame, None);
        assert_eq!(renderer.latest().unwrap(), rendered);
    }

    #[test]
    fn rendering_does_not_mutate_the_input_frame() {
        let renderer = OverlayRenderer::new(0.2);
        let frame = blank_frame(32, 32);
        let before = frame.clone();
        let _ = renderer.render(&frame, Some(&pose_with_score(0.9)));
        assert_eq!(frame, before);
    }
}
