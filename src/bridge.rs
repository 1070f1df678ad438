use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgba, yuyv422_to_rgba,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

use crate::{
    error::ConversionError,
    types::{Image, PixelBuffer, PixelFormat, Rotation},
};

/// Convert a native pixel buffer into the renderable RGBA image used by
/// the overlay and the display surface. Pure; allocates the output.
pub fn to_renderable(buffer: &PixelBuffer) -> Result<Image, ConversionError> {
    let (width, height) = (buffer.width, buffer.height);
    if width == 0 || height == 0 {
        return Err(ConversionError::ZeroDimensions);
    }

    let rgba = match buffer.format {
        PixelFormat::Rgba => {
            check_len(buffer, pixel_count(buffer) * 4)?;
            buffer.data.clone()
        }
        PixelFormat::Bgra => {
            check_len(buffer, pixel_count(buffer) * 4)?;
            swap_red_blue(&buffer.data)
        }
        PixelFormat::Rgb => rgb_like_to_rgba(buffer, false)?,
        PixelFormat::Bgr => rgb_like_to_rgba(buffer, true)?,
        PixelFormat::Gray => gray_to_rgba(buffer)?,
        PixelFormat::Nv12 => nv12_to_rgba(buffer)?,
        PixelFormat::Yuyv => yuyv_to_rgba(buffer)?,
        PixelFormat::Mjpeg => mjpeg_to_rgba(buffer)?,
    };

    Ok(Image {
        rgba,
        width,
        height,
    })
}

/// Convert a rendered image back into a native buffer for the encoder
/// input. Only the encoder-side layouts are valid targets.
pub fn to_native_buffer(
    image: &Image,
    format: PixelFormat,
) -> Result<PixelBuffer, ConversionError> {
    if image.width == 0 || image.height == 0 {
        return Err(ConversionError::ZeroDimensions);
    }
    let expected = image.width as usize * image.height as usize * 4;
    if image.rgba.len() < expected {
        return Err(ConversionError::BufferTooSmall {
            format: PixelFormat::Rgba,
            got: image.rgba.len(),
            expected,
        });
    }

    let data = match format {
        PixelFormat::Rgba => image.rgba.clone(),
        PixelFormat::Bgra => swap_red_blue(&image.rgba),
        other => return Err(ConversionError::Unsupported(other)),
    };

    Ok(PixelBuffer {
        data,
        width: image.width,
        height: image.height,
        format,
    })
}

/// Normalize a captured image to upright. Applied exactly once, by the
/// frame source.
pub fn rotate_upright(image: Image, rotation: Rotation) -> Image {
    match rotation {
        Rotation::None => image,
        Rotation::Cw180 => {
            let mut rgba = vec![0u8; image.rgba.len()];
            let (w, h) = (image.width as usize, image.height as usize);
            for y in 0..h {
                for x in 0..w {
                    let src = (y * w + x) * 4;
                    let dst = ((h - 1 - y) * w + (w - 1 - x)) * 4;
                    rgba[dst..dst + 4].copy_from_slice(&image.rgba[src..src + 4]);
                }
            }
            Image {
                rgba,
                width: image.width,
                height: image.height,
            }
        }
        Rotation::Cw90 | Rotation::Cw270 => {
            let (w, h) = (image.width as usize, image.height as usize);
            let mut rgba = vec![0u8; image.rgba.len()];
            for y in 0..h {
                for x in 0..w {
                    let src = (y * w + x) * 4;
                    // Destination grid is h wide and w tall.
                    let (dx, dy) = match rotation {
                        Rotation::Cw90 => (h - 1 - y, x),
                        _ => (y, w - 1 - x),
                    };
                    let dst = (dy * h + dx) * 4;
                    rgba[dst..dst + 4].copy_from_slice(&image.rgba[src..src + 4]);
                }
            }
            Image {
                rgba,
                width: image.height,
                height: image.width,
            }
        }
    }
}

/// Wrap a raw camera frame in a PixelBuffer without copying semantics
/// beyond the byte move; decoding happens in `to_renderable`.
#[cfg(feature = "camera-nokhwa")]
pub fn from_camera_frame(frame: &nokhwa::Buffer) -> PixelBuffer {
    use nokhwa::utils::FrameFormat;

    let resolution = frame.resolution();
    let format = match frame.source_frame_format() {
        FrameFormat::NV12 => PixelFormat::Nv12,
        FrameFormat::YUYV => PixelFormat::Yuyv,
        FrameFormat::MJPEG => PixelFormat::Mjpeg,
        FrameFormat::RAWRGB => PixelFormat::Rgb,
        FrameFormat::RAWBGR => PixelFormat::Bgr,
        FrameFormat::GRAY => PixelFormat::Gray,
    };

    PixelBuffer {
        data: frame.buffer().to_vec(),
        width: resolution.width_x,
        height: resolution.height_y,
        format,
    }
}

fn pixel_count(buffer: &PixelBuffer) -> usize {
    buffer.width as usize * buffer.height as usize
}

fn check_len(buffer: &PixelBuffer, expected: usize) -> Result<(), ConversionError> {
    if buffer.data.len() < expected {
        return Err(ConversionError::BufferTooSmall {
            format: buffer.format,
            got: buffer.data.len(),
            expected,
        });
    }
    Ok(())
}

fn swap_red_blue(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; data.len() / 4 * 4];
    out.par_chunks_mut(4)
        .zip(data.par_chunks_exact(4))
        .for_each(|(dst, src)| {
            dst[0] = src[2];
            dst[1] = src[1];
            dst[2] = src[0];
            dst[3] = src[3];
        });
    out
}

fn rgb_like_to_rgba(buffer: &PixelBuffer, swap_rb: bool) -> Result<Vec<u8>, ConversionError> {
    check_len(buffer, pixel_count(buffer) * 3)?;

    let mut rgba = vec![0u8; pixel_count(buffer) * 4];
    rgba.par_chunks_mut(4)
        .zip(buffer.data.par_chunks_exact(3))
        .for_each(|(dst, src)| {
            if swap_rb {
                dst[0] = src[2];
                dst[1] = src[1];
                dst[2] = src[0];
            } else {
                dst[0] = src[0];
                dst[1] = src[1];
                dst[2] = src[2];
            }
            dst[3] = 255;
        });

    Ok(rgba)
}

fn gray_to_rgba(buffer: &PixelBuffer) -> Result<Vec<u8>, ConversionError> {
    check_len(buffer, pixel_count(buffer))?;

    let mut rgba = vec![0u8; pixel_count(buffer) * 4];
    rgba.par_chunks_mut(4)
        .zip(buffer.data.par_iter().copied())
        .for_each(|(dst, value)| {
            dst[0] = value;
            dst[1] = value;
            dst[2] = value;
            dst[3] = 255;
        });

    Ok(rgba)
}

fn nv12_to_rgba(buffer: &PixelBuffer) -> Result<Vec<u8>, ConversionError> {
    let (width, height) = (buffer.width, buffer.height);
    let y_plane_len = pixel_count(buffer);
    let uv_plane_len = y_plane_len / 2;
    check_len(buffer, y_plane_len + uv_plane_len)?;

    let y_plane = &buffer.data[..y_plane_len];
    let uv_plane = &buffer.data[y_plane_len..y_plane_len + uv_plane_len];
    let mut rgba = vec![0u8; y_plane_len * 4];

    let image = YuvBiPlanarImage {
        y_plane,
        y_stride: width,
        uv_plane,
        uv_stride: width,
        width,
        height,
    };

    yuv_nv12_to_rgba(
        &image,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| ConversionError::Decode(PixelFormat::Nv12, format!("{err:?}")))?;

    Ok(rgba)
}

fn yuyv_to_rgba(buffer: &PixelBuffer) -> Result<Vec<u8>, ConversionError> {
    let (width, height) = (buffer.width, buffer.height);
    check_len(buffer, pixel_count(buffer) * 2)?;

    let mut rgba = vec![0u8; pixel_count(buffer) * 4];
    let packed = YuvPackedImage {
        yuy: &buffer.data,
        yuy_stride: width * 2,
        width,
        height,
    };

    yuyv422_to_rgba(
        &packed,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| ConversionError::Decode(PixelFormat::Yuyv, format!("{err:?}")))?;

    Ok(rgba)
}

fn mjpeg_to_rgba(buffer: &PixelBuffer) -> Result<Vec<u8>, ConversionError> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(&buffer.data[..]), options);
    let rgba = decoder
        .decode()
        .map_err(|err| ConversionError::Decode(PixelFormat::Mjpeg, format!("{err:?}")))?;

    let expected = pixel_count(buffer) * 4;
    if rgba.len() < expected {
        return Err(ConversionError::BufferTooSmall {
            format: PixelFormat::Mjpeg,
            got: rgba.len(),
            expected,
        });
    }

    Ok(rgba)
}
