use image::codecs::jpeg::JpegEncoder;
use image::{ImageResult, RgbImage};

use facecheck_core::FrameSize;

const JPEG_QUALITY: u8 = 90;

/// Decode an uploaded frame in any supported format into RGB.
pub fn decode_frame(bytes: &[u8]) -> ImageResult<RgbImage> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

pub fn encode_jpeg(frame: &RgbImage) -> ImageResult<Vec<u8>> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode_image(frame)?;
    Ok(jpeg)
}

pub fn frame_size(frame: &RgbImage) -> FrameSize {
    FrameSize {
        width: frame.width(),
        height: frame.height(),
    }
}
