use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

use crate::agent_engine::message::Segment;
use crate::errors::{AgentError, AgentResult};

/// A captured (or user-supplied) screen image.
#[derive(Debug, Clone, PartialEq)]
pub struct Screenshot {
    pub bytes: Vec<u8>,
    pub mime: String,
    /// Pixel size of the device screen the image was taken from.
    pub width: u32,
    pub height: u32,
}

impl Screenshot {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            bytes,
            mime: mime.into(),
            width,
            height,
        }
    }

    /// Wraps encoded image bytes, reading dimensions and format from the data.
    pub fn from_encoded(bytes: Vec<u8>) -> AgentResult<Self> {
        let format = image::guess_format(&bytes)?;
        let img = image::load_from_memory_with_format(&bytes, format)?;
        Ok(Self {
            mime: format.to_mime_type().to_string(),
            width: img.width(),
            height: img.height(),
            bytes,
        })
    }
}

/// Downscales so the longest side is at most `max_dimension` and re-encodes as
/// JPEG. Screenshots dominate request size; the model does not need full
/// device resolution to pick a 0–999 coordinate.
pub fn encode_for_model(shot: &Screenshot, max_dimension: u32, quality: u8) -> AgentResult<Segment> {
    let img = image::load_from_memory(&shot.bytes)
        .map_err(|e| AgentError::Perception(format!("screenshot decode: {e}")))?;
    let (w, h) = (img.width(), img.height());
    if w == 0 || h == 0 {
        return Err(AgentError::Perception("zero-size screenshot".into()));
    }

    let (out_w, out_h) = if w.max(h) > max_dimension {
        if w >= h {
            (max_dimension, ((h as u64 * max_dimension as u64) / w as u64).max(1) as u32)
        } else {
            (((w as u64 * max_dimension as u64) / h as u64).max(1) as u32, max_dimension)
        }
    } else {
        (w, h)
    };

    let scaled = if (out_w, out_h) != (w, h) {
        img.resize_exact(out_w, out_h, FilterType::Triangle)
    } else {
        img
    };

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode_image(&scaled.to_rgb8())
        .map_err(|e| AgentError::Perception(format!("screenshot JPEG encode: {e}")))?;

    tracing::debug!(
        original = %format!("{w}x{h}"),
        scaled = %format!("{out_w}x{out_h}"),
        kb = jpeg.len() / 1024,
        "screenshot compressed for model"
    );

    Ok(Segment::Image {
        bytes: jpeg,
        mime: "image/jpeg".into(),
    })
}
