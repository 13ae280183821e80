// Normalized 0–999 model coordinates → device pixels.
use serde::{Deserialize, Serialize};

use crate::action::types::Point;

/// Device screen size in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1080, 1920)
    }
}

/// Maps a normalized point to a pixel position inside `viewport`.
/// The model's axis runs 0..=999, so 999 lands on the last pixel column/row.
pub fn to_physical(point: Point, viewport: Viewport) -> (i32, i32) {
    let scale = |v: u32, extent: u32| -> i32 {
        if extent == 0 {
            return 0;
        }
        let px = (v as u64 * extent as u64) / 1000;
        px.min(extent as u64 - 1) as i32
    };
    (scale(point.x, viewport.width), scale(point.y, viewport.height))
}
