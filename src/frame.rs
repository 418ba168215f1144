//! Decoded frames and detection geometry.
//!
//! - `Frame`: one decoded RGB8 image plus its capture time. Pixel storage is
//!   private; callers read it through `pixels()` or convert it to an `RgbImage`.
//! - `DetectionBox`: one detector output in source-image pixel coordinates.
//! - `PixelRect`: a box clamped to the bounds of a concrete frame.

use anyhow::{anyhow, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded frame in packed RGB8 layout.
#[derive(Clone)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    captured_at: SystemTime,
}

impl Frame {
    /// Wrap packed RGB8 pixels. The buffer length must equal `width * height * 3`.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at: SystemTime::now(),
        })
    }

    pub fn from_image(image: RgbImage) -> Result<Self> {
        let (width, height) = image.dimensions();
        Self::from_rgb(image.into_raw(), width, height)
    }

    /// Solid-pattern frame used by synthetic sources and tests.
    pub fn synthetic(width: u32, height: u32, seed: u64) -> Result<Self> {
        let pixel_count = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + seed) % 256) as u8;
        }
        Self::from_rgb(pixels, width, height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// Copy the frame into an `RgbImage` for drawing and encoding.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// DetectionBox
// ----------------------------------------------------------------------------

/// A single detector output: corners in source pixels plus confidence in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl DetectionBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).abs()
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).abs()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn diagonal(&self) -> f32 {
        self.width().hypot(self.height())
    }

    /// Clamp the box to `[0, width-1] x [0, height-1]`.
    pub fn clamped(&self, width: u32, height: u32) -> PixelRect {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        let clamp_x = |v: f32| v.clamp(0.0, max_x) as u32;
        let clamp_y = |v: f32| v.clamp(0.0, max_y) as u32;
        let (ax, bx) = (clamp_x(self.x1), clamp_x(self.x2));
        let (ay, by) = (clamp_y(self.y1), clamp_y(self.y2));
        PixelRect {
            x1: ax.min(bx),
            y1: ay.min(by),
            x2: ax.max(bx),
            y2: ay.max(by),
        }
    }
}

/// Parses `x1,y1,x2,y2,confidence`.
impl std::str::FromStr for DetectionBox {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let values = s
            .split(',')
            .map(|v| v.trim().parse::<f32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("invalid box '{}': {}", s, e))?;
        match values.as_slice() {
            [x1, y1, x2, y2, confidence] => Ok(Self::new(*x1, *y1, *x2, *y2, *confidence)),
            _ => Err(anyhow!("box '{}' must be x1,y1,x2,y2,confidence", s)),
        }
    }
}

/// Inclusive pixel rectangle inside a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_mismatched_buffer() {
        assert!(Frame::from_rgb(vec![0u8; 10], 2, 2).is_err());
        assert!(Frame::from_rgb(vec![], 0, 0).is_err());
        assert!(Frame::from_rgb(vec![0u8; 12], 2, 2).is_ok());
    }

    #[test]
    fn frame_round_trips_through_rgb_image() -> Result<()> {
        let frame = Frame::synthetic(4, 3, 7)?;
        let image = frame.to_rgb_image()?;
        assert_eq!(image.dimensions(), (4, 3));
        let again = Frame::from_image(image)?;
        assert_eq!(again.pixels(), frame.pixels());
        Ok(())
    }

    #[test]
    fn box_parses_from_csv() -> Result<()> {
        let b: DetectionBox = "1, 2, 11, 12, 0.75".parse()?;
        assert_eq!(b, DetectionBox::new(1.0, 2.0, 11.0, 12.0, 0.75));
        assert!("1,2,3".parse::<DetectionBox>().is_err());
        assert!("a,b,c,d,e".parse::<DetectionBox>().is_err());
        Ok(())
    }

    #[test]
    fn box_geometry() {
        let b = DetectionBox::new(0.0, 0.0, 30.0, 40.0, 0.9);
        assert_eq!(b.center(), (15.0, 20.0));
        assert_eq!(b.diagonal(), 50.0);
    }

    #[test]
    fn clamp_keeps_box_inside_frame() {
        let b = DetectionBox::new(-5.0, 10.0, 700.0, 900.0, 0.5);
        let rect = b.clamped(640, 480);
        assert_eq!(
            rect,
            PixelRect {
                x1: 0,
                y1: 10,
                x2: 639,
                y2: 479
            }
        );

        let inverted = DetectionBox::new(20.0, 20.0, 10.0, 5.0, 0.5).clamped(640, 480);
        assert_eq!(inverted.x1, 10);
        assert_eq!(inverted.y1, 5);
    }
}
