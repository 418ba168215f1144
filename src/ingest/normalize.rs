//! Camera pixel layouts converted to packed RGB24.

use anyhow::{anyhow, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Nv12,
    Yuyv,
}

impl PixelFormat {
    fn expected_len(self, width: u32, height: u32) -> Result<usize> {
        let pixels = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| anyhow!("{:?} frame dimensions overflow", self))?;
        let len = match self {
            Self::Rgb24 => pixels.checked_mul(3),
            // Chroma is subsampled 2x2, rounded up on odd sizes.
            Self::Nv12 => chroma_stride(width)
                .checked_mul(height.div_ceil(2) as usize)
                .and_then(|chroma| pixels.checked_add(chroma)),
            Self::Yuyv => {
                if width % 2 != 0 {
                    return Err(anyhow!("YUYV frames need an even width, got {}", width));
                }
                pixels.checked_mul(2)
            }
        };
        len.ok_or_else(|| anyhow!("{:?} frame dimensions overflow", self))
    }
}

/// Bytes per interleaved UV row of an NV12 frame.
fn chroma_stride(width: u32) -> usize {
    width.div_ceil(2) as usize * 2
}

/// Convert one captured buffer. Trailing padding beyond the expected length is ignored.
pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    let expected = format.expected_len(width, height)?;
    let pixels = pixels.get(..expected).ok_or_else(|| {
        anyhow!(
            "{:?} frame too short: expected {}, got {}",
            format,
            expected,
            pixels.len()
        )
    })?;
    let (w, h) = (width as usize, height as usize);
    match format {
        PixelFormat::Rgb24 => Ok(pixels.to_vec()),
        PixelFormat::Nv12 => {
            let y_plane = w * h;
            let stride = chroma_stride(width);
            let mut rgb = Vec::with_capacity(y_plane * 3);
            for j in 0..h {
                for i in 0..w {
                    let uv = y_plane + (j / 2) * stride + (i / 2) * 2;
                    rgb.extend_from_slice(&yuv_to_rgb(pixels[j * w + i], pixels[uv], pixels[uv + 1]));
                }
            }
            Ok(rgb)
        }
        PixelFormat::Yuyv => {
            let mut rgb = Vec::with_capacity(w * h * 3);
            // Y0 U Y1 V covers two pixels.
            for quad in pixels.chunks_exact(4) {
                rgb.extend_from_slice(&yuv_to_rgb(quad[0], quad[1], quad[3]));
                rgb.extend_from_slice(&yuv_to_rgb(quad[2], quad[1], quad[3]));
            }
            Ok(rgb)
        }
    }
}

/// BT.601 full-range conversion.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    [
        clamp_to_u8(y + 1.402 * v),
        clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v),
        clamp_to_u8(y + 1.772 * u),
    ]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_is_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        assert_eq!(normalize_to_rgb(&nv12, 2, 2, PixelFormat::Nv12)?, vec![128u8; 12]);

        let yuyv = vec![200, 128, 200, 128];
        assert_eq!(normalize_to_rgb(&yuyv, 2, 1, PixelFormat::Yuyv)?, vec![200u8; 6]);
        Ok(())
    }

    #[test]
    fn odd_nv12_dimensions_round_chroma_up() -> Result<()> {
        // 3x3 luma, 2x2 chroma samples -> 9 + 8 bytes.
        let nv12 = [vec![128u8; 9], vec![128u8; 8]].concat();
        assert_eq!(normalize_to_rgb(&nv12, 3, 3, PixelFormat::Nv12)?, vec![128u8; 27]);
        assert!(normalize_to_rgb(&nv12[..16], 3, 3, PixelFormat::Nv12).is_err());
        assert!(normalize_to_rgb(&[0u8; 6], 3, 1, PixelFormat::Yuyv).is_err());
        Ok(())
    }

    #[test]
    fn short_buffers_are_rejected_and_padding_dropped() -> Result<()> {
        assert!(normalize_to_rgb(&[0u8; 5], 1, 2, PixelFormat::Rgb24).is_err());
        let padded = vec![7u8; 10];
        assert_eq!(normalize_to_rgb(&padded, 1, 2, PixelFormat::Rgb24)?, vec![7u8; 6]);
        Ok(())
    }
}
