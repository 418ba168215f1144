use image::{Rgb, RgbImage};

use crate::frame::{DetectionBox, PixelRect};

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BAR_FILL: Rgb<u8> = Rgb([255, 0, 0]);
const BAR_TRACK: Rgb<u8> = Rgb([32, 32, 32]);
const BOX_THICKNESS: u32 = 2;
const BAR_HEIGHT: u32 = 6;
const BAR_GAP: u32 = 3;

/// Draw every box with its confidence bar onto `image`.
pub(crate) fn draw_detections(image: &mut RgbImage, boxes: &[DetectionBox]) {
    for b in boxes {
        let rect = b.clamped(image.width(), image.height());
        draw_rect(image, rect, BOX_COLOR, BOX_THICKNESS);
        draw_confidence_bar(image, rect, b.confidence);
    }
}

/// Hollow rectangle, `thickness` pixels wide, grown inward from the edges.
pub(crate) fn draw_rect(image: &mut RgbImage, rect: PixelRect, color: Rgb<u8>, thickness: u32) {
    for t in 0..thickness {
        let x1 = rect.x1.saturating_add(t).min(rect.x2);
        let y1 = rect.y1.saturating_add(t).min(rect.y2);
        let x2 = rect.x2.saturating_sub(t).max(x1);
        let y2 = rect.y2.saturating_sub(t).max(y1);
        for x in x1..=x2 {
            put(image, x, y1, color);
            put(image, x, y2, color);
        }
        for y in y1..=y2 {
            put(image, x1, y, color);
            put(image, x2, y, color);
        }
    }
}

/// Horizontal bar above the box (below it when there is no room) whose filled
/// share is the confidence. Stands in for a text label.
pub(crate) fn draw_confidence_bar(image: &mut RgbImage, rect: PixelRect, confidence: f32) {
    let width = rect.x2 - rect.x1 + 1;
    let top = if rect.y1 >= BAR_HEIGHT + BAR_GAP {
        rect.y1 - BAR_HEIGHT - BAR_GAP
    } else {
        rect.y2.saturating_add(BAR_GAP)
    };
    let filled = (width as f32 * confidence.clamp(0.0, 1.0)).round() as u32;
    for y in top..top.saturating_add(BAR_HEIGHT) {
        for dx in 0..width {
            let color = if dx < filled { BAR_FILL } else { BAR_TRACK };
            put(image, rect.x1 + dx, y, color);
        }
    }
}

fn put(image: &mut RgbImage, x: u32, y: u32, color: Rgb<u8>) {
    if x < image.width() && y < image.height() {
        image.put_pixel(x, y, color);
    }
}
