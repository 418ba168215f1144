//! FFmpeg-backed video file decoder.
//!
//! Frames are scaled to RGB24 and handed out one at a time. End of stream
//! flushes the decoder so trailing frames are not lost.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::Path;

use super::display_name;
use crate::frame::Frame;

pub(crate) struct FfmpegVideoSource {
    name: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    fps: Option<f64>,
    frame_count: Option<u64>,
    frames_read: u64,
    eof_sent: bool,
}

impl FfmpegVideoSource {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open video '{}' with ffmpeg", path.display()))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video track", path.display()))?;
        let stream_index = input_stream.index();

        let rate = input_stream.avg_frame_rate();
        let fps = (rate.denominator() != 0 && rate.numerator() > 0)
            .then(|| f64::from(rate.numerator()) / f64::from(rate.denominator()));
        let frame_count = u64::try_from(input_stream.frames()).ok().filter(|n| *n > 0);

        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "VideoSource: opened {} (ffmpeg, {:?} fps, {:?} frames)",
            path.display(),
            fps,
            frame_count
        );

        Ok(Self {
            name: display_name(path),
            input,
            stream_index,
            decoder,
            scaler,
            fps,
            frame_count,
            frames_read: 0,
            eof_sent: false,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn fps(&self) -> Option<f64> {
        self.fps
    }

    pub(crate) fn frame_count(&self) -> Option<u64> {
        self.frame_count
    }

    pub(crate) fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                self.frames_read += 1;
                return Ok(Some(Frame::from_rgb(pixels, width, height)?));
            }
            if self.eof_sent {
                return Ok(None);
            }

            let next_packet = self
                .input
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            match next_packet {
                Some((index, packet)) if index == self.stream_index => {
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                Some(_) => {}
                None => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
        }
    }

    /// Decode forward until the next frame returned is `index`.
    pub(crate) fn seek(&mut self, index: u64) -> Result<()> {
        if index < self.frames_read {
            return Err(anyhow!(
                "cannot seek backwards to frame {} (at {})",
                index,
                self.frames_read
            ));
        }
        while self.frames_read < index {
            if self.next_frame()?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("ffmpeg frame buffer is shorter than expected")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
