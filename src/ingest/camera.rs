//! Camera source.
//!
//! Cameras are addressed by index and opened as the V4L2 device
//! `/dev/video<index>` when the `ingest-v4l2` feature is enabled. Frames are
//! requested as RGB24; devices that only offer NV12 are converted.

use anyhow::Result;

#[cfg(not(feature = "ingest-v4l2"))]
use anyhow::anyhow;

use crate::frame::Frame;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const REQUESTED_FPS: u32 = 30;

pub struct CameraSource {
    name: String,
    #[cfg(feature = "ingest-v4l2")]
    device: device::DeviceCamera,
}

impl CameraSource {
    pub fn open(index: u32) -> Result<Self> {
        let name = format!("camera_{}", index);
        #[cfg(feature = "ingest-v4l2")]
        {
            let path = format!("/dev/video{}", index);
            let device = device::DeviceCamera::open(&path)?;
            Ok(Self { name, device })
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            Err(anyhow!(
                "{} requires the ingest-v4l2 feature",
                name
            ))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        #[cfg(feature = "ingest-v4l2")]
        {
            self.device.next_frame().map(Some)
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            Ok(None)
        }
    }

    pub fn fps(&self) -> Option<f64> {
        #[cfg(feature = "ingest-v4l2")]
        {
            self.device.fps()
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            None
        }
    }

    pub fn frames_read(&self) -> u64 {
        #[cfg(feature = "ingest-v4l2")]
        {
            self.device.frames_read
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            0
        }
    }
}

// ----------------------------------------------------------------------------
// V4L2 device using libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
mod device {
    use anyhow::{anyhow, Context, Result};
    use ouroboros::self_referencing;

    use super::super::normalize::{normalize_to_rgb, PixelFormat};
    use super::{REQUESTED_FPS, REQUESTED_HEIGHT, REQUESTED_WIDTH};
    use crate::frame::Frame;

    pub(super) struct DeviceCamera {
        path: String,
        state: DeviceState,
        width: u32,
        height: u32,
        format: PixelFormat,
        fps: Option<f64>,
        pub(super) frames_read: u64,
    }

    #[self_referencing]
    struct DeviceState {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    impl DeviceCamera {
        pub(super) fn open(path: &str) -> Result<Self> {
            use v4l::buffer::Type;
            use v4l::video::Capture;

            let mut device =
                v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {}", path))?;
            let mut format = device.format().context("read v4l2 format")?;
            format.width = REQUESTED_WIDTH;
            format.height = REQUESTED_HEIGHT;
            format.fourcc = v4l::FourCC::new(b"RGB3");

            let format = match device.set_format(&format) {
                Ok(format) => format,
                Err(err) => {
                    log::warn!("CameraSource: failed to set format on {}: {}", path, err);
                    device
                        .format()
                        .context("read v4l2 format after set failure")?
                }
            };
            let pixel_format = match &format.fourcc.repr {
                b"RGB3" => PixelFormat::Rgb24,
                b"NV12" => PixelFormat::Nv12,
                b"YUYV" => PixelFormat::Yuyv,
                other => {
                    return Err(anyhow!(
                        "{} negotiated unsupported pixel format {}",
                        path,
                        String::from_utf8_lossy(other)
                    ))
                }
            };

            let params = v4l::video::capture::Parameters::with_fps(REQUESTED_FPS);
            let fps = match device.set_params(&params) {
                Ok(applied) => {
                    let interval = applied.interval;
                    (interval.numerator > 0)
                        .then(|| f64::from(interval.denominator) / f64::from(interval.numerator))
                }
                Err(err) => {
                    log::warn!("CameraSource: failed to set fps on {}: {}", path, err);
                    None
                }
            };

            let state = DeviceStateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
                },
            }
            .try_build()?;

            log::info!(
                "CameraSource: connected to {} ({}x{} {:?})",
                path,
                format.width,
                format.height,
                pixel_format
            );
            Ok(Self {
                path: path.to_string(),
                state,
                width: format.width,
                height: format.height,
                format: pixel_format,
                fps,
                frames_read: 0,
            })
        }

        pub(super) fn fps(&self) -> Option<f64> {
            self.fps
        }

        pub(super) fn next_frame(&mut self) -> Result<Frame> {
            use v4l::io::traits::CaptureStream;

            let (width, height, format) = (self.width, self.height, self.format);
            let path = &self.path;
            let pixels = self.state.with_mut(|fields| -> Result<Vec<u8>> {
                let (buf, meta) = fields
                    .stream
                    .next()
                    .with_context(|| format!("capture v4l2 frame from {}", path))?;
                let used = match meta.bytesused as usize {
                    0 => buf.len(),
                    n => n.min(buf.len()),
                };
                normalize_to_rgb(&buf[..used], width, height, format)
            })?;

            self.frames_read += 1;
            Frame::from_rgb(pixels, width, height)
        }
    }
}
