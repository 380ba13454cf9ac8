use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{GrayImage, Rgb, RgbImage};
use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::capability::{Capabilities, Flags as CapabilityFlags};
use v4l::format::{Format, FourCC};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;

use super::{CaptureError, CaptureSource};

pub const DEFAULT_PIXEL_FORMAT: &str = "YUYV";
const STREAM_BUFFERS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLocator {
    Index(u32),
    Path(PathBuf),
}

impl DeviceLocator {
    pub fn from_option(device: Option<String>) -> Self {
        match device {
            Some(text) => {
                if let Ok(index) = text.parse::<u32>() {
                    DeviceLocator::Index(index)
                } else {
                    DeviceLocator::Path(PathBuf::from(text))
                }
            }
            None => DeviceLocator::Index(0),
        }
    }

    pub fn display(&self) -> String {
        match self {
            DeviceLocator::Index(i) => format!("/dev/video{i}"),
            DeviceLocator::Path(path) => path.display().to_string(),
        }
    }

    fn open(&self) -> Result<v4l::Device, CaptureError> {
        let opened = match self {
            DeviceLocator::Index(index) => v4l::Device::new((*index) as usize),
            DeviceLocator::Path(path) => v4l::Device::with_path(path),
        };
        opened.map_err(|err| CaptureError::from_io(&self.display(), &err))
    }
}

#[derive(Debug, Clone)]
pub struct V4lCaptureConfig {
    pub device: DeviceLocator,
    pub pixel_format: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub warmup_frames: u32,
}

impl Default for V4lCaptureConfig {
    fn default() -> Self {
        Self {
            device: DeviceLocator::Index(0),
            pixel_format: DEFAULT_PIXEL_FORMAT.to_string(),
            width: Some(640),
            height: Some(480),
            warmup_frames: 0,
        }
    }
}

struct OpenDevice {
    device: v4l::Device,
    format: Format,
}

/// Video4Linux2 camera. Device calls block, so they run on the blocking pool.
pub struct V4lCaptureSource {
    config: V4lCaptureConfig,
    open: Option<Arc<Mutex<OpenDevice>>>,
}

impl V4lCaptureSource {
    pub fn new(config: V4lCaptureConfig) -> Self {
        Self { config, open: None }
    }
}

#[async_trait]
impl CaptureSource for V4lCaptureSource {
    fn describe(&self) -> String {
        self.config.device.display()
    }

    async fn acquire(&mut self) -> Result<(), CaptureError> {
        let config = self.config.clone();
        let opened = tokio::task::spawn_blocking(move || open_device(&config))
            .await
            .map_err(|err| CaptureError::Unsupported(format!("device setup task failed: {err}")))??;
        self.open = Some(Arc::new(Mutex::new(opened)));
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<RgbImage, CaptureError> {
        let open = self.open.clone().ok_or(CaptureError::NotAcquired)?;
        let device_name = self.config.device.display();
        let warmup_frames = self.config.warmup_frames;
        tokio::task::spawn_blocking(move || {
            let guard = open
                .lock()
                .map_err(|_| CaptureError::Frame("device lock poisoned".into()))?;
            read_frame(&guard, &device_name, warmup_frames)
        })
        .await
        .map_err(|err| CaptureError::Frame(format!("frame task failed: {err}")))?
    }

    fn release(&mut self) {
        if self.open.take().is_some() {
            info!(device = %self.config.device.display(), "closed video device");
        }
    }
}

fn open_device(config: &V4lCaptureConfig) -> Result<OpenDevice, CaptureError> {
    let display = config.device.display();
    let mut device = config.device.open()?;
    let io_err = |err: std::io::Error| CaptureError::from_io(&display, &err);

    let caps = device.query_caps().map_err(io_err)?;
    ensure_capabilities(&caps)?;
    debug!(
        device = %display,
        driver = %caps.driver,
        card = %caps.card,
        bus = %caps.bus,
        "opened video device"
    );

    let requested = parse_fourcc(&config.pixel_format)
        .ok_or_else(|| CaptureError::Unsupported(format!("pixel format '{}'", config.pixel_format)))?;
    let formats = device.enum_formats().map_err(io_err)?;
    if !formats.iter().any(|format| format.fourcc == requested) {
        return Err(CaptureError::Unsupported(format!(
            "pixel format {} not offered by {display}",
            fourcc_to_string(requested)
        )));
    }

    let mut format = device.format().map_err(io_err)?;
    format.fourcc = requested;
    if let Some(width) = config.width {
        format.width = width;
    }
    if let Some(height) = config.height {
        format.height = height;
    }
    let format = device.set_format(&format).map_err(io_err)?;
    info!(
        device = %display,
        pixel_format = %fourcc_to_string(format.fourcc),
        width = format.width,
        height = format.height,
        "negotiated capture format"
    );

    Ok(OpenDevice { device, format })
}

fn read_frame(
    open: &OpenDevice,
    device_name: &str,
    warmup_frames: u32,
) -> Result<RgbImage, CaptureError> {
    let mut stream = Stream::with_buffers(&open.device, Type::VideoCapture, STREAM_BUFFERS)
        .map_err(|err| CaptureError::from_io(device_name, &err))?;
    for idx in 0..warmup_frames {
        stream.next().map_err(|err| {
            CaptureError::Frame(format!("failed to read warm-up frame {}: {err}", idx + 1))
        })?;
    }
    let (data, _) = stream
        .next()
        .map_err(|err| CaptureError::from_io(device_name, &err))?;
    let gray = convert_frame_to_image(data, &open.format)?;
    Ok(gray_to_rgb(&gray))
}

fn ensure_capabilities(caps: &Capabilities) -> Result<(), CaptureError> {
    let flags = caps.capabilities;
    let mut reasons = Vec::new();
    if !flags.contains(CapabilityFlags::VIDEO_CAPTURE) {
        reasons.push("missing VIDEO_CAPTURE".to_string());
    }
    if !flags.contains(CapabilityFlags::STREAMING) {
        reasons.push("missing STREAMING".to_string());
    }
    if reasons.is_empty() {
        Ok(())
    } else {
        Err(CaptureError::Unsupported(reasons.join(", ")))
    }
}

/// Convert a raw V4L2 buffer into 8-bit luma.
pub fn convert_frame_to_image(data: &[u8], format: &Format) -> Result<GrayImage, CaptureError> {
    let width = format.width as usize;
    let height = format.height as usize;
    let expected_pixels = width * height;
    let pixel_format = fourcc_to_string(format.fourcc);
    let short = |expected: usize| {
        CaptureError::Frame(format!(
            "expected {expected} bytes for {pixel_format} frame, got {}",
            data.len()
        ))
    };

    let buffer = match pixel_format.as_str() {
        "Y16" => {
            if data.len() < expected_pixels * 2 {
                return Err(short(expected_pixels * 2));
            }
            // Keep the high byte of each little-endian sample.
            data[..expected_pixels * 2]
                .chunks_exact(2)
                .map(|pair| pair[1])
                .collect()
        }
        "GREY" | "Y8" => {
            if data.len() < expected_pixels {
                return Err(short(expected_pixels));
            }
            data[..expected_pixels].to_vec()
        }
        "YUYV" => {
            let expected_bytes = expected_pixels * 2;
            if data.len() < expected_bytes {
                return Err(short(expected_bytes));
            }
            let mut buffer = Vec::with_capacity(expected_pixels);
            for chunk in data[..expected_bytes].chunks_exact(4) {
                buffer.push(chunk[0]);
                buffer.push(chunk[2]);
            }
            buffer.truncate(expected_pixels);
            buffer
        }
        other => {
            return Err(CaptureError::Unsupported(format!(
                "conversion from pixel format {other}"
            )))
        }
    };

    GrayImage::from_vec(format.width, format.height, buffer)
        .ok_or_else(|| CaptureError::Frame("failed to build image buffer".into()))
}

pub fn gray_to_rgb(image: &GrayImage) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let v = image.get_pixel(x, y)[0];
        Rgb([v, v, v])
    })
}

fn parse_fourcc(code: &str) -> Option<FourCC> {
    if code.is_empty() || code.len() > 4 {
        return None;
    }
    let mut repr = [b' '; 4];
    repr[..code.len()].copy_from_slice(code.as_bytes());
    Some(FourCC::new(&repr))
}

fn fourcc_to_string(fourcc: FourCC) -> String {
    String::from_utf8_lossy(&fourcc.repr)
        .trim_matches(|c| c == char::from(0) || c == ' ')
        .to_string()
}
