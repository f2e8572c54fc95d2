use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::{fmt, fmt::Display};

use crate::buffer_pool::{FrameBuffer, SharedFrameBuffer};
use crate::frame::DecodedFrame;

pub const FORCE_SOFTWARE_ENV: &str = "VIDEO_HW_DECODE_FORCE_SOFTWARE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    Hevc,
    Vp8,
    Vp9,
    Av1,
}

impl Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => f.write_str("h264"),
            Self::Hevc => f.write_str("hevc"),
            Self::Vp8 => f.write_str("vp8"),
            Self::Vp9 => f.write_str("vp9"),
            Self::Av1 => f.write_str("av1"),
        }
    }
}

impl FromStr for Codec {
    type Err = DecoderError;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        match v.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Self::H264),
            "hevc" | "h265" => Ok(Self::Hevc),
            "vp8" => Ok(Self::Vp8),
            "vp9" => Ok(Self::Vp9),
            "av1" => Ok(Self::Av1),
            _ => Err(DecoderError::UnsupportedCodec(v.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Dimensions {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    #[must_use]
    pub fn from_i32(width: i32, height: i32) -> Option<Self> {
        Self::new(u32::try_from(width).ok()?, u32::try_from(height).ok()?)
    }

    pub fn width(&self) -> u32 {
        self.width.get()
    }

    pub fn height(&self) -> u32 {
        self.height.get()
    }
}

impl Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RtpTimestamp(pub u32);

impl Display for RtpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@rtp", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorSpace {
    pub primaries: Option<u8>,
    pub transfer: Option<u8>,
    pub matrix: Option<u8>,
    pub full_range: Option<bool>,
}

impl ColorSpace {
    pub fn bt709() -> Self {
        Self {
            primaries: Some(1),
            transfer: Some(1),
            matrix: Some(1),
            full_range: Some(false),
        }
    }
}

impl Display for ColorSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ColorSpace(primaries={:?}, transfer={:?}, matrix={:?}, full_range={:?})",
            self.primaries, self.transfer, self.matrix, self.full_range
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Yuv420p,
    Yuvj420p,
    Yuv422p,
    Yuvj422p,
    Yuv444p,
    Yuvj444p,
    Yuv420p10,
    Yuv422p10,
    Yuv444p10,
    Nv12,
    HardwareSurface,
    Other(u32),
}

impl FormatTag {
    pub fn pixel_format(self) -> Option<PixelFormat> {
        match self {
            Self::Yuv420p | Self::Yuvj420p => Some(PixelFormat::I420),
            Self::Yuv422p | Self::Yuvj422p => Some(PixelFormat::I422),
            Self::Yuv444p | Self::Yuvj444p => Some(PixelFormat::I444),
            Self::Yuv420p10 => Some(PixelFormat::I010),
            Self::Yuv422p10 => Some(PixelFormat::I210),
            Self::Yuv444p10 => Some(PixelFormat::I410),
            Self::Nv12 => Some(PixelFormat::Nv12),
            Self::HardwareSurface => Some(PixelFormat::Surface),
            Self::Other(_) => None,
        }
    }
}

impl Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yuv420p => f.write_str("yuv420p"),
            Self::Yuvj420p => f.write_str("yuvj420p"),
            Self::Yuv422p => f.write_str("yuv422p"),
            Self::Yuvj422p => f.write_str("yuvj422p"),
            Self::Yuv444p => f.write_str("yuv444p"),
            Self::Yuvj444p => f.write_str("yuvj444p"),
            Self::Yuv420p10 => f.write_str("yuv420p10le"),
            Self::Yuv422p10 => f.write_str("yuv422p10le"),
            Self::Yuv444p10 => f.write_str("yuv444p10le"),
            Self::Nv12 => f.write_str("nv12"),
            Self::HardwareSurface => f.write_str("hw-surface"),
            Self::Other(v) => write!(f, "other({v})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    I420,
    I422,
    I444,
    I010,
    I210,
    I410,
    Nv12,
    Surface,
}

impl PixelFormat {
    pub fn is_hardware(self) -> bool {
        matches!(self, Self::Surface)
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::I010 | Self::I210 | Self::I410 => 2,
            _ => 1,
        }
    }

    pub fn plane_count(self) -> usize {
        match self {
            Self::Nv12 => 2,
            Self::Surface => 0,
            _ => 3,
        }
    }

    pub fn chroma_shift(self) -> (u32, u32) {
        match self {
            Self::I420 | Self::I010 | Self::Nv12 => (1, 1),
            Self::I422 | Self::I210 => (1, 0),
            Self::I444 | Self::I410 | Self::Surface => (0, 0),
        }
    }

    /// Row length in bytes and row count of `plane` for an image of `width` x `height`.
    pub fn plane_extent(self, plane: usize, width: u32, height: u32) -> Option<(usize, usize)> {
        if plane >= self.plane_count() {
            return None;
        }
        let bps = self.bytes_per_sample();
        if plane == 0 {
            return Some((width as usize * bps, height as usize));
        }
        let (sx, sy) = self.chroma_shift();
        let chroma_w = width.div_ceil(1 << sx) as usize;
        let chroma_h = height.div_ceil(1 << sy) as usize;
        match self {
            // Interleaved UV samples.
            Self::Nv12 => Some((chroma_w * 2, chroma_h)),
            _ => Some((chroma_w * bps, chroma_h)),
        }
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I420 => f.write_str("i420"),
            Self::I422 => f.write_str("i422"),
            Self::I444 => f.write_str("i444"),
            Self::I010 => f.write_str("i010"),
            Self::I210 => f.write_str("i210"),
            Self::I410 => f.write_str("i410"),
            Self::Nv12 => f.write_str("nv12"),
            Self::Surface => f.write_str("surface"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityReport {
    pub codec: Codec,
    pub decode_supported: bool,
    pub hardware_acceleration: bool,
}

impl Display for CapabilityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CapabilityReport(codec={}, decode_supported={}, hardware_acceleration={})",
            self.codec, self.decode_supported, self.hardware_acceleration
        )
    }
}

#[derive(Debug, Clone)]
pub struct DecoderSettings {
    pub codec: Codec,
    pub max_render_resolution: Option<Dimensions>,
    pub buffer_pool_size: Option<usize>,
    pub hardware_acceleration: bool,
}

impl DecoderSettings {
    #[must_use]
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            max_render_resolution: None,
            buffer_pool_size: None,
            hardware_acceleration: true,
        }
    }

    #[must_use]
    pub fn with_max_render_resolution(mut self, resolution: Option<Dimensions>) -> Self {
        self.max_render_resolution = resolution;
        self
    }

    #[must_use]
    pub fn with_buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_hardware_acceleration(mut self, enabled: bool) -> Self {
        self.hardware_acceleration = enabled;
        self
    }

    pub fn hardware_enabled(&self) -> bool {
        self.hardware_acceleration && !force_software_from_env()
    }
}

impl Display for DecoderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolution = self
            .max_render_resolution
            .map_or_else(|| "none".to_string(), |d| d.to_string());
        write!(
            f,
            "DecoderSettings(codec={}, max_render_resolution={}, buffer_pool_size={:?}, hardware_acceleration={})",
            self.codec, resolution, self.buffer_pool_size, self.hardware_acceleration
        )
    }
}

fn force_software_from_env() -> bool {
    std::env::var(FORCE_SOFTWARE_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    pub timestamp: RtpTimestamp,
    pub color_space: Option<ColorSpace>,
}

impl EncodedPacket {
    #[must_use]
    pub fn new(data: Vec<u8>, timestamp: RtpTimestamp) -> Self {
        Self {
            data,
            timestamp,
            color_space: None,
        }
    }

    #[must_use]
    pub fn with_color_space(mut self, color_space: ColorSpace) -> Self {
        self.color_space = Some(color_space);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

impl Display for SurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub dims: Dimensions,
    pub format: PixelFormat,
    pub shareable: bool,
}

#[derive(Debug, Clone)]
pub struct MappedSurface {
    pub dims: Dimensions,
    pub row_pitch: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneRef {
    pub offset: usize,
    pub stride: usize,
}

#[derive(Debug, Clone)]
pub enum PictureStorage {
    Buffer {
        buffer: SharedFrameBuffer,
        planes: Vec<PlaneRef>,
    },
    Surface(SurfaceHandle),
}

#[derive(Debug, Clone)]
pub struct Picture {
    pub format: FormatTag,
    pub width: i32,
    pub height: i32,
    pub opaque: i64,
    pub color: Option<ColorSpace>,
    pub storage: PictureStorage,
}

pub struct OpenParams {
    pub codec: Codec,
    pub format: FormatTag,
    pub device: Option<DeviceHandle>,
    pub allocator: Option<Arc<dyn FrameAllocator>>,
    pub coded_size: Option<Dimensions>,
    pub thread_count: usize,
    pub low_delay: bool,
}

impl fmt::Debug for OpenParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenParams")
            .field("codec", &self.codec)
            .field("format", &self.format)
            .field("device", &self.device)
            .field("allocator", &self.allocator.is_some())
            .field("coded_size", &self.coded_size)
            .field("thread_count", &self.thread_count)
            .field("low_delay", &self.low_delay)
            .finish()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("engine asked to retry the submission")]
    TemporaryRetry,
    #[error("engine needs more packets before a picture is available")]
    NeedMorePackets,
    #[error("engine failure: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DecoderError {
    #[error("decoder session is not configured")]
    NotConfigured,
    #[error("no frame consumer registered")]
    NoCallbackRegistered,
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("engine offered no supported pixel format: {0}")]
    NoSupportedFormat(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("corrupt picture: {0}")]
    CorruptPicture(String),
    #[error("surface allocation failed: {0}")]
    SurfaceAllocation(String),
    #[error("invalid picture size: {width}x{height}")]
    InvalidSize { width: i64, height: i64 },
    #[error("failed to open engine: {0}")]
    EngineOpen(String),
    #[error("buffer pool exhausted: {0} buffers in use")]
    BufferPoolExhausted(usize),
    #[error("graphics device error: {0}")]
    Device(String),
}

/// Storage provider handed to the engine at open time for software-path pictures.
pub trait FrameAllocator: Send + Sync {
    fn allocate(&self, format: FormatTag, width: i32, height: i32)
    -> Result<FrameBuffer, DecoderError>;
}

pub trait CodecEngine: Send {
    fn name(&self) -> &str;

    fn query_capability(&self, codec: Codec) -> CapabilityReport;

    fn candidate_formats(&self, codec: Codec) -> Vec<FormatTag>;

    fn open_decoder(&mut self, params: OpenParams) -> Result<Box<dyn EngineDecoder>, EngineError>;
}

pub trait EngineDecoder: Send {
    fn submit_packet(&mut self, data: &[u8], opaque: i64) -> Result<(), EngineError>;

    fn receive_picture(&mut self) -> Result<Picture, EngineError>;
}

pub trait GraphicsBackend: Send + Sync {
    fn create_device(&self) -> Result<Box<dyn GraphicsDevice>, DecoderError>;
}

pub trait GraphicsDevice: Send {
    fn handle(&self) -> DeviceHandle;

    fn create_surface(&mut self, desc: SurfaceDesc) -> Result<SurfaceHandle, DecoderError>;

    fn release_surface(&mut self, surface: SurfaceHandle);

    fn copy_surface(&mut self, src: SurfaceHandle, dst: SurfaceHandle) -> Result<(), DecoderError>;

    fn map_read(&mut self, surface: SurfaceHandle) -> Result<MappedSurface, DecoderError>;
}

pub trait FrameConsumer: Send {
    fn on_frame(&mut self, frame: DecodedFrame, qp: Option<u8>);
}

impl<F> FrameConsumer for F
where
    F: FnMut(DecodedFrame, Option<u8>) + Send,
{
    fn on_frame(&mut self, frame: DecodedFrame, qp: Option<u8>) {
        self(frame, qp)
    }
}
