use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

mod bitstream;
mod buffer_pool;
mod contract;
mod frame;
mod negotiator;
mod recycle;
mod surface;
pub mod synthetic;
pub mod telemetry;

pub use bitstream::{H264BitstreamParser, SpsInfo, split_nal_units};
pub use buffer_pool::{
    BufferLayout, BufferShape, DEFAULT_MAX_BUFFERS, FrameBuffer, FrameBufferPool, PlaneLayout,
    PoolStats, SharedFrameBuffer,
};
pub use contract::{
    CapabilityReport, Codec, CodecEngine, ColorSpace, DecoderError, DecoderSettings, DeviceHandle,
    Dimensions, EncodedPacket, EngineDecoder, EngineError, FORCE_SOFTWARE_ENV, FormatTag,
    FrameAllocator, FrameConsumer, GraphicsBackend, GraphicsDevice, MappedSurface, OpenParams,
    Picture, PictureStorage, PixelFormat, PlaneRef, RtpTimestamp, SurfaceDesc, SurfaceHandle,
};
pub use frame::{CropRect, CroppedBuffer, DecodedFrame, PlaneWindow};
pub use negotiator::{DecodePath, NegotiatedFormat, SOFTWARE_PRIORITY, SurfaceNegotiator};
pub use surface::{HardwareSurfaceContext, OutputSurface, SurfaceStats};

pub const METRICS_ENV: &str = "VIDEO_HW_DECODE_METRICS";

fn should_report_metrics() -> bool {
    std::env::var(METRICS_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Configured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderInfo {
    pub implementation_name: String,
    pub is_hardware_accelerated: bool,
}

impl fmt::Display for DecoderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DecoderInfo(implementation_name={}, is_hardware_accelerated={})",
            self.implementation_name, self.is_hardware_accelerated
        )
    }
}

struct ActiveDecoder {
    handle: Box<dyn EngineDecoder>,
    negotiated: NegotiatedFormat,
    codec: Codec,
}

#[derive(Debug, Default, Clone, Copy)]
struct DecodeTiming {
    engine: Duration,
    wrap: Duration,
}

pub struct DecoderSession {
    engine: Box<dyn CodecEngine>,
    graphics: Option<Arc<dyn GraphicsBackend>>,
    active: Option<ActiveDecoder>,
    surfaces: HardwareSurfaceContext,
    pool: FrameBufferPool,
    consumer: Option<Box<dyn FrameConsumer>>,
    qp_parser: H264BitstreamParser,
    frames_decoded: u64,
}

impl DecoderSession {
    pub fn new<E>(engine: E) -> Self
    where
        E: CodecEngine + 'static,
    {
        Self {
            engine: Box::new(engine),
            graphics: None,
            active: None,
            surfaces: HardwareSurfaceContext::new(),
            pool: FrameBufferPool::default(),
            consumer: None,
            qp_parser: H264BitstreamParser::new(),
            frames_decoded: 0,
        }
    }

    #[must_use]
    pub fn with_graphics(mut self, backend: Arc<dyn GraphicsBackend>) -> Self {
        self.graphics = Some(backend);
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: Box<dyn GraphicsDevice>) -> Self {
        self.surfaces = HardwareSurfaceContext::with_device(device);
        self
    }

    pub fn state(&self) -> SessionState {
        if self.active.is_some() {
            SessionState::Configured
        } else {
            SessionState::Uninitialized
        }
    }

    pub fn register_consumer<C>(&mut self, consumer: C)
    where
        C: FrameConsumer + 'static,
    {
        self.consumer = Some(Box::new(consumer));
    }

    pub fn configure(
        &mut self,
        codec: Codec,
        max_render_resolution: Option<Dimensions>,
    ) -> Result<(), DecoderError> {
        self.configure_with(
            DecoderSettings::new(codec).with_max_render_resolution(max_render_resolution),
        )
    }

    /// Like `configure`, for a codec given by name. Unknown names fail with `UnsupportedCodec`.
    pub fn configure_named(
        &mut self,
        codec: &str,
        max_render_resolution: Option<Dimensions>,
    ) -> Result<(), DecoderError> {
        match codec.parse::<Codec>() {
            Ok(codec) => self.configure(codec, max_render_resolution),
            Err(err) => {
                telemetry::report_init();
                self.release();
                Err(self.fail(err))
            }
        }
    }

    /// Opens the engine for `settings.codec`, preferring hardware and falling back to software.
    /// Any previous configuration is released first. On failure the session is left unconfigured.
    pub fn configure_with(&mut self, settings: DecoderSettings) -> Result<(), DecoderError> {
        telemetry::report_init();
        match self.open(&settings) {
            Ok(negotiated) => {
                info!(
                    codec = %settings.codec,
                    path = %negotiated.path,
                    format = %negotiated.tag,
                    engine = self.engine.name(),
                    "decoder configured"
                );
                Ok(())
            }
            Err(err) => {
                self.release();
                Err(self.fail(err))
            }
        }
    }

    fn open(&mut self, settings: &DecoderSettings) -> Result<NegotiatedFormat, DecoderError> {
        let capability = self.engine.query_capability(settings.codec);
        debug!(%capability, %settings, "configuring decoder");
        if !capability.decode_supported {
            return Err(DecoderError::UnsupportedCodec(settings.codec.to_string()));
        }
        self.release();
        self.pool
            .resize(settings.buffer_pool_size.unwrap_or(DEFAULT_MAX_BUFFERS))?;

        let candidates = self.engine.candidate_formats(settings.codec);
        let hardware_allowed = settings.hardware_enabled()
            && capability.hardware_acceleration
            && (self.graphics.is_some() || self.surfaces.has_external_device());
        let negotiator = SurfaceNegotiator::new(hardware_allowed);
        let negotiated = negotiator.negotiate(&candidates)?;

        let (handle, negotiated) = match negotiated.path {
            DecodePath::Hardware => match self.open_hardware(settings, negotiated) {
                Ok(handle) => (handle, negotiated),
                Err(err) => {
                    warn!(error = %err, "hardware decode unavailable, falling back to software");
                    self.surfaces.release();
                    let fallback = negotiator.software_only().negotiate(&candidates)?;
                    (self.open_software(settings, fallback)?, fallback)
                }
            },
            DecodePath::Software => (self.open_software(settings, negotiated)?, negotiated),
        };

        self.qp_parser = H264BitstreamParser::new();
        self.active = Some(ActiveDecoder {
            handle,
            negotiated,
            codec: settings.codec,
        });
        Ok(negotiated)
    }

    fn open_params(settings: &DecoderSettings, format: FormatTag) -> OpenParams {
        OpenParams {
            codec: settings.codec,
            format,
            device: None,
            allocator: None,
            coded_size: settings.max_render_resolution,
            thread_count: 1,
            low_delay: true,
        }
    }

    fn open_hardware(
        &mut self,
        settings: &DecoderSettings,
        negotiated: NegotiatedFormat,
    ) -> Result<Box<dyn EngineDecoder>, DecoderError> {
        let device = self
            .surfaces
            .initialize(self.graphics.as_deref(), settings.max_render_resolution)?;
        let mut params = Self::open_params(settings, negotiated.tag);
        params.device = Some(device);
        self.engine
            .open_decoder(params)
            .map_err(|err| DecoderError::EngineOpen(err.to_string()))
    }

    fn open_software(
        &mut self,
        settings: &DecoderSettings,
        negotiated: NegotiatedFormat,
    ) -> Result<Box<dyn EngineDecoder>, DecoderError> {
        let mut params = Self::open_params(settings, negotiated.tag);
        params.allocator = Some(Arc::new(self.pool.clone()));
        self.engine
            .open_decoder(params)
            .map_err(|err| DecoderError::EngineOpen(err.to_string()))
    }

    pub fn decode(&mut self, packet: &EncodedPacket) -> Result<(), DecoderError> {
        self.decode_packet(packet).map_err(|err| self.fail(err))
    }

    fn decode_packet(&mut self, packet: &EncodedPacket) -> Result<(), DecoderError> {
        let Some(active) = self.active.as_mut() else {
            return Err(DecoderError::NotConfigured);
        };
        let Some(consumer) = self.consumer.as_mut() else {
            return Err(DecoderError::NoCallbackRegistered);
        };
        if packet.data.is_empty() {
            return Err(DecoderError::InvalidArgument("empty packet".into()));
        }
        if i32::try_from(packet.data.len()).is_err() {
            return Err(DecoderError::InvalidArgument(format!(
                "packet of {} bytes exceeds the engine limit",
                packet.data.len()
            )));
        }

        let qp = if active.codec == Codec::H264 {
            self.qp_parser.parse_packet(&packet.data);
            self.qp_parser.last_slice_qp()
        } else {
            None
        };

        let mut timing = DecodeTiming::default();
        let started = Instant::now();
        let opaque = i64::from(packet.timestamp.0);
        active
            .handle
            .submit_packet(&packet.data, opaque)
            .map_err(|err| DecoderError::Decode(format!("submit failed: {err}")))?;
        let picture = active
            .handle
            .receive_picture()
            .map_err(|err| DecoderError::Decode(format!("no picture: {err}")))?;
        timing.engine = started.elapsed();

        if picture.opaque != opaque {
            return Err(DecoderError::Decode(format!(
                "engine returned timestamp {} for packet {}",
                picture.opaque, opaque
            )));
        }

        let wrap_started = Instant::now();
        let color_space = packet.color_space.or(picture.color);
        let frame = match (active.negotiated.path, picture.storage) {
            (DecodePath::Software, PictureStorage::Buffer { buffer, planes }) => {
                DecodedFrame::Software {
                    buffer: CroppedBuffer::wrap(buffer, &planes, picture.width, picture.height)?,
                    timestamp: packet.timestamp,
                    color_space,
                }
            }
            (DecodePath::Hardware, PictureStorage::Surface(source)) => {
                let dims = Dimensions::from_i32(picture.width, picture.height).ok_or_else(|| {
                    DecoderError::CorruptPicture(format!(
                        "reported size {}x{}",
                        picture.width, picture.height
                    ))
                })?;
                let output = self.surfaces.present(source, dims)?;
                DecodedFrame::Hardware {
                    surface: output.handle,
                    dims,
                    timestamp: packet.timestamp,
                    color_space,
                }
            }
            (path, _) => {
                return Err(DecoderError::Decode(format!(
                    "picture storage does not match the {path} path"
                )));
            }
        };
        timing.wrap = wrap_started.elapsed();

        self.frames_decoded += 1;
        trace!(frame = %frame, ?qp, "frame decoded");
        if should_report_metrics() {
            info!(
                frames = self.frames_decoded,
                engine_ms = timing.engine.as_secs_f64() * 1_000.0,
                wrap_ms = timing.wrap.as_secs_f64() * 1_000.0,
                "decode timing"
            );
        }
        consumer.on_frame(frame, qp);
        Ok(())
    }

    fn fail(&self, err: DecoderError) -> DecoderError {
        let usage = matches!(
            err,
            DecoderError::NotConfigured
                | DecoderError::NoCallbackRegistered
                | DecoderError::InvalidArgument(_)
        );
        if usage {
            debug!(error = %err, "decode call rejected");
        } else {
            warn!(error = %err, "decoder error");
        }
        telemetry::report_error();
        err
    }

    /// Drops the engine handle, output surface and idle buffers. Frames already delivered stay valid.
    pub fn release(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(codec = %active.codec, path = %active.negotiated.path, "releasing decoder");
        }
        self.surfaces.release();
        self.pool.clear();
        if let Err(err) = self.pool.resize(DEFAULT_MAX_BUFFERS) {
            debug!(error = %err, "buffer pool keeps its cap until held frames return");
        }
        self.qp_parser = H264BitstreamParser::new();
        self.frames_decoded = 0;
    }

    pub fn info(&self) -> DecoderInfo {
        DecoderInfo {
            implementation_name: self.engine.name().to_string(),
            is_hardware_accelerated: self
                .active
                .as_ref()
                .is_some_and(|a| a.negotiated.path == DecodePath::Hardware),
        }
    }

    pub fn negotiated_format(&self) -> Option<NegotiatedFormat> {
        self.active.as_ref().map(|a| a.negotiated)
    }

    pub fn download_surface(&mut self, frame: &DecodedFrame) -> Result<MappedSurface, DecoderError> {
        let surface = frame.surface().ok_or_else(|| {
            DecoderError::InvalidArgument("software frames have no surface".into())
        })?;
        match self.surfaces.current_surface() {
            Some(current) if current.handle == surface => self.surfaces.read_back(),
            _ => Err(DecoderError::InvalidArgument(format!(
                "{surface} is no longer the output surface"
            ))),
        }
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn surface_stats(&self) -> SurfaceStats {
        self.surfaces.stats()
    }

    pub fn buffer_pool(&self) -> &FrameBufferPool {
        &self.pool
    }
}

impl Drop for DecoderSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{H264StreamWriter, SyntheticEngine, SyntheticGraphics};
    use std::sync::Mutex;

    fn collecting_session(engine: SyntheticEngine) -> (DecoderSession, Arc<Mutex<Vec<DecodedFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        let mut session = DecoderSession::new(engine);
        session.register_consumer(move |frame: DecodedFrame, _qp: Option<u8>| {
            sink.lock().unwrap().push(frame);
        });
        (session, frames)
    }

    #[test]
    fn decode_before_configure_is_rejected() {
        let (mut session, frames) = collecting_session(SyntheticEngine::new());
        let err = session
            .decode(&EncodedPacket::new(vec![], RtpTimestamp(33)))
            .unwrap_err();
        assert!(matches!(err, DecoderError::NotConfigured));
        assert!(frames.lock().unwrap().is_empty());
    }

    #[test]
    fn consumer_is_required_before_packets_are_checked() {
        let mut session = DecoderSession::new(SyntheticEngine::new());
        session.configure(Codec::H264, None).unwrap();
        let err = session
            .decode(&EncodedPacket::new(vec![], RtpTimestamp(1)))
            .unwrap_err();
        assert!(matches!(err, DecoderError::NoCallbackRegistered));
    }

    #[test]
    fn open_uses_single_thread_low_delay() {
        let engine = SyntheticEngine::new();
        let probe = engine.clone();
        let mut session = DecoderSession::new(engine);
        let hint = Dimensions::new(1280, 720);
        session.configure(Codec::H264, hint).unwrap();
        let opens = probe.opens();
        assert_eq!(opens.len(), 1);
        assert_eq!((opens[0].thread_count, opens[0].low_delay), (1, true));
        assert_eq!(opens[0].coded_size, hint);
        assert_eq!(opens[0].format, FormatTag::Yuv420p);
    }

    #[test]
    fn disabled_hardware_setting_keeps_software_path() {
        let engine = SyntheticEngine::new().with_hardware();
        let mut session = DecoderSession::new(engine)
            .with_graphics(Arc::new(SyntheticGraphics::new()));
        session
            .configure_with(DecoderSettings::new(Codec::H264).with_hardware_acceleration(false))
            .unwrap();
        assert!(!session.info().is_hardware_accelerated);
        assert_eq!(
            session.negotiated_format().map(|n| n.path),
            Some(DecodePath::Software)
        );
    }

    #[test]
    fn h264_frames_carry_qp_and_hevc_frames_do_not() {
        let qps = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&qps);
        let mut session = DecoderSession::new(SyntheticEngine::new());
        session.register_consumer(move |_frame: DecodedFrame, qp: Option<u8>| {
            sink.lock().unwrap().push(qp);
        });
        let writer = H264StreamWriter::new(Dimensions::new(320, 240).unwrap());

        session.configure(Codec::H264, None).unwrap();
        session
            .decode(&EncodedPacket::new(writer.keyframe(31), RtpTimestamp(0)))
            .unwrap();
        session.configure(Codec::Hevc, None).unwrap();
        session
            .decode(&EncodedPacket::new(vec![0, 0, 1, 0x40, 1], RtpTimestamp(3000)))
            .unwrap();
        assert_eq!(*qps.lock().unwrap(), vec![Some(31), None]);
    }

    #[test]
    fn info_names_the_engine() {
        let session = DecoderSession::new(SyntheticEngine::new());
        assert_eq!(
            session.info().to_string(),
            "DecoderInfo(implementation_name=synthetic, is_hardware_accelerated=false)"
        );
    }
}
