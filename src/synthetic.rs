//! In-process engine and graphics device that follow the external contracts closely enough
//! to drive a [`DecoderSession`](crate::DecoderSession) end to end without a real codec.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bitstream::{BitWriter, H264BitstreamParser, escape_rbsp};
use crate::contract::{
    CapabilityReport, Codec, CodecEngine, ColorSpace, DecoderError, DeviceHandle, Dimensions,
    EngineDecoder, EngineError, FormatTag, FrameAllocator, GraphicsBackend, GraphicsDevice,
    MappedSurface, OpenParams, Picture, PictureStorage, PlaneRef, SurfaceDesc, SurfaceHandle,
};

const DECODE_SURFACE_BASE: u64 = 0x1000;
// Size of the engine-side decode surface ring.
const DECODE_SURFACE_COUNT: u64 = 17;

const DEFAULT_SIZE: Dimensions = match (NonZeroU32::new(640), NonZeroU32::new(360)) {
    (Some(width), Some(height)) => Dimensions { width, height },
    _ => panic!("default size must be non-zero"),
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct H264StreamWriter {
    dims: Dimensions,
    color: Option<ColorSpace>,
}

impl H264StreamWriter {
    #[must_use]
    pub fn new(dims: Dimensions) -> Self {
        Self { dims, color: None }
    }

    #[must_use]
    pub fn with_color(mut self, color: ColorSpace) -> Self {
        self.color = Some(color);
        self
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    fn sps(&self) -> Vec<u8> {
        let width = self.dims.width();
        let height = self.dims.height();
        let mbs_w = width.div_ceil(16);
        let mbs_h = height.div_ceil(16);
        let crop_right = (mbs_w * 16 - width) / 2;
        let crop_bottom = (mbs_h * 16 - height) / 2;

        let mut w = BitWriter::default();
        w.bits(66, 8)
            .bits(0xC0, 8)
            .bits(40, 8)
            .ue(0)
            .ue(0)
            .ue(2)
            .ue(1)
            .flag(false)
            .ue(mbs_w - 1)
            .ue(mbs_h - 1)
            .flag(true)
            .flag(true);
        let cropped = crop_right > 0 || crop_bottom > 0;
        w.flag(cropped);
        if cropped {
            w.ue(0).ue(crop_right).ue(0).ue(crop_bottom);
        }
        match self.color {
            Some(color) => {
                let code = |v: Option<u8>| u64::from(v.unwrap_or(2));
                w.flag(true)
                    .flag(false)
                    .flag(false)
                    .flag(true)
                    .bits(5, 3)
                    .flag(color.full_range.unwrap_or(false))
                    .flag(true)
                    .bits(code(color.primaries), 8)
                    .bits(code(color.transfer), 8)
                    .bits(code(color.matrix), 8);
                for _ in 0..6 {
                    w.flag(false);
                }
            }
            None => {
                w.flag(false);
            }
        }
        w.finish_rbsp()
    }

    fn pps() -> Vec<u8> {
        let mut w = BitWriter::default();
        w.ue(0)
            .ue(0)
            .flag(false)
            .flag(false)
            .ue(0)
            .ue(0)
            .ue(0)
            .flag(false)
            .bits(0, 2)
            .se(0)
            .se(0)
            .se(0)
            .flag(true)
            .flag(false)
            .flag(false);
        w.finish_rbsp()
    }

    fn push_nal(out: &mut Vec<u8>, header: u8, rbsp: &[u8]) {
        out.extend_from_slice(&[0, 0, 0, 1, header]);
        out.extend_from_slice(&escape_rbsp(rbsp));
    }

    fn slice_tail(w: &mut BitWriter, qp: u8) -> Vec<u8> {
        w.se(i32::from(qp) - 26).ue(0).se(0).se(0).bits(0xA5A5, 16);
        w.finish_rbsp()
    }

    pub fn keyframe(&self, qp: u8) -> Vec<u8> {
        let mut out = Vec::new();
        Self::push_nal(&mut out, 0x67, &self.sps());
        Self::push_nal(&mut out, 0x68, &Self::pps());
        let mut w = BitWriter::default();
        w.ue(0).ue(7).ue(0).bits(0, 4).ue(0).flag(false).flag(false);
        Self::push_nal(&mut out, 0x65, &Self::slice_tail(&mut w, qp));
        out
    }

    pub fn delta_frame(&self, frame_num: u32, qp: u8) -> Vec<u8> {
        let mut out = Vec::new();
        let mut w = BitWriter::default();
        w.ue(0)
            .ue(5)
            .ue(0)
            .bits(u64::from(frame_num % 16), 4)
            .flag(false)
            .flag(false)
            .flag(false);
        Self::push_nal(&mut out, 0x41, &Self::slice_tail(&mut w, qp));
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticFault {
    RejectPacket,
    WithholdPicture,
    ShiftLumaOrigin(usize),
    OverstateWidth,
    MismatchOpaque,
}

#[derive(Debug, Clone, Default)]
pub struct FaultInjector(Arc<Mutex<VecDeque<SyntheticFault>>>);

impl FaultInjector {
    pub fn inject(&self, fault: SyntheticFault) {
        lock(&self.0).push_back(fault);
    }

    fn next(&self) -> Option<SyntheticFault> {
        lock(&self.0).pop_front()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRecord {
    pub codec: Codec,
    pub format: FormatTag,
    pub device: Option<DeviceHandle>,
    pub coded_size: Option<Dimensions>,
    pub thread_count: usize,
    pub low_delay: bool,
    pub succeeded: bool,
}

#[derive(Debug, Clone)]
pub struct SyntheticEngine {
    codecs: Vec<Codec>,
    software_formats: Vec<FormatTag>,
    hardware: bool,
    fail_hardware_open: bool,
    default_size: Dimensions,
    alignment: u32,
    faults: FaultInjector,
    opens: Arc<Mutex<Vec<OpenRecord>>>,
}

impl Default for SyntheticEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticEngine {
    pub fn new() -> Self {
        Self {
            codecs: vec![Codec::H264, Codec::Hevc],
            software_formats: vec![FormatTag::Yuv420p, FormatTag::Nv12],
            hardware: false,
            fail_hardware_open: false,
            default_size: DEFAULT_SIZE,
            alignment: 16,
            faults: FaultInjector::default(),
            opens: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_codecs(mut self, codecs: Vec<Codec>) -> Self {
        self.codecs = codecs;
        self
    }

    #[must_use]
    pub fn with_software_formats(mut self, formats: Vec<FormatTag>) -> Self {
        self.software_formats = formats;
        self
    }

    #[must_use]
    pub fn with_hardware(mut self) -> Self {
        self.hardware = true;
        self
    }

    #[must_use]
    pub fn with_failing_hardware_open(mut self) -> Self {
        self.fail_hardware_open = true;
        self
    }

    #[must_use]
    pub fn with_default_size(mut self, dims: Dimensions) -> Self {
        self.default_size = dims;
        self
    }

    #[must_use]
    pub fn with_alignment(mut self, alignment: u32) -> Self {
        self.alignment = alignment.max(1);
        self
    }

    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        lock(&self.opens).clone()
    }
}

impl CodecEngine for SyntheticEngine {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn query_capability(&self, codec: Codec) -> CapabilityReport {
        let supported = self.codecs.contains(&codec);
        CapabilityReport {
            codec,
            decode_supported: supported,
            hardware_acceleration: supported && self.hardware,
        }
    }

    fn candidate_formats(&self, codec: Codec) -> Vec<FormatTag> {
        if !self.codecs.contains(&codec) {
            return Vec::new();
        }
        let mut formats = Vec::with_capacity(self.software_formats.len() + 1);
        if self.hardware {
            formats.push(FormatTag::HardwareSurface);
        }
        formats.extend(self.software_formats.iter().copied());
        formats
    }

    fn open_decoder(&mut self, params: OpenParams) -> Result<Box<dyn EngineDecoder>, EngineError> {
        let hardware = params.format == FormatTag::HardwareSurface;
        let result = if !self.candidate_formats(params.codec).contains(&params.format) {
            Err(EngineError::Fatal(format!(
                "format {} not offered for {}",
                params.format, params.codec
            )))
        } else if hardware && self.fail_hardware_open {
            Err(EngineError::Fatal("hardware decoder refused to open".into()))
        } else if hardware && params.device.is_none() {
            Err(EngineError::Fatal("hardware decode needs a device".into()))
        } else if !hardware && params.allocator.is_none() {
            Err(EngineError::Fatal("software decode needs an allocator".into()))
        } else {
            Ok(())
        };

        lock(&self.opens).push(OpenRecord {
            codec: params.codec,
            format: params.format,
            device: params.device,
            coded_size: params.coded_size,
            thread_count: params.thread_count,
            low_delay: params.low_delay,
            succeeded: result.is_ok(),
        });
        result?;

        let coded = params.coded_size.unwrap_or(self.default_size);
        Ok(Box::new(SyntheticDecoder {
            codec: params.codec,
            format: params.format,
            allocator: params.allocator,
            parser: H264BitstreamParser::new(),
            coded,
            display: coded,
            crop_origin: (0, 0),
            color: None,
            alignment: self.alignment,
            faults: self.faults.clone(),
            pending: VecDeque::new(),
            issued: 0,
        }))
    }
}

struct SyntheticDecoder {
    codec: Codec,
    format: FormatTag,
    allocator: Option<Arc<dyn FrameAllocator>>,
    parser: H264BitstreamParser,
    coded: Dimensions,
    display: Dimensions,
    crop_origin: (u32, u32),
    color: Option<ColorSpace>,
    alignment: u32,
    faults: FaultInjector,
    pending: VecDeque<Picture>,
    issued: u64,
}

impl SyntheticDecoder {
    fn track_stream_size(&mut self, data: &[u8]) {
        if self.codec != Codec::H264 {
            return;
        }
        self.parser.parse_packet(data);
        let Some(sps) = self.parser.active_sps() else {
            return;
        };
        if let (Some(coded), Some(display)) = (sps.coded_dims(), sps.display_dims()) {
            self.coded = coded;
            self.display = display;
            self.crop_origin = (sps.crop_left, sps.crop_top);
            self.color = sps.color_space;
        }
    }

    fn software_picture(
        &mut self,
        data: &[u8],
        opaque: i64,
        fault: Option<SyntheticFault>,
    ) -> Result<Picture, EngineError> {
        let allocator = self
            .allocator
            .as_ref()
            .ok_or_else(|| EngineError::Fatal("no allocator".into()))?;
        let padded_w = self.coded.width().next_multiple_of(self.alignment);
        let padded_h = self.coded.height().next_multiple_of(self.alignment);
        let mut buffer = allocator
            .allocate(self.format, padded_w as i32, padded_h as i32)
            .map_err(|err| EngineError::Fatal(err.to_string()))?;

        let seed = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        for (index, plane) in buffer.planes_mut().into_iter().enumerate() {
            plane.fill(seed.wrapping_add(index as u8 * 64));
        }

        let format = buffer.shape().format;
        let (left, top) = self.crop_origin;
        let mut planes: Vec<PlaneRef> = buffer
            .layout()
            .planes()
            .iter()
            .enumerate()
            .map(|(index, plane)| {
                let (x_bytes, y_rows) = format.plane_extent(index, left, top).unwrap_or((0, 0));
                PlaneRef {
                    offset: plane.offset + y_rows * plane.stride + x_bytes,
                    stride: plane.stride,
                }
            })
            .collect();

        let mut width = self.display.width() as i32;
        match fault {
            Some(SyntheticFault::ShiftLumaOrigin(bytes)) => {
                if let Some(luma) = planes.first_mut() {
                    luma.offset += bytes;
                }
            }
            Some(SyntheticFault::OverstateWidth) => width = padded_w as i32 + 2,
            _ => {}
        }

        Ok(Picture {
            format: self.format,
            width,
            height: self.display.height() as i32,
            opaque,
            color: self.color,
            storage: PictureStorage::Buffer {
                buffer: buffer.share(),
                planes,
            },
        })
    }

    fn hardware_picture(&mut self, opaque: i64) -> Picture {
        let surface = SurfaceHandle(DECODE_SURFACE_BASE + self.issued % DECODE_SURFACE_COUNT);
        self.issued += 1;
        Picture {
            format: self.format,
            width: self.display.width() as i32,
            height: self.display.height() as i32,
            opaque,
            color: self.color,
            storage: PictureStorage::Surface(surface),
        }
    }
}

impl EngineDecoder for SyntheticDecoder {
    fn submit_packet(&mut self, data: &[u8], opaque: i64) -> Result<(), EngineError> {
        let fault = self.faults.next();
        if fault == Some(SyntheticFault::RejectPacket) {
            return Err(EngineError::Fatal("packet rejected".into()));
        }
        if data.is_empty() {
            return Err(EngineError::Fatal("empty packet".into()));
        }
        self.track_stream_size(data);

        let opaque = if fault == Some(SyntheticFault::MismatchOpaque) {
            opaque.wrapping_add(1)
        } else {
            opaque
        };
        let picture = if self.format == FormatTag::HardwareSurface {
            self.hardware_picture(opaque)
        } else {
            self.software_picture(data, opaque, fault)?
        };
        if fault != Some(SyntheticFault::WithholdPicture) {
            self.pending.push_back(picture);
        }
        Ok(())
    }

    fn receive_picture(&mut self) -> Result<Picture, EngineError> {
        self.pending.pop_front().ok_or(EngineError::NeedMorePackets)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLog {
    pub devices_created: usize,
    pub surfaces_created: usize,
    pub created: Vec<(SurfaceHandle, Dimensions)>,
    pub released: Vec<SurfaceHandle>,
    pub copies: usize,
}

impl DeviceLog {
    pub fn live_surfaces(&self) -> usize {
        self.surfaces_created - self.released.len()
    }
}

#[derive(Debug, Default)]
struct GraphicsShared {
    log: DeviceLog,
    fail_next_surface: bool,
    fail_device: bool,
    next_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SyntheticGraphics {
    shared: Arc<Mutex<GraphicsShared>>,
}

impl SyntheticGraphics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> DeviceLog {
        lock(&self.shared).log.clone()
    }

    pub fn fail_next_surface(&self) {
        lock(&self.shared).fail_next_surface = true;
    }

    pub fn fail_device_creation(&self) {
        lock(&self.shared).fail_device = true;
    }
}

impl GraphicsBackend for SyntheticGraphics {
    fn create_device(&self) -> Result<Box<dyn GraphicsDevice>, DecoderError> {
        let mut shared = lock(&self.shared);
        if shared.fail_device {
            return Err(DecoderError::Device("no adapter available".into()));
        }
        shared.log.devices_created += 1;
        let handle = DeviceHandle(shared.log.devices_created as u64);
        Ok(Box::new(SyntheticDevice {
            handle,
            shared: Arc::clone(&self.shared),
            surfaces: HashMap::new(),
        }))
    }
}

struct DeviceSurface {
    desc: SurfaceDesc,
    row_pitch: usize,
    data: Vec<u8>,
}

struct SyntheticDevice {
    handle: DeviceHandle,
    shared: Arc<Mutex<GraphicsShared>>,
    surfaces: HashMap<SurfaceHandle, DeviceSurface>,
}

impl GraphicsDevice for SyntheticDevice {
    fn handle(&self) -> DeviceHandle {
        self.handle
    }

    fn create_surface(&mut self, desc: SurfaceDesc) -> Result<SurfaceHandle, DecoderError> {
        let mut shared = lock(&self.shared);
        if shared.fail_next_surface {
            shared.fail_next_surface = false;
            return Err(DecoderError::Device("out of video memory".into()));
        }
        shared.next_id += 1;
        let handle = SurfaceHandle(0x100 + shared.next_id);
        shared.log.surfaces_created += 1;
        shared.log.created.push((handle, desc.dims));
        drop(shared);

        // NV12: full-height luma rows followed by half-height interleaved chroma rows.
        let row_pitch = desc.dims.width().next_multiple_of(2) as usize;
        let rows = (desc.dims.height() + desc.dims.height().div_ceil(2)) as usize;
        self.surfaces.insert(
            handle,
            DeviceSurface {
                desc,
                row_pitch,
                data: vec![0; row_pitch * rows],
            },
        );
        Ok(handle)
    }

    fn release_surface(&mut self, surface: SurfaceHandle) {
        if self.surfaces.remove(&surface).is_some() {
            lock(&self.shared).log.released.push(surface);
        }
    }

    fn copy_surface(&mut self, src: SurfaceHandle, dst: SurfaceHandle) -> Result<(), DecoderError> {
        let target = self
            .surfaces
            .get_mut(&dst)
            .ok_or_else(|| DecoderError::Device(format!("unknown {dst}")))?;
        target.data.fill(src.0 as u8);
        lock(&self.shared).log.copies += 1;
        Ok(())
    }

    fn map_read(&mut self, surface: SurfaceHandle) -> Result<MappedSurface, DecoderError> {
        let source = self
            .surfaces
            .get(&surface)
            .ok_or_else(|| DecoderError::Device(format!("unknown {surface}")))?;
        Ok(MappedSurface {
            dims: source.desc.dims,
            row_pitch: source.row_pitch,
            data: source.data.clone(),
        })
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        let mut shared = lock(&self.shared);
        for handle in self.surfaces.keys() {
            shared.log.released.push(*handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::FrameBufferPool;

    fn software_params(allocator: Arc<dyn FrameAllocator>) -> OpenParams {
        OpenParams {
            codec: Codec::H264,
            format: FormatTag::Yuv420p,
            device: None,
            allocator: Some(allocator),
            coded_size: None,
            thread_count: 1,
            low_delay: true,
        }
    }

    #[test]
    fn software_decode_reports_display_size_inside_padded_buffer() {
        let pool = FrameBufferPool::new(4);
        let mut engine = SyntheticEngine::new().with_alignment(64);
        let mut decoder = engine.open_decoder(software_params(Arc::new(pool.clone()))).unwrap();
        let writer = H264StreamWriter::new(Dimensions::new(1918, 1080).unwrap());

        decoder.submit_packet(&writer.keyframe(28), 5).unwrap();
        let picture = decoder.receive_picture().unwrap();
        assert_eq!((picture.width, picture.height, picture.opaque), (1918, 1080, 5));
        let PictureStorage::Buffer { buffer, .. } = picture.storage else {
            panic!("expected a buffer picture");
        };
        assert_eq!((buffer.shape().width, buffer.shape().height), (1920, 1088));
        assert!(matches!(
            decoder.receive_picture(),
            Err(EngineError::NeedMorePackets)
        ));
    }

    #[test]
    fn open_is_recorded_with_parameters() {
        let mut engine = SyntheticEngine::new().with_hardware().with_failing_hardware_open();
        let mut params = software_params(Arc::new(FrameBufferPool::new(1)));
        params.format = FormatTag::HardwareSurface;
        params.device = Some(DeviceHandle(1));
        assert!(engine.open_decoder(params).is_err());
        let opens = engine.opens();
        assert_eq!(opens.len(), 1);
        assert!(!opens[0].succeeded && opens[0].low_delay && opens[0].thread_count == 1);
    }

    #[test]
    fn device_drop_releases_leftover_surfaces() {
        let graphics = SyntheticGraphics::new();
        let mut device = graphics.create_device().unwrap();
        let desc = SurfaceDesc {
            dims: Dimensions::new(8, 8).unwrap(),
            format: crate::contract::PixelFormat::Nv12,
            shareable: true,
        };
        device.create_surface(desc).unwrap();
        assert_eq!(graphics.log().live_surfaces(), 1);
        drop(device);
        assert_eq!(graphics.log().live_surfaces(), 0);
    }
}
