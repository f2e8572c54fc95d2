use std::fmt;

use crate::buffer_pool::SharedFrameBuffer;
use crate::contract::{
    ColorSpace, DecoderError, Dimensions, PixelFormat, PlaneRef, RtpTimestamp, SurfaceHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneWindow {
    pub offset: usize,
    pub stride: usize,
    pub row_bytes: usize,
    pub rows: usize,
}

#[derive(Clone)]
pub struct CroppedBuffer {
    buffer: SharedFrameBuffer,
    dims: Dimensions,
    crop: CropRect,
    planes: Vec<PlaneWindow>,
}

impl CroppedBuffer {
    /// Checks every reported plane against the allocation before wrapping it.
    pub(crate) fn wrap(
        buffer: SharedFrameBuffer,
        reported: &[PlaneRef],
        width: i32,
        height: i32,
    ) -> Result<Self, DecoderError> {
        let dims = Dimensions::from_i32(width, height).ok_or_else(|| {
            DecoderError::CorruptPicture(format!("reported size {width}x{height}"))
        })?;
        let shape = buffer.shape();
        let format = shape.format;
        if dims.width() > shape.width || dims.height() > shape.height {
            return Err(DecoderError::CorruptPicture(format!(
                "reported size {dims} exceeds buffer {}x{}",
                shape.width, shape.height
            )));
        }
        let layout = buffer.layout();
        if reported.len() != layout.planes().len() {
            return Err(DecoderError::CorruptPicture(format!(
                "{} planes reported for {format}, expected {}",
                reported.len(),
                layout.planes().len()
            )));
        }

        let mut planes = Vec::with_capacity(reported.len());
        for (index, (plane, allocated)) in reported.iter().zip(layout.planes()).enumerate() {
            let (row_bytes, rows) = format
                .plane_extent(index, dims.width(), dims.height())
                .ok_or_else(|| DecoderError::CorruptPicture(format!("no plane {index}")))?;
            let allocated_end = allocated.end();
            let reported_end = plane
                .stride
                .checked_mul(rows)
                .and_then(|len| len.checked_add(plane.offset));
            let in_bounds = plane.offset >= allocated.offset
                && plane.stride >= row_bytes
                && reported_end.is_some_and(|end| end <= allocated_end);
            if !in_bounds {
                return Err(DecoderError::CorruptPicture(format!(
                    "plane {index} origin {} stride {} rows {rows} outside allocation {}..{}",
                    plane.offset, plane.stride, allocated.offset, allocated_end
                )));
            }
            planes.push(PlaneWindow {
                offset: plane.offset,
                stride: plane.stride,
                row_bytes,
                rows,
            });
        }

        let luma = planes[0];
        let delta = luma.offset - layout.planes()[0].offset;
        let crop = CropRect {
            x: ((delta % luma.stride) / format.bytes_per_sample()) as u32,
            y: (delta / luma.stride) as u32,
            width: dims.width(),
            height: dims.height(),
        };

        Ok(Self {
            buffer,
            dims,
            crop,
            planes,
        })
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    pub fn format(&self) -> PixelFormat {
        self.buffer.shape().format
    }

    pub fn crop(&self) -> CropRect {
        self.crop
    }

    pub fn buffer(&self) -> &SharedFrameBuffer {
        &self.buffer
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, index: usize) -> Option<PlaneWindow> {
        self.planes.get(index).copied()
    }

    pub fn row(&self, plane: usize, y: usize) -> Option<&[u8]> {
        let window = self.planes.get(plane)?;
        if y >= window.rows {
            return None;
        }
        let start = window.offset + y * window.stride;
        self.buffer.as_bytes().get(start..start + window.row_bytes)
    }

    pub fn rows(&self, plane: usize) -> impl Iterator<Item = &[u8]> + '_ {
        let count = self.planes.get(plane).map_or(0, |w| w.rows);
        (0..count).filter_map(move |y| self.row(plane, y))
    }

    pub fn copy_plane(&self, plane: usize) -> Vec<u8> {
        self.rows(plane).flatten().copied().collect()
    }
}

impl fmt::Debug for CroppedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CroppedBuffer")
            .field("format", &self.format())
            .field("dims", &self.dims)
            .field("crop", &self.crop)
            .field("planes", &self.planes)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum DecodedFrame {
    Software {
        buffer: CroppedBuffer,
        timestamp: RtpTimestamp,
        color_space: Option<ColorSpace>,
    },
    Hardware {
        surface: SurfaceHandle,
        dims: Dimensions,
        timestamp: RtpTimestamp,
        color_space: Option<ColorSpace>,
    },
}

impl DecodedFrame {
    pub fn timestamp(&self) -> RtpTimestamp {
        match self {
            Self::Software { timestamp, .. } | Self::Hardware { timestamp, .. } => *timestamp,
        }
    }

    pub fn dims(&self) -> Dimensions {
        match self {
            Self::Software { buffer, .. } => buffer.dims(),
            Self::Hardware { dims, .. } => *dims,
        }
    }

    pub fn pixel_format(&self) -> PixelFormat {
        match self {
            Self::Software { buffer, .. } => buffer.format(),
            Self::Hardware { .. } => PixelFormat::Surface,
        }
    }

    pub fn color_space(&self) -> Option<ColorSpace> {
        match self {
            Self::Software { color_space, .. } | Self::Hardware { color_space, .. } => {
                *color_space
            }
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Hardware { .. })
    }

    pub fn as_software(&self) -> Option<&CroppedBuffer> {
        match self {
            Self::Software { buffer, .. } => Some(buffer),
            Self::Hardware { .. } => None,
        }
    }

    pub fn surface(&self) -> Option<SurfaceHandle> {
        match self {
            Self::Hardware { surface, .. } => Some(*surface),
            Self::Software { .. } => None,
        }
    }
}

impl fmt::Display for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DecodedFrame({} {} {})",
            self.pixel_format(),
            self.dims(),
            self.timestamp()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::FrameBufferPool;
    use crate::contract::{FormatTag, FrameAllocator};

    fn filled_i420(width: i32, height: i32) -> SharedFrameBuffer {
        let pool = FrameBufferPool::new(2);
        let mut buffer = pool.allocate_shape(PixelFormat::I420, width, height).unwrap();
        let stride = width as usize;
        let luma = buffer.plane_mut(0).unwrap();
        for (y, row) in luma.chunks_mut(stride).enumerate() {
            for (x, px) in row.iter_mut().enumerate() {
                *px = (x + y) as u8;
            }
        }
        buffer.share()
    }

    fn planes_of(buffer: &SharedFrameBuffer) -> Vec<PlaneRef> {
        buffer
            .layout()
            .planes()
            .iter()
            .map(|p| PlaneRef {
                offset: p.offset,
                stride: p.stride,
            })
            .collect()
    }

    #[test]
    fn full_size_picture_has_zero_crop_origin() {
        let buffer = filled_i420(64, 32);
        let planes = planes_of(&buffer);
        let cropped = CroppedBuffer::wrap(buffer, &planes, 64, 32).unwrap();
        assert_eq!(cropped.crop(), CropRect { x: 0, y: 0, width: 64, height: 32 });
        assert_eq!(cropped.plane(1).unwrap().rows, 16);
    }

    #[test]
    fn narrower_report_shares_padded_stride() {
        let buffer = filled_i420(64, 32);
        let storage = buffer.storage_id();
        let planes = planes_of(&buffer);
        let cropped = CroppedBuffer::wrap(buffer, &planes, 62, 30).unwrap();
        let luma = cropped.plane(0).unwrap();
        assert_eq!((luma.stride, luma.row_bytes, luma.rows), (64, 62, 30));
        assert_eq!(cropped.plane(2).unwrap().row_bytes, 31);
        assert_eq!(&cropped.row(0, 3).unwrap()[..3], &[3u8, 4, 5]);
        assert_eq!(cropped.buffer().storage_id(), storage);
        assert_eq!(cropped.copy_plane(1).len(), 31 * 15);
    }

    #[test]
    fn shifted_origin_becomes_crop_offset() {
        let buffer = filled_i420(64, 32);
        let mut planes = planes_of(&buffer);
        planes[0].offset += 2 * 64 + 4;
        planes[1].offset += 32 + 2;
        planes[2].offset += 32 + 2;
        let cropped = CroppedBuffer::wrap(buffer, &planes, 56, 28).unwrap();
        assert_eq!((cropped.crop().x, cropped.crop().y), (4, 2));
        assert_eq!(cropped.row(0, 0).unwrap()[0], 6);
    }

    #[test]
    fn origin_past_plane_end_is_corrupt() {
        let buffer = filled_i420(64, 32);
        let mut planes = planes_of(&buffer);
        planes[0].offset += 64;
        let err = CroppedBuffer::wrap(buffer, &planes, 64, 32).unwrap_err();
        assert!(matches!(err, DecoderError::CorruptPicture(_)));
    }

    #[test]
    fn origin_before_plane_start_is_corrupt() {
        let buffer = filled_i420(64, 32);
        let mut planes = planes_of(&buffer);
        planes[2].offset = planes[1].offset;
        assert!(CroppedBuffer::wrap(buffer, &planes, 64, 32).is_err());
    }

    #[test]
    fn oversized_report_is_corrupt() {
        let buffer = filled_i420(64, 32);
        let planes = planes_of(&buffer);
        assert!(CroppedBuffer::wrap(buffer.clone(), &planes, 66, 32).is_err());
        assert!(CroppedBuffer::wrap(buffer.clone(), &planes, 64, 0).is_err());
        assert!(CroppedBuffer::wrap(buffer, &planes[..2], 64, 32).is_err());
    }

    #[test]
    fn ten_bit_crop_offset_counts_samples() {
        let pool = FrameBufferPool::new(1);
        let buffer = pool.allocate(FormatTag::Yuv420p10, 32, 16).unwrap().share();
        let mut planes = planes_of(&buffer);
        planes[0].offset += 2 * 64 + 2 * 4;
        planes[1].offset += 32 + 2 * 2;
        planes[2].offset += 32 + 2 * 2;
        let cropped = CroppedBuffer::wrap(buffer, &planes, 28, 12).unwrap();
        assert_eq!((cropped.crop().x, cropped.crop().y), (4, 2));
        assert_eq!(cropped.plane(0).unwrap().row_bytes, 56);
    }

    #[test]
    fn frame_accessors_cover_both_paths() {
        let buffer = filled_i420(16, 16);
        let planes = planes_of(&buffer);
        let software = DecodedFrame::Software {
            buffer: CroppedBuffer::wrap(buffer, &planes, 16, 16).unwrap(),
            timestamp: RtpTimestamp(90),
            color_space: None,
        };
        let hardware = DecodedFrame::Hardware {
            surface: SurfaceHandle(4),
            dims: Dimensions::new(16, 16).unwrap(),
            timestamp: RtpTimestamp(180),
            color_space: Some(ColorSpace::bt709()),
        };
        assert_eq!(software.pixel_format(), PixelFormat::I420);
        assert!(software.as_software().is_some() && software.surface().is_none());
        assert_eq!(hardware.surface(), Some(SurfaceHandle(4)));
        assert_eq!(hardware.to_string(), "DecodedFrame(surface 16x16 180@rtp)");
    }
}
