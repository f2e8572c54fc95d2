use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::contract::{DecoderError, FormatTag, FrameAllocator, PixelFormat};
use crate::recycle::{ReturnQueueRx, ReturnQueueTx, return_queue};

pub const DEFAULT_MAX_BUFFERS: usize = 300;

// (w + 128) * (h + 128) must stay below this, matching the engine-side image check.
const MAX_PADDED_AREA: i64 = (i32::MAX / 8) as i64;

pub(crate) fn check_image_size(width: i32, height: i32) -> Result<(), DecoderError> {
    let invalid = DecoderError::InvalidSize {
        width: i64::from(width),
        height: i64::from(height),
    };
    if width <= 0 || height <= 0 {
        return Err(invalid);
    }
    let padded = (i64::from(width) + 128) * (i64::from(height) + 128);
    if padded >= MAX_PADDED_AREA {
        return Err(invalid);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferShape {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub stride: usize,
    pub rows: usize,
}

impl PlaneLayout {
    pub fn len(&self) -> usize {
        self.stride * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn end(&self) -> usize {
        self.offset + self.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferLayout {
    planes: Vec<PlaneLayout>,
    total_len: usize,
}

impl BufferLayout {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        let mut planes = Vec::with_capacity(format.plane_count());
        let mut offset = 0;
        for plane in 0..format.plane_count() {
            let Some((row_bytes, rows)) = format.plane_extent(plane, width, height) else {
                break;
            };
            planes.push(PlaneLayout {
                offset,
                stride: row_bytes,
                rows,
            });
            offset += row_bytes * rows;
        }
        Self {
            planes,
            total_len: offset,
        }
    }

    pub fn planes(&self) -> &[PlaneLayout] {
        &self.planes
    }

    pub fn plane(&self, index: usize) -> Option<&PlaneLayout> {
        self.planes.get(index)
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }
}

struct RecycledBuffer {
    shape: BufferShape,
    data: Box<[u8]>,
}

pub struct FrameBuffer {
    shape: BufferShape,
    layout: Arc<BufferLayout>,
    data: Option<Box<[u8]>>,
    recycler: Option<ReturnQueueTx<RecycledBuffer>>,
}

impl FrameBuffer {
    pub fn shape(&self) -> BufferShape {
        self.shape
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        let plane = self.layout.plane(index)?;
        self.as_bytes().get(plane.offset..plane.end())
    }

    pub fn plane_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let plane = *self.layout.plane(index)?;
        self.data.as_deref_mut()?.get_mut(plane.offset..plane.end())
    }

    pub fn planes_mut(&mut self) -> Vec<&mut [u8]> {
        let layout = Arc::clone(&self.layout);
        let Some(mut rest) = self.data.as_deref_mut() else {
            return Vec::new();
        };
        let mut planes = Vec::with_capacity(layout.planes().len());
        for plane in layout.planes() {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(plane.len());
            planes.push(head);
            rest = tail;
        }
        planes
    }

    #[must_use]
    pub fn share(self) -> SharedFrameBuffer {
        SharedFrameBuffer(Arc::new(self))
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("shape", &self.shape)
            .field("len", &self.as_bytes().len())
            .field("pooled", &self.recycler.is_some())
            .finish()
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let (Some(data), Some(recycler)) = (self.data.take(), self.recycler.take()) {
            // A closed pool hands the storage back and it is freed here.
            let _ = recycler.send(RecycledBuffer {
                shape: self.shape,
                data,
            });
        }
    }
}

#[derive(Debug, Clone)]
pub struct SharedFrameBuffer(Arc<FrameBuffer>);

impl SharedFrameBuffer {
    pub fn shape(&self) -> BufferShape {
        self.0.shape
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.0.layout
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        self.0.plane(index)
    }

    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn storage_id(&self) -> usize {
        self.as_bytes().as_ptr() as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_buffers: usize,
    pub allocated: usize,
    pub in_use: usize,
    pub free: usize,
    pub peak_in_use: usize,
    pub created: u64,
    pub reused: u64,
    pub shapes: usize,
    pub returned_peak: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoolStats(max={}, allocated={}, in_use={}, free={}, peak_in_use={}, created={}, reused={}, shapes={}, returned_peak={})",
            self.max_buffers,
            self.allocated,
            self.in_use,
            self.free,
            self.peak_in_use,
            self.created,
            self.reused,
            self.shapes,
            self.returned_peak
        )
    }
}

struct ShapeEntry {
    layout: Arc<BufferLayout>,
    free: Vec<Box<[u8]>>,
    allocated: usize,
}

struct PoolState {
    shapes: HashMap<BufferShape, ShapeEntry>,
    returns: ReturnQueueRx<RecycledBuffer>,
    max_buffers: usize,
    peak_in_use: usize,
    returned_peak: usize,
    created: u64,
    reused: u64,
}

impl PoolState {
    fn absorb_returns(&mut self) {
        let returned = self.returns.drain();
        self.returned_peak = self.returned_peak.max(returned.len());
        for returned in returned {
            if let Some(entry) = self.shapes.get_mut(&returned.shape) {
                entry.free.push(returned.data);
            }
        }
    }

    fn total_allocated(&self) -> usize {
        self.shapes.values().map(|e| e.allocated).sum()
    }

    fn in_use(&self) -> usize {
        self.shapes.values().map(|e| e.allocated - e.free.len()).sum()
    }

    fn free(&self) -> usize {
        self.shapes.values().map(|e| e.free.len()).sum()
    }

    fn evict_one(&mut self, keep: Option<BufferShape>) -> bool {
        let victim = self
            .shapes
            .iter_mut()
            .filter(|(shape, _)| Some(**shape) != keep)
            .find(|(_, entry)| !entry.free.is_empty());
        match victim {
            Some((_, entry)) => {
                entry.free.pop();
                entry.allocated -= 1;
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct FrameBufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    returns_tx: ReturnQueueTx<RecycledBuffer>,
}

impl Default for FrameBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERS)
    }
}

impl FrameBufferPool {
    pub fn new(max_buffers: usize) -> Self {
        let (returns_tx, returns) = return_queue();
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    shapes: HashMap::new(),
                    returns,
                    max_buffers,
                    peak_in_use: 0,
                    returned_peak: 0,
                    created: 0,
                    reused: 0,
                }),
                returns_tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn allocate_shape(
        &self,
        format: PixelFormat,
        width: i32,
        height: i32,
    ) -> Result<FrameBuffer, DecoderError> {
        check_image_size(width, height)?;
        if format.is_hardware() {
            return Err(DecoderError::InvalidArgument(format!(
                "{format} has no CPU-side layout"
            )));
        }
        let shape = BufferShape {
            format,
            width: width as u32,
            height: height as u32,
        };

        let mut state = self.lock();
        state.absorb_returns();
        let layout = Arc::clone(
            &state
                .shapes
                .entry(shape)
                .or_insert_with(|| ShapeEntry {
                    layout: Arc::new(BufferLayout::new(format, shape.width, shape.height)),
                    free: Vec::new(),
                    allocated: 0,
                })
                .layout,
        );

        let recycled = state.shapes.get_mut(&shape).and_then(|e| e.free.pop());
        let data = match recycled {
            Some(data) => {
                state.reused += 1;
                data
            }
            None => {
                while state.total_allocated() >= state.max_buffers {
                    if !state.evict_one(Some(shape)) {
                        return Err(DecoderError::BufferPoolExhausted(state.in_use()));
                    }
                }
                if let Some(entry) = state.shapes.get_mut(&shape) {
                    entry.allocated += 1;
                }
                state.created += 1;
                vec![0u8; layout.total_len()].into_boxed_slice()
            }
        };

        let in_use = state.in_use();
        state.peak_in_use = state.peak_in_use.max(in_use);
        drop(state);

        Ok(FrameBuffer {
            shape,
            layout,
            data: Some(data),
            recycler: Some(self.shared.returns_tx.clone()),
        })
    }

    /// Changes the buffer cap; refuses to drop below the number of buffers in use.
    pub fn resize(&self, max_buffers: usize) -> Result<(), DecoderError> {
        if max_buffers == 0 {
            return Err(DecoderError::InvalidArgument(
                "buffer pool size must be positive".to_string(),
            ));
        }
        let mut state = self.lock();
        state.absorb_returns();
        let in_use = state.in_use();
        if in_use > max_buffers {
            return Err(DecoderError::InvalidArgument(format!(
                "cannot shrink pool to {max_buffers} buffers while {in_use} are in use"
            )));
        }
        while state.total_allocated() > max_buffers && state.evict_one(None) {}
        state.max_buffers = max_buffers;
        Ok(())
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.absorb_returns();
        state.shapes.retain(|_, entry| {
            entry.allocated -= entry.free.len();
            entry.free.clear();
            entry.allocated > 0
        });
    }

    pub fn max_buffers(&self) -> usize {
        self.lock().max_buffers
    }

    pub fn stats(&self) -> PoolStats {
        let mut state = self.lock();
        state.absorb_returns();
        PoolStats {
            max_buffers: state.max_buffers,
            allocated: state.total_allocated(),
            in_use: state.in_use(),
            free: state.free(),
            peak_in_use: state.peak_in_use,
            created: state.created,
            reused: state.reused,
            shapes: state.shapes.len(),
            returned_peak: state.returned_peak,
        }
    }
}

impl FrameAllocator for FrameBufferPool {
    fn allocate(
        &self,
        format: FormatTag,
        width: i32,
        height: i32,
    ) -> Result<FrameBuffer, DecoderError> {
        let pixel_format = format.pixel_format().ok_or_else(|| {
            DecoderError::InvalidArgument(format!("no buffer layout for format {format}"))
        })?;
        self.allocate_shape(pixel_format, width, height)
    }
}

impl fmt::Debug for FrameBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FrameBufferPool").field(&self.stats()).finish()
    }
}
