use tracing::{debug, warn};

use crate::contract::{
    DecoderError, DeviceHandle, Dimensions, GraphicsBackend, GraphicsDevice, MappedSurface,
    PixelFormat, SurfaceDesc, SurfaceHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSurface {
    pub handle: SurfaceHandle,
    pub dims: Dimensions,
    pub shareable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceStats {
    pub allocations: u64,
    pub releases: u64,
    pub copies: u64,
}

pub struct HardwareSurfaceContext {
    device: Option<Box<dyn GraphicsDevice>>,
    external: bool,
    surface: Option<OutputSurface>,
    stats: SurfaceStats,
}

impl Default for HardwareSurfaceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareSurfaceContext {
    pub fn new() -> Self {
        Self {
            device: None,
            external: false,
            surface: None,
            stats: SurfaceStats::default(),
        }
    }

    pub fn with_device(device: Box<dyn GraphicsDevice>) -> Self {
        Self {
            device: Some(device),
            external: true,
            ..Self::new()
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.device.is_some()
    }

    pub fn has_external_device(&self) -> bool {
        self.external
    }

    pub fn device_handle(&self) -> Option<DeviceHandle> {
        self.device.as_ref().map(|d| d.handle())
    }

    pub fn current_surface(&self) -> Option<OutputSurface> {
        self.surface
    }

    pub fn stats(&self) -> SurfaceStats {
        self.stats
    }

    pub fn initialize(
        &mut self,
        backend: Option<&dyn GraphicsBackend>,
        hint: Option<Dimensions>,
    ) -> Result<DeviceHandle, DecoderError> {
        if self.device.is_none() {
            let backend = backend
                .ok_or_else(|| DecoderError::Device("no graphics backend available".into()))?;
            let device = backend.create_device()?;
            debug!(device = device.handle().0, "graphics device created");
            self.device = Some(device);
        }
        if let Some(dims) = hint {
            self.ensure_surface(dims)?;
        }
        self.device_handle()
            .ok_or_else(|| DecoderError::Device("graphics device missing".into()))
    }

    /// Returns a surface of exactly `dims`, releasing the old one before creating a new one.
    pub fn ensure_surface(&mut self, dims: Dimensions) -> Result<OutputSurface, DecoderError> {
        if let Some(current) = self.surface {
            if current.dims == dims {
                return Ok(current);
            }
        }
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| DecoderError::Device("graphics device not initialized".into()))?;

        if let Some(old) = self.surface.take() {
            device.release_surface(old.handle);
            self.stats.releases += 1;
            debug!(surface = %old.handle, from = %old.dims, to = %dims, "output surface resized");
        }

        let desc = SurfaceDesc {
            dims,
            format: PixelFormat::Nv12,
            shareable: true,
        };
        let handle = device.create_surface(desc).map_err(|err| {
            warn!(%dims, error = %err, "output surface allocation failed");
            DecoderError::SurfaceAllocation(format!("{dims}: {err}"))
        })?;
        self.stats.allocations += 1;
        let surface = OutputSurface {
            handle,
            dims,
            shareable: desc.shareable,
        };
        self.surface = Some(surface);
        Ok(surface)
    }

    pub fn present(
        &mut self,
        source: SurfaceHandle,
        dims: Dimensions,
    ) -> Result<OutputSurface, DecoderError> {
        let output = self.ensure_surface(dims)?;
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| DecoderError::Device("graphics device not initialized".into()))?;
        device.copy_surface(source, output.handle)?;
        self.stats.copies += 1;
        Ok(output)
    }

    pub fn read_back(&mut self) -> Result<MappedSurface, DecoderError> {
        let surface = self
            .surface
            .ok_or_else(|| DecoderError::InvalidArgument("no output surface allocated".into()))?;
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| DecoderError::Device("graphics device not initialized".into()))?;
        device.map_read(surface.handle)
    }

    pub fn release(&mut self) {
        if let Some(old) = self.surface.take() {
            if let Some(device) = self.device.as_mut() {
                device.release_surface(old.handle);
            }
        }
        if !self.external {
            self.device = None;
        }
        self.stats = SurfaceStats::default();
    }
}

impl Drop for HardwareSurfaceContext {
    fn drop(&mut self) {
        self.release();
    }
}
