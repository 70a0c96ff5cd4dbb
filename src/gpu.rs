//! Window-backed wgpu device and surface.
//!
//! [`GpuContext`] owns the wgpu boilerplate (instance, adapter, device, queue
//! and surface configuration) and is handed to [`WgpuBackend`] which builds the
//! stateful command interface on top of it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use afterglow::{Context, GpuContext, WgpuBackend};
//! # fn run(window: Arc<winit::window::Window>) -> afterglow::Result<()> {
//! let gpu = GpuContext::new(window)?;
//! let ctx = Context::new(WgpuBackend::new(gpu));
//! # Ok(())
//! # }
//! ```
//!
//! [`WgpuBackend`]: crate::WgpuBackend

use std::sync::Arc;
use winit::window::Window;

use crate::error::{Error, Result};

/// Core GPU context holding wgpu resources.
///
/// All fields are public to allow direct access to wgpu APIs when needed.
pub struct GpuContext {
    /// The surface for presenting rendered frames to the window.
    pub surface: wgpu::Surface<'static>,
    /// The logical GPU device for creating resources and pipelines.
    pub device: wgpu::Device,
    /// The command queue for submitting work to the GPU.
    pub queue: wgpu::Queue,
    /// Current surface configuration (format, size, present mode).
    pub config: wgpu::SurfaceConfiguration,
}

impl GpuContext {
    /// Create a new GPU context from a winit window.
    ///
    /// This performs all wgpu initialization:
    /// 1. Creates a wgpu instance with primary backends (Vulkan, Metal, DX12)
    /// 2. Creates a surface for the window
    /// 3. Requests a suitable GPU adapter
    /// 4. Creates the logical device, enabling filterable 32-bit float textures when available
    /// 5. Configures the surface with a linear (non-sRGB) format and Fifo present mode
    ///
    /// The surface format is linear on purpose: output encoding is controlled by
    /// the framebuffer-sRGB capability, which the backend applies in the shader.
    pub fn new(window: Arc<Window>) -> Result<Self> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let surface = instance.create_surface(window)?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))?;
        log::info!("using adapter {:?}", adapter.get_info().name);

        let required_features = adapter.features() & wgpu::Features::FLOAT32_FILTERABLE;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Afterglow Device"),
            required_features,
            required_limits: wgpu::Limits::default(),
            memory_hints: Default::default(),
            trace: Default::default(),
            experimental_features: Default::default(),
        }))?;

        let surface_caps = surface.get_capabilities(&adapter);
        let (surface_format, alpha_mode) =
            choose_surface_format(&surface_caps.formats, &surface_caps.alpha_modes)?;
        log::debug!("surface format {:?}", surface_format);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        Ok(Self {
            surface,
            device,
            queue,
            config,
        })
    }

    /// Resize the surface to new dimensions.
    ///
    /// Ignores zero-sized dimensions (which occur while the window is minimized).
    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.config.width = width;
            self.config.height = height;
            self.surface.configure(&self.device, &self.config);
        }
    }

    /// Reapplies the current configuration after the surface was lost or outdated.
    pub fn reconfigure(&self) {
        self.surface.configure(&self.device, &self.config);
    }

    /// Returns the current surface width in pixels.
    pub fn width(&self) -> u32 {
        self.config.width
    }

    /// Returns the current surface height in pixels.
    pub fn height(&self) -> u32 {
        self.config.height
    }
}

/// Prefers a linear surface format so framebuffer sRGB stays under the
/// pipeline's control. Fails when the surface is incompatible with the adapter.
fn choose_surface_format(
    formats: &[wgpu::TextureFormat],
    alpha_modes: &[wgpu::CompositeAlphaMode],
) -> Result<(wgpu::TextureFormat, wgpu::CompositeAlphaMode)> {
    let format = formats
        .iter()
        .find(|f| !f.is_srgb())
        .or_else(|| formats.first())
        .copied()
        .ok_or(Error::UnsupportedSurface)?;
    let alpha_mode = alpha_modes.first().copied().ok_or(Error::UnsupportedSurface)?;
    Ok((format, alpha_mode))
}
