//! Error type shared by every backend and pipeline component.

use crate::backend::{FramebufferId, MeshId, ProgramId, ShaderLanguage, TextureId};

/// Errors produced while creating or driving GPU resources.
///
/// Resource-creation failures are hard errors: there is no degraded mode for a
/// render target that could not be allocated, so callers get an `Err` at
/// creation time instead of a target that silently renders nothing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The framebuffer could not be completed with the requested attachments.
    #[error("framebuffer '{label}' is incomplete: {reason}")]
    IncompleteFramebuffer { label: String, reason: String },

    #[error("unknown framebuffer {0:?}")]
    UnknownFramebuffer(FramebufferId),

    #[error("unknown texture {0:?}")]
    UnknownTexture(TextureId),

    #[error("unknown program {0:?}")]
    UnknownProgram(ProgramId),

    #[error("unknown mesh {0:?}")]
    UnknownMesh(MeshId),

    #[error("texture unit {unit} is out of range (backend supports {max})")]
    TextureUnitOutOfRange { unit: u32, max: u32 },

    #[error("color attachment {index} is out of range (target has {count})")]
    AttachmentOutOfRange { index: usize, count: usize },

    #[error("render target '{0}' has no sampleable depth texture")]
    NoDepthTexture(String),

    #[error("layer {layer} is out of range (target has {layers})")]
    LayerOutOfRange { layer: u32, layers: u32 },

    /// A draw was issued with no program in use.
    #[error("draw issued with no program in use")]
    NoProgramBound,

    #[error("the {backend} backend cannot run {language:?} shaders")]
    UnsupportedShader {
        backend: &'static str,
        language: ShaderLanguage,
    },

    #[error("invalid mesh: {0}")]
    InvalidMesh(String),

    #[error("depth blit failed: {0}")]
    DepthBlit(String),

    #[error("shader compilation failed for '{label}': {message}")]
    ShaderCompilation { label: String, message: String },

    #[error("failed to acquire surface texture: {0}")]
    Surface(#[from] wgpu::SurfaceError),

    #[error("failed to create surface: {0}")]
    CreateSurface(#[from] wgpu::CreateSurfaceError),

    /// The surface reports no formats or alpha modes for the chosen adapter.
    #[error("surface is not supported by the adapter")]
    UnsupportedSurface,

    #[error("no suitable GPU adapter: {0}")]
    RequestAdapter(#[from] wgpu::RequestAdapterError),

    #[error("failed to create device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    EventLoop(#[from] winit::error::EventLoopError),

    #[error(transparent)]
    Window(#[from] winit::error::OsError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
