//! The graphics-context seam every component renders through.
//!
//! A [`Backend`] is a single-threaded, stateful command interface in the shape
//! of a classic GL context: one bound draw framebuffer, one program in use, one
//! texture per sampling unit and a couple of global capabilities. Operations
//! are submitted in order and are logically complete before the next call.
//!
//! Two implementations ship with the crate:
//!
//! - [`WgpuBackend`]: records every clear and draw as its own wgpu render pass
//!   and presents to a window surface.
//! - [`SoftwareBackend`]: a deterministic CPU rasterizer with readback, used
//!   for headless rendering and as the fake GPU in tests.
//!
//! ```text
//!  RenderTarget ──┐
//!  Program ───────┼──▶ Context ──▶ Rc<RefCell<dyn Backend>> ──▶ wgpu | CPU
//!  FullScreenQuad ┘
//! ```

mod software;
mod wgpu_backend;

pub use software::{Fragment, NativeShader, SoftwareBackend};
pub use wgpu_backend::{PRELUDE, WgpuBackend};

use std::borrow::Cow;

use glam::{Vec2, Vec3, Vec4};

use crate::error::{Error, Result};

/// Number of texture sampling units a backend exposes.
pub const MAX_TEXTURE_UNITS: u32 = 16;

/// Maximum number of color attachments on a single framebuffer.
pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// Uniform name carrying the viewport width in pixels.
pub const SCREEN_WIDTH: &str = "screenWidth";

/// Uniform name carrying the viewport height in pixels.
pub const SCREEN_HEIGHT: &str = "screenHeight";

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// The raw backend identifier.
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

handle!(
    /// Opaque handle to a framebuffer object.
    FramebufferId
);
handle!(
    /// Opaque handle to a sampleable texture (color or depth attachment).
    TextureId
);
handle!(
    /// Opaque handle to a linked shader program.
    ProgramId
);
handle!(
    /// Opaque handle to uploaded vertex/index data.
    MeshId
);

/// Monotonic id source shared by a backend's resource tables.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub(crate) fn next(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

/// Storage format of a color attachment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum ColorFormat {
    /// 8-bit normalized RGBA.
    Rgba8,
    /// 16-bit float RGB. Alpha reads back as 1.0.
    #[default]
    Rgb16F,
    /// 16-bit float RGBA.
    Rgba16F,
    /// 32-bit float RGBA.
    Rgba32F,
}

impl ColorFormat {
    /// Whether the format keeps values outside `[0, 1]`.
    pub fn is_hdr(self) -> bool {
        !matches!(self, ColorFormat::Rgba8)
    }

    pub fn has_alpha(self) -> bool {
        !matches!(self, ColorFormat::Rgb16F)
    }
}

/// The depth attachment requested for a framebuffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum DepthAttachment {
    /// No depth attachment.
    None,
    /// A combined depth/stencil buffer that is rendered to but never sampled.
    #[default]
    Renderbuffer,
    /// A sampleable 2D depth texture (shadow map).
    Texture,
    /// A sampleable depth cube map with six layers (omnidirectional shadow map).
    Cube,
}

impl DepthAttachment {
    /// Whether the attachment is exposed as a sampleable texture.
    pub fn is_sampleable(self) -> bool {
        matches!(self, DepthAttachment::Texture | DepthAttachment::Cube)
    }

    /// Number of layers the attachment has.
    pub fn layers(self) -> u32 {
        match self {
            DepthAttachment::Cube => 6,
            _ => 1,
        }
    }
}

/// Everything needed to allocate a framebuffer and its attachments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramebufferDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub color_formats: Vec<ColorFormat>,
    pub depth: DepthAttachment,
}

impl FramebufferDescriptor {
    /// Checks the rules every backend enforces before allocating anything.
    pub fn validate(&self, max_dimension: u32) -> Result<()> {
        let incomplete = |reason: String| Error::IncompleteFramebuffer {
            label: self.label.clone(),
            reason,
        };

        if self.width == 0 || self.height == 0 {
            return Err(incomplete(format!(
                "zero-sized attachments ({}x{})",
                self.width, self.height
            )));
        }
        if self.width > max_dimension || self.height > max_dimension {
            return Err(incomplete(format!(
                "{}x{} exceeds the maximum dimension {}",
                self.width, self.height, max_dimension
            )));
        }
        if self.color_formats.is_empty() && !self.depth.is_sampleable() {
            return Err(incomplete("no color attachments and no depth texture".into()));
        }
        if self.color_formats.len() > MAX_COLOR_ATTACHMENTS {
            return Err(incomplete(format!(
                "{} color attachments requested, at most {} supported",
                self.color_formats.len(),
                MAX_COLOR_ATTACHMENTS
            )));
        }
        if self.depth == DepthAttachment::Cube && self.width != self.height {
            return Err(incomplete(format!(
                "cube faces must be square, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Handles produced by a successful framebuffer allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramebufferAllocation {
    pub id: FramebufferId,
    pub color: Vec<TextureId>,
    /// Present only for sampleable depth attachments.
    pub depth: Option<TextureId>,
}

/// The active draw destination.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum FramebufferBinding {
    /// The window's framebuffer.
    #[default]
    Default,
    /// An offscreen framebuffer; `layer` selects a cube face for layered depth targets.
    Offscreen { id: FramebufferId, layer: u32 },
}

/// Global switches toggled around post-processing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    DepthTest,
    /// Linear-to-sRGB encoding when writing to an sRGB-capable (default) framebuffer.
    FramebufferSrgb,
}

/// Which buffers a clear touches.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Clear {
    pub color: Option<Vec4>,
    pub depth: Option<f32>,
}

impl Clear {
    pub fn color(color: Vec4) -> Self {
        Self {
            color: Some(color),
            depth: None,
        }
    }

    pub fn depth(depth: f32) -> Self {
        Self {
            color: None,
            depth: Some(depth),
        }
    }

    pub fn all(color: Vec4, depth: f32) -> Self {
        Self {
            color: Some(color),
            depth: Some(depth),
        }
    }
}

/// A value assignable to a named program parameter.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UniformValue {
    Int(i32),
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
}

impl UniformValue {
    /// The value widened to four floats, zero-padded.
    pub fn to_vec4(self) -> Vec4 {
        match self {
            UniformValue::Int(v) => Vec4::new(v as f32, 0.0, 0.0, 0.0),
            UniformValue::Float(v) => Vec4::new(v, 0.0, 0.0, 0.0),
            UniformValue::Vec2(v) => v.extend(0.0).extend(0.0),
            UniformValue::Vec3(v) => v.extend(0.0),
            UniformValue::Vec4(v) => v,
        }
    }

    /// The first component as a float.
    pub fn as_f32(self) -> f32 {
        self.to_vec4().x
    }
}

impl From<i32> for UniformValue {
    fn from(v: i32) -> Self {
        UniformValue::Int(v)
    }
}

impl From<u32> for UniformValue {
    fn from(v: u32) -> Self {
        UniformValue::Int(v as i32)
    }
}

impl From<f32> for UniformValue {
    fn from(v: f32) -> Self {
        UniformValue::Float(v)
    }
}

impl From<Vec2> for UniformValue {
    fn from(v: Vec2) -> Self {
        UniformValue::Vec2(v)
    }
}

impl From<Vec3> for UniformValue {
    fn from(v: Vec3) -> Self {
        UniformValue::Vec3(v)
    }
}

impl From<Vec4> for UniformValue {
    fn from(v: Vec4) -> Self {
        UniformValue::Vec4(v)
    }
}

/// The kind of shader a backend executes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderLanguage {
    /// WGSL fragment code compiled by wgpu.
    Wgsl,
    /// Rust closures run per fragment on the CPU.
    Native,
}

/// Fragment code for a program.
#[derive(Clone)]
pub enum ShaderSource {
    /// WGSL defining `fn fs(in: VertexOutput) -> @location(0) vec4<f32>`.
    /// The backend prepends the shared prelude (uniforms, units, vertex stage).
    Wgsl(Cow<'static, str>),
    Native(NativeShader),
}

impl ShaderSource {
    pub fn language(&self) -> ShaderLanguage {
        match self {
            ShaderSource::Wgsl(_) => ShaderLanguage::Wgsl,
            ShaderSource::Native(_) => ShaderLanguage::Native,
        }
    }
}

impl std::fmt::Debug for ShaderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderSource::Wgsl(src) => write!(f, "Wgsl({} bytes)", src.len()),
            ShaderSource::Native(_) => write!(f, "Native"),
        }
    }
}

/// Description of a program to link.
#[derive(Clone, Debug)]
pub struct ProgramDescriptor {
    pub label: String,
    pub source: ShaderSource,
    /// Named parameters in slot order. WGSL reads slot `i` as `u.params[i]`;
    /// `screenWidth`/`screenHeight` are always available as `u.screen_size`.
    pub params: Vec<String>,
    /// Number of color outputs the fragment stage writes. Attachments past this
    /// count are left untouched by draws.
    pub outputs: usize,
}

impl ProgramDescriptor {
    pub fn new(label: impl Into<String>, source: ShaderSource) -> Self {
        Self {
            label: label.into(),
            source,
            params: Vec::new(),
            outputs: 1,
        }
    }

    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(name.into());
        self
    }

    pub fn outputs(mut self, outputs: usize) -> Self {
        self.outputs = outputs;
        self
    }
}

/// Encodes a linear channel value with the sRGB transfer function.
pub(crate) fn linear_to_srgb(c: f32) -> f32 {
    let c = c.clamp(0.0, 1.0);
    if c <= 0.003_130_8 {
        c * 12.92
    } else if c >= 1.0 {
        1.0
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

/// [`linear_to_srgb`] on the color channels; alpha stays linear.
pub(crate) fn encode_srgb(color: Vec4) -> Vec4 {
    Vec4::new(
        linear_to_srgb(color.x),
        linear_to_srgb(color.y),
        linear_to_srgb(color.z),
        color.w,
    )
}

/// Vertex layout used by every mesh drawn through a backend.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ScreenVertex {
    /// Position in normalized device coordinates.
    pub position: [f32; 3],
    pub uv: [f32; 2],
}

impl ScreenVertex {
    pub const fn new(position: [f32; 3], uv: [f32; 2]) -> Self {
        Self { position, uv }
    }

    pub const LAYOUT: wgpu::VertexBufferLayout<'static> = wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<ScreenVertex>() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &[
            // position
            wgpu::VertexAttribute {
                offset: 0,
                shader_location: 0,
                format: wgpu::VertexFormat::Float32x3,
            },
            // uv
            wgpu::VertexAttribute {
                offset: 12,
                shader_location: 1,
                format: wgpu::VertexFormat::Float32x2,
            },
        ],
    };
}

/// Binding state every backend tracks. Mirrors the context-wide GL state.
#[derive(Clone, Debug)]
pub struct BindingState {
    pub framebuffer: FramebufferBinding,
    pub program: Option<ProgramId>,
    pub units: [Option<TextureId>; MAX_TEXTURE_UNITS as usize],
    pub depth_test: bool,
    pub framebuffer_srgb: bool,
}

impl Default for BindingState {
    fn default() -> Self {
        Self {
            framebuffer: FramebufferBinding::Default,
            program: None,
            units: [None; MAX_TEXTURE_UNITS as usize],
            depth_test: true,
            framebuffer_srgb: false,
        }
    }
}

impl BindingState {
    pub(crate) fn capability(&self, cap: Capability) -> bool {
        match cap {
            Capability::DepthTest => self.depth_test,
            Capability::FramebufferSrgb => self.framebuffer_srgb,
        }
    }

    pub(crate) fn set_capability(&mut self, cap: Capability, enabled: bool) {
        match cap {
            Capability::DepthTest => self.depth_test = enabled,
            Capability::FramebufferSrgb => self.framebuffer_srgb = enabled,
        }
    }

    /// Forgets every reference to a deleted texture so a stale unit is never sampled.
    pub(crate) fn forget_texture(&mut self, texture: TextureId) {
        for unit in self.units.iter_mut() {
            if *unit == Some(texture) {
                *unit = None;
            }
        }
    }

    pub(crate) fn forget_framebuffer(&mut self, framebuffer: FramebufferId) {
        if let FramebufferBinding::Offscreen { id, .. } = self.framebuffer {
            if id == framebuffer {
                self.framebuffer = FramebufferBinding::Default;
            }
        }
    }
}

/// A stateful, single-threaded graphics context.
///
/// Binding calls mutate context-wide state exactly like their GL counterparts:
/// callers bind before use and restore the default framebuffer afterwards.
/// [`crate::RenderTarget::bind`] returns a scope that does the restore.
pub trait Backend {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &'static str;

    fn shader_language(&self) -> ShaderLanguage;

    fn state(&self) -> &BindingState;

    fn state_mut(&mut self) -> &mut BindingState;

    /// Current size of the default framebuffer.
    fn surface_size(&self) -> (u32, u32);

    /// Reallocates the default framebuffer. Zero sizes are ignored.
    fn resize_surface(&mut self, width: u32, height: u32);

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor)
    -> Result<FramebufferAllocation>;

    /// Frees the framebuffer and every attachment it owns. Unknown ids are ignored.
    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);

    /// Makes `binding` the draw destination. Idempotent.
    fn bind_framebuffer(&mut self, binding: FramebufferBinding) -> Result<()>;

    /// Copies the depth attachment of `src` into `dst`. Both must have equal sizes.
    fn blit_depth(&mut self, src: FramebufferId, dst: FramebufferId) -> Result<()>;

    /// Size of a live texture, `None` once it has been released.
    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)>;

    fn create_program(&mut self, desc: ProgramDescriptor) -> Result<ProgramId>;

    fn delete_program(&mut self, program: ProgramId);

    /// Sets a named parameter. Names the program does not declare are ignored.
    fn set_uniform(&mut self, program: ProgramId, name: &str, value: UniformValue) -> Result<()>;

    fn create_mesh(&mut self, vertices: &[ScreenVertex], indices: &[u32]) -> Result<MeshId>;

    fn delete_mesh(&mut self, mesh: MeshId);

    /// Draws `mesh` with the program in use into the bound framebuffer.
    fn draw(&mut self, mesh: MeshId) -> Result<()>;

    /// Clears the bound framebuffer.
    fn clear(&mut self, clear: Clear) -> Result<()>;

    /// Submits recorded work and presents the default framebuffer.
    fn finish_frame(&mut self) -> Result<()>;

    fn bound_framebuffer(&self) -> FramebufferBinding {
        self.state().framebuffer
    }

    fn use_program(&mut self, program: ProgramId) {
        self.state_mut().program = Some(program);
    }

    fn current_program(&self) -> Option<ProgramId> {
        self.state().program
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureId) -> Result<()> {
        if unit >= MAX_TEXTURE_UNITS {
            return Err(Error::TextureUnitOutOfRange {
                unit,
                max: MAX_TEXTURE_UNITS,
            });
        }
        if self.texture_size(texture).is_none() {
            return Err(Error::UnknownTexture(texture));
        }
        self.state_mut().units[unit as usize] = Some(texture);
        Ok(())
    }

    /// Empties sampling unit `unit`. Out-of-range units are ignored.
    fn unbind_texture(&mut self, unit: u32) {
        if let Some(slot) = self.state_mut().units.get_mut(unit as usize) {
            *slot = None;
        }
    }

    fn bound_texture(&self, unit: u32) -> Option<TextureId> {
        self.state().units.get(unit as usize).copied().flatten()
    }

    fn set_capability(&mut self, cap: Capability, enabled: bool) {
        self.state_mut().set_capability(cap, enabled);
    }

    fn capability(&self, cap: Capability) -> bool {
        self.state().capability(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(
        width: u32,
        height: u32,
        colors: Vec<ColorFormat>,
        depth: DepthAttachment,
    ) -> FramebufferDescriptor {
        FramebufferDescriptor {
            label: "test".into(),
            width,
            height,
            color_formats: colors,
            depth,
        }
    }

    #[test]
    fn srgb_encoding_keeps_the_range_ends_exact() {
        assert_eq!(linear_to_srgb(0.0), 0.0);
        assert_eq!(linear_to_srgb(1.0), 1.0);
        assert_eq!(linear_to_srgb(4.0), 1.0);
        assert!((linear_to_srgb(0.5) - 0.735_357).abs() < 1e-3);
        assert_eq!(encode_srgb(Vec4::new(1.0, 0.0, 2.0, 0.5)), Vec4::new(1.0, 0.0, 1.0, 0.5));
    }

    #[test]
    fn descriptor_rejects_zero_size() {
        let d = desc(0, 10, vec![ColorFormat::Rgb16F], DepthAttachment::Renderbuffer);
        assert!(matches!(d.validate(4096), Err(Error::IncompleteFramebuffer { .. })));
    }

    #[test]
    fn descriptor_rejects_color_less_non_depth_target() {
        let d = desc(4, 4, vec![], DepthAttachment::Renderbuffer);
        assert!(d.validate(4096).is_err());

        let shadow = desc(4, 4, vec![], DepthAttachment::Texture);
        assert!(shadow.validate(4096).is_ok());
    }

    #[test]
    fn descriptor_rejects_too_many_attachments() {
        let d = desc(
            4,
            4,
            vec![ColorFormat::Rgba8; MAX_COLOR_ATTACHMENTS + 1],
            DepthAttachment::None,
        );
        assert!(d.validate(4096).is_err());
    }

    #[test]
    fn descriptor_rejects_non_square_cube() {
        let d = desc(8, 4, vec![], DepthAttachment::Cube);
        assert!(d.validate(4096).is_err());
        assert!(desc(8, 8, vec![], DepthAttachment::Cube).validate(4096).is_ok());
    }

    #[test]
    fn uniform_values_widen_to_vec4() {
        assert_eq!(UniformValue::from(3).to_vec4(), Vec4::new(3.0, 0.0, 0.0, 0.0));
        assert_eq!(
            UniformValue::from(Vec3::new(1.0, 2.0, 3.0)).to_vec4(),
            Vec4::new(1.0, 2.0, 3.0, 0.0)
        );
        assert_eq!(UniformValue::from(0.5f32).as_f32(), 0.5);
    }

    #[test]
    fn binding_state_forgets_deleted_resources() {
        let mut state = BindingState::default();
        let texture = TextureId(7);
        let framebuffer = FramebufferId(3);
        state.units[2] = Some(texture);
        state.framebuffer = FramebufferBinding::Offscreen {
            id: framebuffer,
            layer: 0,
        };

        state.forget_texture(texture);
        state.forget_framebuffer(framebuffer);

        assert_eq!(state.units[2], None);
        assert_eq!(state.framebuffer, FramebufferBinding::Default);
    }
}
