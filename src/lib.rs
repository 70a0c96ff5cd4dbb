//! # Afterglow
//!
//! **Ping-pong post-processing chains over offscreen render targets.**
//!
//! Render your scene into the pipeline's input target, add stages, and call
//! [`PostProcessing::run`]. Each stage reads the previous result and writes
//! the other of two buffers; a final program presents the last one.
//!
//! ## Quick Start
//!
//! ```
//! use std::rc::Rc;
//! use afterglow::*;
//!
//! # fn main() -> afterglow::Result<()> {
//! let ctx = Context::new(SoftwareBackend::new(64, 64));
//! let tone_map = Rc::new(Effect::ToneMapAces.program(&ctx)?);
//!
//! let mut post = PostProcessing::new(&ctx, 64, 64, tone_map)?;
//! post.add_stage(Bloom::new(&ctx, 64, 64, 5)?)
//!     .add_stage(make_shader_stage(Rc::new(Effect::Grayscale.program(&ctx)?)));
//!
//! {
//!     let scene = post.bind_input_target()?;
//!     scene.clear(Vec4::new(4.0, 2.0, 1.0, 1.0))?;
//! }
//! post.run()?;
//! ctx.finish_frame()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - [`WgpuBackend`] renders through wgpu into a window surface; programs are WGSL.
//! - [`SoftwareBackend`] rasterizes on the CPU; programs are [`NativeShader`]
//!   closures. Use it for tests and headless rendering.
//!
//! [`Effect`] ships both flavours of every built-in program and picks the one
//! the backend understands.

mod app;
pub mod backend;
mod bloom;
mod config;
mod context;
mod effects;
mod error;
mod gpu;
mod post_process;
mod program;
mod quad;
mod stage;
mod target;

pub use app::{Demo, render_png, run, run_with_config};
pub use backend::{
    Backend, Capability, ColorFormat, DepthAttachment, Fragment, FramebufferBinding,
    FramebufferDescriptor, FramebufferId, MeshId, NativeShader, ProgramDescriptor, ProgramId,
    ShaderLanguage, ShaderSource, SoftwareBackend, TextureId, UniformValue, WgpuBackend,
};
pub use bloom::Bloom;
pub use config::{AppConfig, PostProcessingConfig};
pub use context::Context;
pub use effects::{DEFAULT_BLOOM_THRESHOLD, Effect, GAUSSIAN_WEIGHTS, LUMA};
pub use error::{Error, Result};
pub use gpu::GpuContext;
pub use post_process::PostProcessing;
pub use program::Program;
pub use quad::{FullScreenQuad, QUAD_INDICES, QUAD_VERTICES};
pub use stage::{ShaderStage, Stage, make_shader_stage};
pub use target::{ActiveTarget, RenderTarget};

// Re-export glam math types for convenience
pub use glam::{Vec2, Vec3, Vec4};
