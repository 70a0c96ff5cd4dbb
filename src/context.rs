//! Shared handle to the active graphics backend.

use std::cell::RefCell;
use std::rc::Rc;

use crate::backend::{Backend, Capability, FramebufferBinding, MAX_TEXTURE_UNITS, ShaderLanguage};
use crate::error::Result;
use crate::target::ActiveTarget;

/// A cloneable handle to one [`Backend`].
///
/// Every GPU resource keeps a clone so it can release itself on drop. The
/// context is single-threaded, like the GL context it models.
#[derive(Clone)]
pub struct Context {
    backend: Rc<RefCell<dyn Backend>>,
}

impl Context {
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            backend: Rc::new(RefCell::new(backend)),
        }
    }

    /// Wraps a backend the caller keeps a typed handle to, e.g. to read back
    /// [`SoftwareBackend`](crate::SoftwareBackend) pixels after rendering.
    pub fn from_shared<B: Backend + 'static>(backend: Rc<RefCell<B>>) -> Self {
        Self { backend }
    }

    /// Runs `f` with exclusive access to the backend.
    ///
    /// # Panics
    ///
    /// Panics if called re-entrantly from inside another `with` closure.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn Backend) -> R) -> R {
        f(&mut *self.backend.borrow_mut())
    }

    /// Binds the default (window) framebuffer.
    pub fn bind_default(&self) -> Result<ActiveTarget<'static>> {
        self.with(|b| b.bind_framebuffer(FramebufferBinding::Default))?;
        Ok(ActiveTarget::default_framebuffer(self.clone()))
    }

    pub fn bound_framebuffer(&self) -> FramebufferBinding {
        self.with(|b| b.bound_framebuffer())
    }

    /// Empties every sampling unit.
    pub fn unbind_textures(&self) {
        self.with(|b| (0..MAX_TEXTURE_UNITS).for_each(|unit| b.unbind_texture(unit)))
    }

    pub fn capability(&self, cap: Capability) -> bool {
        self.with(|b| b.capability(cap))
    }

    pub fn set_capability(&self, cap: Capability, enabled: bool) {
        self.with(|b| b.set_capability(cap, enabled))
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.with(|b| b.surface_size())
    }

    pub fn resize_surface(&self, width: u32, height: u32) {
        self.with(|b| b.resize_surface(width, height))
    }

    /// Submits the frame's work and presents.
    pub fn finish_frame(&self) -> Result<()> {
        self.with(|b| b.finish_frame())
    }

    pub fn shader_language(&self) -> ShaderLanguage {
        self.with(|b| b.shader_language())
    }

    pub fn backend_name(&self) -> &'static str {
        self.with(|b| b.name())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.backend_name())
            .finish()
    }
}

/// Snapshot of the capabilities [`crate::PostProcessing::run`] touches.
///
/// Restores the captured values when dropped, so an early `?` return leaves the
/// context the way it was found.
pub(crate) struct CapabilityGuard {
    ctx: Context,
    depth_test: bool,
    framebuffer_srgb: bool,
}

impl CapabilityGuard {
    pub(crate) fn save(ctx: &Context) -> Self {
        Self {
            ctx: ctx.clone(),
            depth_test: ctx.capability(Capability::DepthTest),
            framebuffer_srgb: ctx.capability(Capability::FramebufferSrgb),
        }
    }
}

impl Drop for CapabilityGuard {
    fn drop(&mut self) {
        self.ctx.set_capability(Capability::DepthTest, self.depth_test);
        self.ctx
            .set_capability(Capability::FramebufferSrgb, self.framebuffer_srgb);
    }
}
