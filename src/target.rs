//! Offscreen render targets.
//!
//! A [`RenderTarget`] owns one framebuffer object together with its color
//! attachments and optional depth attachment. Render targets can be both
//! rendered to (after [`RenderTarget::bind`]) and sampled from (after
//! [`RenderTarget::bind_color_texture`]), which is what makes ping-pong
//! post-processing possible: one stage writes target A while reading target B,
//! and the next stage swaps the roles.
//!
//! ```text
//!  RenderTarget::new          color0: Rgb16F     depth: renderbuffer
//!  RenderTarget::with_formats color0..N          depth: renderbuffer
//!  RenderTarget::depth                           depth: 2D texture
//!  RenderTarget::depth_cube                      depth: cube (6 layers)
//! ```

use std::marker::PhantomData;

use glam::Vec4;

use crate::backend::{
    Clear, ColorFormat, DepthAttachment, FramebufferAllocation, FramebufferBinding,
    FramebufferDescriptor, FramebufferId, TextureId,
};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::program::Program;
use crate::quad::FullScreenQuad;

/// An off-screen framebuffer with owned attachments.
///
/// Creation failures surface as `Err`; a `RenderTarget` value always refers to
/// a complete framebuffer. Dropping the target (or calling
/// [`release`](Self::release)) frees the framebuffer and every attachment.
pub struct RenderTarget {
    ctx: Context,
    desc: FramebufferDescriptor,
    alloc: FramebufferAllocation,
}

impl RenderTarget {
    /// Creates a target with one `Rgb16F` color attachment and a depth
    /// renderbuffer, the usual input for post-processing.
    pub fn new(ctx: &Context, width: u32, height: u32) -> Result<Self> {
        Self::with_formats(ctx, width, height, &[ColorFormat::Rgb16F])
    }

    /// Creates a target with one color attachment per entry of `formats`
    /// (multiple render targets) and a depth renderbuffer.
    ///
    /// ```
    /// # use afterglow::{ColorFormat, Context, RenderTarget, SoftwareBackend};
    /// # let ctx = Context::new(SoftwareBackend::new(64, 64));
    /// let gbuffer = RenderTarget::with_formats(
    ///     &ctx,
    ///     64,
    ///     64,
    ///     &[ColorFormat::Rgba32F, ColorFormat::Rgba32F, ColorFormat::Rgba8],
    /// )?;
    /// assert_eq!(gbuffer.color_count(), 3);
    /// # Ok::<(), afterglow::Error>(())
    /// ```
    pub fn with_formats(
        ctx: &Context,
        width: u32,
        height: u32,
        formats: &[ColorFormat],
    ) -> Result<Self> {
        Self::from_descriptor(
            ctx,
            FramebufferDescriptor {
                label: "Render Target".into(),
                width,
                height,
                color_formats: formats.to_vec(),
                depth: DepthAttachment::Renderbuffer,
            },
        )
    }

    /// Creates a depth-only target whose depth texture can be sampled (shadow map).
    pub fn depth(ctx: &Context, width: u32, height: u32) -> Result<Self> {
        Self::from_descriptor(
            ctx,
            FramebufferDescriptor {
                label: "Depth Target".into(),
                width,
                height,
                color_formats: Vec::new(),
                depth: DepthAttachment::Texture,
            },
        )
    }

    /// Creates a depth-only cube target with six square faces.
    ///
    /// Render each face after [`bind_layer`](Self::bind_layer) with the face index
    /// in GL order (+X, -X, +Y, -Y, +Z, -Z).
    pub fn depth_cube(ctx: &Context, size: u32) -> Result<Self> {
        Self::from_descriptor(
            ctx,
            FramebufferDescriptor {
                label: "Depth Cube Target".into(),
                width: size,
                height: size,
                color_formats: Vec::new(),
                depth: DepthAttachment::Cube,
            },
        )
    }

    /// Allocates a target exactly as described.
    pub fn from_descriptor(ctx: &Context, desc: FramebufferDescriptor) -> Result<Self> {
        let alloc = ctx.with(|b| b.create_framebuffer(&desc))?;
        Ok(Self {
            ctx: ctx.clone(),
            desc,
            alloc,
        })
    }

    pub fn id(&self) -> FramebufferId {
        self.alloc.id
    }

    pub fn label(&self) -> &str {
        &self.desc.label
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    pub fn descriptor(&self) -> &FramebufferDescriptor {
        &self.desc
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Makes this target the draw destination.
    ///
    /// The returned [`ActiveTarget`] rebinds whatever was bound before it when it
    /// goes out of scope, so scopes nest. Binding an already bound target is
    /// harmless.
    pub fn bind(&self) -> Result<ActiveTarget<'_>> {
        self.bind_layer(0)
    }

    /// Binds one layer of a layered (cube) target; `0` for ordinary targets.
    pub fn bind_layer(&self, layer: u32) -> Result<ActiveTarget<'_>> {
        let binding = FramebufferBinding::Offscreen {
            id: self.alloc.id,
            layer,
        };
        let previous = self.ctx.bound_framebuffer();
        self.ctx.with(|b| b.bind_framebuffer(binding))?;
        Ok(ActiveTarget {
            ctx: self.ctx.clone(),
            binding,
            width: self.desc.width,
            height: self.desc.height,
            restore: Some(previous),
            _target: PhantomData,
        })
    }

    /// Rebinds the default framebuffer.
    pub fn unbind(ctx: &Context) -> Result<()> {
        ctx.with(|b| b.bind_framebuffer(FramebufferBinding::Default))
    }

    /// The color attachment at `index`, or `None` past the attachment count.
    pub fn color_texture(&self, index: usize) -> Option<TextureId> {
        self.alloc.color.get(index).copied()
    }

    pub fn color_count(&self) -> usize {
        self.alloc.color.len()
    }

    /// Binds color attachment `index` to sampling unit `unit`.
    pub fn bind_color_texture(&self, unit: u32, index: usize) -> Result<()> {
        let texture = self
            .color_texture(index)
            .ok_or(Error::AttachmentOutOfRange {
                index,
                count: self.alloc.color.len(),
            })?;
        self.ctx.with(|b| b.bind_texture(unit, texture))
    }

    /// The sampleable depth texture of a [`depth`](Self::depth) or
    /// [`depth_cube`](Self::depth_cube) target.
    pub fn depth_texture(&self) -> Option<TextureId> {
        self.alloc.depth
    }

    pub fn bind_depth_texture(&self, unit: u32) -> Result<()> {
        let texture = self
            .depth_texture()
            .ok_or_else(|| Error::NoDepthTexture(self.desc.label.clone()))?;
        self.ctx.with(|b| b.bind_texture(unit, texture))
    }

    /// Copies this target's depth buffer into `dst`, e.g. to forward-render on
    /// top of a deferred G-buffer with correct occlusion.
    pub fn blit_depth_to(&self, dst: &RenderTarget) -> Result<()> {
        self.ctx.with(|b| b.blit_depth(self.alloc.id, dst.alloc.id))
    }

    /// Reallocates the target when its size differs from `width` x `height`.
    ///
    /// The new framebuffer is created before the old one is released, so on
    /// error the target still refers to its previous allocation. Returns whether
    /// a reallocation happened.
    pub fn ensure_size(&mut self, width: u32, height: u32) -> Result<bool> {
        if self.size() == (width, height) {
            return Ok(false);
        }
        let desc = FramebufferDescriptor {
            width,
            height,
            ..self.desc.clone()
        };
        let alloc = self.ctx.with(|b| b.create_framebuffer(&desc))?;
        let old = std::mem::replace(&mut self.alloc, alloc);
        self.ctx.with(|b| b.delete_framebuffer(old.id));
        log::debug!(
            "resized '{}' from {}x{} to {}x{}",
            self.desc.label,
            self.desc.width,
            self.desc.height,
            width,
            height
        );
        self.desc = desc;
        Ok(true)
    }

    /// Frees the framebuffer and its attachments now. Equivalent to dropping.
    pub fn release(self) {}
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        self.ctx.with(|b| b.delete_framebuffer(self.alloc.id));
    }
}

impl std::fmt::Debug for RenderTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTarget")
            .field("label", &self.desc.label)
            .field("id", &self.alloc.id)
            .field("size", &self.size())
            .finish()
    }
}

/// The currently bound draw destination.
///
/// Obtained from [`RenderTarget::bind`] or [`Context::bind_default`]. When an
/// offscreen binding ends, the binding that was active before it is restored,
/// so scopes nest. `clear` and `draw` always address this scope's own target.
pub struct ActiveTarget<'a> {
    ctx: Context,
    binding: FramebufferBinding,
    width: u32,
    height: u32,
    restore: Option<FramebufferBinding>,
    _target: PhantomData<&'a RenderTarget>,
}

impl ActiveTarget<'static> {
    pub(crate) fn default_framebuffer(ctx: Context) -> Self {
        let (width, height) = ctx.surface_size();
        Self {
            ctx,
            binding: FramebufferBinding::Default,
            width,
            height,
            restore: None,
            _target: PhantomData,
        }
    }
}

impl ActiveTarget<'_> {
    /// Viewport size of the bound target.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The binding this scope draws into.
    pub fn binding(&self) -> FramebufferBinding {
        self.binding
    }

    /// Clears color and depth (to 1.0), like `glClear(COLOR | DEPTH)`.
    pub fn clear(&self, color: Vec4) -> Result<()> {
        self.submit(Clear::all(color, 1.0))
    }

    pub fn clear_color(&self, color: Vec4) -> Result<()> {
        self.submit(Clear::color(color))
    }

    pub fn clear_depth(&self, depth: f32) -> Result<()> {
        self.submit(Clear::depth(depth))
    }

    fn submit(&self, clear: Clear) -> Result<()> {
        self.ctx.with(|b| {
            b.bind_framebuffer(self.binding)?;
            b.clear(clear)
        })
    }

    /// Draws `quad` with `program` into this target.
    pub fn draw(&self, quad: &FullScreenQuad, program: &Program) -> Result<()> {
        self.ctx.with(|b| b.bind_framebuffer(self.binding))?;
        quad.draw(program)
    }
}

impl Drop for ActiveTarget<'_> {
    fn drop(&mut self) {
        let Some(previous) = self.restore else { return };
        self.ctx.with(|b| {
            // A previous target released in the meantime falls back to the window.
            if b.bind_framebuffer(previous).is_err() {
                let _ = b.bind_framebuffer(FramebufferBinding::Default);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NativeShader, SoftwareBackend};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn setup(width: u32, height: u32) -> (Rc<RefCell<SoftwareBackend>>, Context) {
        let soft = Rc::new(RefCell::new(SoftwareBackend::new(width, height)));
        let ctx = Context::from_shared(soft.clone());
        (soft, ctx)
    }

    #[test]
    fn default_target_has_one_hdr_attachment() {
        let (soft, ctx) = setup(16, 16);
        let target = RenderTarget::new(&ctx, 8, 4).unwrap();

        assert_eq!(target.size(), (8, 4));
        assert_eq!(target.color_count(), 1);
        assert!(target.color_texture(0).is_some());
        assert!(target.color_texture(1).is_none());
        assert!(target.depth_texture().is_none());
        assert_eq!(soft.borrow().live_framebuffers(), 1);
    }

    #[test]
    fn creation_failures_are_errors() {
        let (soft, ctx) = setup(16, 16);
        assert!(matches!(
            RenderTarget::new(&ctx, 0, 4),
            Err(Error::IncompleteFramebuffer { .. })
        ));
        assert!(RenderTarget::with_formats(&ctx, 4, 4, &[]).is_err());

        let small = Rc::new(RefCell::new(SoftwareBackend::new(4, 4).with_max_dimension(32)));
        let limited = Context::from_shared(small);
        assert!(RenderTarget::new(&limited, 64, 8).is_err());
        assert_eq!(soft.borrow().live_framebuffers(), 0);
    }

    #[test]
    fn bind_scope_restores_default_framebuffer() {
        let (_soft, ctx) = setup(16, 16);
        let target = RenderTarget::new(&ctx, 4, 4).unwrap();
        {
            let active = target.bind().unwrap();
            assert_eq!(active.size(), (4, 4));
            assert_eq!(
                ctx.bound_framebuffer(),
                FramebufferBinding::Offscreen {
                    id: target.id(),
                    layer: 0
                }
            );
            // Binding again while bound is harmless.
            let again = target.bind().unwrap();
            drop(again);
        }
        assert_eq!(ctx.bound_framebuffer(), FramebufferBinding::Default);
    }

    #[test]
    fn nested_scopes_keep_drawing_into_the_outer_target() {
        let (soft, ctx) = setup(4, 4);
        let quad = FullScreenQuad::new(&ctx).unwrap();
        let white = Program::native(&ctx, "white", NativeShader::new(|_| Vec4::ONE)).unwrap();
        let a = RenderTarget::new(&ctx, 4, 4).unwrap();
        let b = RenderTarget::new(&ctx, 4, 4).unwrap();

        let outer = a.bind().unwrap();
        outer.clear(Vec4::new(0.0, 0.0, 0.0, 1.0)).unwrap();
        {
            let inner = b.bind().unwrap();
            inner.clear(Vec4::new(0.0, 0.0, 0.0, 1.0)).unwrap();
        }
        assert_eq!(ctx.bound_framebuffer(), outer.binding());
        outer.draw(&quad, &white).unwrap();
        drop(outer);

        assert_eq!(ctx.bound_framebuffer(), FramebufferBinding::Default);
        let soft = soft.borrow();
        assert_eq!(soft.texture_pixel(a.color_texture(0).unwrap(), 1, 1), Some(Vec4::ONE));
        assert_eq!(soft.surface_pixel(1, 1), Vec4::ZERO);
    }

    #[test]
    fn scopes_rebind_their_target_before_drawing() {
        let (soft, ctx) = setup(4, 4);
        let quad = FullScreenQuad::new(&ctx).unwrap();
        let white = Program::native(&ctx, "white", NativeShader::new(|_| Vec4::ONE)).unwrap();
        let a = RenderTarget::new(&ctx, 4, 4).unwrap();

        let active = a.bind().unwrap();
        RenderTarget::unbind(&ctx).unwrap();
        active.clear(Vec4::new(0.0, 0.0, 0.0, 1.0)).unwrap();
        active.draw(&quad, &white).unwrap();

        let soft = soft.borrow();
        assert_eq!(soft.texture_pixel(a.color_texture(0).unwrap(), 2, 2), Some(Vec4::ONE));
        assert_eq!(soft.surface_pixel(2, 2), Vec4::ZERO);
    }

    #[test]
    fn attachment_lookups_are_checked() {
        let (_soft, ctx) = setup(16, 16);
        let target = RenderTarget::new(&ctx, 4, 4).unwrap();
        assert!(matches!(
            target.bind_color_texture(0, 1),
            Err(Error::AttachmentOutOfRange { index: 1, count: 1 })
        ));
        assert!(matches!(
            target.bind_color_texture(99, 0),
            Err(Error::TextureUnitOutOfRange { .. })
        ));
        assert!(matches!(
            target.bind_depth_texture(0),
            Err(Error::NoDepthTexture(_))
        ));
        target.bind_color_texture(3, 0).unwrap();
        assert_eq!(ctx.with(|b| b.bound_texture(3)), target.color_texture(0));
    }

    #[test]
    fn ensure_size_reallocates_only_on_mismatch() {
        let (soft, ctx) = setup(16, 16);
        let mut target = RenderTarget::new(&ctx, 4, 4).unwrap();
        let before = target.color_texture(0).unwrap();

        assert!(!target.ensure_size(4, 4).unwrap());
        assert_eq!(target.color_texture(0), Some(before));

        assert!(target.ensure_size(6, 3).unwrap());
        let after = target.color_texture(0).unwrap();
        assert_ne!(before, after);
        assert_eq!(ctx.with(|b| b.texture_size(after)), Some((6, 3)));
        assert_eq!(ctx.with(|b| b.texture_size(before)), None);
        assert_eq!(soft.borrow().live_framebuffers(), 1);
    }

    #[test]
    fn failed_resize_keeps_previous_allocation() {
        let (soft, ctx) = setup(16, 16);
        let mut target = RenderTarget::new(&ctx, 4, 4).unwrap();
        assert!(target.ensure_size(0, 4).is_err());
        assert_eq!(target.size(), (4, 4));
        assert!(ctx.with(|b| b.texture_size(target.color_texture(0).unwrap())).is_some());
        assert_eq!(soft.borrow().live_framebuffers(), 1);
    }

    #[test]
    fn drop_and_release_free_everything() {
        let (soft, ctx) = setup(16, 16);
        let a = RenderTarget::new(&ctx, 4, 4).unwrap();
        let b = RenderTarget::depth(&ctx, 4, 4).unwrap();
        assert_eq!(soft.borrow().live_framebuffers(), 2);

        a.release();
        assert_eq!(soft.borrow().live_framebuffers(), 1);
        drop(b);
        assert_eq!(soft.borrow().live_framebuffers(), 0);
        assert_eq!(soft.borrow().live_textures(), 0);
    }

    #[test]
    fn shadow_targets_expose_depth() {
        let (_soft, ctx) = setup(16, 16);
        let shadow = RenderTarget::depth(&ctx, 8, 8).unwrap();
        assert_eq!(shadow.color_count(), 0);
        shadow.bind_depth_texture(4).unwrap();

        let cube = RenderTarget::depth_cube(&ctx, 8).unwrap();
        assert!(cube.depth_texture().is_some());
        for face in 0..6 {
            let active = cube.bind_layer(face).unwrap();
            active.clear_depth(1.0).unwrap();
        }
        assert!(matches!(
            cube.bind_layer(6),
            Err(Error::LayerOutOfRange { layer: 6, layers: 6 })
        ));
    }

    #[test]
    fn depth_blit_copies_occlusion() {
        let (soft, ctx) = setup(4, 4);
        let quad = FullScreenQuad::new(&ctx).unwrap();
        let white = Program::native(&ctx, "white", NativeShader::new(|_| Vec4::ONE)).unwrap();

        let gbuffer = RenderTarget::new(&ctx, 4, 4).unwrap();
        let forward = RenderTarget::new(&ctx, 4, 4).unwrap();
        {
            // Depth 0.5 everywhere in the G-buffer.
            let active = gbuffer.bind().unwrap();
            active.clear(Vec4::ZERO).unwrap();
            active.draw(&quad, &white).unwrap();
        }
        {
            let active = forward.bind().unwrap();
            active.clear(Vec4::ZERO).unwrap();
        }
        gbuffer.blit_depth_to(&forward).unwrap();
        {
            // The same depth fails the Less test after the blit.
            let active = forward.bind().unwrap();
            active.draw(&quad, &white).unwrap();
        }
        let texel = soft
            .borrow()
            .texture_pixel(forward.color_texture(0).unwrap(), 1, 1)
            .unwrap();
        assert_eq!(texel, Vec4::new(0.0, 0.0, 0.0, 1.0));

        let mismatched = RenderTarget::new(&ctx, 2, 2).unwrap();
        assert!(matches!(
            gbuffer.blit_depth_to(&mismatched),
            Err(Error::DepthBlit(_))
        ));
    }

    #[test]
    fn multiple_render_targets_receive_their_outputs() {
        let (soft, ctx) = setup(4, 4);
        let quad = FullScreenQuad::new(&ctx).unwrap();
        let gbuffer = RenderTarget::with_formats(
            &ctx,
            4,
            4,
            &[ColorFormat::Rgba32F, ColorFormat::Rgba8],
        )
        .unwrap();
        let program = Program::new(
            &ctx,
            crate::ProgramDescriptor::new(
                "gbuffer",
                crate::ShaderSource::Native(NativeShader::multi(|_, out| {
                    out[0] = Vec4::new(2.0, 0.0, 0.0, 1.0);
                    out[1] = Vec4::new(0.0, 1.0, 0.0, 1.0);
                })),
            )
            .outputs(2),
        )
        .unwrap();

        {
            let active = gbuffer.bind().unwrap();
            active.clear(Vec4::ZERO).unwrap();
            active.draw(&quad, &program).unwrap();
        }
        let soft = soft.borrow();
        assert_eq!(
            soft.texture_pixel(gbuffer.color_texture(0).unwrap(), 0, 0),
            Some(Vec4::new(2.0, 0.0, 0.0, 1.0))
        );
        assert_eq!(
            soft.texture_pixel(gbuffer.color_texture(1).unwrap(), 3, 3),
            Some(Vec4::new(0.0, 1.0, 0.0, 1.0))
        );
    }
}
