//! The stage contract and the single-shader stage.

use std::rc::Rc;

use glam::Vec4;

use crate::error::Result;
use crate::program::Program;
use crate::quad::FullScreenQuad;
use crate::target::RenderTarget;

/// One unit of work in a [`PostProcessing`](crate::PostProcessing) chain.
///
/// A stage reads the previous result from `read` and writes its own into
/// `write`. It may bind any number of programs, textures and intermediate
/// targets in between, as long as it returns with the default framebuffer
/// bound. Binding `write` through [`RenderTarget::bind`] takes care of that,
/// since the returned scope restores the default framebuffer.
///
/// # Execution Flow
///
/// ```text
/// stage 0: framebuffers[0] -> framebuffers[1]
/// stage 1: framebuffers[1] -> framebuffers[0]
/// stage 2: framebuffers[0] -> framebuffers[1]
/// final:   framebuffers[read] -> screen
/// ```
///
/// Closures with the matching signature are stages too:
///
/// ```
/// # use afterglow::{FullScreenQuad, RenderTarget, Stage};
/// let mut passthrough = |_read: &RenderTarget,
///                         write: &RenderTarget,
///                         _width: u32,
///                         _height: u32,
///                         _quad: &FullScreenQuad|
///  -> afterglow::Result<()> {
///     let _scope = write.bind()?;
///     Ok(())
/// };
/// # fn assert_stage(_: &mut impl Stage) {}
/// # assert_stage(&mut passthrough);
/// ```
pub trait Stage {
    /// Runs the stage.
    ///
    /// # Arguments
    ///
    /// * `read` - Target holding the previous stage's output
    /// * `write` - Target to render this stage's output into
    /// * `width`, `height` - Viewport size of the chain
    /// * `quad` - Shared full-screen quad
    fn invoke(
        &mut self,
        read: &RenderTarget,
        write: &RenderTarget,
        width: u32,
        height: u32,
        quad: &FullScreenQuad,
    ) -> Result<()>;
}

impl<F> Stage for F
where
    F: FnMut(&RenderTarget, &RenderTarget, u32, u32, &FullScreenQuad) -> Result<()>,
{
    fn invoke(
        &mut self,
        read: &RenderTarget,
        write: &RenderTarget,
        width: u32,
        height: u32,
        quad: &FullScreenQuad,
    ) -> Result<()> {
        self(read, write, width, height, quad)
    }
}

/// Applies one fragment program to the previous result.
///
/// The program samples its input on unit 0, the only unit left bound, and
/// receives `screenWidth` / `screenHeight`. The program is shared, not owned:
/// the caller keeps control of its lifetime.
pub struct ShaderStage {
    program: Rc<Program>,
}

impl ShaderStage {
    pub fn new(program: Rc<Program>) -> Self {
        Self { program }
    }

    pub fn program(&self) -> &Rc<Program> {
        &self.program
    }
}

impl Stage for ShaderStage {
    fn invoke(
        &mut self,
        read: &RenderTarget,
        write: &RenderTarget,
        width: u32,
        height: u32,
        quad: &FullScreenQuad,
    ) -> Result<()> {
        log::trace!("shader stage '{}'", self.program.label());
        let target = write.bind()?;
        target.clear(Vec4::new(0.0, 0.0, 0.0, 1.0))?;
        write.context().unbind_textures();
        self.program.activate();
        self.program.set_screen_size(width, height)?;
        read.bind_color_texture(0, 0)?;
        target.draw(quad, &self.program)
    }
}

/// Wraps `program` into a stage.
pub fn make_shader_stage(program: Rc<Program>) -> ShaderStage {
    ShaderStage::new(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, FramebufferBinding, NativeShader, SoftwareBackend};
    use std::cell::RefCell;

    #[test]
    fn shader_stage_samples_read_into_write() {
        let soft = Rc::new(RefCell::new(SoftwareBackend::new(4, 4)));
        let ctx = Context::from_shared(soft.clone());
        let quad = FullScreenQuad::new(&ctx).unwrap();
        let read = RenderTarget::new(&ctx, 4, 4).unwrap();
        let write = RenderTarget::new(&ctx, 4, 4).unwrap();
        {
            let target = read.bind().unwrap();
            target.clear(Vec4::new(0.2, 0.4, 0.6, 1.0)).unwrap();
        }

        let double = Rc::new(
            Program::native(
                &ctx,
                "double",
                NativeShader::new(|frag| {
                    let c = frag.sample(0, frag.uv);
                    Vec4::new(c.x * 2.0, c.y * 2.0, c.z * 2.0, 1.0)
                }),
            )
            .unwrap(),
        );
        let mut stage = make_shader_stage(double.clone());
        stage.invoke(&read, &write, 4, 4, &quad).unwrap();

        assert_eq!(ctx.bound_framebuffer(), FramebufferBinding::Default);
        let texel = soft
            .borrow()
            .texture_pixel(write.color_texture(0).unwrap(), 2, 1)
            .unwrap();
        assert!((texel - Vec4::new(0.4, 0.8, 1.2, 1.0)).abs().max_element() < 1e-5);
        assert!(Rc::ptr_eq(stage.program(), &double));
    }

    #[test]
    fn shader_stage_clears_units_left_by_earlier_passes() {
        let soft = Rc::new(RefCell::new(SoftwareBackend::new(2, 2)));
        let ctx = Context::from_shared(soft.clone());
        let quad = FullScreenQuad::new(&ctx).unwrap();
        let read = RenderTarget::new(&ctx, 2, 2).unwrap();
        let write = RenderTarget::new(&ctx, 2, 2).unwrap();
        let other = RenderTarget::new(&ctx, 2, 2).unwrap();
        {
            let target = other.bind().unwrap();
            target.clear(Vec4::ONE).unwrap();
        }
        write.bind_color_texture(1, 0).unwrap();
        other.bind_color_texture(5, 0).unwrap();

        let second_unit = Rc::new(
            Program::native(&ctx, "unit 1", NativeShader::new(|frag| frag.sample(1, frag.uv)))
                .unwrap(),
        );
        make_shader_stage(second_unit)
            .invoke(&read, &write, 2, 2, &quad)
            .unwrap();

        let texel = soft
            .borrow()
            .texture_pixel(write.color_texture(0).unwrap(), 0, 0)
            .unwrap();
        assert_eq!(texel, Vec4::new(0.0, 0.0, 0.0, 1.0));
        ctx.with(|b| {
            assert_eq!(b.bound_texture(0), read.color_texture(0));
            assert_eq!(b.bound_texture(1), None);
            assert_eq!(b.bound_texture(5), None);
        });
    }

    #[test]
    fn closures_are_stages() {
        let ctx = Context::new(SoftwareBackend::new(2, 2));
        let quad = FullScreenQuad::new(&ctx).unwrap();
        let read = RenderTarget::new(&ctx, 2, 2).unwrap();
        let write = RenderTarget::new(&ctx, 2, 2).unwrap();

        let mut calls = 0;
        let mut stage = |_: &RenderTarget,
                         w: &RenderTarget,
                         _: u32,
                         _: u32,
                         _: &FullScreenQuad|
         -> crate::Result<()> {
            calls += 1;
            let _scope = w.bind()?;
            Ok(())
        };
        stage.invoke(&read, &write, 2, 2, &quad).unwrap();
        stage.invoke(&read, &write, 2, 2, &quad).unwrap();
        assert_eq!(calls, 2);
    }
}
