//! The ping-pong post-processing pipeline.

use std::rc::Rc;

use crate::backend::{Capability, ColorFormat, DepthAttachment, FramebufferDescriptor};
use crate::config::PostProcessingConfig;
use crate::context::{CapabilityGuard, Context};
use crate::error::Result;
use crate::program::Program;
use crate::quad::FullScreenQuad;
use crate::stage::Stage;
use crate::target::{ActiveTarget, RenderTarget};

/// An ordered chain of [`Stage`]s over two ping-pong render targets, ending
/// in a final program that presents the result.
///
/// The scene is rendered into [`input_target`](Self::input_target) (always
/// `framebuffers[0]`). [`run`](Self::run) then invokes every stage in append
/// order, each reading the previous result and writing the other buffer, and
/// finally draws `framebuffers[read]` into the default framebuffer.
///
/// # Buffer Management
///
/// ```text
/// scene:   -> framebuffers[0]
/// stage 0: framebuffers[0] -> framebuffers[1]
/// stage 1: framebuffers[1] -> framebuffers[0]
/// final:   framebuffers[read] -> screen        (read = stages % 2)
/// ```
///
/// # Example
///
/// ```
/// use std::rc::Rc;
/// use afterglow::{Bloom, Context, Effect, PostProcessing, SoftwareBackend};
///
/// let ctx = Context::new(SoftwareBackend::new(32, 32));
/// let tone_map = Rc::new(Effect::ToneMapAces.program(&ctx)?);
/// let mut post = PostProcessing::new(&ctx, 32, 32, tone_map)?;
/// post.add_stage(Bloom::new(&ctx, 32, 32, 2)?);
///
/// {
///     let scene = post.bind_input_target()?;
///     scene.clear(afterglow::Vec4::new(2.0, 0.5, 0.1, 1.0))?;
/// }
/// post.run()?;
/// # Ok::<(), afterglow::Error>(())
/// ```
pub struct PostProcessing {
    ctx: Context,
    quad: FullScreenQuad,
    framebuffers: [RenderTarget; 2],
    stages: Vec<Box<dyn Stage>>,
    read_fb: usize,
    width: u32,
    height: u32,
    final_stage: Rc<Program>,
    config: PostProcessingConfig,
}

impl PostProcessing {
    /// Creates a pipeline with default settings.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Backend the pipeline renders with
    /// * `width`, `height` - Size of both ping-pong targets
    /// * `final_stage` - Program that presents the last result; shared, not owned
    pub fn new(ctx: &Context, width: u32, height: u32, final_stage: Rc<Program>) -> Result<Self> {
        Self::with_config(ctx, width, height, final_stage, PostProcessingConfig::default())
    }

    pub fn with_config(
        ctx: &Context,
        width: u32,
        height: u32,
        final_stage: Rc<Program>,
        config: PostProcessingConfig,
    ) -> Result<Self> {
        let framebuffers = Self::allocate(ctx, width, height, config.color_format)?;
        log::debug!(
            "post-processing chain at {}x{} ({:?})",
            width,
            height,
            config.color_format
        );
        Ok(Self {
            ctx: ctx.clone(),
            quad: FullScreenQuad::new(ctx)?,
            framebuffers,
            stages: Vec::new(),
            read_fb: 0,
            width,
            height,
            final_stage,
            config,
        })
    }

    fn allocate(
        ctx: &Context,
        width: u32,
        height: u32,
        format: ColorFormat,
    ) -> Result<[RenderTarget; 2]> {
        let target = |label: &str| {
            RenderTarget::from_descriptor(
                ctx,
                FramebufferDescriptor {
                    label: label.into(),
                    width,
                    height,
                    color_formats: vec![format],
                    depth: DepthAttachment::Renderbuffer,
                },
            )
        };
        Ok([target("Post Framebuffer 0")?, target("Post Framebuffer 1")?])
    }

    /// Frees both ping-pong targets and allocates new ones at `width` x `height`.
    ///
    /// Content is not preserved. Call after the window size changes, then
    /// re-render the scene into the input target.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.framebuffers = Self::allocate(&self.ctx, width, height, self.config.color_format)?;
        self.width = width;
        self.height = height;
        log::debug!("post-processing chain resized to {}x{}", width, height);
        Ok(())
    }

    /// Resizes only when the size differs. Returns whether it did.
    pub fn ensure_size(&mut self, width: u32, height: u32) -> Result<bool> {
        if self.size() == (width, height) {
            return Ok(false);
        }
        self.resize(width, height)?;
        Ok(true)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn config(&self) -> &PostProcessingConfig {
        &self.config
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// The target the scene should be rendered into.
    pub fn input_target(&self) -> &RenderTarget {
        &self.framebuffers[0]
    }

    /// Binds the input target for scene rendering.
    pub fn bind_input_target(&self) -> Result<ActiveTarget<'_>> {
        self.framebuffers[0].bind()
    }

    /// Appends a stage. Stages run in the order they were added.
    pub fn add_stage(&mut self, stage: impl Stage + 'static) -> &mut Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn final_stage(&self) -> &Rc<Program> {
        &self.final_stage
    }

    /// Swaps the presenting program, returning the previous one.
    pub fn set_final_stage(&mut self, program: Rc<Program>) -> Rc<Program> {
        std::mem::replace(&mut self.final_stage, program)
    }

    /// Index of the buffer holding the latest result.
    ///
    /// After a run with `n` stages this is `n % 2`.
    pub fn read_index(&self) -> usize {
        self.read_fb
    }

    /// Runs every stage and presents the result to the default framebuffer.
    ///
    /// Every texture unit is empty afterwards, so the next frame can render the
    /// scene into the input target without sampling it.
    ///
    /// Depth testing is disabled and framebuffer sRGB enabled (per
    /// [`PostProcessingConfig::srgb_output`]) for the duration of the call; both
    /// are restored afterwards, including when a stage fails. The first failing
    /// stage aborts the run.
    pub fn run(&mut self) -> Result<()> {
        let _guard = self.run_stages()?;
        let screen = self.ctx.bind_default()?;
        self.present(&screen)?;
        self.ctx.unbind_textures();
        Ok(())
    }

    /// Like [`run`](Self::run), but presents into `target` instead of the
    /// default framebuffer.
    pub fn run_to(&mut self, target: &RenderTarget) -> Result<()> {
        let _guard = self.run_stages()?;
        let active = target.bind()?;
        self.present(&active)?;
        self.ctx.unbind_textures();
        Ok(())
    }

    fn run_stages(&mut self) -> Result<CapabilityGuard> {
        let guard = CapabilityGuard::save(&self.ctx);
        self.ctx.set_capability(Capability::DepthTest, false);
        self.ctx
            .set_capability(Capability::FramebufferSrgb, self.config.srgb_output);

        self.read_fb = 0;
        for (index, stage) in self.stages.iter_mut().enumerate() {
            let read = &self.framebuffers[self.read_fb];
            let write = &self.framebuffers[1 - self.read_fb];
            log::trace!(
                "stage {}: framebuffer {} -> {}",
                index,
                self.read_fb,
                1 - self.read_fb
            );
            stage.invoke(read, write, self.width, self.height, &self.quad)?;
            self.read_fb = 1 - self.read_fb;
        }
        Ok(guard)
    }

    fn present(&self, target: &ActiveTarget<'_>) -> Result<()> {
        target.clear(self.config.clear_color)?;
        self.ctx.unbind_textures();
        self.final_stage.activate();
        self.final_stage.set_screen_size(self.width, self.height)?;
        self.framebuffers[self.read_fb].bind_color_texture(0, 0)?;
        target.draw(&self.quad, &self.final_stage)
    }
}

impl std::fmt::Debug for PostProcessing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostProcessing")
            .field("size", &self.size())
            .field("stages", &self.stages.len())
            .field("read_fb", &self.read_fb)
            .field("final_stage", &self.final_stage.label())
            .finish()
    }
}
