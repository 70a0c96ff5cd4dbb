//! Bloom as a composite stage.
//!
//! ```text
//! read ──extract──▶ internal ──blur H──▶ write ──blur V──▶ internal   (x iterations)
//! read (unit 0) + internal (unit 1) ──composite──▶ write
//! ```
//!
//! The stage owns a private intermediate target and borrows the pipeline's
//! `write` target as blur scratch space, so a whole bloom chain costs one extra
//! allocation.

use glam::Vec4;

use crate::backend::{ColorFormat, DepthAttachment, FramebufferDescriptor};
use crate::context::Context;
use crate::effects::{DEFAULT_BLOOM_THRESHOLD, Effect};
use crate::error::Result;
use crate::program::Program;
use crate::quad::FullScreenQuad;
use crate::stage::Stage;
use crate::target::RenderTarget;

const CLEAR: Vec4 = Vec4::new(0.0, 0.0, 0.0, 1.0);

/// Bright-pass extraction, separable Gaussian blur and additive composite.
pub struct Bloom {
    extract: Program,
    blur_h: Program,
    blur_v: Program,
    composite: Program,
    internal: RenderTarget,
    iterations: u32,
    threshold: f32,
}

impl Bloom {
    /// Creates the stage and its internal buffer at `width` x `height`.
    ///
    /// `iterations` is the number of horizontal + vertical blur pairs; zero
    /// still extracts and composites.
    pub fn new(ctx: &Context, width: u32, height: u32, iterations: u32) -> Result<Self> {
        let internal = RenderTarget::from_descriptor(
            ctx,
            FramebufferDescriptor {
                label: "Bloom Internal".into(),
                width,
                height,
                color_formats: vec![ColorFormat::Rgb16F],
                depth: DepthAttachment::Renderbuffer,
            },
        )?;
        Ok(Self {
            extract: Effect::BloomExtract.program(ctx)?,
            blur_h: Effect::BlurHorizontal.program(ctx)?,
            blur_v: Effect::BlurVertical.program(ctx)?,
            composite: Effect::BloomComposite.program(ctx)?,
            internal,
            iterations,
            threshold: DEFAULT_BLOOM_THRESHOLD,
        })
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn set_iterations(&mut self, iterations: u32) {
        self.iterations = iterations;
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Sets the luma above which pixels contribute to the bloom.
    pub fn set_threshold(&mut self, threshold: f32) -> Result<()> {
        self.extract.set("threshold", threshold)?;
        self.threshold = threshold;
        Ok(())
    }

    /// Current size of the internal buffer.
    pub fn internal_size(&self) -> (u32, u32) {
        self.internal.size()
    }

    /// Clears `target`, binds only `inputs` (to units 0..) and draws `program` into it.
    fn pass(
        target: &RenderTarget,
        program: &Program,
        inputs: &[&RenderTarget],
        width: u32,
        height: u32,
        quad: &FullScreenQuad,
    ) -> Result<()> {
        let active = target.bind()?;
        active.clear(CLEAR)?;
        target.context().unbind_textures();
        program.activate();
        program.set_screen_size(width, height)?;
        for (unit, input) in inputs.iter().enumerate() {
            input.bind_color_texture(unit as u32, 0)?;
        }
        active.draw(quad, program)
    }
}

impl Stage for Bloom {
    fn invoke(
        &mut self,
        read: &RenderTarget,
        write: &RenderTarget,
        width: u32,
        height: u32,
        quad: &FullScreenQuad,
    ) -> Result<()> {
        if self.internal.ensure_size(width, height)? {
            log::debug!("bloom internal buffer now {}x{}", width, height);
        }
        log::trace!("bloom: {} blur iterations", self.iterations);

        Self::pass(&self.internal, &self.extract, &[read], width, height, quad)?;
        for _ in 0..self.iterations {
            Self::pass(write, &self.blur_h, &[&self.internal], width, height, quad)?;
            Self::pass(&self.internal, &self.blur_v, &[write], width, height, quad)?;
        }
        Self::pass(
            write,
            &self.composite,
            &[read, &self.internal],
            width,
            height,
            quad,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MAX_TEXTURE_UNITS;
    use crate::effects::GAUSSIAN_WEIGHTS;
    use crate::{FramebufferBinding, NativeShader, SoftwareBackend};
    use std::cell::RefCell;
    use std::rc::Rc;

    const SIZE: u32 = 16;

    struct Fixture {
        soft: Rc<RefCell<SoftwareBackend>>,
        ctx: Context,
        quad: FullScreenQuad,
        read: RenderTarget,
        write: RenderTarget,
    }

    /// A black scene with a 2x2 spot of value 4.0 around the center.
    fn fixture() -> Fixture {
        let soft = Rc::new(RefCell::new(SoftwareBackend::new(SIZE, SIZE)));
        let ctx = Context::from_shared(soft.clone());
        let quad = FullScreenQuad::new(&ctx).unwrap();
        let read = RenderTarget::new(&ctx, SIZE, SIZE).unwrap();
        let write = RenderTarget::new(&ctx, SIZE, SIZE).unwrap();

        let spot = Program::native(
            &ctx,
            "spot",
            NativeShader::new(|frag| {
                let inside = |v: f32| (7.0..9.0).contains(&v);
                if inside(frag.position.x) && inside(frag.position.y) {
                    Vec4::new(4.0, 4.0, 4.0, 1.0)
                } else {
                    CLEAR
                }
            }),
        )
        .unwrap();
        {
            let target = read.bind().unwrap();
            target.clear(CLEAR).unwrap();
            target.draw(&quad, &spot).unwrap();
        }

        Fixture {
            soft,
            ctx,
            quad,
            read,
            write,
        }
    }

    fn run_bloom(f: &Fixture, iterations: u32) -> (f32, f32) {
        let mut bloom = Bloom::new(&f.ctx, SIZE, SIZE, iterations).unwrap();
        bloom.invoke(&f.read, &f.write, SIZE, SIZE, &f.quad).unwrap();
        let soft = f.soft.borrow();
        let out = f.write.color_texture(0).unwrap();
        let peak = soft.texture_pixel(out, 7, 7).unwrap().x;
        let neighbour = soft.texture_pixel(out, 10, 7).unwrap().x;
        (peak, neighbour)
    }

    #[test]
    fn zero_iterations_is_sharper_than_one() {
        let f = fixture();
        let (peak0, neighbour0) = run_bloom(&f, 0);
        let (peak1, neighbour1) = run_bloom(&f, 1);

        // Extract + composite without blur doubles the spot.
        assert!((peak0 - 8.0).abs() < 1e-4);
        assert_eq!(neighbour0, 0.0);
        assert!(peak1 < peak0);
        assert!(neighbour1 > 0.0);

        // Horizontal then vertical 5-tap Gaussian over a 2x2 spot.
        let pair = GAUSSIAN_WEIGHTS[0] + GAUSSIAN_WEIGHTS[1];
        assert!((peak1 - (4.0 + pair * pair * 4.0)).abs() < 1e-3);
    }

    #[test]
    fn zero_iterations_still_changes_the_image() {
        let f = fixture();
        let before = f.soft.borrow().texture_pixel(f.read.color_texture(0).unwrap(), 7, 7);
        let (peak, _) = run_bloom(&f, 0);
        assert_ne!(before.map(|t| t.x), Some(peak));
    }

    #[test]
    fn dim_scenes_are_left_alone() {
        let f = fixture();
        let mut bloom = Bloom::new(&f.ctx, SIZE, SIZE, 2).unwrap();
        bloom.set_threshold(10.0).unwrap();
        assert_eq!(bloom.threshold(), 10.0);
        bloom.invoke(&f.read, &f.write, SIZE, SIZE, &f.quad).unwrap();

        let soft = f.soft.borrow();
        let out = f.write.color_texture(0).unwrap();
        assert!((soft.texture_pixel(out, 7, 7).unwrap().x - 4.0).abs() < 1e-5);
        assert_eq!(soft.texture_pixel(out, 10, 7).unwrap().x, 0.0);
    }

    #[test]
    fn internal_buffer_follows_the_viewport() {
        let f = fixture();
        let mut bloom = Bloom::new(&f.ctx, 8, 8, 1).unwrap();
        let live = f.soft.borrow().live_framebuffers();
        assert_eq!(bloom.internal_size(), (8, 8));

        bloom.invoke(&f.read, &f.write, SIZE, SIZE, &f.quad).unwrap();

        assert_eq!(bloom.internal_size(), (SIZE, SIZE));
        assert_eq!(f.soft.borrow().live_framebuffers(), live);
        assert_eq!(f.ctx.bound_framebuffer(), FramebufferBinding::Default);
    }

    #[test]
    fn repeated_invokes_never_sample_their_target() {
        let f = fixture();
        let mut bloom = Bloom::new(&f.ctx, SIZE, SIZE, 2).unwrap();
        let out = f.write.color_texture(0).unwrap();
        let mut results = Vec::new();

        for _ in 0..2 {
            bloom.invoke(&f.read, &f.write, SIZE, SIZE, &f.quad).unwrap();
            f.ctx.with(|b| {
                assert_eq!(b.bound_texture(0), f.read.color_texture(0));
                assert!((0..MAX_TEXTURE_UNITS).all(|u| b.bound_texture(u) != Some(out)));
                assert!((2..MAX_TEXTURE_UNITS).all(|u| b.bound_texture(u).is_none()));
            });
            results.push(f.soft.borrow().texture_pixels(out).unwrap().to_vec());
        }

        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn blur_passes_scale_with_iterations() {
        let f = fixture();
        let mut bloom = Bloom::new(&f.ctx, SIZE, SIZE, 3).unwrap();
        let before = f.soft.borrow().draw_calls();
        bloom.invoke(&f.read, &f.write, SIZE, SIZE, &f.quad).unwrap();
        // extract + 3 x (H + V) + composite
        assert_eq!(f.soft.borrow().draw_calls() - before, 8);

        bloom.set_iterations(0);
        assert_eq!(bloom.iterations(), 0);
        let before = f.soft.borrow().draw_calls();
        bloom.invoke(&f.read, &f.write, SIZE, SIZE, &f.quad).unwrap();
        assert_eq!(f.soft.borrow().draw_calls() - before, 2);
    }
}
