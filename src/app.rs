//! Demo host: a procedural HDR scene through bloom and a switchable tone map.
//!
//! [`Demo`] is backend-agnostic. [`run_with_config`] drives it in a winit
//! window on the [`WgpuBackend`](crate::WgpuBackend); [`render_png`] renders a
//! single frame on the [`SoftwareBackend`](crate::SoftwareBackend) and writes
//! it to disk.

use std::cell::RefCell;
use std::f32::consts::TAU;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use glam::{Vec2, Vec3, Vec4};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowAttributes, WindowId};

use crate::backend::{NativeShader, ProgramDescriptor, ShaderLanguage, ShaderSource};
use crate::bloom::Bloom;
use crate::config::AppConfig;
use crate::context::Context;
use crate::effects::Effect;
use crate::error::{Error, Result};
use crate::gpu::GpuContext;
use crate::post_process::PostProcessing;
use crate::program::Program;
use crate::quad::FullScreenQuad;
use crate::{SoftwareBackend, WgpuBackend};

/// Final stages SPACE cycles through.
const FINAL_STAGES: [Effect; 3] = [Effect::ToneMapAces, Effect::ToneMapReinhard, Effect::Identity];

const ORB_COLORS: [Vec3; 3] = [
    Vec3::new(1.0, 0.45, 0.1),
    Vec3::new(0.2, 0.5, 1.0),
    Vec3::new(0.9, 0.2, 0.7),
];

const SCENE_WGSL: &str = r#"
@fragment
fn fs(in: VertexOutput) -> @location(0) vec4f {
    let time = u.params[0].x;
    let p = vec2f(in.uv.x, 1.0 - in.uv.y);
    let aspect = u.screen_size.x / u.screen_size.y;

    var colors = array<vec3f, 3>(
        vec3f(1.0, 0.45, 0.1),
        vec3f(0.2, 0.5, 1.0),
        vec3f(0.9, 0.2, 0.7),
    );
    var color = mix(vec3f(0.02, 0.02, 0.05), vec3f(0.06, 0.03, 0.1), p.y);
    for (var i = 0; i < 3; i++) {
        let phase = time * 0.5 + f32(i) * 2.0943951;
        let center = vec2f(0.5 + 0.3 * cos(phase), 0.5 + 0.2 * sin(phase * 1.3));
        let d = length((p - center) * vec2f(aspect, 1.0));
        let core = max(1.0 - d / 0.08, 0.0);
        color += colors[i] * core * core * 6.0;
    }
    return finish(vec4f(color, 1.0));
}
"#;

/// CPU twin of [`SCENE_WGSL`].
fn scene_color(p: Vec2, aspect: f32, time: f32) -> Vec3 {
    let mut color = Vec3::new(0.02, 0.02, 0.05).lerp(Vec3::new(0.06, 0.03, 0.1), p.y);
    for (i, tint) in ORB_COLORS.iter().enumerate() {
        let phase = time * 0.5 + i as f32 * TAU / 3.0;
        let center = Vec2::new(0.5 + 0.3 * phase.cos(), 0.5 + 0.2 * (phase * 1.3).sin());
        let d = ((p - center) * Vec2::new(aspect, 1.0)).length();
        let core = (1.0 - d / 0.08).max(0.0);
        color += *tint * core * core * 6.0;
    }
    color
}

fn scene_program(ctx: &Context) -> Result<Program> {
    let source = match ctx.shader_language() {
        ShaderLanguage::Wgsl => ShaderSource::Wgsl(SCENE_WGSL.into()),
        ShaderLanguage::Native => ShaderSource::Native(NativeShader::new(|frag| {
            let size = frag.screen_size();
            let aspect = size.x / size.y.max(1.0);
            scene_color(frag.uv, aspect, frag.float("time", 0.0)).extend(1.0)
        })),
    };
    Program::new(ctx, ProgramDescriptor::new("scene", source).param("time"))
}

/// Scene, bloom chain and the final stages to choose from.
pub struct Demo {
    quad: FullScreenQuad,
    scene: Program,
    post: PostProcessing,
    finals: Vec<Rc<Program>>,
    current: usize,
}

impl Demo {
    pub fn new(ctx: &Context, config: &AppConfig, width: u32, height: u32) -> Result<Self> {
        let finals = FINAL_STAGES
            .iter()
            .map(|effect| effect.program(ctx).map(Rc::new))
            .collect::<Result<Vec<_>>>()?;

        let mut bloom = Bloom::new(ctx, width, height, config.bloom_iterations)?;
        bloom.set_threshold(config.bloom_threshold)?;
        let mut post = PostProcessing::new(ctx, width, height, finals[0].clone())?;
        post.add_stage(bloom);

        Ok(Self {
            quad: FullScreenQuad::new(ctx)?,
            scene: scene_program(ctx)?,
            post,
            finals,
            current: 0,
        })
    }

    /// Renders the scene at `time` seconds and runs the chain to the screen.
    ///
    /// Presenting is left to the caller ([`Context::finish_frame`]).
    pub fn render(&mut self, time: f32) -> Result<()> {
        let (width, height) = self.post.size();
        {
            let target = self.post.bind_input_target()?;
            target.clear(Vec4::new(0.0, 0.0, 0.0, 1.0))?;
            self.scene.activate();
            self.scene.set_screen_size(width, height)?;
            self.scene.set("time", time)?;
            target.draw(&self.quad, &self.scene)?;
        }
        self.post.run()
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.post.ensure_size(width, height).map(|_| ())
    }

    /// Switches to the next final stage and returns its name.
    pub fn cycle_final_stage(&mut self) -> &'static str {
        self.current = (self.current + 1) % self.finals.len();
        self.post.set_final_stage(self.finals[self.current].clone());
        FINAL_STAGES[self.current].name()
    }

    pub fn final_stage_name(&self) -> &'static str {
        FINAL_STAGES[self.current].name()
    }
}

/// Renders one frame at `time` seconds on the software backend and saves it as an image.
pub fn render_png(
    path: impl AsRef<Path>,
    width: u32,
    height: u32,
    config: &AppConfig,
    time: f32,
) -> Result<()> {
    let soft = Rc::new(RefCell::new(
        SoftwareBackend::new(width, height).with_srgb_surface(true),
    ));
    let ctx = Context::from_shared(soft.clone());
    let mut demo = Demo::new(&ctx, config, width, height)?;
    demo.render(time)?;
    ctx.finish_frame()?;
    soft.borrow().save_surface(path.as_ref())?;
    log::info!("wrote {}", path.as_ref().display());
    Ok(())
}

/// Runs the demo in a window with default settings.
pub fn run() -> Result<()> {
    run_with_config(AppConfig::default())
}

/// Runs the demo in a window.
///
/// SPACE cycles the final stage, ESC quits. Returns the first rendering error.
pub fn run_with_config(config: AppConfig) -> Result<()> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = AfterglowApp::Pending { config };
    event_loop.run_app(&mut app)?;

    match app {
        AfterglowApp::Failed(err) => Err(err),
        _ => Ok(()),
    }
}

enum AfterglowApp {
    Pending {
        config: AppConfig,
    },
    Running {
        window: Arc<Window>,
        ctx: Context,
        demo: Demo,
        start_time: Instant,
    },
    Failed(Error),
}

impl AfterglowApp {
    fn start(event_loop: &ActiveEventLoop, config: &AppConfig) -> Result<Self> {
        let window_attrs = WindowAttributes::default()
            .with_title(&config.title)
            .with_inner_size(winit::dpi::LogicalSize::new(config.width, config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContext::new(window.clone())?;
        let (width, height) = (gpu.width(), gpu.height());
        let ctx = Context::new(WgpuBackend::new(gpu));
        let demo = Demo::new(&ctx, config, width, height)?;
        log::info!(
            "running at {}x{} with '{}'",
            width,
            height,
            demo.final_stage_name()
        );

        Ok(AfterglowApp::Running {
            window,
            ctx,
            demo,
            start_time: Instant::now(),
        })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: Error) {
        log::error!("{err}");
        event_loop.exit();
        *self = AfterglowApp::Failed(err);
    }
}

impl ApplicationHandler for AfterglowApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if let AfterglowApp::Pending { config } = self {
            match Self::start(event_loop, config) {
                Ok(running) => *self = running,
                Err(err) => self.fail(event_loop, err),
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let AfterglowApp::Running {
            window,
            ctx,
            demo,
            start_time,
        } = self
        else {
            return;
        };

        let result = match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
                Ok(())
            }
            WindowEvent::Resized(size) => {
                ctx.resize_surface(size.width, size.height);
                demo.resize(size.width, size.height)
            }
            WindowEvent::KeyboardInput { event, .. }
                if event.state == ElementState::Pressed && !event.repeat =>
            {
                match event.physical_key {
                    PhysicalKey::Code(KeyCode::Space) => {
                        log::info!("final stage: {}", demo.cycle_final_stage());
                    }
                    PhysicalKey::Code(KeyCode::Escape) => event_loop.exit(),
                    _ => {}
                }
                Ok(())
            }
            WindowEvent::RedrawRequested => {
                let time = start_time.elapsed().as_secs_f32();
                let frame = demo.render(time).and_then(|()| ctx.finish_frame());
                window.request_redraw();
                frame
            }
            _ => Ok(()),
        };

        if let Err(err) = result {
            self.fail(event_loop, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orbs_are_hdr_and_background_is_dim() {
        let center = Vec2::new(0.8, 0.5);
        assert!(scene_color(center, 1.0, 0.0).max_element() > 1.0);
        assert!(scene_color(Vec2::new(0.05, 0.95), 1.0, 0.0).max_element() < 0.2);
    }

    #[test]
    fn demo_cycles_final_stages() {
        let ctx = Context::new(SoftwareBackend::new(8, 8));
        let mut demo = Demo::new(&ctx, &AppConfig::new().bloom_iterations(1), 8, 8).unwrap();
        assert_eq!(demo.final_stage_name(), "tonemap-aces");
        assert_eq!(demo.cycle_final_stage(), "tonemap-reinhard");
        assert_eq!(demo.cycle_final_stage(), "identity");
        assert_eq!(demo.cycle_final_stage(), "tonemap-aces");
    }

    #[test]
    fn demo_frame_lands_on_the_surface() {
        let soft = Rc::new(RefCell::new(SoftwareBackend::new(32, 18)));
        let ctx = Context::from_shared(soft.clone());
        let mut demo = Demo::new(&ctx, &AppConfig::new().bloom_iterations(2), 32, 18).unwrap();

        demo.render(0.0).unwrap();
        ctx.finish_frame().unwrap();

        let soft = soft.borrow();
        assert_eq!(soft.frames(), 1);
        let brightest = soft
            .surface_pixels()
            .iter()
            .map(|p| p.truncate().max_element())
            .fold(0.0, f32::max);
        // ACES keeps the bright orb cores below one.
        assert!(brightest > 0.5 && brightest <= 1.0);
    }

    #[test]
    fn resize_ignores_minimized_windows() {
        let ctx = Context::new(SoftwareBackend::new(8, 8));
        let mut demo = Demo::new(&ctx, &AppConfig::new(), 8, 8).unwrap();
        demo.resize(0, 0).unwrap();
        assert_eq!(demo.post.size(), (8, 8));
        demo.resize(12, 6).unwrap();
        assert_eq!(demo.post.size(), (12, 6));
    }
}
