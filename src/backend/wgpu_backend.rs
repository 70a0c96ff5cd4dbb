//! wgpu implementation of the [`Backend`] seam.
//!
//! wgpu has no global binding state, so this backend keeps the GL-style
//! [`BindingState`] itself and turns every `clear` and `draw` into a separate
//! render pass against whatever is bound at that moment. Passes are recorded
//! into one command encoder per frame; [`Backend::finish_frame`] submits it and
//! presents the surface texture, which is acquired lazily the first time the
//! default framebuffer is touched.
//!
//! Programs are WGSL fragment shaders. Every program is compiled together with
//! [`PRELUDE`], which declares:
//!
//! - `u`: the uniform block (`u.screen_size`, `u.params[i]` for declared parameters)
//! - `t0`..`t3`: color textures on units 0 to 3, sampled with `linear_sampler`
//! - `depth_map` / `depth_cube` with `shadow_sampler` for depth textures
//! - the vertex stage `vs` and the `VertexOutput` it produces
//! - `texel_size()` and `finish(color)`, which applies the framebuffer-sRGB encoding
//!
//! UVs handed to the fragment stage are in texture space, so sampling a
//! texture at `in.uv` reads the texel the fragment covers.

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use crate::backend::{
    Backend, BindingState, Clear, ColorFormat, DepthAttachment, FramebufferAllocation,
    FramebufferBinding, FramebufferDescriptor, FramebufferId, IdAllocator, MeshId,
    ProgramDescriptor, ProgramId, SCREEN_HEIGHT, SCREEN_WIDTH, ScreenVertex, ShaderLanguage,
    ShaderSource, TextureId, UniformValue, encode_srgb,
};
use crate::error::{Error, Result};
use crate::gpu::GpuContext;

/// Number of color texture units exposed to WGSL programs (`t0`..`t3`).
const COLOR_UNITS: usize = 4;

/// Number of `vec4` parameter slots in the uniform block.
const PARAM_SLOTS: usize = 8;

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Shared declarations prepended to every WGSL program.
pub const PRELUDE: &str = r#"
struct Uniforms {
    screen_size: vec2f,
    srgb_output: f32,
    _pad: f32,
    params: array<vec4f, 8>,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(0) @binding(1) var t0: texture_2d<f32>;
@group(0) @binding(2) var t1: texture_2d<f32>;
@group(0) @binding(3) var t2: texture_2d<f32>;
@group(0) @binding(4) var t3: texture_2d<f32>;
@group(0) @binding(5) var linear_sampler: sampler;
@group(0) @binding(6) var depth_map: texture_depth_2d;
@group(0) @binding(7) var depth_cube: texture_depth_cube;
@group(0) @binding(8) var shadow_sampler: sampler_comparison;

struct VertexInput {
    @location(0) position: vec3f,
    @location(1) uv: vec2f,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4f,
    @location(0) uv: vec2f,
}

@vertex
fn vs(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    // GL depth range [-1, 1] to wgpu [0, 1]
    out.clip_position = vec4f(in.position.xy, in.position.z * 0.5 + 0.5, 1.0);
    out.uv = vec2f(in.uv.x, 1.0 - in.uv.y);
    return out;
}

fn texel_size() -> vec2f {
    return 1.0 / u.screen_size;
}

fn linear_to_srgb(c: vec3f) -> vec3f {
    let x = clamp(c, vec3f(0.0), vec3f(1.0));
    let lo = x * 12.92;
    let hi = 1.055 * pow(x, vec3f(1.0 / 2.4)) - 0.055;
    return select(hi, lo, x <= vec3f(0.0031308));
}

fn finish(color: vec4f) -> vec4f {
    if u.srgb_output > 0.5 {
        return vec4f(linear_to_srgb(color.rgb), color.a);
    }
    return color;
}

fn shadow(uv: vec2f, reference: f32) -> f32 {
    return textureSampleCompare(depth_map, shadow_sampler, uv, reference);
}

fn shadow_cube(direction: vec3f, reference: f32) -> f32 {
    return textureSampleCompare(depth_cube, shadow_sampler, direction, reference);
}
"#;

/// Uniform block layout matching `Uniforms` in [`PRELUDE`].
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ProgramUniforms {
    screen_size: [f32; 2],
    srgb_output: f32,
    _pad: f32,
    params: [[f32; 4]; PARAM_SLOTS],
}

struct GpuTexture {
    texture: wgpu::Texture,
    /// View used for sampling (`Cube` for layered depth targets).
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    /// Rgb16F targets keep alpha at 1.
    rgb_only: bool,
    width: u32,
    height: u32,
    layers: u32,
}

impl GpuTexture {
    fn is_depth(&self) -> bool {
        self.format == DEPTH_FORMAT
    }

    fn layer_view(&self, layer: u32) -> wgpu::TextureView {
        self.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Afterglow Layer View"),
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_array_layer: layer,
            array_layer_count: Some(1),
            ..Default::default()
        })
    }
}

struct GpuFramebuffer {
    label: String,
    width: u32,
    height: u32,
    layers: u32,
    color: Vec<TextureId>,
    depth: Option<TextureId>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    /// Format and RGB-only flag per color attachment.
    targets: Vec<(wgpu::TextureFormat, bool)>,
    depth: bool,
    depth_test: bool,
}

struct GpuProgram {
    label: String,
    module: wgpu::ShaderModule,
    params: Vec<String>,
    values: [[f32; 4]; PARAM_SLOTS],
    screen_width: Option<f32>,
    screen_height: Option<f32>,
    outputs: usize,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
}

struct GpuMesh {
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
    index_count: u32,
}

/// A color attachment resolved for one pass.
struct ColorSlot {
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    rgb_only: bool,
}

struct ResolvedTarget {
    color: Vec<ColorSlot>,
    depth: Option<wgpu::TextureView>,
    width: u32,
    height: u32,
    is_default: bool,
}

/// Placeholder views bound to units with nothing on them.
struct Fallbacks {
    color: wgpu::TextureView,
    depth: wgpu::TextureView,
    cube: wgpu::TextureView,
}

/// [`Backend`] recording wgpu render passes for a window surface.
pub struct WgpuBackend {
    gpu: GpuContext,
    state: BindingState,
    ids: IdAllocator,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    linear_sampler: wgpu::Sampler,
    shadow_sampler: wgpu::Sampler,
    fallbacks: Fallbacks,
    float32_filterable: bool,
    textures: HashMap<TextureId, GpuTexture>,
    framebuffers: HashMap<FramebufferId, GpuFramebuffer>,
    programs: HashMap<ProgramId, GpuProgram>,
    meshes: HashMap<MeshId, GpuMesh>,
    encoder: Option<wgpu::CommandEncoder>,
    frame: Option<(wgpu::SurfaceTexture, wgpu::TextureView)>,
}

fn texture_entry(
    binding: u32,
    sample_type: wgpu::TextureSampleType,
    dim: wgpu::TextureViewDimension,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type,
            view_dimension: dim,
            multisampled: false,
        },
        count: None,
    }
}

fn wgpu_color(c: glam::Vec4) -> wgpu::Color {
    wgpu::Color {
        r: c.x as f64,
        g: c.y as f64,
        b: c.z as f64,
        a: c.w as f64,
    }
}

impl WgpuBackend {
    pub fn new(gpu: GpuContext) -> Self {
        let device = &gpu.device;
        let float = wgpu::TextureSampleType::Float { filterable: true };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Afterglow Bind Group Layout"),
            entries: &[
                // Uniforms
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Color units 0..4
                texture_entry(1, float, wgpu::TextureViewDimension::D2),
                texture_entry(2, float, wgpu::TextureViewDimension::D2),
                texture_entry(3, float, wgpu::TextureViewDimension::D2),
                texture_entry(4, float, wgpu::TextureViewDimension::D2),
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                // Depth textures
                texture_entry(6, wgpu::TextureSampleType::Depth, wgpu::TextureViewDimension::D2),
                texture_entry(7, wgpu::TextureSampleType::Depth, wgpu::TextureViewDimension::Cube),
                wgpu::BindGroupLayoutEntry {
                    binding: 8,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Afterglow Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let linear_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Afterglow Linear Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let shadow_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Afterglow Shadow Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            compare: Some(wgpu::CompareFunction::LessEqual),
            ..Default::default()
        });

        let fallbacks = Fallbacks {
            color: Self::fallback_view(device, wgpu::TextureFormat::Rgba8Unorm, 1),
            depth: Self::fallback_view(device, DEPTH_FORMAT, 1),
            cube: Self::fallback_view(device, DEPTH_FORMAT, 6),
        };

        let float32_filterable = device
            .features()
            .contains(wgpu::Features::FLOAT32_FILTERABLE);
        if !float32_filterable {
            log::warn!("wgpu: Rgba32F targets fall back to Rgba16Float (no FLOAT32_FILTERABLE)");
        }

        Self {
            gpu,
            state: BindingState::default(),
            ids: IdAllocator::default(),
            bind_group_layout,
            pipeline_layout,
            linear_sampler,
            shadow_sampler,
            fallbacks,
            float32_filterable,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            meshes: HashMap::new(),
            encoder: None,
            frame: None,
        }
    }

    /// The underlying device and surface.
    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    fn fallback_view(
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        layers: u32,
    ) -> wgpu::TextureView {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Afterglow Fallback Texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(if layers == 6 {
                wgpu::TextureViewDimension::Cube
            } else {
                wgpu::TextureViewDimension::D2
            }),
            ..Default::default()
        })
    }

    fn color_format(&self, format: ColorFormat) -> wgpu::TextureFormat {
        match format {
            ColorFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            ColorFormat::Rgb16F | ColorFormat::Rgba16F => wgpu::TextureFormat::Rgba16Float,
            ColorFormat::Rgba32F if self.float32_filterable => wgpu::TextureFormat::Rgba32Float,
            ColorFormat::Rgba32F => wgpu::TextureFormat::Rgba16Float,
        }
    }

    fn create_texture(
        &mut self,
        label: &str,
        width: u32,
        height: u32,
        layers: u32,
        format: wgpu::TextureFormat,
        rgb_only: bool,
    ) -> TextureId {
        let texture = self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(if layers == 6 {
                wgpu::TextureViewDimension::Cube
            } else {
                wgpu::TextureViewDimension::D2
            }),
            ..Default::default()
        });

        let id = TextureId(self.ids.next());
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                view,
                format,
                rgb_only,
                width,
                height,
                layers,
            },
        );
        id
    }

    /// Acquires the surface texture for this frame, reconfiguring once if it went stale.
    fn surface_view(&mut self) -> Result<wgpu::TextureView> {
        if let Some((_, view)) = &self.frame {
            return Ok(view.clone());
        }
        let output = match self.gpu.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                log::warn!("wgpu: surface lost or outdated, reconfiguring");
                self.gpu.reconfigure();
                self.gpu.surface.get_current_texture()?
            }
            Err(e) => return Err(e.into()),
        };
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        self.frame = Some((output, view.clone()));
        Ok(view)
    }

    fn resolve_target(&mut self) -> Result<ResolvedTarget> {
        match self.state.framebuffer {
            FramebufferBinding::Default => {
                let view = self.surface_view()?;
                Ok(ResolvedTarget {
                    color: vec![ColorSlot {
                        view,
                        format: self.gpu.config.format,
                        rgb_only: false,
                    }],
                    depth: None,
                    width: self.gpu.width(),
                    height: self.gpu.height(),
                    is_default: true,
                })
            }
            FramebufferBinding::Offscreen { id, layer } => {
                let fb = self
                    .framebuffers
                    .get(&id)
                    .ok_or(Error::UnknownFramebuffer(id))?;
                let mut color = Vec::with_capacity(fb.color.len());
                for texture in &fb.color {
                    let texture = self
                        .textures
                        .get(texture)
                        .ok_or(Error::UnknownTexture(*texture))?;
                    color.push(ColorSlot {
                        view: texture.view.clone(),
                        format: texture.format,
                        rgb_only: texture.rgb_only,
                    });
                }
                let depth = match fb.depth {
                    Some(depth) => {
                        let texture = self
                            .textures
                            .get(&depth)
                            .ok_or(Error::UnknownTexture(depth))?;
                        Some(if texture.layers > 1 {
                            texture.layer_view(layer)
                        } else {
                            texture.view.clone()
                        })
                    }
                    None => None,
                };
                Ok(ResolvedTarget {
                    color,
                    depth,
                    width: fb.width,
                    height: fb.height,
                    is_default: false,
                })
            }
        }
    }

    fn encodes_srgb(&self, target: &ResolvedTarget) -> bool {
        target.is_default && self.state.framebuffer_srgb
    }

    /// Whether `id` is attached to the bound framebuffer.
    fn attached(&self, id: TextureId) -> bool {
        let FramebufferBinding::Offscreen { id: fb, .. } = self.state.framebuffer else {
            return false;
        };
        self.framebuffers
            .get(&fb)
            .is_some_and(|fb| fb.depth == Some(id) || fb.color.contains(&id))
    }

    /// Textures attached to the bound framebuffer are replaced by the fallbacks,
    /// and color units the prelude does not declare are skipped.
    fn bind_group(&self, uniforms: &wgpu::Buffer) -> Result<wgpu::BindGroup> {
        let mut color: [&wgpu::TextureView; COLOR_UNITS] = [&self.fallbacks.color; COLOR_UNITS];
        let mut depth = &self.fallbacks.depth;
        let mut cube = &self.fallbacks.cube;

        for (unit, bound) in self.state.units.iter().enumerate() {
            let Some(id) = bound else { continue };
            let texture = self.textures.get(id).ok_or(Error::UnknownTexture(*id))?;
            if self.attached(*id) {
                log::warn!("wgpu: unit {} samples the bound framebuffer, using fallback", unit);
                continue;
            }
            if texture.is_depth() {
                if texture.layers > 1 {
                    cube = &texture.view;
                } else {
                    depth = &texture.view;
                }
            } else if unit < COLOR_UNITS {
                color[unit] = &texture.view;
            } else {
                log::debug!("wgpu: color unit {} is not sampled by the prelude", unit);
            }
        }

        Ok(self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Afterglow Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(color[0]),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(color[1]),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(color[2]),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(color[3]),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::Sampler(&self.linear_sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: wgpu::BindingResource::TextureView(depth),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: wgpu::BindingResource::TextureView(cube),
                },
                wgpu::BindGroupEntry {
                    binding: 8,
                    resource: wgpu::BindingResource::Sampler(&self.shadow_sampler),
                },
            ],
        }))
    }

    fn pipeline(
        &mut self,
        program_id: ProgramId,
        key: PipelineKey,
    ) -> Result<wgpu::RenderPipeline> {
        let program = self
            .programs
            .get_mut(&program_id)
            .ok_or(Error::UnknownProgram(program_id))?;
        if let Some(pipeline) = program.pipelines.get(&key) {
            return Ok(pipeline.clone());
        }

        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .targets
            .iter()
            .enumerate()
            .map(|(index, &(format, rgb_only))| {
                let write_mask = if index >= program.outputs {
                    wgpu::ColorWrites::empty()
                } else if rgb_only {
                    wgpu::ColorWrites::COLOR
                } else {
                    wgpu::ColorWrites::ALL
                };
                Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask,
                })
            })
            .collect();

        let depth_stencil = key.depth.then(|| wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: key.depth_test,
            depth_compare: if key.depth_test {
                wgpu::CompareFunction::Less
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let device = &self.gpu.device;
        let layout = &self.pipeline_layout;
        let label = program.label.clone();
        let module = &program.module;
        let created = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&label),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some("vs"),
                    buffers: &[ScreenVertex::LAYOUT],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point: Some("fs"),
                    targets: &targets,
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        }));
        let pipeline = created.map_err(|_| Error::ShaderCompilation {
            label: label.clone(),
            message: "render pipeline creation failed".into(),
        })?;

        log::debug!("wgpu: built pipeline for '{}' ({} targets)", label, key.targets.len());
        program.pipelines.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.gpu.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Afterglow Frame Encoder"),
            })
        })
    }
}

impl Backend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn shader_language(&self) -> ShaderLanguage {
        ShaderLanguage::Wgsl
    }

    fn state(&self) -> &BindingState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut BindingState {
        &mut self.state
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.gpu.width(), self.gpu.height())
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        // A frame acquired at the old size cannot be presented after reconfiguring.
        self.frame = None;
        self.gpu.resize(width, height);
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> Result<FramebufferAllocation> {
        desc.validate(self.gpu.device.limits().max_texture_dimension_2d)?;

        let color: Vec<TextureId> = desc
            .color_formats
            .iter()
            .map(|&format| {
                let wgpu_format = self.color_format(format);
                self.create_texture(
                    &desc.label,
                    desc.width,
                    desc.height,
                    1,
                    wgpu_format,
                    !format.has_alpha(),
                )
            })
            .collect();

        let depth = match desc.depth {
            DepthAttachment::None => None,
            attachment => Some(self.create_texture(
                &desc.label,
                desc.width,
                desc.height,
                attachment.layers(),
                DEPTH_FORMAT,
                false,
            )),
        };

        let id = FramebufferId(self.ids.next());
        self.framebuffers.insert(
            id,
            GpuFramebuffer {
                label: desc.label.clone(),
                width: desc.width,
                height: desc.height,
                layers: desc.depth.layers(),
                color: color.clone(),
                depth,
            },
        );
        log::debug!(
            "wgpu: allocated framebuffer '{}' {:?} ({}x{}, {} color, depth {:?})",
            desc.label,
            id,
            desc.width,
            desc.height,
            color.len(),
            desc.depth
        );

        Ok(FramebufferAllocation {
            id,
            color,
            depth: depth.filter(|_| desc.depth.is_sampleable()),
        })
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        let Some(fb) = self.framebuffers.remove(&framebuffer) else {
            return;
        };
        for texture in fb.color.iter().copied().chain(fb.depth) {
            if let Some(removed) = self.textures.remove(&texture) {
                removed.texture.destroy();
            }
            self.state.forget_texture(texture);
        }
        self.state.forget_framebuffer(framebuffer);
        log::debug!("wgpu: released framebuffer '{}' {:?}", fb.label, framebuffer);
    }

    fn bind_framebuffer(&mut self, binding: FramebufferBinding) -> Result<()> {
        if let FramebufferBinding::Offscreen { id, layer } = binding {
            let fb = self
                .framebuffers
                .get(&id)
                .ok_or(Error::UnknownFramebuffer(id))?;
            if layer >= fb.layers {
                return Err(Error::LayerOutOfRange {
                    layer,
                    layers: fb.layers,
                });
            }
        }
        self.state.framebuffer = binding;
        Ok(())
    }

    fn blit_depth(&mut self, src: FramebufferId, dst: FramebufferId) -> Result<()> {
        let source = self
            .framebuffers
            .get(&src)
            .ok_or(Error::UnknownFramebuffer(src))?;
        let dest = self
            .framebuffers
            .get(&dst)
            .ok_or(Error::UnknownFramebuffer(dst))?;
        if (source.width, source.height) != (dest.width, dest.height) {
            return Err(Error::DepthBlit(format!(
                "size mismatch {}x{} -> {}x{}",
                source.width, source.height, dest.width, dest.height
            )));
        }
        let (Some(src_depth), Some(dst_depth)) = (source.depth, dest.depth) else {
            return Err(Error::DepthBlit(
                "both framebuffers need a depth attachment".into(),
            ));
        };
        let src_texture = self
            .textures
            .get(&src_depth)
            .ok_or(Error::UnknownTexture(src_depth))?
            .texture
            .clone();
        let dst_texture = self
            .textures
            .get(&dst_depth)
            .ok_or(Error::UnknownTexture(dst_depth))?
            .texture
            .clone();
        let size = wgpu::Extent3d {
            width: source.width,
            height: source.height,
            depth_or_array_layers: 1,
        };

        self.encoder().copy_texture_to_texture(
            src_texture.as_image_copy(),
            dst_texture.as_image_copy(),
            size,
        );
        Ok(())
    }

    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.textures.get(&texture).map(|t| (t.width, t.height))
    }

    fn create_program(&mut self, desc: ProgramDescriptor) -> Result<ProgramId> {
        let ShaderSource::Wgsl(source) = &desc.source else {
            return Err(Error::UnsupportedShader {
                backend: self.name(),
                language: desc.source.language(),
            });
        };
        if desc.params.len() > PARAM_SLOTS {
            return Err(Error::ShaderCompilation {
                label: desc.label,
                message: format!("at most {PARAM_SLOTS} parameters are supported"),
            });
        }

        let full_source = format!("{PRELUDE}\n{source}");
        let device = &self.gpu.device;
        let label = desc.label.as_str();
        // wgpu reports invalid WGSL through the device error handler, which panics.
        let module = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(full_source.as_str().into()),
            })
        }))
        .map_err(|_| Error::ShaderCompilation {
            label: desc.label.clone(),
            message: "WGSL failed validation".into(),
        })?;

        let id = ProgramId(self.ids.next());
        log::debug!("wgpu: compiled program '{}' {:?}", desc.label, id);
        self.programs.insert(
            id,
            GpuProgram {
                label: desc.label,
                module,
                params: desc.params,
                values: [[0.0; 4]; PARAM_SLOTS],
                screen_width: None,
                screen_height: None,
                outputs: desc.outputs,
                pipelines: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        if let Some(removed) = self.programs.remove(&program) {
            log::trace!("wgpu: deleted program '{}'", removed.label);
        }
        if self.state.program == Some(program) {
            self.state.program = None;
        }
    }

    fn set_uniform(&mut self, program: ProgramId, name: &str, value: UniformValue) -> Result<()> {
        let program = self
            .programs
            .get_mut(&program)
            .ok_or(Error::UnknownProgram(program))?;
        match name {
            SCREEN_WIDTH => program.screen_width = Some(value.as_f32()),
            SCREEN_HEIGHT => program.screen_height = Some(value.as_f32()),
            _ => {
                if let Some(slot) = program.params.iter().position(|p| p == name) {
                    program.values[slot] = value.to_vec4().to_array();
                }
            }
        }
        Ok(())
    }

    fn create_mesh(&mut self, vertices: &[ScreenVertex], indices: &[u32]) -> Result<MeshId> {
        if indices.len() % 3 != 0 || indices.iter().any(|&i| i as usize >= vertices.len()) {
            return Err(Error::InvalidMesh(format!(
                "{} indices over {} vertices",
                indices.len(),
                vertices.len()
            )));
        }
        let device = &self.gpu.device;
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Afterglow Vertex Buffer"),
            contents: bytemuck::cast_slice(vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Afterglow Index Buffer"),
            contents: bytemuck::cast_slice(indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        let id = MeshId(self.ids.next());
        self.meshes.insert(
            id,
            GpuMesh {
                vertices: vertex_buffer,
                indices: index_buffer,
                index_count: indices.len() as u32,
            },
        );
        Ok(id)
    }

    fn delete_mesh(&mut self, mesh: MeshId) {
        self.meshes.remove(&mesh);
    }

    fn draw(&mut self, mesh_id: MeshId) -> Result<()> {
        let program_id = self.state.program.ok_or(Error::NoProgramBound)?;
        let target = self.resolve_target()?;

        let key = PipelineKey {
            targets: target
                .color
                .iter()
                .map(|slot| (slot.format, slot.rgb_only))
                .collect(),
            depth: target.depth.is_some(),
            depth_test: self.state.depth_test,
        };
        let pipeline = self.pipeline(program_id, key)?;

        let uniforms = {
            let program = self
                .programs
                .get(&program_id)
                .ok_or(Error::UnknownProgram(program_id))?;
            log::trace!("wgpu: draw '{}'", program.label);
            ProgramUniforms {
                screen_size: [
                    program.screen_width.unwrap_or(target.width as f32),
                    program.screen_height.unwrap_or(target.height as f32),
                ],
                srgb_output: if self.encodes_srgb(&target) { 1.0 } else { 0.0 },
                _pad: 0.0,
                params: program.values,
            }
        };
        let uniform_buffer =
            self.gpu
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("Afterglow Uniforms"),
                    contents: bytemuck::cast_slice(&[uniforms]),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
        let bind_group = self.bind_group(&uniform_buffer)?;

        let mesh = self.meshes.get(&mesh_id).ok_or(Error::UnknownMesh(mesh_id))?;
        let (vertices, indices, index_count) =
            (mesh.vertices.clone(), mesh.indices.clone(), mesh.index_count);

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = target
            .color
            .iter()
            .map(|slot| {
                Some(wgpu::RenderPassColorAttachment {
                    view: &slot.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();

        let encoder = self.encoder();
        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Afterglow Draw Pass"),
            color_attachments: &color_attachments,
            depth_stencil_attachment: target.depth.as_ref().map(|view| {
                wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        render_pass.set_pipeline(&pipeline);
        render_pass.set_bind_group(0, &bind_group, &[]);
        render_pass.set_vertex_buffer(0, vertices.slice(..));
        render_pass.set_index_buffer(indices.slice(..), wgpu::IndexFormat::Uint32);
        render_pass.draw_indexed(0..index_count, 0, 0..1);
        Ok(())
    }

    fn clear(&mut self, clear: Clear) -> Result<()> {
        let target = self.resolve_target()?;
        let encode = self.encodes_srgb(&target);

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = target
            .color
            .iter()
            .map(|slot| {
                let load = match clear.color {
                    Some(mut color) => {
                        if slot.rgb_only {
                            color.w = 1.0;
                        }
                        if encode {
                            color = encode_srgb(color);
                        }
                        wgpu::LoadOp::Clear(wgpu_color(color))
                    }
                    None => wgpu::LoadOp::Load,
                };
                Some(wgpu::RenderPassColorAttachment {
                    view: &slot.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();

        let depth_load = match clear.depth {
            Some(depth) => wgpu::LoadOp::Clear(depth.clamp(0.0, 1.0)),
            None => wgpu::LoadOp::Load,
        };

        let encoder = self.encoder();
        let _render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Afterglow Clear Pass"),
            color_attachments: &color_attachments,
            depth_stencil_attachment: target.depth.as_ref().map(|view| {
                wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: depth_load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        Ok(())
    }

    fn finish_frame(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            self.gpu.queue.submit(std::iter::once(encoder.finish()));
        }
        if let Some((output, _)) = self.frame.take() {
            output.present();
        }
        Ok(())
    }
}
