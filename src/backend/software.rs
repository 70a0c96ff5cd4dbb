//! Deterministic CPU backend.
//!
//! Rasterizes triangles against pixel centers and runs [`NativeShader`]
//! closures per fragment. Texel storage follows GL conventions: row 0 is the
//! bottom of the image and UV `(0, 0)` is the bottom-left corner. Textures are
//! sampled bilinearly with clamp-to-edge addressing.
//!
//! The backend keeps the whole context state observable, which makes it the
//! fake GPU layer for every test in the crate:
//!
//! ```
//! use afterglow::{Context, SoftwareBackend};
//! use std::{cell::RefCell, rc::Rc};
//!
//! let soft = Rc::new(RefCell::new(SoftwareBackend::new(64, 64)));
//! let ctx = Context::from_shared(soft.clone());
//! assert_eq!(ctx.surface_size(), (64, 64));
//! assert_eq!(soft.borrow().live_framebuffers(), 0);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use glam::{Vec2, Vec3, Vec4};

use crate::backend::{
    Backend, BindingState, Clear, ColorFormat, DepthAttachment, FramebufferAllocation,
    FramebufferBinding, FramebufferDescriptor, FramebufferId, IdAllocator, MeshId,
    ProgramDescriptor, ProgramId, SCREEN_HEIGHT, SCREEN_WIDTH, ScreenVertex, ShaderLanguage,
    ShaderSource, TextureId, UniformValue, encode_srgb,
};
use crate::error::{Error, Result};

/// Largest framebuffer edge the software backend accepts.
const DEFAULT_MAX_DIMENSION: u32 = 8192;

/// Sub-texel offsets closer than this to a texel center snap onto it.
const SNAP_EPSILON: f32 = 1e-4;

/// Value returned when sampling a unit with nothing bound.
const UNBOUND_TEXEL: Vec4 = Vec4::new(0.0, 0.0, 0.0, 1.0);

type ShadeFn = dyn Fn(&Fragment<'_>, &mut [Vec4]);

/// A fragment program executed on the CPU.
///
/// ```
/// use afterglow::NativeShader;
/// use glam::Vec4;
///
/// // Invert whatever is bound to unit 0.
/// let invert = NativeShader::new(|frag| {
///     let c = frag.sample(0, frag.uv);
///     Vec4::new(1.0 - c.x, 1.0 - c.y, 1.0 - c.z, 1.0)
/// });
/// # let _ = invert;
/// ```
#[derive(Clone)]
pub struct NativeShader {
    shade: Rc<ShadeFn>,
}

impl NativeShader {
    /// A program writing a single color to attachment 0.
    pub fn new<F>(shade: F) -> Self
    where
        F: Fn(&Fragment<'_>) -> Vec4 + 'static,
    {
        Self {
            shade: Rc::new(move |frag: &Fragment<'_>, out: &mut [Vec4]| {
                if let Some(first) = out.first_mut() {
                    *first = shade(frag);
                }
            }),
        }
    }

    /// A program writing one color per attachment (multiple render targets).
    pub fn multi<F>(shade: F) -> Self
    where
        F: Fn(&Fragment<'_>, &mut [Vec4]) + 'static,
    {
        Self {
            shade: Rc::new(shade),
        }
    }

    fn run(&self, frag: &Fragment<'_>, out: &mut [Vec4]) {
        (self.shade)(frag, out)
    }
}

/// Inputs visible to a [`NativeShader`] for one fragment.
pub struct Fragment<'a> {
    /// Window coordinates of the pixel center, origin bottom-left.
    pub position: Vec2,
    /// Interpolated texture coordinate.
    pub uv: Vec2,
    /// Interpolated window-space depth in `[0, 1]`.
    pub depth: f32,
    target_size: (u32, u32),
    uniforms: &'a HashMap<String, UniformValue>,
    units: &'a [Option<&'a SoftTexture>],
}

impl Fragment<'_> {
    pub fn uniform(&self, name: &str) -> Option<UniformValue> {
        self.uniforms.get(name).copied()
    }

    /// A scalar parameter, or `default` when the program never received it.
    pub fn float(&self, name: &str, default: f32) -> f32 {
        self.uniform(name).map_or(default, UniformValue::as_f32)
    }

    /// `screenWidth`/`screenHeight` when set, otherwise the bound target's size.
    pub fn screen_size(&self) -> Vec2 {
        Vec2::new(
            self.float(SCREEN_WIDTH, self.target_size.0 as f32),
            self.float(SCREEN_HEIGHT, self.target_size.1 as f32),
        )
    }

    /// UV distance between neighbouring pixels.
    pub fn texel_size(&self) -> Vec2 {
        Vec2::ONE / self.screen_size()
    }

    fn unit(&self, unit: u32) -> Option<&SoftTexture> {
        self.units.get(unit as usize).copied().flatten()
    }

    /// Bilinear, clamp-to-edge sample of layer 0 of the texture on `unit`.
    pub fn sample(&self, unit: u32, uv: Vec2) -> Vec4 {
        self.sample_layer(unit, 0, uv)
    }

    pub fn sample_layer(&self, unit: u32, layer: u32, uv: Vec2) -> Vec4 {
        self.unit(unit)
            .map_or(UNBOUND_TEXEL, |texture| texture.sample(layer, uv))
    }

    /// Samples a cube texture along `direction`.
    pub fn sample_cube(&self, unit: u32, direction: Vec3) -> Vec4 {
        let (face, uv) = cube_face(direction);
        self.sample_layer(unit, face, uv)
    }

    /// Unfiltered fetch with clamped integer coordinates.
    pub fn texel(&self, unit: u32, x: i32, y: i32) -> Vec4 {
        self.unit(unit)
            .map_or(UNBOUND_TEXEL, |texture| texture.fetch(0, x, y))
    }

    pub fn texture_size(&self, unit: u32) -> Option<(u32, u32)> {
        self.unit(unit).map(|t| (t.width, t.height))
    }
}

/// Picks the cube face and face-local UV for a direction (GL face order +X, -X, +Y, -Y, +Z, -Z).
fn cube_face(d: Vec3) -> (u32, Vec2) {
    let a = d.abs();
    let (face, sc, tc, ma) = if a.x >= a.y && a.x >= a.z {
        if d.x > 0.0 {
            (0, -d.z, -d.y, a.x)
        } else {
            (1, d.z, -d.y, a.x)
        }
    } else if a.y >= a.z {
        if d.y > 0.0 {
            (2, d.x, d.z, a.y)
        } else {
            (3, d.x, -d.z, a.y)
        }
    } else if d.z > 0.0 {
        (4, d.x, -d.y, a.z)
    } else {
        (5, -d.x, -d.y, a.z)
    };
    if ma == 0.0 {
        return (0, Vec2::splat(0.5));
    }
    (face, Vec2::new(sc / ma + 1.0, tc / ma + 1.0) * 0.5)
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum TexelKind {
    Color(ColorFormat),
    Depth,
}

/// Texel storage for one attachment, all layers.
#[derive(Clone, Debug)]
pub(crate) struct SoftTexture {
    width: u32,
    height: u32,
    layers: u32,
    kind: TexelKind,
    data: Vec<Vec4>,
}

impl SoftTexture {
    fn new(width: u32, height: u32, layers: u32, kind: TexelKind) -> Self {
        let initial = match kind {
            TexelKind::Color(format) if !format.has_alpha() => Vec4::new(0.0, 0.0, 0.0, 1.0),
            TexelKind::Color(_) => Vec4::ZERO,
            TexelKind::Depth => Vec4::ONE,
        };
        Self {
            width,
            height,
            layers,
            kind,
            data: vec![initial; (width * height * layers) as usize],
        }
    }

    fn index(&self, layer: u32, x: u32, y: u32) -> usize {
        ((layer * self.height + y) * self.width + x) as usize
    }

    fn fetch(&self, layer: u32, x: i32, y: i32) -> Vec4 {
        let layer = layer.min(self.layers - 1);
        let x = x.clamp(0, self.width as i32 - 1) as u32;
        let y = y.clamp(0, self.height as i32 - 1) as u32;
        self.data[self.index(layer, x, y)]
    }

    fn sample(&self, layer: u32, uv: Vec2) -> Vec4 {
        let fx = snap(uv.x * self.width as f32 - 0.5);
        let fy = snap(uv.y * self.height as f32 - 0.5);
        let x0 = fx.floor();
        let y0 = fy.floor();
        let tx = fx - x0;
        let ty = fy - y0;
        let (x0, y0) = (x0 as i32, y0 as i32);

        let bottom = self
            .fetch(layer, x0, y0)
            .lerp(self.fetch(layer, x0 + 1, y0), tx);
        let top = self
            .fetch(layer, x0, y0 + 1)
            .lerp(self.fetch(layer, x0 + 1, y0 + 1), tx);
        bottom.lerp(top, ty)
    }

    fn layer(&self, layer: u32) -> &[Vec4] {
        let size = (self.width * self.height) as usize;
        let start = layer as usize * size;
        &self.data[start..start + size]
    }

    fn store(&mut self, layer: u32, x: u32, y: u32, value: Vec4) {
        let index = self.index(layer, x, y);
        self.data[index] = self.quantize(value);
    }

    fn fill(&mut self, layer: u32, value: Vec4) {
        let value = self.quantize(value);
        let size = (self.width * self.height) as usize;
        let start = layer as usize * size;
        self.data[start..start + size].fill(value);
    }

    fn quantize(&self, value: Vec4) -> Vec4 {
        match self.kind {
            TexelKind::Color(ColorFormat::Rgba8) => {
                (value.clamp(Vec4::ZERO, Vec4::ONE) * 255.0).round() / 255.0
            }
            TexelKind::Color(ColorFormat::Rgb16F) => value.truncate().extend(1.0),
            TexelKind::Color(_) => value,
            TexelKind::Depth => {
                let d = value.x.clamp(0.0, 1.0);
                Vec4::new(d, d, d, 1.0)
            }
        }
    }
}

fn snap(v: f32) -> f32 {
    let rounded = v.round();
    if (v - rounded).abs() < SNAP_EPSILON {
        rounded
    } else {
        v
    }
}

/// Signed parallelogram area of `(a, b, c)`; positive when counter-clockwise.
fn edge(a: Vec2, b: Vec2, c: Vec2) -> f32 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

struct SoftFramebuffer {
    label: String,
    width: u32,
    height: u32,
    layers: u32,
    color: Vec<TextureId>,
    depth: Option<TextureId>,
}

struct SoftProgram {
    label: String,
    shader: NativeShader,
    outputs: usize,
    uniforms: HashMap<String, UniformValue>,
}

struct SoftMesh {
    vertices: Vec<ScreenVertex>,
    indices: Vec<u32>,
}

/// A color destination: the window surface or an attachment texture.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Slot {
    Surface,
    Texture(TextureId),
}

/// The bound framebuffer resolved to concrete storage.
struct ResolvedTarget {
    color: Vec<Slot>,
    depth: Option<TextureId>,
    layer: u32,
    width: u32,
    height: u32,
    is_default: bool,
}

impl ResolvedTarget {
    fn attaches(&self, id: TextureId) -> bool {
        self.depth == Some(id) || self.color.contains(&Slot::Texture(id))
    }
}

/// One shaded fragment waiting to be written back.
struct FragmentWrite {
    x: u32,
    y: u32,
    depth: f32,
    first_output: usize,
}

/// CPU implementation of [`Backend`].
pub struct SoftwareBackend {
    surface: SoftTexture,
    srgb_surface: bool,
    max_dimension: u32,
    textures: HashMap<TextureId, SoftTexture>,
    framebuffers: HashMap<FramebufferId, SoftFramebuffer>,
    programs: HashMap<ProgramId, SoftProgram>,
    meshes: HashMap<MeshId, SoftMesh>,
    state: BindingState,
    ids: IdAllocator,
    draw_calls: u64,
    frames: u64,
}

impl SoftwareBackend {
    /// Creates a backend whose default framebuffer is a linear float surface.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            surface: Self::make_surface(width, height),
            srgb_surface: false,
            max_dimension: DEFAULT_MAX_DIMENSION,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            meshes: HashMap::new(),
            state: BindingState::default(),
            ids: IdAllocator::default(),
            draw_calls: 0,
            frames: 0,
        }
    }

    /// Makes the default framebuffer sRGB-capable, so writes are encoded while
    /// [`Capability::FramebufferSrgb`](crate::backend::Capability) is enabled.
    pub fn with_srgb_surface(mut self, srgb: bool) -> Self {
        self.srgb_surface = srgb;
        self
    }

    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    fn make_surface(width: u32, height: u32) -> SoftTexture {
        SoftTexture::new(
            width.max(1),
            height.max(1),
            1,
            TexelKind::Color(ColorFormat::Rgba32F),
        )
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn live_meshes(&self) -> usize {
        self.meshes.len()
    }

    /// Number of draw calls issued since creation.
    pub fn draw_calls(&self) -> u64 {
        self.draw_calls
    }

    /// Number of [`Backend::finish_frame`] calls since creation.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Default framebuffer texels, bottom row first.
    pub fn surface_pixels(&self) -> &[Vec4] {
        &self.surface.data
    }

    pub fn surface_pixel(&self, x: u32, y: u32) -> Vec4 {
        self.surface.fetch(0, x as i32, y as i32)
    }

    /// Layer 0 of a live texture, bottom row first.
    pub fn texture_pixels(&self, texture: TextureId) -> Option<&[Vec4]> {
        self.textures.get(&texture).map(|t| t.layer(0))
    }

    pub fn texture_pixel(&self, texture: TextureId, x: u32, y: u32) -> Option<Vec4> {
        self.textures
            .get(&texture)
            .map(|t| t.fetch(0, x as i32, y as i32))
    }

    /// The default framebuffer as an 8-bit image, top row first.
    pub fn surface_image(&self) -> image::RgbaImage {
        let surface = &self.surface;
        image::RgbaImage::from_fn(surface.width, surface.height, |x, y| {
            let texel = surface.fetch(0, x as i32, (surface.height - 1 - y) as i32);
            let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            image::Rgba([to_u8(texel.x), to_u8(texel.y), to_u8(texel.z), to_u8(texel.w)])
        })
    }

    /// Writes the default framebuffer to an image file.
    pub fn save_surface(&self, path: impl AsRef<Path>) -> Result<()> {
        self.surface_image().save(path.as_ref())?;
        Ok(())
    }

    fn resolve_target(&self) -> Result<ResolvedTarget> {
        match self.state.framebuffer {
            FramebufferBinding::Default => Ok(ResolvedTarget {
                color: vec![Slot::Surface],
                depth: None,
                layer: 0,
                width: self.surface.width,
                height: self.surface.height,
                is_default: true,
            }),
            FramebufferBinding::Offscreen { id, layer } => {
                let fb = self
                    .framebuffers
                    .get(&id)
                    .ok_or(Error::UnknownFramebuffer(id))?;
                Ok(ResolvedTarget {
                    color: fb.color.iter().copied().map(Slot::Texture).collect(),
                    depth: fb.depth,
                    layer,
                    width: fb.width,
                    height: fb.height,
                    is_default: false,
                })
            }
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> Option<&mut SoftTexture> {
        match slot {
            Slot::Surface => Some(&mut self.surface),
            Slot::Texture(id) => self.textures.get_mut(&id),
        }
    }

    fn encodes_srgb(&self, target: &ResolvedTarget) -> bool {
        target.is_default && self.srgb_surface && self.state.framebuffer_srgb
    }

    /// Rasterizes and shades `mesh`, returning the writes and the shaded outputs.
    fn shade_mesh(
        &self,
        mesh: &SoftMesh,
        program: &SoftProgram,
        target: &ResolvedTarget,
        depth_layer: Option<&[Vec4]>,
    ) -> (Vec<FragmentWrite>, Vec<Vec4>) {
        let units: Vec<Option<&SoftTexture>> = self
            .state
            .units
            .iter()
            .map(|unit| {
                // A texture attached to the target reads as unbound.
                unit.filter(|id| !target.attaches(*id))
                    .and_then(|id| self.textures.get(&id))
            })
            .collect();

        let outputs_per_fragment = target.color.len().max(1);
        let mut local_depth: Option<Vec<f32>> =
            depth_layer.map(|d| d.iter().map(|t| t.x).collect());
        let mut writes = Vec::new();
        let mut outputs = Vec::new();
        let (w, h) = (target.width as f32, target.height as f32);

        for triangle in mesh.indices.chunks_exact(3) {
            let v = [
                mesh.vertices[triangle[0] as usize],
                mesh.vertices[triangle[1] as usize],
                mesh.vertices[triangle[2] as usize],
            ];
            let p = v.map(|vertex| {
                Vec2::new(
                    (vertex.position[0] + 1.0) * 0.5 * w,
                    (vertex.position[1] + 1.0) * 0.5 * h,
                )
            });
            let z = v.map(|vertex| (vertex.position[2] + 1.0) * 0.5);
            let uv = v.map(|vertex| Vec2::from(vertex.uv));

            let area = edge(p[0], p[1], p[2]);
            if area.abs() <= f32::EPSILON {
                continue;
            }

            let min = p[0].min(p[1]).min(p[2]).floor().max(Vec2::ZERO);
            let max = p[0].max(p[1]).max(p[2]).ceil().min(Vec2::new(w, h));

            for py in min.y as u32..max.y as u32 {
                for px in min.x as u32..max.x as u32 {
                    let center = Vec2::new(px as f32 + 0.5, py as f32 + 0.5);
                    let b0 = edge(p[1], p[2], center) / area;
                    let b1 = edge(p[2], p[0], center) / area;
                    let b2 = edge(p[0], p[1], center) / area;
                    if b0 < -1e-6 || b1 < -1e-6 || b2 < -1e-6 {
                        continue;
                    }

                    let depth = b0 * z[0] + b1 * z[1] + b2 * z[2];
                    if let Some(stored) = local_depth.as_mut() {
                        let index = (py * target.width + px) as usize;
                        if depth >= stored[index] {
                            continue;
                        }
                        stored[index] = depth;
                    }

                    let fragment = Fragment {
                        position: center,
                        uv: uv[0] * b0 + uv[1] * b1 + uv[2] * b2,
                        depth,
                        target_size: (target.width, target.height),
                        uniforms: &program.uniforms,
                        units: &units,
                    };

                    let first_output = outputs.len();
                    outputs.resize(first_output + outputs_per_fragment, Vec4::ZERO);
                    program.shader.run(&fragment, &mut outputs[first_output..]);
                    writes.push(FragmentWrite {
                        x: px,
                        y: py,
                        depth,
                        first_output,
                    });
                }
            }
        }

        (writes, outputs)
    }
}

impl Backend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn shader_language(&self) -> ShaderLanguage {
        ShaderLanguage::Native
    }

    fn state(&self) -> &BindingState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut BindingState {
        &mut self.state
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface.width, self.surface.height)
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.surface = Self::make_surface(width, height);
        }
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> Result<FramebufferAllocation> {
        desc.validate(self.max_dimension)?;

        let layers = desc.depth.layers();
        let color: Vec<TextureId> = desc
            .color_formats
            .iter()
            .map(|&format| {
                let id = TextureId(self.ids.next());
                self.textures.insert(
                    id,
                    SoftTexture::new(desc.width, desc.height, 1, TexelKind::Color(format)),
                );
                id
            })
            .collect();

        let depth = match desc.depth {
            DepthAttachment::None => None,
            attachment => {
                let id = TextureId(self.ids.next());
                self.textures.insert(
                    id,
                    SoftTexture::new(
                        desc.width,
                        desc.height,
                        attachment.layers(),
                        TexelKind::Depth,
                    ),
                );
                Some(id)
            }
        };

        let id = FramebufferId(self.ids.next());
        self.framebuffers.insert(
            id,
            SoftFramebuffer {
                label: desc.label.clone(),
                width: desc.width,
                height: desc.height,
                layers,
                color: color.clone(),
                depth,
            },
        );
        log::debug!(
            "software: allocated framebuffer '{}' {:?} ({}x{}, {} color, depth {:?})",
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
            self.textures.remove(&texture);
            self.state.forget_texture(texture);
        }
        self.state.forget_framebuffer(framebuffer);
        log::debug!("software: released framebuffer '{}' {:?}", fb.label, framebuffer);
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

        let data = self
            .textures
            .get(&src_depth)
            .ok_or(Error::UnknownTexture(src_depth))?
            .layer(0)
            .to_vec();
        let target = self
            .textures
            .get_mut(&dst_depth)
            .ok_or(Error::UnknownTexture(dst_depth))?;
        let size = data.len();
        target.data[..size].copy_from_slice(&data);
        Ok(())
    }

    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.textures.get(&texture).map(|t| (t.width, t.height))
    }

    fn create_program(&mut self, desc: ProgramDescriptor) -> Result<ProgramId> {
        let ShaderSource::Native(shader) = desc.source else {
            return Err(Error::UnsupportedShader {
                backend: self.name(),
                language: desc.source.language(),
            });
        };
        let id = ProgramId(self.ids.next());
        self.programs.insert(
            id,
            SoftProgram {
                label: desc.label,
                shader,
                outputs: desc.outputs,
                uniforms: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        if let Some(removed) = self.programs.remove(&program) {
            log::trace!("software: deleted program '{}'", removed.label);
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
        program.uniforms.insert(name.to_owned(), value);
        Ok(())
    }

    fn create_mesh(&mut self, vertices: &[ScreenVertex], indices: &[u32]) -> Result<MeshId> {
        if indices.len() % 3 != 0 {
            return Err(Error::InvalidMesh(format!(
                "{} indices do not form whole triangles",
                indices.len()
            )));
        }
        if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(Error::InvalidMesh(format!(
                "index {} out of range for {} vertices",
                bad,
                vertices.len()
            )));
        }
        let id = MeshId(self.ids.next());
        self.meshes.insert(
            id,
            SoftMesh {
                vertices: vertices.to_vec(),
                indices: indices.to_vec(),
            },
        );
        Ok(id)
    }

    fn delete_mesh(&mut self, mesh: MeshId) {
        self.meshes.remove(&mesh);
    }

    fn draw(&mut self, mesh: MeshId) -> Result<()> {
        let program_id = self.state.program.ok_or(Error::NoProgramBound)?;
        let target = self.resolve_target()?;

        if self.state.units.iter().flatten().any(|id| target.attaches(*id)) {
            log::warn!("software: draw samples a texture attached to the bound framebuffer");
        }

        let depth_id = target.depth.filter(|_| self.state.depth_test);
        let (writes, outputs, program_outputs) = {
            let program = self
                .programs
                .get(&program_id)
                .ok_or(Error::UnknownProgram(program_id))?;
            let mesh = self.meshes.get(&mesh).ok_or(Error::UnknownMesh(mesh))?;
            let depth_layer = match depth_id {
                Some(id) => Some(
                    self.textures
                        .get(&id)
                        .ok_or(Error::UnknownTexture(id))?
                        .layer(target.layer),
                ),
                None => None,
            };
            log::trace!("software: draw '{}' ({} indices)", program.label, mesh.indices.len());
            let (writes, outputs) = self.shade_mesh(mesh, program, &target, depth_layer);
            (writes, outputs, program.outputs)
        };

        let encode = self.encodes_srgb(&target);
        for (attachment, &slot) in target.color.iter().enumerate().take(program_outputs) {
            let Some(texture) = self.slot_mut(slot) else {
                continue;
            };
            for write in &writes {
                let mut color = outputs[write.first_output + attachment];
                if encode {
                    color = encode_srgb(color);
                }
                texture.store(0, write.x, write.y, color);
            }
        }
        if let Some(id) = depth_id {
            if let Some(depth) = self.textures.get_mut(&id) {
                for write in &writes {
                    depth.store(target.layer, write.x, write.y, Vec4::splat(write.depth));
                }
            }
        }

        self.draw_calls += 1;
        Ok(())
    }

    fn clear(&mut self, clear: Clear) -> Result<()> {
        let target = self.resolve_target()?;
        if let Some(color) = clear.color {
            let color = if self.encodes_srgb(&target) {
                encode_srgb(color)
            } else {
                color
            };
            for &slot in &target.color {
                if let Some(texture) = self.slot_mut(slot) {
                    texture.fill(0, color);
                }
            }
        }
        if let (Some(depth), Some(id)) = (clear.depth, target.depth) {
            if let Some(texture) = self.textures.get_mut(&id) {
                texture.fill(target.layer, Vec4::splat(depth));
            }
        }
        Ok(())
    }

    fn finish_frame(&mut self) -> Result<()> {
        self.frames += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Capability;

    const QUAD: [ScreenVertex; 4] = [
        ScreenVertex::new([-1.0, 1.0, 0.0], [0.0, 1.0]),
        ScreenVertex::new([-1.0, -1.0, 0.0], [0.0, 0.0]),
        ScreenVertex::new([1.0, -1.0, 0.0], [1.0, 0.0]),
        ScreenVertex::new([1.0, 1.0, 0.0], [1.0, 1.0]),
    ];
    const QUAD_INDICES: [u32; 6] = [0, 1, 2, 0, 2, 3];

    fn color_target(backend: &mut SoftwareBackend, w: u32, h: u32) -> FramebufferAllocation {
        backend
            .create_framebuffer(&FramebufferDescriptor {
                label: "test".into(),
                width: w,
                height: h,
                color_formats: vec![ColorFormat::Rgba32F],
                depth: DepthAttachment::Renderbuffer,
            })
            .unwrap()
    }

    fn solid(color: Vec4) -> ProgramDescriptor {
        ProgramDescriptor::new("solid", ShaderSource::Native(NativeShader::new(move |_| color)))
    }

    #[test]
    fn quad_covers_every_pixel_once() {
        let mut backend = SoftwareBackend::new(7, 5);
        let mesh = backend.create_mesh(&QUAD, &QUAD_INDICES).unwrap();
        let program = backend
            .create_program(ProgramDescriptor::new(
                "uv",
                ShaderSource::Native(NativeShader::new(|frag| frag.uv.extend(0.0).extend(1.0))),
            ))
            .unwrap();
        backend.use_program(program);
        backend.draw(mesh).unwrap();

        // Pixel centers map to uv = (x + 0.5) / w.
        let p = backend.surface_pixel(3, 2);
        assert!((p.x - 3.5 / 7.0).abs() < 1e-5);
        assert!((p.y - 2.5 / 5.0).abs() < 1e-5);
        assert!(backend.surface_pixels().iter().all(|p| p.w == 1.0));
        assert_eq!(backend.draw_calls(), 1);
    }

    #[test]
    fn draw_without_program_fails() {
        let mut backend = SoftwareBackend::new(4, 4);
        let mesh = backend.create_mesh(&QUAD, &QUAD_INDICES).unwrap();
        assert!(matches!(backend.draw(mesh), Err(Error::NoProgramBound)));
    }

    #[test]
    fn wgsl_programs_are_rejected() {
        let mut backend = SoftwareBackend::new(4, 4);
        let result = backend.create_program(ProgramDescriptor::new(
            "wgsl",
            ShaderSource::Wgsl("fn fs() {}".into()),
        ));
        assert!(matches!(
            result,
            Err(Error::UnsupportedShader {
                language: ShaderLanguage::Wgsl,
                ..
            })
        ));
    }

    #[test]
    fn invalid_meshes_are_rejected() {
        let mut backend = SoftwareBackend::new(4, 4);
        assert!(backend.create_mesh(&QUAD, &[0, 1]).is_err());
        assert!(backend.create_mesh(&QUAD, &[0, 1, 9]).is_err());
    }

    #[test]
    fn sampling_reads_bound_unit() {
        let mut backend = SoftwareBackend::new(4, 4);
        let mesh = backend.create_mesh(&QUAD, &QUAD_INDICES).unwrap();
        let target = color_target(&mut backend, 4, 4);

        backend
            .bind_framebuffer(FramebufferBinding::Offscreen {
                id: target.id,
                layer: 0,
            })
            .unwrap();
        backend.clear(Clear::color(Vec4::new(0.25, 0.5, 0.75, 1.0))).unwrap();
        backend.bind_framebuffer(FramebufferBinding::Default).unwrap();

        let copy = backend
            .create_program(ProgramDescriptor::new(
                "copy",
                ShaderSource::Native(NativeShader::new(|frag| frag.sample(0, frag.uv))),
            ))
            .unwrap();
        backend.use_program(copy);
        backend.bind_texture(0, target.color[0]).unwrap();
        backend.draw(mesh).unwrap();

        let p = backend.surface_pixel(1, 2);
        assert!((p - Vec4::new(0.25, 0.5, 0.75, 1.0)).abs().max_element() < 1e-5);
    }

    #[test]
    fn unbound_units_sample_black() {
        let mut backend = SoftwareBackend::new(2, 2);
        let mesh = backend.create_mesh(&QUAD, &QUAD_INDICES).unwrap();
        let program = backend
            .create_program(ProgramDescriptor::new(
                "copy",
                ShaderSource::Native(NativeShader::new(|frag| frag.sample(3, frag.uv))),
            ))
            .unwrap();
        backend.use_program(program);
        backend.draw(mesh).unwrap();
        assert_eq!(backend.surface_pixel(0, 0), UNBOUND_TEXEL);
    }

    #[test]
    fn sampling_the_draw_target_reads_as_unbound() {
        let mut backend = SoftwareBackend::new(2, 2);
        let mesh = backend.create_mesh(&QUAD, &QUAD_INDICES).unwrap();
        let target = color_target(&mut backend, 2, 2);
        let copy = backend
            .create_program(ProgramDescriptor::new(
                "copy",
                ShaderSource::Native(NativeShader::new(|frag| frag.sample(0, frag.uv))),
            ))
            .unwrap();

        backend
            .bind_framebuffer(FramebufferBinding::Offscreen {
                id: target.id,
                layer: 0,
            })
            .unwrap();
        backend.clear(Clear::color(Vec4::ONE)).unwrap();
        backend.use_program(copy);
        backend.bind_texture(0, target.color[0]).unwrap();
        backend.draw(mesh).unwrap();

        assert_eq!(backend.texture_pixel(target.color[0], 1, 1), Some(UNBOUND_TEXEL));
    }

    #[test]
    fn rgb_and_rgba8_attachments_quantize() {
        let mut rgb = SoftTexture::new(1, 1, 1, TexelKind::Color(ColorFormat::Rgb16F));
        rgb.store(0, 0, 0, Vec4::new(2.0, 0.5, 0.0, 0.25));
        assert_eq!(rgb.fetch(0, 0, 0), Vec4::new(2.0, 0.5, 0.0, 1.0));

        let mut ldr = SoftTexture::new(1, 1, 1, TexelKind::Color(ColorFormat::Rgba8));
        ldr.store(0, 0, 0, Vec4::new(2.0, 0.5, -1.0, 1.0));
        let texel = ldr.fetch(0, 0, 0);
        assert_eq!(texel.x, 1.0);
        assert_eq!(texel.z, 0.0);
        assert!((texel.y - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn bilinear_sampling_blends_neighbours() {
        let mut texture = SoftTexture::new(2, 1, 1, TexelKind::Color(ColorFormat::Rgba32F));
        texture.store(0, 0, 0, Vec4::ZERO);
        texture.store(0, 1, 0, Vec4::ONE);
        let mid = texture.sample(0, Vec2::new(0.5, 0.5));
        assert!((mid.x - 0.5).abs() < 1e-6);
        // Clamp to edge past the border.
        assert_eq!(texture.sample(0, Vec2::new(2.0, 0.5)), Vec4::ONE);
    }

    #[test]
    fn depth_test_keeps_nearest_fragment() {
        let mut backend = SoftwareBackend::new(2, 2);
        let target = color_target(&mut backend, 2, 2);
        let near: Vec<ScreenVertex> = QUAD
            .iter()
            .map(|v| ScreenVertex::new([v.position[0], v.position[1], -0.5], v.uv))
            .collect();
        let near_mesh = backend.create_mesh(&near, &QUAD_INDICES).unwrap();
        let far_mesh = backend.create_mesh(&QUAD, &QUAD_INDICES).unwrap();
        let red = backend.create_program(solid(Vec4::new(1.0, 0.0, 0.0, 1.0))).unwrap();
        let blue = backend.create_program(solid(Vec4::new(0.0, 0.0, 1.0, 1.0))).unwrap();

        backend
            .bind_framebuffer(FramebufferBinding::Offscreen {
                id: target.id,
                layer: 0,
            })
            .unwrap();
        backend.clear(Clear::all(Vec4::ZERO, 1.0)).unwrap();
        backend.use_program(red);
        backend.draw(near_mesh).unwrap();
        backend.use_program(blue);
        backend.draw(far_mesh).unwrap();

        assert_eq!(
            backend.texture_pixel(target.color[0], 0, 0),
            Some(Vec4::new(1.0, 0.0, 0.0, 1.0))
        );

        backend.set_capability(Capability::DepthTest, false);
        backend.draw(far_mesh).unwrap();
        assert_eq!(
            backend.texture_pixel(target.color[0], 0, 0),
            Some(Vec4::new(0.0, 0.0, 1.0, 1.0))
        );
    }

    #[test]
    fn srgb_encoding_applies_only_to_capable_surface() {
        let mut backend = SoftwareBackend::new(1, 1).with_srgb_surface(true);
        backend.set_capability(Capability::FramebufferSrgb, true);
        backend.clear(Clear::color(Vec4::new(0.5, 0.0, 1.0, 1.0))).unwrap();
        let p = backend.surface_pixel(0, 0);
        assert!((p.x - 0.735_357).abs() < 1e-3);
        assert_eq!(p.z, 1.0);

        backend.set_capability(Capability::FramebufferSrgb, false);
        backend.clear(Clear::color(Vec4::new(0.5, 0.0, 1.0, 1.0))).unwrap();
        assert_eq!(backend.surface_pixel(0, 0).x, 0.5);
    }

    #[test]
    fn cube_layers_are_addressable() {
        let mut backend = SoftwareBackend::new(4, 4);
        let cube = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: "cube".into(),
                width: 4,
                height: 4,
                color_formats: vec![],
                depth: DepthAttachment::Cube,
            })
            .unwrap();
        let depth = cube.depth.expect("cube targets expose their depth texture");

        backend
            .bind_framebuffer(FramebufferBinding::Offscreen {
                id: cube.id,
                layer: 3,
            })
            .unwrap();
        backend.clear(Clear::depth(0.25)).unwrap();
        assert!(matches!(
            backend.bind_framebuffer(FramebufferBinding::Offscreen {
                id: cube.id,
                layer: 6
            }),
            Err(Error::LayerOutOfRange { .. })
        ));

        let texture = &backend.textures[&depth];
        assert_eq!(texture.fetch(3, 1, 1).x, 0.25);
        assert_eq!(texture.fetch(0, 1, 1).x, 1.0);
        // -Y selects face 3.
        assert_eq!(cube_face(Vec3::new(0.0, -1.0, 0.0)).0, 3);
    }

    #[test]
    fn deleting_a_framebuffer_frees_attachments_and_bindings() {
        let mut backend = SoftwareBackend::new(4, 4);
        let target = color_target(&mut backend, 4, 4);
        backend
            .bind_framebuffer(FramebufferBinding::Offscreen {
                id: target.id,
                layer: 0,
            })
            .unwrap();
        backend.bind_texture(2, target.color[0]).unwrap();
        assert_eq!(backend.live_textures(), 2);

        backend.delete_framebuffer(target.id);

        assert_eq!(backend.live_framebuffers(), 0);
        assert_eq!(backend.live_textures(), 0);
        assert_eq!(backend.bound_framebuffer(), FramebufferBinding::Default);
        assert_eq!(backend.bound_texture(2), None);
    }

    #[test]
    fn surface_image_is_top_row_first() {
        let mut backend = SoftwareBackend::new(1, 2);
        let mesh = backend.create_mesh(&QUAD, &QUAD_INDICES).unwrap();
        let program = backend
            .create_program(ProgramDescriptor::new(
                "rows",
                ShaderSource::Native(NativeShader::new(|frag| {
                    Vec4::new(frag.position.y - 0.5, 0.0, 0.0, 1.0)
                })),
            ))
            .unwrap();
        backend.use_program(program);
        backend.draw(mesh).unwrap();

        let image = backend.surface_image();
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(image.get_pixel(0, 1).0, [0, 0, 0, 255]);
    }
}
