//! Built-in fragment programs.
//!
//! Every effect ships in two forms: WGSL for [`WgpuBackend`](crate::WgpuBackend)
//! and a [`NativeShader`] for [`SoftwareBackend`](crate::SoftwareBackend).
//! [`Effect::program`] compiles whichever one the context's backend runs.
//!
//! | Effect            | Units        | Parameters  |
//! |-------------------|--------------|-------------|
//! | `Identity`        | 0            |             |
//! | `Invert`          | 0            |             |
//! | `Grayscale`       | 0            |             |
//! | `Blur`            | 0            |             |
//! | `Sharpen`         | 0            |             |
//! | `EdgeDetect`      | 0            |             |
//! | `BloomExtract`    | 0            | `threshold` |
//! | `BlurHorizontal`  | 0            |             |
//! | `BlurVertical`    | 0            |             |
//! | `BloomComposite`  | 0 (scene), 1 (bloom) |     |
//! | `ToneMapReinhard` | 0            |             |
//! | `ToneMapAces`     | 0            |             |

use std::borrow::Cow;

use glam::{Vec2, Vec3, Vec4};

use crate::backend::{Fragment, NativeShader, ProgramDescriptor, ShaderLanguage, ShaderSource};
use crate::context::Context;
use crate::error::Result;
use crate::program::Program;

/// Rec. 709 luma weights.
pub const LUMA: Vec3 = Vec3::new(0.2126, 0.7152, 0.0722);

/// Five-tap Gaussian weights, center first.
pub const GAUSSIAN_WEIGHTS: [f32; 5] = [0.227_027, 0.194_594_6, 0.121_621_6, 0.054_054, 0.016_216];

/// Default brightness above which [`Effect::BloomExtract`] keeps a pixel.
pub const DEFAULT_BLOOM_THRESHOLD: f32 = 1.0;

#[rustfmt::skip]
const BLUR_KERNEL: [f32; 9] = [
    1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0,
    2.0 / 16.0, 4.0 / 16.0, 2.0 / 16.0,
    1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0,
];

#[rustfmt::skip]
const SHARPEN_KERNEL: [f32; 9] = [
    -1.0, -1.0, -1.0,
    -1.0, 9.0, -1.0,
    -1.0, -1.0, -1.0,
];

#[rustfmt::skip]
const EDGE_KERNEL: [f32; 9] = [
    1.0, 1.0, 1.0,
    1.0, -8.0, 1.0,
    1.0, 1.0, 1.0,
];

/// A built-in post-processing program.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Effect {
    /// Copies the input.
    Identity,
    /// `1 - rgb`.
    Invert,
    /// Luma replicated into every channel.
    Grayscale,
    /// 3x3 binomial blur.
    Blur,
    /// 3x3 sharpen kernel.
    Sharpen,
    /// 3x3 Laplacian edge detection.
    EdgeDetect,
    /// Keeps pixels brighter than `threshold`, black elsewhere.
    BloomExtract,
    /// Horizontal pass of the separable Gaussian blur.
    BlurHorizontal,
    /// Vertical pass of the separable Gaussian blur.
    BlurVertical,
    /// Adds the blurred highlights on unit 1 to the scene on unit 0.
    BloomComposite,
    /// `c / (1 + c)`.
    ToneMapReinhard,
    /// Narkowicz ACES filmic fit.
    ToneMapAces,
}

impl Effect {
    pub const ALL: [Effect; 12] = [
        Effect::Identity,
        Effect::Invert,
        Effect::Grayscale,
        Effect::Blur,
        Effect::Sharpen,
        Effect::EdgeDetect,
        Effect::BloomExtract,
        Effect::BlurHorizontal,
        Effect::BlurVertical,
        Effect::BloomComposite,
        Effect::ToneMapReinhard,
        Effect::ToneMapAces,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Effect::Identity => "identity",
            Effect::Invert => "invert",
            Effect::Grayscale => "grayscale",
            Effect::Blur => "blur",
            Effect::Sharpen => "sharpen",
            Effect::EdgeDetect => "edge-detect",
            Effect::BloomExtract => "bloom-extract",
            Effect::BlurHorizontal => "blur-horizontal",
            Effect::BlurVertical => "blur-vertical",
            Effect::BloomComposite => "bloom-composite",
            Effect::ToneMapReinhard => "tonemap-reinhard",
            Effect::ToneMapAces => "tonemap-aces",
        }
    }

    /// Parameters the program declares, in slot order.
    pub fn params(self) -> &'static [&'static str] {
        match self {
            Effect::BloomExtract => &["threshold"],
            _ => &[],
        }
    }

    /// The WGSL fragment stage, to be compiled after the backend prelude.
    pub fn wgsl(self) -> Cow<'static, str> {
        match self {
            Effect::Identity => Cow::Borrowed(IDENTITY_WGSL),
            Effect::Invert => Cow::Borrowed(INVERT_WGSL),
            Effect::Grayscale => Cow::Borrowed(GRAYSCALE_WGSL),
            Effect::Blur => Cow::Owned(kernel_wgsl(&BLUR_KERNEL)),
            Effect::Sharpen => Cow::Owned(kernel_wgsl(&SHARPEN_KERNEL)),
            Effect::EdgeDetect => Cow::Owned(kernel_wgsl(&EDGE_KERNEL)),
            Effect::BloomExtract => Cow::Borrowed(BLOOM_EXTRACT_WGSL),
            Effect::BlurHorizontal => Cow::Owned(gaussian_wgsl("vec2f(1.0, 0.0)")),
            Effect::BlurVertical => Cow::Owned(gaussian_wgsl("vec2f(0.0, 1.0)")),
            Effect::BloomComposite => Cow::Borrowed(BLOOM_COMPOSITE_WGSL),
            Effect::ToneMapReinhard => Cow::Borrowed(REINHARD_WGSL),
            Effect::ToneMapAces => Cow::Borrowed(ACES_WGSL),
        }
    }

    /// The CPU implementation.
    pub fn native(self) -> NativeShader {
        match self {
            Effect::Identity => NativeShader::new(|frag| frag.sample(0, frag.uv)),
            Effect::Invert => NativeShader::new(|frag| {
                let c = frag.sample(0, frag.uv);
                (Vec3::ONE - c.truncate()).extend(1.0)
            }),
            Effect::Grayscale => NativeShader::new(|frag| {
                let luma = frag.sample(0, frag.uv).truncate().dot(LUMA);
                Vec3::splat(luma).extend(1.0)
            }),
            Effect::Blur => NativeShader::new(|frag| convolve(frag, &BLUR_KERNEL)),
            Effect::Sharpen => NativeShader::new(|frag| convolve(frag, &SHARPEN_KERNEL)),
            Effect::EdgeDetect => NativeShader::new(|frag| convolve(frag, &EDGE_KERNEL)),
            Effect::BloomExtract => NativeShader::new(|frag| {
                let threshold = frag.float("threshold", DEFAULT_BLOOM_THRESHOLD);
                let c = frag.sample(0, frag.uv).truncate();
                if c.dot(LUMA) > threshold {
                    c.extend(1.0)
                } else {
                    Vec4::new(0.0, 0.0, 0.0, 1.0)
                }
            }),
            Effect::BlurHorizontal => NativeShader::new(|frag| gaussian(frag, Vec2::X)),
            Effect::BlurVertical => NativeShader::new(|frag| gaussian(frag, Vec2::Y)),
            Effect::BloomComposite => NativeShader::new(|frag| {
                let scene = frag.sample(0, frag.uv).truncate();
                let bloom = frag.sample(1, frag.uv).truncate();
                (scene + bloom).extend(1.0)
            }),
            Effect::ToneMapReinhard => NativeShader::new(|frag| {
                let c = frag.sample(0, frag.uv).truncate().max(Vec3::ZERO);
                (c / (Vec3::ONE + c)).extend(1.0)
            }),
            Effect::ToneMapAces => NativeShader::new(|frag| {
                aces(frag.sample(0, frag.uv).truncate()).extend(1.0)
            }),
        }
    }

    /// Descriptor for the given shader language.
    pub fn descriptor(self, language: ShaderLanguage) -> ProgramDescriptor {
        let source = match language {
            ShaderLanguage::Wgsl => ShaderSource::Wgsl(self.wgsl()),
            ShaderLanguage::Native => ShaderSource::Native(self.native()),
        };
        self.params()
            .iter()
            .fold(ProgramDescriptor::new(self.name(), source), |desc, p| desc.param(*p))
    }

    /// Compiles the effect for the context's backend, with default parameters set.
    pub fn program(self, ctx: &Context) -> Result<Program> {
        let program = Program::new(ctx, self.descriptor(ctx.shader_language()))?;
        if self == Effect::BloomExtract {
            program.set("threshold", DEFAULT_BLOOM_THRESHOLD)?;
        }
        Ok(program)
    }
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Applies a 3x3 kernel (row-major, top row first) around the fragment.
fn convolve(frag: &Fragment<'_>, kernel: &[f32; 9]) -> Vec4 {
    let texel = frag.texel_size();
    let mut sum = Vec3::ZERO;
    for (i, weight) in kernel.iter().enumerate() {
        let dx = (i % 3) as f32 - 1.0;
        let dy = 1.0 - (i / 3) as f32;
        let uv = frag.uv + Vec2::new(dx, dy) * texel;
        sum += frag.sample(0, uv).truncate() * *weight;
    }
    sum.extend(1.0)
}

fn gaussian(frag: &Fragment<'_>, direction: Vec2) -> Vec4 {
    let step = frag.texel_size() * direction;
    let mut sum = frag.sample(0, frag.uv).truncate() * GAUSSIAN_WEIGHTS[0];
    for (i, weight) in GAUSSIAN_WEIGHTS.iter().enumerate().skip(1) {
        let offset = step * i as f32;
        sum += frag.sample(0, frag.uv + offset).truncate() * *weight;
        sum += frag.sample(0, frag.uv - offset).truncate() * *weight;
    }
    sum.extend(1.0)
}

fn aces(x: Vec3) -> Vec3 {
    let x = x.max(Vec3::ZERO);
    let (a, b, c, d, e) = (2.51, 0.03, 2.43, 0.59, 0.14);
    ((x * (a * x + b)) / (x * (c * x + d) + e)).clamp(Vec3::ZERO, Vec3::ONE)
}

fn wgsl_array(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| format!("{v:?}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Kernel WGSL. Texture space has v pointing down, so the top kernel row samples at `-v`.
fn kernel_wgsl(kernel: &[f32; 9]) -> String {
    format!(
        r#"
@fragment
fn fs(in: VertexOutput) -> @location(0) vec4f {{
    var kernel = array<f32, 9>({});
    let t = texel_size();
    var sum = vec3f(0.0);
    for (var i = 0; i < 9; i++) {{
        let offset = vec2f(f32(i % 3 - 1), f32(i / 3 - 1)) * t;
        sum += textureSampleLevel(t0, linear_sampler, in.uv + offset, 0.0).rgb * kernel[i];
    }}
    return finish(vec4f(sum, 1.0));
}}
"#,
        wgsl_array(kernel)
    )
}

fn gaussian_wgsl(direction: &str) -> String {
    format!(
        r#"
@fragment
fn fs(in: VertexOutput) -> @location(0) vec4f {{
    var weights = array<f32, 5>({});
    let step = texel_size() * {};
    var sum = textureSampleLevel(t0, linear_sampler, in.uv, 0.0).rgb * weights[0];
    for (var i = 1; i < 5; i++) {{
        let offset = step * f32(i);
        sum += textureSampleLevel(t0, linear_sampler, in.uv + offset, 0.0).rgb * weights[i];
        sum += textureSampleLevel(t0, linear_sampler, in.uv - offset, 0.0).rgb * weights[i];
    }}
    return finish(vec4f(sum, 1.0));
}}
"#,
        wgsl_array(&GAUSSIAN_WEIGHTS),
        direction
    )
}

const IDENTITY_WGSL: &str = r#"
@fragment
fn fs(in: VertexOutput) -> @location(0) vec4f {
    return finish(textureSampleLevel(t0, linear_sampler, in.uv, 0.0));
}
"#;

const INVERT_WGSL: &str = r#"
@fragment
fn fs(in: VertexOutput) -> @location(0) vec4f {
    let c = textureSampleLevel(t0, linear_sampler, in.uv, 0.0).rgb;
    return finish(vec4f(1.0 - c, 1.0));
}
"#;

const GRAYSCALE_WGSL: &str = r#"
@fragment
fn fs(in: VertexOutput) -> @location(0) vec4f {
    let c = textureSampleLevel(t0, linear_sampler, in.uv, 0.0).rgb;
    let luma = dot(c, vec3f(0.2126, 0.7152, 0.0722));
    return finish(vec4f(vec3f(luma), 1.0));
}
"#;

const BLOOM_EXTRACT_WGSL: &str = r#"
@fragment
fn fs(in: VertexOutput) -> @location(0) vec4f {
    let threshold = u.params[0].x;
    let c = textureSampleLevel(t0, linear_sampler, in.uv, 0.0).rgb;
    if dot(c, vec3f(0.2126, 0.7152, 0.0722)) > threshold {
        return finish(vec4f(c, 1.0));
    }
    return finish(vec4f(0.0, 0.0, 0.0, 1.0));
}
"#;

const BLOOM_COMPOSITE_WGSL: &str = r#"
@fragment
fn fs(in: VertexOutput) -> @location(0) vec4f {
    let scene = textureSampleLevel(t0, linear_sampler, in.uv, 0.0).rgb;
    let bloom = textureSampleLevel(t1, linear_sampler, in.uv, 0.0).rgb;
    return finish(vec4f(scene + bloom, 1.0));
}
"#;

const REINHARD_WGSL: &str = r#"
@fragment
fn fs(in: VertexOutput) -> @location(0) vec4f {
    let c = max(textureSampleLevel(t0, linear_sampler, in.uv, 0.0).rgb, vec3f(0.0));
    return finish(vec4f(c / (1.0 + c), 1.0));
}
"#;

const ACES_WGSL: &str = r#"
@fragment
fn fs(in: VertexOutput) -> @location(0) vec4f {
    let x = max(textureSampleLevel(t0, linear_sampler, in.uv, 0.0).rgb, vec3f(0.0));
    let mapped = (x * (2.51 * x + 0.03)) / (x * (2.43 * x + 0.59) + 0.14);
    return finish(vec4f(clamp(mapped, vec3f(0.0), vec3f(1.0)), 1.0));
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FullScreenQuad, RenderTarget, SoftwareBackend};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Runs `effect` over a target cleared to `input` and returns the texel at (1, 1).
    fn apply(effect: Effect, input: Vec4) -> Vec4 {
        let soft = Rc::new(RefCell::new(SoftwareBackend::new(4, 4)));
        let ctx = Context::from_shared(soft.clone());
        let quad = FullScreenQuad::new(&ctx).unwrap();
        let source =
            RenderTarget::with_formats(&ctx, 4, 4, &[crate::ColorFormat::Rgba32F]).unwrap();
        {
            let target = source.bind().unwrap();
            target.clear(input).unwrap();
        }
        let program = effect.program(&ctx).unwrap();
        source.bind_color_texture(0, 0).unwrap();
        source.bind_color_texture(1, 0).unwrap();
        quad.draw(&program).unwrap();
        let texel = soft.borrow().surface_pixel(1, 1);
        texel
    }

    fn close(a: Vec4, b: Vec4) -> bool {
        (a - b).abs().max_element() < 1e-4
    }

    #[test]
    fn every_effect_compiles_for_the_software_backend() {
        let ctx = Context::new(SoftwareBackend::new(2, 2));
        for effect in Effect::ALL {
            assert!(effect.program(&ctx).is_ok(), "{effect}");
        }
    }

    #[test]
    fn wgsl_sources_define_a_fragment_entry_point() {
        for effect in Effect::ALL {
            let source = effect.wgsl();
            assert!(source.contains("fn fs(in: VertexOutput)"), "{effect}");
            assert!(source.contains("finish("), "{effect}");
        }
        assert!(Effect::Blur.wgsl().contains("0.0625"));
    }

    #[test]
    fn point_effects() {
        let c = Vec4::new(0.25, 0.5, 1.0, 1.0);
        assert!(close(apply(Effect::Identity, c), c));
        assert!(close(apply(Effect::Invert, c), Vec4::new(0.75, 0.5, 0.0, 1.0)));
        let luma = 0.25 * 0.2126 + 0.5 * 0.7152 + 0.0722;
        assert!(close(apply(Effect::Grayscale, c), Vec4::new(luma, luma, luma, 1.0)));
    }

    #[test]
    fn kernels_preserve_flat_images() {
        let c = Vec4::new(0.3, 0.6, 0.9, 1.0);
        assert!(close(apply(Effect::Blur, c), c));
        assert!(close(apply(Effect::Sharpen, c), c));
        assert!(close(apply(Effect::EdgeDetect, c), Vec4::new(0.0, 0.0, 0.0, 1.0)));
        assert!(close(apply(Effect::BlurHorizontal, c), c));
        assert!(close(apply(Effect::BlurVertical, c), c));
    }

    #[test]
    fn bloom_extract_thresholds_on_luma() {
        let bright = Vec4::new(2.0, 2.0, 2.0, 1.0);
        let dim = Vec4::new(0.9, 0.9, 0.9, 1.0);
        assert!(close(apply(Effect::BloomExtract, bright), bright));
        assert!(close(apply(Effect::BloomExtract, dim), Vec4::new(0.0, 0.0, 0.0, 1.0)));
    }

    #[test]
    fn composite_adds_both_units() {
        let c = Vec4::new(0.25, 0.5, 1.5, 1.0);
        assert!(close(apply(Effect::BloomComposite, c), Vec4::new(0.5, 1.0, 3.0, 1.0)));
    }

    #[test]
    fn tone_maps_compress_hdr() {
        let c = Vec4::new(1.0, 3.0, 0.0, 1.0);
        assert!(close(apply(Effect::ToneMapReinhard, c), Vec4::new(0.5, 0.75, 0.0, 1.0)));

        let mapped = apply(Effect::ToneMapAces, Vec4::new(100.0, 0.0, 0.5, 1.0));
        assert!(mapped.x <= 1.0 && mapped.x > 0.99);
        assert_eq!(mapped.y, 0.0);
        assert!(close(mapped, aces(Vec3::new(100.0, 0.0, 0.5)).extend(1.0)));
    }

    #[test]
    fn gaussian_weights_sum_to_one() {
        let total = GAUSSIAN_WEIGHTS[0] + 2.0 * GAUSSIAN_WEIGHTS[1..].iter().sum::<f32>();
        assert!((total - 1.0).abs() < 1e-3);
    }
}
