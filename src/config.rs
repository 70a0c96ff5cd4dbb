//! Builders for the post-processing pipeline and the demo host.

use glam::Vec4;

use crate::backend::ColorFormat;
use crate::effects::DEFAULT_BLOOM_THRESHOLD;

/// Settings for a [`PostProcessing`](crate::PostProcessing) pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PostProcessingConfig {
    /// Color format of both ping-pong targets.
    pub color_format: ColorFormat,
    /// Color the default framebuffer is cleared to before the final stage.
    pub clear_color: Vec4,
    /// Enable framebuffer sRGB encoding while the chain runs.
    pub srgb_output: bool,
}

impl Default for PostProcessingConfig {
    fn default() -> Self {
        Self {
            color_format: ColorFormat::Rgb16F,
            clear_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            srgb_output: true,
        }
    }
}

impl PostProcessingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color_format(mut self, format: ColorFormat) -> Self {
        self.color_format = format;
        self
    }

    pub fn clear_color(mut self, color: Vec4) -> Self {
        self.clear_color = color;
        self
    }

    pub fn srgb_output(mut self, enabled: bool) -> Self {
        self.srgb_output = enabled;
        self
    }
}

/// Configuration for the demo window.
#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub bloom_iterations: u32,
    pub bloom_threshold: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Afterglow".to_string(),
            width: 1280,
            height: 720,
            bloom_iterations: 5,
            bloom_threshold: DEFAULT_BLOOM_THRESHOLD,
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn bloom_iterations(mut self, iterations: u32) -> Self {
        self.bloom_iterations = iterations;
        self
    }

    pub fn bloom_threshold(mut self, threshold: f32) -> Self {
        self.bloom_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hdr_chain() {
        let config = PostProcessingConfig::default();
        assert_eq!(config.color_format, ColorFormat::Rgb16F);
        assert_eq!(config.clear_color, Vec4::new(0.0, 0.0, 0.0, 1.0));
        assert!(config.srgb_output);
    }

    #[test]
    fn builders_chain() {
        let config = PostProcessingConfig::new()
            .color_format(ColorFormat::Rgba32F)
            .srgb_output(false);
        assert_eq!(config.color_format, ColorFormat::Rgba32F);
        assert!(!config.srgb_output);

        let app = AppConfig::new().title("Glow").size(640, 360).bloom_iterations(2);
        assert_eq!((app.width, app.height), (640, 360));
        assert_eq!(app.title, "Glow");
        assert_eq!(app.bloom_iterations, 2);
        assert_eq!(app.bloom_threshold, DEFAULT_BLOOM_THRESHOLD);
    }
}
