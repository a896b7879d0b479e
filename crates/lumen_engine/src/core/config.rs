//! # Engine Configuration
//!
//! All settings the engine reads at startup, grouped by subsystem:
//!
//! - **Window**: size, title and display mode of the output window
//! - **Shaders**: SPIR-V files for the vertex and fragment stages
//! - **Renderer**: frames in flight, descriptor slack, validation, clear color
//! - **Update**: behaviour tick rate
//! - **Logging**: default log filter
//!
//! Every section is serde-serializable, so an [`EngineConfig`] can be loaded
//! from a `.toml` or `.ron` file through the [`Config`] trait. Each section
//! offers builder-style `with_*` setters and a `validate` method.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use crate::config::{Config, ConfigError};

/// Largest supported number of frames in flight
pub const MAX_FRAMES_IN_FLIGHT: usize = 8;

/// Ten seconds. Kept below `i64::MAX` so the value survives TOML.
pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 10_000_000_000;

/// Window settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Initial framebuffer width in pixels
    pub width: u32,
    /// Initial framebuffer height in pixels
    pub height: u32,
    /// Window title
    pub title: String,
    /// Open on the primary monitor in fullscreen mode
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1600,
            height: 1000,
            title: "Lumen".to_string(),
            fullscreen: false,
        }
    }
}

impl WindowConfig {
    /// Set window size
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set window title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Enable or disable fullscreen
    pub fn with_fullscreen(mut self, fullscreen: bool) -> Self {
        self.fullscreen = fullscreen;
        self
    }

    /// Validate window settings
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!("Window size must be non-zero, got {}x{}", self.width, self.height));
        }
        Ok(())
    }
}

/// Programmable pipeline stage a shader is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderStage {
    /// Vertex stage
    Vertex,
    /// Fragment stage
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vertex => f.write_str("vertex"),
            Self::Fragment => f.write_str("fragment"),
        }
    }
}

/// SPIR-V shader files used by the graphics pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    /// Vertex stage SPIR-V file
    pub vertex: Option<PathBuf>,
    /// Fragment stage SPIR-V file
    pub fragment: Option<PathBuf>,
}

impl ShaderConfig {
    /// Create a shader configuration with both stages set
    pub fn new(vertex: impl Into<PathBuf>, fragment: impl Into<PathBuf>) -> Self {
        Self {
            vertex: Some(vertex.into()),
            fragment: Some(fragment.into()),
        }
    }

    /// Attach a shader file to a stage, replacing any previous one
    pub fn set(&mut self, stage: ShaderStage, path: impl Into<PathBuf>) {
        let path = Some(path.into());
        match stage {
            ShaderStage::Vertex => self.vertex = path,
            ShaderStage::Fragment => self.fragment = path,
        }
    }

    /// Path for a stage, if one was provided
    pub fn path(&self, stage: ShaderStage) -> Option<&Path> {
        match stage {
            ShaderStage::Vertex => self.vertex.as_deref(),
            ShaderStage::Fragment => self.fragment.as_deref(),
        }
    }

    /// First stage without a shader, if any
    pub fn missing_stage(&self) -> Option<ShaderStage> {
        [ShaderStage::Vertex, ShaderStage::Fragment]
            .into_iter()
            .find(|&stage| self.path(stage).is_none())
    }

    /// Validate that both stages are set and their files exist
    pub fn validate(&self) -> Result<(), String> {
        if let Some(stage) = self.missing_stage() {
            return Err(format!("No {stage} shader provided"));
        }
        for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
            if let Some(path) = self.path(stage) {
                if !path.exists() {
                    return Err(format!("{stage} shader not found: {}", path.display()));
                }
            }
        }
        Ok(())
    }
}

/// Renderer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Number of frames the CPU may record ahead of the GPU
    pub frames_in_flight: usize,
    /// Extra objects the descriptor pool is sized for at startup
    pub descriptor_slack: usize,
    /// Enable validation layers (only honoured in debug builds)
    pub enable_validation: bool,
    /// Color the frame is cleared to (RGBA)
    pub clear_color: [f32; 4],
    /// Longest CPU wait on a frame fence before the render loop gives up
    pub fence_timeout_ns: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            descriptor_slack: 10,
            enable_validation: cfg!(debug_assertions),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
        }
    }
}

impl RendererConfig {
    /// Set frames in flight
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set descriptor slack
    pub fn with_descriptor_slack(mut self, slack: usize) -> Self {
        self.descriptor_slack = slack;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = enabled;
        self
    }

    /// Set clear color
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Set fence timeout in nanoseconds
    pub fn with_fence_timeout_ns(mut self, timeout: u64) -> Self {
        self.fence_timeout_ns = timeout;
        self
    }

    /// Validate renderer settings
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&self.frames_in_flight) {
            return Err(format!(
                "frames_in_flight must be between 1 and {MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            ));
        }
        if self.fence_timeout_ns == 0 {
            return Err("fence_timeout_ns must be non-zero".to_string());
        }
        if self.clear_color.iter().any(|c| !(0.0..=1.0).contains(c)) {
            return Err(format!("clear_color components must be in [0, 1], got {:?}", self.clear_color));
        }
        Ok(())
    }
}

/// Behaviour update loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Upper bound on behaviour ticks per second
    pub rate_hz: u32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self { rate_hz: 900 }
    }
}

impl UpdateConfig {
    /// Set tick rate
    pub fn with_rate_hz(mut self, rate_hz: u32) -> Self {
        self.rate_hz = rate_hz;
        self
    }

    /// Validate update settings
    pub fn validate(&self) -> Result<(), String> {
        if self.rate_hz == 0 {
            return Err("rate_hz must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl LoggingConfig {
    /// Validate logging settings
    pub fn validate(&self) -> Result<(), String> {
        match self.level.to_ascii_lowercase().as_str() {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(format!("Unknown log level: {other}")),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Window settings
    pub window: WindowConfig,
    /// Shader files
    pub shaders: ShaderConfig,
    /// Renderer settings
    pub renderer: RendererConfig,
    /// Update loop settings
    pub update: UpdateConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config for EngineConfig {}

impl EngineConfig {
    /// Replace window settings
    pub fn with_window(mut self, window: WindowConfig) -> Self {
        self.window = window;
        self
    }

    /// Replace shader settings
    pub fn with_shaders(mut self, shaders: ShaderConfig) -> Self {
        self.shaders = shaders;
        self
    }

    /// Replace renderer settings
    pub fn with_renderer(mut self, renderer: RendererConfig) -> Self {
        self.renderer = renderer;
        self
    }

    /// Replace update settings
    pub fn with_update(mut self, update: UpdateConfig) -> Self {
        self.update = update;
        self
    }

    /// Validate every section except shader presence, which is checked at start
    pub fn validate(&self) -> Result<(), String> {
        self.window.validate()?;
        self.renderer.validate()?;
        self.update.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.renderer.frames_in_flight, 2);
        assert_eq!(config.renderer.descriptor_slack, 10);
        assert_eq!(config.update.rate_hz, 900);
        assert_eq!((config.window.width, config.window.height), (1600, 1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn frames_in_flight_is_bounded() {
        assert!(RendererConfig::default().with_frames_in_flight(0).validate().is_err());
        assert!(RendererConfig::default().with_frames_in_flight(MAX_FRAMES_IN_FLIGHT).validate().is_ok());
        assert!(RendererConfig::default()
            .with_frames_in_flight(MAX_FRAMES_IN_FLIGHT + 1)
            .validate()
            .is_err());
    }

    #[test]
    fn missing_shader_stage_is_reported() {
        let mut shaders = ShaderConfig::default();
        assert_eq!(shaders.missing_stage(), Some(ShaderStage::Vertex));
        shaders.set(ShaderStage::Vertex, "vert.spv");
        assert_eq!(shaders.missing_stage(), Some(ShaderStage::Fragment));
        shaders.set(ShaderStage::Fragment, "frag.spv");
        assert_eq!(shaders.missing_stage(), None);
        assert_eq!(shaders.path(ShaderStage::Vertex), Some(Path::new("vert.spv")));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [window]
            title = "cube"

            [renderer]
            frames_in_flight = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.window.title, "cube");
        assert_eq!(config.window.width, 1600);
        assert_eq!(config.renderer.frames_in_flight, 3);
        assert_eq!(config.renderer.descriptor_slack, 10);
    }

    #[test]
    fn ron_round_trip_preserves_settings() {
        let config = EngineConfig::default()
            .with_shaders(ShaderConfig::new("a.spv", "b.spv"))
            .with_update(UpdateConfig::default().with_rate_hz(120));
        let text = ron::ser::to_string(&config).unwrap();
        let parsed: EngineConfig = ron::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
