//! Core engine settings

pub mod config;

pub use config::{
    EngineConfig, LoggingConfig, RendererConfig, ShaderConfig, ShaderStage, UpdateConfig, WindowConfig,
};
