//! Spinning cube demo
//!
//! Renders a vertex-colored cube that turns around all three axes.
//!
//! ```text
//! cube_app [--config <file.toml|file.ron>] [<vertex.spv> <fragment.spv>]
//! ```
//!
//! Shader paths given on the command line override the config file.

use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use lumen_engine::config::ConfigError;
use lumen_engine::prelude::*;
use thiserror::Error;

const DEFAULT_VERTEX_SHADER: &str = "target/shaders/cube.vert.spv";
const DEFAULT_FRAGMENT_SHADER: &str = "target/shaders/cube.frag.spv";
const STATUS_INTERVAL: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(16);
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    Usage(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    shaders: Option<(PathBuf, PathBuf)>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, AppError> {
    let mut parsed = Args::default();
    let mut positional = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| AppError::Usage("--config needs a file path".to_string()))?;
                parsed.config = Some(PathBuf::from(path));
            }
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    match positional.len() {
        0 => {}
        2 => {
            let fragment = positional.pop();
            let vertex = positional.pop();
            parsed.shaders = vertex.zip(fragment);
        }
        n => {
            return Err(AppError::Usage(format!(
                "Expected a vertex and a fragment shader, got {n} paths"
            )))
        }
    }
    Ok(parsed)
}

/// Turns its object by one radian per second around each axis
struct Spinner;

impl Behavior for Spinner {
    fn start(&mut self, _object: &RenderObject) {
        log::info!("Cube spinning");
    }

    fn update(&mut self, object: &RenderObject, delta_time: f32) {
        object.update_transform(|t| t.rotation += Vec3::repeat(delta_time));
    }
}

fn cube() -> RenderObject {
    let object = RenderObject::with_behavior(Spinner);
    object.set_vertices(vec![
        Vertex::new([-0.5, -0.5, 0.5], [1.0, 0.0, 0.0]),
        Vertex::new([0.5, -0.5, 0.5], [0.0, 1.0, 0.0]),
        Vertex::new([0.5, 0.5, 0.5], [0.0, 0.0, 1.0]),
        Vertex::new([-0.5, 0.5, 0.5], [1.0, 1.0, 0.0]),
        Vertex::new([-0.5, -0.5, -0.5], [1.0, 0.0, 1.0]),
        Vertex::new([0.5, -0.5, -0.5], [0.0, 1.0, 1.0]),
        Vertex::new([0.5, 0.5, -0.5], [1.0, 1.0, 1.0]),
        Vertex::new([-0.5, 0.5, -0.5], [0.2, 0.2, 0.2]),
    ]);
    object.set_indices(vec![
        0, 1, 2, 2, 3, 0, // front
        1, 5, 6, 6, 2, 1, // right
        5, 4, 7, 7, 6, 5, // back
        4, 0, 3, 3, 7, 4, // left
        3, 2, 6, 6, 7, 3, // top
        4, 5, 1, 1, 0, 4, // bottom
    ]);
    object
}

fn load_config(args: &Args) -> Result<EngineConfig, AppError> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default().with_window(
            WindowConfig::default()
                .with_size(1600, 1000)
                .with_title("Lumen - Spinning Cube"),
        ),
    };

    if let Some((vertex, fragment)) = &args.shaders {
        config.shaders.set(ShaderStage::Vertex, vertex);
        config.shaders.set(ShaderStage::Fragment, fragment);
    }
    if config.shaders.vertex.is_none() {
        config.shaders.set(ShaderStage::Vertex, DEFAULT_VERTEX_SHADER);
    }
    if config.shaders.fragment.is_none() {
        config.shaders.set(ShaderStage::Fragment, DEFAULT_FRAGMENT_SHADER);
    }
    config.validate().map_err(AppError::Usage)?;
    Ok(config)
}

/// Filter handed to the logger when `RUST_LOG` is unset
fn logger_level(config: &EngineConfig) -> &str {
    &config.logging.level
}

fn run(args: &Args, config: EngineConfig) -> Result<(), AppError> {
    if let Some(path) = &args.config {
        log::info!("Loaded config from {}", path.display());
    }

    let mut engine = Engine::new(config, VulkanBackend::new());
    engine.add_object(cube());
    engine.start()?;

    let mut since_status = Duration::ZERO;
    while engine.is_running() {
        thread::sleep(POLL_INTERVAL);
        since_status += POLL_INTERVAL;
        if since_status >= STATUS_INTERVAL {
            since_status = Duration::ZERO;
            log::info!(
                "{} frames, frame time {:.2} ms",
                engine.frames_rendered(),
                engine.frame_time() * 1000.0
            );
        }
    }

    engine.stop()?;
    log::info!("Rendered {} frames", engine.frames_rendered());
    Ok(())
}

fn main() {
    // The logger filter comes from the config, so it is read before logging starts
    let setup = parse_args(std::env::args().skip(1))
        .and_then(|args| load_config(&args).map(|config| (args, config)));
    let level = setup
        .as_ref()
        .map_or(DEFAULT_LOG_LEVEL, |(_, config)| logger_level(config));
    if let Err(e) = logging::init_with_level(level) {
        eprintln!("Logger already installed: {e}");
    }

    if let Err(e) = setup.and_then(|(args, config)| run(&args, config)) {
        log::error!("{e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, AppError> {
        parse_args(list.iter().map(|s| (*s).to_string()))
    }

    #[test]
    fn shader_pair_and_config_are_parsed() {
        let parsed = args(&["--config", "engine.toml", "a.vert.spv", "a.frag.spv"]).unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("engine.toml")));
        assert_eq!(
            parsed.shaders,
            Some((PathBuf::from("a.vert.spv"), PathBuf::from("a.frag.spv")))
        );
        assert_eq!(args(&[]).unwrap(), Args::default());
    }

    #[test]
    fn incomplete_arguments_are_rejected() {
        assert!(matches!(args(&["only.vert.spv"]), Err(AppError::Usage(_))));
        assert!(matches!(args(&["--config"]), Err(AppError::Usage(_))));
    }

    #[test]
    fn command_line_shaders_override_defaults() {
        let parsed = args(&["v.spv", "f.spv"]).unwrap();
        let config = load_config(&parsed).unwrap();
        assert_eq!(config.shaders.path(ShaderStage::Vertex), Some(std::path::Path::new("v.spv")));
        assert_eq!(config.window.width, 1600);
        assert_eq!(config.window.height, 1000);
    }

    #[test]
    fn config_file_sets_the_log_level() {
        let path = std::env::temp_dir().join(format!("cube_app_logging_{}.toml", process::id()));
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();

        let parsed = Args {
            config: Some(path.clone()),
            shaders: None,
        };
        let config = load_config(&parsed);
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(logger_level(&config), "debug");
        assert_eq!(logger_level(&load_config(&Args::default()).unwrap()), DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn cube_mesh_is_complete() {
        let cube = cube();
        cube.with_mesh(|mesh| {
            assert_eq!(mesh.vertices.len(), 8);
            assert_eq!(mesh.indices.len(), 36);
            assert!(mesh.indices.iter().all(|&i| i < 8));
        });
    }
}
