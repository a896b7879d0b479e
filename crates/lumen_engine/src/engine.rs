//! Engine context
//!
//! [`Engine`] owns the configuration, the shared object registry and the two
//! worker tasks. The render task builds the device on its own thread and
//! runs the frame driver; the update task drives object behaviours at a
//! fixed rate. Either task ending (window closed, fatal render error, or
//! [`Engine::stop`]) winds down the other.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::core::{EngineConfig, ShaderStage};
use crate::foundation::task::{StopSignal, Task, TaskError};
use crate::foundation::time::{FrameTiming, Timer};
use crate::render::backends::BackendFactory;
use crate::render::{FrameDriver, RenderError, RenderResult};
use crate::scene::{Behavior, ObjectRegistry, RenderObject};

const RENDER_TASK: &str = "lumen-render";
const UPDATE_TASK: &str = "lumen-update";

/// Engine lifecycle errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// A pipeline stage has no shader attached
    #[error("No {0} shader provided")]
    MissingShader(ShaderStage),

    /// `start` was called twice without `stop`
    #[error("Engine is already running")]
    AlreadyRunning,

    /// The configuration failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// The render task failed
    #[error("Rendering error: {0}")]
    Render(#[from] RenderError),

    /// A worker thread panicked
    #[error("Task '{0}' panicked")]
    TaskPanicked(&'static str),

    /// A worker thread could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<TaskError> for EngineError {
    fn from(error: TaskError) -> Self {
        match error {
            TaskError::Panicked(name) | TaskError::AlreadyJoined(name) => Self::TaskPanicked(name),
        }
    }
}

struct Workers {
    stop: StopSignal,
    render: Task<RenderResult<()>>,
    update: Task<()>,
}

/// Top-level engine context
pub struct Engine<F: BackendFactory + Clone> {
    config: EngineConfig,
    factory: F,
    registry: Arc<ObjectRegistry>,
    timing: Arc<FrameTiming>,
    render_error: Arc<Mutex<Option<String>>>,
    workers: Option<Workers>,
}

impl<F: BackendFactory + Clone> Engine<F> {
    /// Create a stopped engine that will render through `factory`
    pub fn new(config: EngineConfig, factory: F) -> Self {
        Self {
            config,
            factory,
            registry: Arc::new(ObjectRegistry::new()),
            timing: Arc::new(FrameTiming::new()),
            render_error: Arc::new(Mutex::new(None)),
            workers: None,
        }
    }

    /// Attach a SPIR-V file to a pipeline stage; takes effect on the next start
    pub fn add_shader(&mut self, path: impl Into<PathBuf>, stage: ShaderStage) {
        self.config.shaders.set(stage, path);
    }

    /// Register an object driven by `behavior`
    pub fn instantiate(&self, behavior: impl Behavior + 'static) -> Arc<RenderObject> {
        self.registry.add(RenderObject::with_behavior(behavior))
    }

    /// Register an existing object
    pub fn add_object(&self, object: impl Into<Arc<RenderObject>>) -> Arc<RenderObject> {
        self.registry.add(object)
    }

    /// Spawn the render and update tasks
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.workers.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        if let Some(stage) = self.config.shaders.missing_stage() {
            log::error!("Refusing to start: no {stage} shader provided");
            return Err(EngineError::MissingShader(stage));
        }
        self.config.validate().map_err(EngineError::Config)?;

        log::info!("Starting engine with {} objects", self.registry.len());
        self.registry.start_pending();
        *self.render_error.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let stop = StopSignal::new();
        let render = {
            let factory = self.factory.clone();
            let config = self.config.clone();
            let registry = Arc::clone(&self.registry);
            let timing = Arc::clone(&self.timing);
            let render_error = Arc::clone(&self.render_error);
            Task::spawn(RENDER_TASK, stop.clone(), move |stop| {
                let result = render_main(&factory, &config, registry, &timing, &stop);
                if let Err(e) = &result {
                    log::error!("Render task failed: {e}");
                    *render_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
                }
                // A closed window or a dead device ends the whole engine
                stop.request();
                result
            })?
        };
        let update = {
            let registry = Arc::clone(&self.registry);
            let timing = Arc::clone(&self.timing);
            let rate_hz = self.config.update.rate_hz;
            match Task::spawn(UPDATE_TASK, stop.clone(), move |stop| {
                update_main(&registry, &timing, rate_hz, &stop);
            }) {
                Ok(task) => task,
                Err(e) => {
                    // Dropping the render task stops and joins it
                    drop(render);
                    return Err(e.into());
                }
            }
        };

        self.workers = Some(Workers { stop, render, update });
        Ok(())
    }

    /// Stop both tasks, wait for them and report how rendering ended
    pub fn stop(&mut self) -> Result<(), EngineError> {
        let Some(workers) = self.workers.take() else {
            return Ok(());
        };
        log::info!("Stopping engine");
        workers.stop.request();
        let update = workers.update.join();
        let render = workers.render.join();

        update?;
        render??;
        Ok(())
    }

    /// Whether the render task is still alive
    pub fn is_running(&self) -> bool {
        self.workers
            .as_ref()
            .is_some_and(|workers| !workers.render.is_finished() && !workers.stop.is_requested())
    }

    /// Fatal render error of the current or last run, if any
    pub fn render_error(&self) -> Option<String> {
        self.render_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Duration of the last update tick in seconds
    pub fn delta_time(&self) -> f64 {
        self.timing.update_delta()
    }

    /// Duration of the last presented frame in seconds
    pub fn frame_time(&self) -> f64 {
        self.timing.frame_time()
    }

    /// Frames presented since the engine was created
    pub fn frames_rendered(&self) -> u64 {
        self.timing.frames_rendered()
    }

    /// Shared object registry
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl<F: BackendFactory + Clone> Drop for Engine<F> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Engine stopped with error: {e}");
        }
    }
}

fn render_main<F: BackendFactory>(
    factory: &F,
    config: &EngineConfig,
    registry: Arc<ObjectRegistry>,
    timing: &FrameTiming,
    stop: &StopSignal,
) -> RenderResult<()> {
    let device = factory.create_device(config)?;
    let mut driver = FrameDriver::new(device, registry, &config.renderer)?;
    let result = driver.run(stop, timing);
    let teardown = driver.shutdown();
    result.and(teardown)
}

fn update_main(registry: &ObjectRegistry, timing: &FrameTiming, rate_hz: u32, stop: &StopSignal) {
    let period = Duration::from_secs_f64(1.0 / f64::from(rate_hz.max(1)));
    let mut timer = Timer::new();
    while !stop.is_requested() {
        let delta_time = timer.tick();
        timing.set_update_delta(delta_time);
        #[allow(clippy::cast_possible_truncation)]
        registry.update_all(delta_time as f32);

        let elapsed = timer.since_last_tick();
        if elapsed < period {
            thread::sleep(period - elapsed);
        }
    }
    log::debug!("Update loop finished after {} ticks", timer.tick_count());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::render::backends::headless::{DeviceEvent, HeadlessBackend, HeadlessDevice, Scripted};
    use std::time::Instant;

    struct Spin;

    impl Behavior for Spin {
        fn update(&mut self, object: &RenderObject, delta_time: f32) {
            object.update_transform(|t| t.rotation += Vec3::new(1.0, 1.0, 1.0) * delta_time);
        }
    }

    fn engine(device: &Arc<HeadlessDevice>) -> Engine<HeadlessBackend> {
        let mut engine = Engine::new(EngineConfig::default(), HeadlessBackend::new(Arc::clone(device)));
        engine.add_shader("shaders/cube.vert.spv", ShaderStage::Vertex);
        engine.add_shader("shaders/cube.frag.spv", ShaderStage::Fragment);
        engine
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn start_requires_both_shaders() {
        let device = Arc::new(HeadlessDevice::new());
        let mut engine = Engine::new(EngineConfig::default(), HeadlessBackend::new(Arc::clone(&device)));
        assert!(matches!(
            engine.start(),
            Err(EngineError::MissingShader(ShaderStage::Vertex))
        ));

        engine.add_shader("cube.vert.spv", ShaderStage::Vertex);
        assert!(matches!(
            engine.start(),
            Err(EngineError::MissingShader(ShaderStage::Fragment))
        ));
        assert!(!engine.is_running());
        assert!(device.events().is_empty());
    }

    #[test]
    fn invalid_config_is_refused() {
        let device = Arc::new(HeadlessDevice::new());
        let mut engine = engine(&device);
        engine.config.update.rate_hz = 0;
        assert!(matches!(engine.start(), Err(EngineError::Config(_))));
    }

    #[test]
    fn renders_and_updates_until_stopped() {
        let device = Arc::new(HeadlessDevice::new());
        let mut engine = engine(&device);
        let cube = engine.instantiate(Spin);
        cube.set_vertices(vec![crate::render::api::Vertex::default(); 3]);
        cube.set_indices([0u16, 1, 2]);

        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));
        wait_until(|| engine.frames_rendered() >= 5 && cube.transform().rotation.x > 0.0);
        assert!(engine.is_running());

        engine.stop().unwrap();
        assert!(!engine.is_running());
        assert!(engine.frame_time() >= 0.0);
        assert!(engine.delta_time() >= 0.0);
        assert!(device.validation_errors().is_empty());
        assert_eq!(device.live_object_count(), 0);
        assert!(device.max_in_flight() <= engine.config().renderer.frames_in_flight);
    }

    #[test]
    fn window_close_ends_the_engine() {
        let device = Arc::new(HeadlessDevice::new());
        let mut engine = engine(&device);
        engine.start().unwrap();
        wait_until(|| engine.frames_rendered() >= 1);

        device.request_close();
        wait_until(|| !engine.is_running());
        engine.stop().unwrap();
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn device_loss_is_reported_on_stop() {
        let device = Arc::new(HeadlessDevice::new());
        let mut engine = engine(&device);
        device.script_acquire(Scripted::DeviceLost);
        engine.start().unwrap();

        wait_until(|| !engine.is_running());
        assert!(engine.render_error().is_some());
        assert!(matches!(
            engine.stop(),
            Err(EngineError::Render(RenderError::DeviceLost))
        ));
        assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::Presented { .. })), 0);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn failed_submit_is_reported_on_stop() {
        let device = Arc::new(HeadlessDevice::new());
        let mut engine = engine(&device);
        device.script_submit(Scripted::DeviceLost);
        engine.start().unwrap();

        wait_until(|| !engine.is_running());
        assert!(engine.render_error().is_some());
        assert!(matches!(
            engine.stop(),
            Err(EngineError::Render(RenderError::DeviceLost))
        ));
        assert_eq!(engine.frames_rendered(), 0);
        assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::Presented { .. })), 0);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn objects_added_while_running_are_drawn() {
        let device = Arc::new(HeadlessDevice::new());
        let mut engine = engine(&device);
        engine.start().unwrap();
        wait_until(|| engine.frames_rendered() >= 2);

        let object = engine.add_object(RenderObject::new());
        object.set_vertices(vec![crate::render::api::Vertex::default(); 4]);
        object.set_indices([0u16, 1, 2, 2, 3, 0]);
        wait_until(|| device.count_events(|e| matches!(e, DeviceEvent::Submitted { draw_count: 1, .. })) > 0);

        engine.stop().unwrap();
        assert!(device.validation_errors().is_empty());
    }
}
