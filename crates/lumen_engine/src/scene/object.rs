//! Renderable objects

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::foundation::math::Transform;
use crate::render::api::Vertex;

/// Per-object logic driven by the update thread
pub trait Behavior: Send {
    /// Called once before the first update
    fn start(&mut self, _object: &RenderObject) {}

    /// Called every update tick with the tick duration in seconds
    fn update(&mut self, object: &RenderObject, delta_time: f32);
}

/// Host-side mesh with change counters for the renderer
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    /// Position and color vertices
    pub vertices: Vec<Vertex>,
    /// Triangle list indices
    pub indices: Vec<u16>,
    /// Bumped on every `set_vertices`
    pub vertex_revision: u64,
    /// Bumped on every `set_indices`
    pub index_revision: u64,
}

impl MeshData {
    /// Whether there is anything to draw
    pub fn is_drawable(&self) -> bool {
        !self.vertices.is_empty() && !self.indices.is_empty()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Something the engine draws every frame
///
/// The transform, the mesh and the behaviour sit behind separate locks so
/// a behaviour can move its own object while it runs.
pub struct RenderObject {
    transform: Mutex<Transform>,
    mesh: Mutex<MeshData>,
    behavior: Mutex<Option<Box<dyn Behavior>>>,
    started: AtomicBool,
}

impl Default for RenderObject {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RenderObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mesh = lock(&self.mesh);
        f.debug_struct("RenderObject")
            .field("transform", &self.transform())
            .field("vertices", &mesh.vertices.len())
            .field("indices", &mesh.indices.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl RenderObject {
    /// Create an object without mesh or behaviour at the origin
    pub fn new() -> Self {
        Self {
            transform: Mutex::new(Transform::default()),
            mesh: Mutex::new(MeshData::default()),
            behavior: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Create an object driven by a behaviour
    pub fn with_behavior(behavior: impl Behavior + 'static) -> Self {
        let object = Self::new();
        *lock(&object.behavior) = Some(Box::new(behavior));
        object
    }

    /// Replace the vertex data
    pub fn set_vertices(&self, vertices: impl Into<Vec<Vertex>>) {
        let mut mesh = lock(&self.mesh);
        mesh.vertices = vertices.into();
        mesh.vertex_revision += 1;
    }

    /// Replace the index data
    pub fn set_indices(&self, indices: impl Into<Vec<u16>>) {
        let mut mesh = lock(&self.mesh);
        mesh.indices = indices.into();
        mesh.index_revision += 1;
    }

    /// Current vertex and index revisions
    pub fn mesh_revision(&self) -> (u64, u64) {
        let mesh = lock(&self.mesh);
        (mesh.vertex_revision, mesh.index_revision)
    }

    /// Run `f` with the mesh locked
    pub fn with_mesh<R>(&self, f: impl FnOnce(&MeshData) -> R) -> R {
        f(&lock(&self.mesh))
    }

    /// Copy of the current transform
    pub fn transform(&self) -> Transform {
        *lock(&self.transform)
    }

    /// Replace the transform
    pub fn set_transform(&self, transform: Transform) {
        *lock(&self.transform) = transform;
    }

    /// Modify the transform in place
    pub fn update_transform(&self, f: impl FnOnce(&mut Transform)) {
        f(&mut lock(&self.transform));
    }

    /// Whether the behaviour's `start` hook has run
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Run `start` once; later calls do nothing
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(behavior) = lock(&self.behavior).as_mut() {
            behavior.start(self);
        }
    }

    /// Advance the behaviour by one tick, starting it first if needed
    pub fn update(&self, delta_time: f32) {
        self.start();
        if let Some(behavior) = lock(&self.behavior).as_mut() {
            behavior.update(self, delta_time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use approx::assert_relative_eq;

    struct Spin {
        starts: usize,
    }

    impl Behavior for Spin {
        fn start(&mut self, object: &RenderObject) {
            self.starts += 1;
            object.set_transform(Transform::from_position(Vec3::new(0.0, 0.0, -1.0)));
        }

        fn update(&mut self, object: &RenderObject, delta_time: f32) {
            assert_eq!(self.starts, 1);
            object.update_transform(|t| t.rotation += Vec3::new(1.0, 1.0, 1.0) * delta_time);
        }
    }

    #[test]
    fn behaviour_starts_once_before_updates() {
        let object = RenderObject::with_behavior(Spin { starts: 0 });
        assert!(!object.is_started());

        object.update(0.5);
        object.update(0.25);
        object.start();

        assert!(object.is_started());
        let transform = object.transform();
        assert_relative_eq!(transform.position.z, -1.0);
        assert_relative_eq!(transform.rotation.x, 0.75);
        assert_relative_eq!(transform.rotation.z, 0.75);
    }

    #[test]
    fn mesh_setters_bump_revisions() {
        let object = RenderObject::new();
        assert_eq!(object.mesh_revision(), (0, 0));
        assert!(!object.with_mesh(MeshData::is_drawable));

        object.set_vertices(vec![Vertex::new([0.0; 3], [1.0; 3]); 3]);
        object.set_indices([0u16, 1, 2]);
        object.set_indices(vec![0u16, 2, 1]);

        assert_eq!(object.mesh_revision(), (1, 2));
        assert!(object.with_mesh(MeshData::is_drawable));
        assert_eq!(object.with_mesh(|m| m.indices.clone()), vec![0, 2, 1]);
    }

    #[test]
    fn object_without_behaviour_updates_quietly() {
        let object = RenderObject::new();
        object.update(1.0);
        assert!(object.is_started());
        assert_eq!(object.transform(), Transform::default());
    }
}
