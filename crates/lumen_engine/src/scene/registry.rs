//! Ordered, growable collection of render objects

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::object::RenderObject;

/// Objects in registration order, shared by every engine thread
///
/// Objects can be added at any time. The renderer works from snapshots so
/// additions never block a frame for longer than the copy.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: Mutex<Vec<Arc<RenderObject>>>,
}

impl ObjectRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, Vec<Arc<RenderObject>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an object and return the shared handle
    pub fn add(&self, object: impl Into<Arc<RenderObject>>) -> Arc<RenderObject> {
        let object = object.into();
        let mut objects = self.objects();
        objects.push(Arc::clone(&object));
        log::debug!("Registered render object #{}", objects.len() - 1);
        object
    }

    /// Current objects, in registration order
    pub fn snapshot(&self) -> Vec<Arc<RenderObject>> {
        self.objects().clone()
    }

    /// Number of registered objects
    pub fn len(&self) -> usize {
        self.objects().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    /// Run the `start` hook of every object that has not started yet
    pub fn start_pending(&self) {
        for object in self.snapshot() {
            object.start();
        }
    }

    /// Advance every behaviour by one tick
    pub fn update_all(&self, delta_time: f32) {
        for object in self.snapshot() {
            object.update(delta_time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::scene::Behavior;
    use approx::assert_relative_eq;

    struct Drift;

    impl Behavior for Drift {
        fn update(&mut self, object: &RenderObject, delta_time: f32) {
            object.update_transform(|t| t.position += Vec3::x() * delta_time);
        }
    }

    #[test]
    fn keeps_registration_order() {
        let registry = ObjectRegistry::new();
        let first = registry.add(RenderObject::new());
        let second = registry.add(Arc::new(RenderObject::new()));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(Arc::ptr_eq(&snapshot[0], &first));
        assert!(Arc::ptr_eq(&snapshot[1], &second));
    }

    #[test]
    fn update_all_drives_behaviours() {
        let registry = ObjectRegistry::new();
        let moving = registry.add(RenderObject::with_behavior(Drift));
        let still = registry.add(RenderObject::new());

        registry.start_pending();
        assert!(moving.is_started() && still.is_started());

        registry.update_all(0.5);
        registry.update_all(0.5);
        assert_relative_eq!(moving.transform().position.x, 1.0);
        assert_relative_eq!(still.transform().position.x, 0.0);
    }

    #[test]
    fn objects_can_be_added_from_other_threads() {
        let registry = Arc::new(ObjectRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.add(RenderObject::new());
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 4);
    }
}
