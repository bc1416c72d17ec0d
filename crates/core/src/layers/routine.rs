//! Swappable execution routines.
//!
//! Each attention sub-module and the top-level model dispatch their forward
//! pass through a [`RoutineSlot`]. Callers always go through the owning
//! module, so swapping the slot's routine changes behavior for every caller
//! without touching the module's weights.

use std::sync::Arc;

/// Holds the routine currently active for one module.
pub struct RoutineSlot<R: ?Sized> {
    current: Arc<R>,
}

impl<R: ?Sized> RoutineSlot<R> {
    pub fn new(routine: Arc<R>) -> Self {
        Self { current: routine }
    }

    /// The active routine.
    pub fn get(&self) -> &Arc<R> {
        &self.current
    }

    /// Install `routine` and hand back the one it displaced.
    pub fn replace(&mut self, routine: Arc<R>) -> Arc<R> {
        std::mem::replace(&mut self.current, routine)
    }

    /// Whether `routine` is the exact instance installed (pointer identity).
    pub fn is(&self, routine: &Arc<R>) -> bool {
        Arc::ptr_eq(&self.current, routine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> &'static str;
    }

    struct Hello;
    struct Hi;

    impl Greeter for Hello {
        fn greet(&self) -> &'static str {
            "hello"
        }
    }

    impl Greeter for Hi {
        fn greet(&self) -> &'static str {
            "hi"
        }
    }

    #[test]
    fn replace_returns_displaced_routine() {
        let hello: Arc<dyn Greeter> = Arc::new(Hello);
        let mut slot = RoutineSlot::new(hello.clone());
        assert_eq!(slot.get().greet(), "hello");

        let old = slot.replace(Arc::new(Hi));
        assert_eq!(slot.get().greet(), "hi");
        assert!(Arc::ptr_eq(&old, &hello));

        slot.replace(old);
        assert!(slot.is(&hello));
    }

    #[test]
    fn identity_is_per_instance() {
        let a: Arc<dyn Greeter> = Arc::new(Hello);
        let b: Arc<dyn Greeter> = Arc::new(Hello);
        let slot = RoutineSlot::new(a.clone());
        assert!(slot.is(&a));
        assert!(!slot.is(&b));
    }
}
