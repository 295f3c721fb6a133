//! Opaque per-flow parser state
//!
//! The reassembler stores one [`ParserState`] per flow and never looks
//! inside; each plugin downcasts to its own state type. Destroying the
//! flow drops whatever the plugin left here.

use std::any::Any;

/// Per-flow state slot owned by the bound protocol plugin
#[derive(Default)]
pub struct ParserState {
    inner: Option<Box<dyn Any + Send>>,
}

impl ParserState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed view of the stored state
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.inner.as_ref()?.downcast_ref::<T>()
    }

    /// Typed mutable view of the stored state
    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.inner.as_mut()?.downcast_mut::<T>()
    }

    /// Fetch the plugin's state, initializing it on first use.
    ///
    /// Replaces a value of the wrong type, which only happens if a flow
    /// were rebound between plugins (bindings are fixed, so it does not).
    pub fn get_or_insert_with<T, F>(&mut self, init: F) -> &mut T
    where
        T: 'static + Send,
        F: FnOnce() -> T,
    {
        let wrong_type = self
            .inner
            .as_ref()
            .map(|b| !b.is::<T>())
            .unwrap_or(true);
        if wrong_type {
            self.inner = Some(Box::new(init()));
        }
        self.inner
            .as_mut()
            .unwrap()
            .downcast_mut::<T>()
            .unwrap()
    }

    pub fn set<T: 'static + Send>(&mut self, value: T) {
        self.inner = Some(Box::new(value));
    }

    /// Drop the stored state (unrecoverable parse error path)
    pub fn clear(&mut self) {
        self.inner = None;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }
}

impl std::fmt::Debug for ParserState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserState")
            .field("occupied", &self.inner.is_some())
            .finish()
    }
}
