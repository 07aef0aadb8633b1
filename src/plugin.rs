//! Opaque user extensions.
//!
//! Plugins are initialized by [`App::run`](crate::app::App::run) in
//! registration order, before the transport starts accepting.

/// A named extension with a one-shot initialization hook.
pub trait Plugin: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    /// Called once before the transport starts.
    fn initialize(&self);
}
