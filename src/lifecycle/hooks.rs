//! Lifecycle hook registry.
//!
//! Three optional callbacks the embedding service can register to run its own
//! setup and teardown at fixed points. Registering again replaces the previous
//! callback; an empty slot is a no-op.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Point in the lifecycle at which a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// After listener acquisition, right before privileges are dropped.
    PrePrivilegeDrop,
    /// After privileges are dropped, before serving starts.
    PostInit,
    /// After draining finished, right before the exit callback.
    PostDrain,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookPoint::PrePrivilegeDrop => "pre-privilege-drop",
            HookPoint::PostInit => "post-init",
            HookPoint::PostDrain => "post-drain",
        };
        f.write_str(name)
    }
}

/// A registered no-argument callback.
pub struct Hook(Box<dyn Fn() + Send + Sync>);

impl Hook {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self(Box::new(f))
    }

    pub fn call(&self) {
        (self.0)()
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hook")
    }
}

#[derive(Debug, Default)]
pub struct LifecycleHooks {
    pre_privilege_drop: ArcSwapOption<Hook>,
    post_init: ArcSwapOption<Hook>,
    post_drain: ArcSwapOption<Hook>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, point: HookPoint) -> &ArcSwapOption<Hook> {
        match point {
            HookPoint::PrePrivilegeDrop => &self.pre_privilege_drop,
            HookPoint::PostInit => &self.post_init,
            HookPoint::PostDrain => &self.post_drain,
        }
    }

    /// Register `f` at `point`, replacing any earlier registration.
    pub fn register<F>(&self, point: HookPoint, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.slot(point).store(Some(Arc::new(Hook::new(f))));
    }

    pub fn on_pre_privilege_drop<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(HookPoint::PrePrivilegeDrop, f);
    }

    pub fn on_post_init<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(HookPoint::PostInit, f);
    }

    pub fn on_post_drain<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(HookPoint::PostDrain, f);
    }

    pub fn is_registered(&self, point: HookPoint) -> bool {
        self.slot(point).load().is_some()
    }

    /// Run the hook at `point` if one is registered.
    ///
    /// The slot is read once; the callback runs without holding any lock, so
    /// it may itself register hooks.
    pub fn run(&self, point: HookPoint) -> bool {
        match self.slot(point).load_full() {
            Some(hook) => {
                tracing::debug!(hook = %point, "Running lifecycle hook");
                hook.call();
                true
            }
            None => false,
        }
    }
}
