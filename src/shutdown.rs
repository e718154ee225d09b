//! Shutdown and rollback registry.
//!
//! Components hand over ownership of undo actions here. The registry is the
//! sole owner until [`ShutdownRegistry::run`] consumes each action, most
//! recently registered first.

use tracing::{debug, error, warn};

use crate::error::PciError;

/// Default action limit.
pub const SHUTDOWN_MAX_ACTIONS: usize = 32;

type ShutdownFn<C> = Box<dyn FnOnce(&mut C) -> Result<(), PciError>>;

struct ShutdownAction<C> {
    name: String,
    action: ShutdownFn<C>,
}

/// Ordered list of teardown and undo actions run once at exit.
///
/// `C` is the state handed to every action, typically the
/// [`PciSession`](crate::context::PciSession) so undo writes can find their
/// device again.
pub struct ShutdownRegistry<C> {
    actions: Vec<ShutdownAction<C>>,
    capacity: usize,
}

impl<C> Default for ShutdownRegistry<C> {
    fn default() -> Self {
        Self::with_capacity(SHUTDOWN_MAX_ACTIONS)
    }
}

impl<C> ShutdownRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            actions: Vec::new(),
            capacity,
        }
    }

    /// Takes ownership of `action`.
    ///
    /// Fails with [`PciError::RegistryFull`] once the limit is reached; in
    /// that case the action is dropped without running.
    pub fn register<F>(&mut self, name: impl Into<String>, action: F) -> Result<(), PciError>
    where
        F: FnOnce(&mut C) -> Result<(), PciError> + 'static,
    {
        let name = name.into();
        if self.actions.len() >= self.capacity {
            error!("Cannot register \"{name}\": {} actions already pending", self.capacity);
            return Err(PciError::RegistryFull(self.capacity));
        }
        debug!("Registered shutdown action \"{name}\"");
        self.actions.push(ShutdownAction {
            name,
            action: Box::new(action),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs every pending action exactly once, newest first.
    ///
    /// A failing action is logged and the rest still run. Returns how many
    /// actions failed.
    pub fn run(&mut self, state: &mut C) -> usize {
        let mut failures = 0;
        while let Some(ShutdownAction { name, action }) = self.actions.pop() {
            debug!("Running shutdown action \"{name}\"");
            if let Err(e) = action(state) {
                error!("Shutdown action \"{name}\" failed: {e}");
                failures += 1;
            }
        }
        failures
    }
}

impl<C> Drop for ShutdownRegistry<C> {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            warn!(
                "Shutdown registry dropped with {} pending actions, hardware state was not restored",
                self.actions.len()
            );
        }
    }
}
