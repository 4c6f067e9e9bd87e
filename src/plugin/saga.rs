use anyhow::Result;
use tracing::{debug, warn};

type Compensator = Box<dyn FnOnce() -> Result<()>>;

/// Undo actions for the steps of one invocation that already succeeded.
///
/// Actions are registered right after their step succeeds and run in reverse
/// registration order on [`Rollback::unwind`]. A failing action is logged and
/// does not stop the ones registered before it.
#[derive(Default)]
pub struct Rollback {
    actions: Vec<(&'static str, Compensator)>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &'static str, action: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.actions.push((name, Box::new(action)));
    }

    /// Names of the registered actions, in registration order.
    pub fn pending(&self) -> Vec<&'static str> {
        self.actions.iter().map(|(name, _)| *name).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs every action, last registered first.
    pub fn unwind(mut self) {
        while let Some((name, action)) = self.actions.pop() {
            debug!(action = name, "rolling back");
            if let Err(e) = action() {
                warn!(action = name, error = %format!("{:#}", e), "rollback step failed");
            }
        }
    }

    /// Drops the actions without running them.
    pub fn commit(mut self) {
        self.actions.clear();
    }
}
