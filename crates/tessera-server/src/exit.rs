//! Exit hook chain
//!
//! Cleanup callbacks registered during setup and run once at process exit,
//! newest first. A failing or panicking hook is logged and the chain goes on.

use std::panic::{AssertUnwindSafe, catch_unwind};

use parking_lot::Mutex;
use tracing::{debug, error};

/// Cleanup callback receiving the exit code
pub type ExitFn = Box<dyn FnOnce(i32) -> anyhow::Result<()> + Send>;

type Terminator = Box<dyn Fn(i32) + Send + Sync>;

pub struct ExitHooks {
    hooks: Mutex<Vec<(String, ExitFn)>>,
    terminator: Terminator,
}

impl Default for ExitHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitHooks {
    /// Hook chain that terminates the process on [`ExitHooks::exit`]
    pub fn new() -> Self {
        Self::with_terminator(|code| std::process::exit(code))
    }

    /// Hook chain with a custom terminal call
    pub fn with_terminator<F>(terminator: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        Self {
            hooks: Mutex::new(Vec::new()),
            terminator: Box::new(terminator),
        }
    }

    /// Register a hook; it runs before every hook registered earlier
    pub fn add<F>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce(i32) -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        debug!(hook = %name, "Registered exit hook");
        self.hooks.lock().push((name, Box::new(hook)));
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.lock().is_empty()
    }

    /// Run and drain all hooks in reverse registration order
    ///
    /// Returns the number of hooks that failed.
    pub fn run_all(&self, code: i32) -> usize {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        let mut failures = 0;

        for (name, hook) in hooks.into_iter().rev() {
            match catch_unwind(AssertUnwindSafe(|| hook(code))) {
                Ok(Ok(())) => debug!(hook = %name, "Exit hook completed"),
                Ok(Err(e)) => {
                    failures += 1;
                    error!(hook = %name, error = %e, "Exit hook failed");
                }
                Err(_) => {
                    failures += 1;
                    error!(hook = %name, "Exit hook panicked");
                }
            }
        }

        failures
    }

    /// Run the chain, then terminate with `code`
    pub fn exit(&self, code: i32) {
        self.run_all(code);
        (self.terminator)(code);
    }
}
