//! Resource scopes.
//!
//! A [`Scope`] collects finalizers and runs them, most recently added first, when it is closed.
//! Every handle to a scope is a clone of the same underlying scope, and the scope is closed at the
//! latest when the last handle is dropped.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

type Finalizer = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct ScopeInner {
    /// `None` once the scope has been closed.
    finalizers: Mutex<Option<Vec<Finalizer>>>,
}

impl ScopeInner {
    fn take(&self) -> Vec<Finalizer> {
        self.finalizers.lock().take().unwrap_or_default()
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if let Err(error) = run_all(self.take()) {
            tracing::error!(error = %error, "scope finalizer failed");
        }
    }
}

/// A handle to a set of finalizers that run when the scope closes.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Creates a new open scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                finalizers: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    /// Registers `finalizer` to run when this scope closes.
    ///
    /// If the scope is already closed, the finalizer runs right away.
    pub fn add_finalizer<F>(&self, finalizer: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if let Some(finalizers) = self.inner.finalizers.lock().as_mut() {
            finalizers.push(Box::new(finalizer));
            return;
        }

        if let Err(error) = finalizer() {
            tracing::error!(error = %error, "finalizer of closed scope failed");
        }
    }

    /// Closes the scope, running all finalizers in reverse order of registration.
    ///
    /// Every finalizer runs even if an earlier one fails. The first failure is returned, later
    /// ones are logged. Closing a scope more than once is a no-op.
    pub fn close(&self) -> anyhow::Result<()> {
        run_all(self.inner.take())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.finalizers.lock().is_none()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn run_all(finalizers: Vec<Finalizer>) -> anyhow::Result<()> {
    let mut first_error = None;
    for finalizer in finalizers.into_iter().rev() {
        if let Err(error) = finalizer() {
            if first_error.is_none() {
                first_error = Some(error);
            } else {
                tracing::error!(error = %error, "scope finalizer failed");
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
