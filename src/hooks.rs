//! Before-request and after-response hooks.
//!
//! Hooks are named closures run in registration order. A before hook takes
//! the outgoing [`Request`] and returns the request to send; an after hook
//! takes the final [`Response`] and returns the response to hand back. An
//! error from either aborts the call with [`Error::Hook`] and is never
//! retried.

use crate::{BoxError, Error, HookStage, Request, Response, Result};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

type BeforeFn = Arc<dyn Fn(Request) -> std::result::Result<Request, BoxError> + Send + Sync>;
type AfterFn = Arc<dyn Fn(Response) -> std::result::Result<Response, BoxError> + Send + Sync>;

/// When before hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookMode {
    /// Once for every request of a redirect chain, before its first attempt.
    #[default]
    OncePerCall,
    /// Before every attempt, including retries.
    EveryAttempt,
}

/// An ordered set of named hooks.
///
/// # Examples
///
/// ```
/// use spindle::Hooks;
///
/// let hooks = Hooks::new()
///     .before("trace-id", |request| {
///         Ok(request.with_header("x-trace-id", "abc123")?)
///     })
///     .after("strip-cookies", |mut response| {
///         response.headers.remove("set-cookie");
///         Ok(response)
///     });
/// # let _ = hooks;
/// ```
#[derive(Clone, Default)]
pub struct Hooks {
    before: Vec<(String, BeforeFn)>,
    after: Vec<(String, AfterFn)>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before", &self.before.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("after", &self.after.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

impl Hooks {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a before hook.
    pub fn before<F>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(Request) -> std::result::Result<Request, BoxError> + Send + Sync + 'static,
    {
        self.before.push((name.into(), Arc::new(hook)));
        self
    }

    /// Appends an after hook.
    pub fn after<F>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(Response) -> std::result::Result<Response, BoxError> + Send + Sync + 'static,
    {
        self.after.push((name.into(), Arc::new(hook)));
        self
    }

    /// Returns `true` if no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }

    /// Runs the before hooks over `request`.
    pub fn run_before(&self, mut request: Request) -> Result<Request> {
        for (name, hook) in &self.before {
            trace!(hook = %name, "running before hook");
            request = hook(request).map_err(|source| Error::Hook {
                name: name.clone(),
                stage: HookStage::Before,
                source,
            })?;
        }
        Ok(request)
    }

    /// Runs the after hooks over `response`.
    pub fn run_after(&self, mut response: Response) -> Result<Response> {
        for (name, hook) in &self.after {
            trace!(hook = %name, "running after hook");
            response = hook(response).map_err(|source| Error::Hook {
                name: name.clone(),
                stage: HookStage::After,
                source,
            })?;
        }
        Ok(response)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        check_names(self.before.iter().map(|(n, _)| n.as_str()), HookStage::Before)?;
        check_names(self.after.iter().map(|(n, _)| n.as_str()), HookStage::After)
    }
}

fn check_names<'a>(names: impl Iterator<Item = &'a str>, stage: HookStage) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(Error::ConfigurationError(format!(
                "{} hook names must not be empty",
                stage
            )));
        }
        if !seen.insert(name) {
            return Err(Error::ConfigurationError(format!(
                "duplicate {} hook name `{}`",
                stage, name
            )));
        }
    }
    Ok(())
}
