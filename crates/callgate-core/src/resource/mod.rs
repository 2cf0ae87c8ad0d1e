// Resource Lifecycle
//
// Two-phase resources (enter, then exit) produced by generator-style
// callables, the scopes that guarantee their release, and the adapter that
// drives blocking resources through the worker pool.

pub mod adapter;
pub mod scope;

use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use callgate_error::{CallableError, InvokeError};

pub use adapter::{open_resource, open_resource_blocking, open_resource_on, Cooperative, ScopedResource, ThreadedResource};
pub use scope::{scoped, BlockingExitScope, ExitScope};

//-----------------------------------------------------------------------------
// Exit Outcomes
//-----------------------------------------------------------------------------

/// What an exit step did with the error it was given
pub enum ExitOutcome {
    /// Released; any pending error keeps propagating.
    Released,
    /// Released; the pending error is handled and must not propagate.
    ReleasedAndSuppressed,
    /// Released, but the exit step failed. The new error replaces any
    /// pending one.
    ReleasedWithNewError(CallableError),
}

impl fmt::Debug for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Released => write!(f, "Released"),
            ExitOutcome::ReleasedAndSuppressed => write!(f, "ReleasedAndSuppressed"),
            ExitOutcome::ReleasedWithNewError(err) => write!(f, "ReleasedWithNewError({})", err),
        }
    }
}

/// Combine the error pending before an exit step with the step's outcome,
/// yielding the error that keeps propagating (if any).
pub fn settle(pending: Option<InvokeError>, outcome: ExitOutcome) -> Option<InvokeError> {
    match outcome {
        ExitOutcome::Released => pending,
        ExitOutcome::ReleasedAndSuppressed => {
            if let Some(err) = &pending {
                debug!(%err, "exit step suppressed error");
            }
            None
        }
        ExitOutcome::ReleasedWithNewError(err) => {
            if let Some(previous) = &pending {
                debug!(%previous, new = %err, "exit step superseded error");
            }
            Some(InvokeError::release(err))
        }
    }
}

//-----------------------------------------------------------------------------
// Resource Protocols
//-----------------------------------------------------------------------------

/// A two-phase resource whose steps block the calling thread
pub trait BlockingResource: Send {
    /// Acquire the resource and produce its handle
    fn enter(&mut self) -> Result<Value, CallableError>;

    /// Release the resource. `error` is the failure that ended the protected
    /// region, if any.
    fn exit(&mut self, error: Option<&InvokeError>) -> ExitOutcome;
}

/// A two-phase resource whose steps are asynchronous
#[async_trait]
pub trait AsyncResource: Send {
    /// Acquire the resource and produce its handle
    async fn enter(&mut self) -> Result<Value, CallableError>;

    /// Release the resource. `error` is the failure that ended the protected
    /// region, if any.
    async fn exit(&mut self, error: Option<&InvokeError>) -> ExitOutcome;
}

//-----------------------------------------------------------------------------
// Closure-built Resources
//-----------------------------------------------------------------------------

/// A blocking resource built from an enter closure and an exit closure.
///
/// The enter closure returns the handle together with state that is handed
/// to the exit closure, the way a generator keeps its locals between the
/// setup and teardown halves.
pub struct FnResource<S, E, X> {
    enter: Option<E>,
    exit: Option<X>,
    state: Option<S>,
}

impl<S, E, X> FnResource<S, E, X>
where
    S: Send,
    E: FnOnce() -> Result<(Value, S), CallableError> + Send,
    X: for<'e> FnOnce(S, Option<&'e InvokeError>) -> ExitOutcome + Send,
{
    pub fn new(enter: E, exit: X) -> Self {
        Self {
            enter: Some(enter),
            exit: Some(exit),
            state: None,
        }
    }
}

impl<S, E, X> BlockingResource for FnResource<S, E, X>
where
    S: Send,
    E: FnOnce() -> Result<(Value, S), CallableError> + Send,
    X: for<'e> FnOnce(S, Option<&'e InvokeError>) -> ExitOutcome + Send,
{
    fn enter(&mut self) -> Result<Value, CallableError> {
        let enter = self
            .enter
            .take()
            .ok_or_else(|| anyhow::anyhow!("resource entered twice"))?;
        let (handle, state) = enter()?;
        self.state = Some(state);
        Ok(handle)
    }

    fn exit(&mut self, error: Option<&InvokeError>) -> ExitOutcome {
        match (self.exit.take(), self.state.take()) {
            (Some(exit), Some(state)) => exit(state, error),
            _ => ExitOutcome::Released,
        }
    }
}

/// An asynchronous resource built from an enter closure and an exit closure
pub struct AsyncFnResource<S, E, X> {
    enter: Option<E>,
    exit: Option<X>,
    state: Option<S>,
}

impl<S, E, EF, X> AsyncFnResource<S, E, X>
where
    S: Send,
    E: FnOnce() -> EF + Send,
    EF: std::future::Future<Output = Result<(Value, S), CallableError>> + Send,
    X: for<'e> FnOnce(S, Option<&'e InvokeError>) -> BoxFuture<'e, ExitOutcome> + Send,
{
    pub fn new(enter: E, exit: X) -> Self {
        Self {
            enter: Some(enter),
            exit: Some(exit),
            state: None,
        }
    }
}

#[async_trait]
impl<S, E, EF, X> AsyncResource for AsyncFnResource<S, E, X>
where
    S: Send,
    E: FnOnce() -> EF + Send,
    EF: std::future::Future<Output = Result<(Value, S), CallableError>> + Send,
    X: for<'e> FnOnce(S, Option<&'e InvokeError>) -> BoxFuture<'e, ExitOutcome> + Send,
{
    async fn enter(&mut self) -> Result<Value, CallableError> {
        let enter = self
            .enter
            .take()
            .ok_or_else(|| anyhow::anyhow!("resource entered twice"))?;
        let (handle, state) = enter().await?;
        self.state = Some(state);
        Ok(handle)
    }

    async fn exit(&mut self, error: Option<&InvokeError>) -> ExitOutcome {
        match (self.exit.take(), self.state.take()) {
            (Some(exit), Some(state)) => exit(state, error).await,
            _ => ExitOutcome::Released,
        }
    }
}
