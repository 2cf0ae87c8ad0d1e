// Exit scopes
//
// An exit scope collects the release steps of resources acquired inside it
// and runs them, last acquired first, when the scope closes. Each release
// sees the error pending at that point and may keep, suppress or replace it.
// A scope that is dropped before it was closed (its task was cancelled)
// still runs its pending releases in the background.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use super::{settle, AsyncResource, BlockingResource, Cooperative, ExitOutcome};
use crate::resource::adapter::ScopedResource;
use callgate_error::{InvokeError, InvokeResult};

type Release = Box<dyn FnOnce(Option<InvokeError>) -> BoxFuture<'static, Option<InvokeError>> + Send>;

//-----------------------------------------------------------------------------
// Scoped Acquisition
//-----------------------------------------------------------------------------

/// Acquire a handle, run `body` with it, and release.
///
/// A failed acquisition propagates without calling `release`. Otherwise
/// `release` runs exactly once, receiving the body's error if it failed.
/// Returns `Ok(None)` when the body failed and the release suppressed it.
/// If the returned future is dropped while the body runs, the release still
/// runs in the background with [`InvokeError::Cancelled`].
pub async fn scoped<H, T, A, B, BF, R>(acquire: A, body: B, release: R) -> InvokeResult<Option<T>>
where
    A: Future<Output = InvokeResult<H>>,
    B: FnOnce(H) -> BF,
    BF: Future<Output = InvokeResult<T>>,
    R: for<'e> FnOnce(Option<&'e InvokeError>) -> BoxFuture<'e, ExitOutcome> + Send + 'static,
{
    let handle = acquire.await?;
    let scope = ExitScope::new();
    scope.push_exit(release);
    scope.guard(body(handle)).await
}

//-----------------------------------------------------------------------------
// Asynchronous Exit Scope
//-----------------------------------------------------------------------------

#[derive(Default)]
struct ScopeState {
    releases: Mutex<Vec<Release>>,
}

impl Drop for ScopeState {
    fn drop(&mut self) {
        let releases = std::mem::take(self.releases.get_mut());
        if releases.is_empty() {
            return;
        }

        let count = releases.len();
        match Handle::try_current() {
            Ok(handle) => {
                warn!(count, "exit scope dropped before closing; releasing in background");
                handle.spawn(async move {
                    match unwind(releases, Some(InvokeError::Cancelled)).await {
                        None | Some(InvokeError::Cancelled) => {}
                        Some(err) => warn!(%err, "background release failed"),
                    }
                });
            }
            Err(_) => {
                error!(count, "exit scope dropped outside a runtime; pending releases cannot run");
            }
        }
    }
}

async fn unwind(releases: Vec<Release>, mut pending: Option<InvokeError>) -> Option<InvokeError> {
    for release in releases.into_iter().rev() {
        pending = release(pending).await;
    }
    pending
}

/// An asynchronous exit stack shared by everything invoked for one request.
///
/// Cloning yields another handle to the same scope.
#[derive(Clone, Default)]
pub struct ExitScope {
    state: Arc<ScopeState>,
}

impl ExitScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `body` inside a fresh scope and close the scope on every path.
    /// Returns `Ok(None)` when the body failed and a release suppressed it.
    pub async fn run<F, Fut, T>(body: F) -> InvokeResult<Option<T>>
    where
        F: FnOnce(ExitScope) -> Fut,
        Fut: Future<Output = InvokeResult<T>>,
    {
        let scope = ExitScope::new();
        scope.guard(body(scope.clone())).await
    }

    /// Await `region`, then close this scope with its outcome
    pub async fn guard<Fut, T>(&self, region: Fut) -> InvokeResult<Option<T>>
    where
        Fut: Future<Output = InvokeResult<T>>,
    {
        match region.await {
            Ok(value) => {
                self.close(None).await?;
                Ok(Some(value))
            }
            Err(err) => {
                self.close(Some(err)).await?;
                Ok(None)
            }
        }
    }

    /// Acquire `resource` and register its release with this scope
    pub async fn enter<R>(&self, mut resource: R) -> InvokeResult<Value>
    where
        R: ScopedResource + 'static,
    {
        let handle = resource.acquire().await?;
        self.push(Box::new(move |pending: Option<InvokeError>| {
            async move {
                let outcome = resource.release(pending.as_ref()).await;
                settle(pending, outcome)
            }
            .boxed()
        }));
        Ok(handle)
    }

    /// Enter an asynchronous resource on the calling task
    pub async fn enter_async<R>(&self, resource: R) -> InvokeResult<Value>
    where
        R: AsyncResource + 'static,
    {
        self.enter(Cooperative::new(Box::new(resource))).await
    }

    /// Register a bare release step
    pub fn push_exit<F>(&self, release: F)
    where
        F: for<'e> FnOnce(Option<&'e InvokeError>) -> BoxFuture<'e, ExitOutcome> + Send + 'static,
    {
        self.push(Box::new(move |pending: Option<InvokeError>| {
            async move {
                let outcome = release(pending.as_ref()).await;
                settle(pending, outcome)
            }
            .boxed()
        }));
    }

    fn push(&self, release: Release) {
        self.state.releases.lock().push(release);
    }

    /// Number of releases still registered
    pub fn pending(&self) -> usize {
        self.state.releases.lock().len()
    }

    /// Run every registered release, most recent first. `error` is the
    /// failure that ended the scope, if any; the error still pending after
    /// the last release is returned.
    pub async fn close(&self, error: Option<InvokeError>) -> InvokeResult<()> {
        let mut pending = error;
        loop {
            // Releases are taken one at a time so that a cancelled close
            // leaves the remainder to the drop path.
            let next = self.state.releases.lock().pop();
            match next {
                Some(release) => pending = release(pending).await,
                None => break,
            }
        }

        match pending {
            None => Ok(()),
            Some(err) => {
                debug!(%err, "exit scope closed with error");
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for ExitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitScope")
            .field("pending", &self.pending())
            .finish()
    }
}

//-----------------------------------------------------------------------------
// Blocking Exit Scope
//-----------------------------------------------------------------------------

/// Synchronous counterpart of [`ExitScope`] for blocking contexts. Enter and
/// exit steps run inline on the calling thread.
#[derive(Default)]
pub struct BlockingExitScope {
    resources: Vec<Box<dyn BlockingResource>>,
}

impl BlockingExitScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `body` inside a fresh scope and close it on every path
    pub fn run<F, T>(body: F) -> InvokeResult<Option<T>>
    where
        F: FnOnce(&mut BlockingExitScope) -> InvokeResult<T>,
    {
        let mut scope = BlockingExitScope::new();
        match body(&mut scope) {
            Ok(value) => {
                scope.close(None)?;
                Ok(Some(value))
            }
            Err(err) => {
                scope.close(Some(err))?;
                Ok(None)
            }
        }
    }

    /// Enter `resource` and register its exit step
    pub fn enter(&mut self, mut resource: Box<dyn BlockingResource>) -> InvokeResult<Value> {
        let handle = resource.enter().map_err(InvokeError::callable)?;
        self.resources.push(resource);
        Ok(handle)
    }

    pub fn pending(&self) -> usize {
        self.resources.len()
    }

    /// Exit every registered resource, most recent first
    pub fn close(mut self, error: Option<InvokeError>) -> InvokeResult<()> {
        match self.unwind(error) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn unwind(&mut self, mut pending: Option<InvokeError>) -> Option<InvokeError> {
        while let Some(mut resource) = self.resources.pop() {
            let outcome = resource.exit(pending.as_ref());
            pending = settle(pending, outcome);
        }
        pending
    }
}

impl Drop for BlockingExitScope {
    fn drop(&mut self) {
        if self.resources.is_empty() {
            return;
        }
        warn!(count = self.resources.len(), "blocking exit scope dropped before closing");
        if let Some(err) = self.unwind(Some(InvokeError::Cancelled)) {
            if !matches!(err, InvokeError::Cancelled) {
                warn!(%err, "release during drop failed");
            }
        }
    }
}
