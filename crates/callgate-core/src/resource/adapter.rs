// Resource Adapter
//
// Uniform acquire/release over both resource flavours. Asynchronous
// resources run on the calling task. Blocking resources run their enter
// step on a general worker and their exit step on the exit segment.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{AsyncResource, BlockingExitScope, BlockingResource, ExitOutcome, ExitScope};
use crate::callable::{Arguments, Callable};
use crate::offload::Offloader;
use crate::shape::{self, Target};
use callgate_error::{CallableError, InvokeError, InvokeResult};

/// A resource as seen by an exit scope: acquired once, released once
#[async_trait]
pub trait ScopedResource: Send {
    async fn acquire(&mut self) -> InvokeResult<Value>;

    async fn release(&mut self, error: Option<&InvokeError>) -> ExitOutcome;
}

//-----------------------------------------------------------------------------
// Cooperative Resources
//-----------------------------------------------------------------------------

/// Drives an asynchronous resource on the calling task
pub struct Cooperative {
    resource: Box<dyn AsyncResource>,
}

impl Cooperative {
    pub fn new(resource: Box<dyn AsyncResource>) -> Self {
        Self { resource }
    }
}

#[async_trait]
impl ScopedResource for Cooperative {
    async fn acquire(&mut self) -> InvokeResult<Value> {
        self.resource.enter().await.map_err(InvokeError::callable)
    }

    async fn release(&mut self, error: Option<&InvokeError>) -> ExitOutcome {
        self.resource.exit(error).await
    }
}

//-----------------------------------------------------------------------------
// Threaded Resources
//-----------------------------------------------------------------------------

fn exit_cancelled(mut resource: Box<dyn BlockingResource>) {
    match resource.exit(Some(&InvokeError::Cancelled)) {
        ExitOutcome::ReleasedWithNewError(err) => {
            warn!(error = %err, "exit step failed after cancellation")
        }
        _ => debug!("released resource abandoned by a cancelled caller"),
    }
}

// An entered resource. It travels from the worker back to the caller, is
// held until release, then moves into the exit step. Wherever it is dropped
// without being taken, the resource is released on the exit segment.
struct Entered {
    resource: Option<Box<dyn BlockingResource>>,
    offloader: Arc<Offloader>,
}

impl Entered {
    fn take(mut self) -> Option<Box<dyn BlockingResource>> {
        self.resource.take()
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        let resource = match self.resource.take() {
            Some(resource) => resource,
            None => return,
        };
        match Handle::try_current() {
            Ok(handle) => {
                let offloader = self.offloader.clone();
                handle.spawn(async move {
                    let _ = offloader.run_exit(move || exit_cancelled(resource)).await;
                });
            }
            Err(_) => exit_cancelled(resource),
        }
    }
}

/// Drives a blocking resource through the worker pool
pub struct ThreadedResource {
    fresh: Option<Box<dyn BlockingResource>>,
    entered: Option<Entered>,
    offloader: Arc<Offloader>,
}

impl ThreadedResource {
    pub fn new(resource: Box<dyn BlockingResource>, offloader: Arc<Offloader>) -> Self {
        Self {
            fresh: Some(resource),
            entered: None,
            offloader,
        }
    }
}

#[async_trait]
impl ScopedResource for ThreadedResource {
    async fn acquire(&mut self) -> InvokeResult<Value> {
        let mut resource = self
            .fresh
            .take()
            .ok_or_else(|| InvokeError::callable(anyhow::anyhow!("resource acquired twice")))?;
        let offloader = self.offloader.clone();
        let (tx, rx) = oneshot::channel::<(Value, Entered)>();

        self.offloader
            .run(move || -> Result<(), CallableError> {
                let handle = resource.enter()?;
                let entered = Entered {
                    resource: Some(resource),
                    offloader,
                };
                if let Err((_, entered)) = tx.send((handle, entered)) {
                    // The caller stopped waiting; release right here
                    if let Some(resource) = entered.take() {
                        exit_cancelled(resource);
                    }
                }
                Ok(())
            })
            .await?
            .map_err(InvokeError::callable)?;

        let (handle, entered) = rx.await.map_err(|_| InvokeError::Cancelled)?;
        self.entered = Some(entered);
        Ok(handle)
    }

    async fn release(&mut self, error: Option<&InvokeError>) -> ExitOutcome {
        let entered = match self.entered.take() {
            Some(entered) => entered,
            None => return ExitOutcome::Released,
        };
        let error = error.cloned();
        // If this future is dropped while waiting for the exit worker, the
        // closure and its `Entered` go with it and the release is respawned.
        let exit = move || match entered.take() {
            Some(mut resource) => resource.exit(error.as_ref()),
            None => ExitOutcome::Released,
        };
        match self.offloader.run_exit(exit).await
        {
            Ok(outcome) => outcome,
            Err(err) => ExitOutcome::ReleasedWithNewError(anyhow::Error::new(err)),
        }
    }
}

//-----------------------------------------------------------------------------
// Opening Resources
//-----------------------------------------------------------------------------

/// Open the resource produced by a generator-shaped callable and bind its
/// release to `scope`, using the global offloader. Returns the handle.
pub async fn open_resource(callable: &Callable, args: Arguments, scope: &ExitScope) -> InvokeResult<Value> {
    open_resource_on(&Offloader::global(), callable, args, scope).await
}

/// Like [`open_resource`] with an explicit offloader
pub async fn open_resource_on(
    offloader: &Arc<Offloader>,
    callable: &Callable,
    args: Arguments,
    scope: &ExitScope,
) -> InvokeResult<Value> {
    match shape::target(callable)? {
        Target::BlockingGenerator(factory) => {
            debug!(callable = callable.name(), "opening blocking resource");
            scope
                .enter(ThreadedResource::new(factory(args), offloader.clone()))
                .await
        }
        Target::AsyncGenerator(factory) => {
            debug!(callable = callable.name(), "opening asynchronous resource");
            scope.enter(Cooperative::new(factory(args))).await
        }
        other => Err(InvokeError::UnsupportedShape {
            name: callable.name().to_string(),
            shape: other.shape().to_string(),
            context: "as a resource",
        }),
    }
}

/// Open a blocking generator's resource inline on the calling thread
pub fn open_resource_blocking(
    callable: &Callable,
    args: Arguments,
    scope: &mut BlockingExitScope,
) -> InvokeResult<Value> {
    match shape::target(callable)? {
        Target::BlockingGenerator(factory) => scope.enter(factory(args)),
        other => Err(InvokeError::UnsupportedShape {
            name: callable.name().to_string(),
            shape: other.shape().to_string(),
            context: "from a blocking scope",
        }),
    }
}
