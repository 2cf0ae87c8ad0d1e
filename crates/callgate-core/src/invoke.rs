// Unified Invocation
//
// One entry point for every callable shape: blocking functions go to a
// worker, asynchronous functions are awaited in place, and generator-style
// factories open a resource whose release is bound to the caller's scope.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::callable::{Arguments, Callable};
use crate::offload::Offloader;
use crate::resource::{open_resource_on, ExitScope};
use crate::shape::{self, Target};
use callgate_error::{InvokeError, InvokeResult};

/// Dispatches callables by shape
#[derive(Clone)]
pub struct Invoker {
    offloader: Arc<Offloader>,
}

impl Default for Invoker {
    fn default() -> Self {
        Self::new(Offloader::global())
    }
}

impl Invoker {
    pub fn new(offloader: Arc<Offloader>) -> Self {
        Self { offloader }
    }

    pub fn offloader(&self) -> &Arc<Offloader> {
        &self.offloader
    }

    /// Invoke `callable` once with `args`.
    ///
    /// For generator shapes the result is the resource handle and the
    /// release is registered with `scope`.
    pub async fn invoke(&self, callable: &Callable, args: Arguments, scope: &ExitScope) -> InvokeResult<Value> {
        let target = shape::target(callable)?;
        debug!(callable = callable.name(), shape = %target.shape(), "invoking");

        match target {
            Target::Blocking(f) => self.offloader.run_offloaded(f.clone(), args).await,
            Target::Async(f) => f(args).await.map_err(InvokeError::callable),
            Target::BlockingGenerator(_) | Target::AsyncGenerator(_) => {
                open_resource_on(&self.offloader, callable, args, scope).await
            }
        }
    }

    /// Invoke a plain (non-generator) callable without an exit scope
    pub async fn run_async(&self, callable: &Callable, args: Arguments) -> InvokeResult<Value> {
        let target = shape::target(callable)?;
        match target {
            Target::Blocking(f) => self.offloader.run_offloaded(f.clone(), args).await,
            Target::Async(f) => f(args).await.map_err(InvokeError::callable),
            other => Err(InvokeError::UnsupportedShape {
                name: callable.name().to_string(),
                shape: other.shape().to_string(),
                context: "without an exit scope",
            }),
        }
    }

    /// Invoke `callable` in a fresh scope, hand the result to `body`, then
    /// close the scope. Returns `Ok(None)` when the body failed and a
    /// release suppressed the failure.
    pub async fn with_resource<F, Fut, T>(&self, callable: &Callable, args: Arguments, body: F) -> InvokeResult<Option<T>>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = InvokeResult<T>>,
    {
        ExitScope::run(|scope| async move {
            let handle = self.invoke(callable, args, &scope).await?;
            body(handle).await
        })
        .await
    }
}

/// Invoke with the global offloader
pub async fn invoke(callable: &Callable, args: Arguments, scope: &ExitScope) -> InvokeResult<Value> {
    Invoker::default().invoke(callable, args, scope).await
}

/// Invoke a plain callable with the global offloader
pub async fn run_async(callable: &Callable, args: Arguments) -> InvokeResult<Value> {
    Invoker::default().run_async(callable, args).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OffloadConfig;
    use crate::resource::{ExitOutcome, FnResource};
    use serde_json::json;

    fn invoker() -> Invoker {
        Invoker::new(Arc::new(Offloader::new(&OffloadConfig::default()).unwrap()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_and_async_dispatch() {
        let invoker = invoker();
        let scope = ExitScope::new();

        let double = Callable::blocking("double", |args| {
            let n = args.arg(0).and_then(Value::as_i64).unwrap_or_default();
            Ok(json!(n * 2))
        });
        let greet = Callable::asynchronous("greet", |args| async move {
            let name = args.kwarg("name").cloned().unwrap_or(Value::Null);
            Ok(json!({ "hello": name }))
        });

        let doubled = invoker.invoke(&double, Arguments::new().with_arg(21), &scope).await.unwrap();
        assert_eq!(doubled, json!(42));

        let greeting = invoker
            .run_async(&greet, Arguments::new().with_kwarg("name", "ada"))
            .await
            .unwrap();
        assert_eq!(greeting, json!({ "hello": "ada" }));
        assert_eq!(scope.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_generator_needs_scope() {
        let invoker = invoker();
        let conn = Callable::blocking_generator("conn", |_| {
            FnResource::new(|| Ok((json!("conn"), ())), |_, _: Option<&InvokeError>| ExitOutcome::Released)
        });

        let err = invoker.run_async(&conn, Arguments::new()).await.unwrap_err();
        assert!(matches!(err, InvokeError::UnsupportedShape { context: "without an exit scope", .. }));

        let value = invoker
            .with_resource(&conn, Arguments::new(), |handle| async move { Ok(handle) })
            .await
            .unwrap();
        assert_eq!(value, Some(json!("conn")));
    }
}
