// Integration tests for resource lifecycles and exit scopes

use std::sync::{mpsc, Arc};
use std::thread::{self, ThreadId};
use std::time::Duration;

use callgate_core::test_logging::init_test_logging;
use callgate_core::{
    scoped, Arguments, AsyncFnResource, Callable, ExitOutcome, ExitScope, FnResource, InvokeError, InvokeResult,
    Invoker, OffloadConfig, Offloader, QueuePolicy,
};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
#[error("KeyError: {0}")]
struct KeyError(&'static str);

type Log = Arc<Mutex<Vec<String>>>;

fn invoker() -> Invoker {
    Invoker::new(Arc::new(Offloader::new(&OffloadConfig::default()).unwrap()))
}

/// A blocking generator that logs its steps and releases with `outcome`
fn logged_resource(name: &'static str, log: Log, outcome: fn() -> ExitOutcome) -> Callable {
    Callable::blocking_generator(name, move |_| {
        let enter_log = log.clone();
        let exit_log = log.clone();
        FnResource::new(
            move || {
                enter_log.lock().push(format!("enter {}", name));
                Ok((json!(name), ()))
            },
            move |_, error: Option<&InvokeError>| {
                let seen = error.map(|e| e.to_string()).unwrap_or_else(|| "none".into());
                exit_log.lock().push(format!("exit {} ({})", name, seen));
                outcome()
            },
        )
    })
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    while !ready() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// A blocking callable or exit step that parks its worker until `unblock` fires
fn gated() -> (mpsc::Sender<()>, Arc<Mutex<Option<mpsc::Receiver<()>>>>) {
    let (unblock, gate) = mpsc::channel();
    (unblock, Arc::new(Mutex::new(Some(gate))))
}

fn wait_at(gate: &Mutex<Option<mpsc::Receiver<()>>>) {
    let gate = gate.lock().take();
    if let Some(gate) = gate {
        let _ = gate.recv();
    }
}

fn released() -> ExitOutcome {
    ExitOutcome::Released
}

fn suppressed() -> ExitOutcome {
    ExitOutcome::ReleasedAndSuppressed
}

#[tokio::test(flavor = "current_thread")]
async fn test_blocking_generator_steps_run_off_the_scheduler_thread() {
    init_test_logging();
    let scheduler = thread::current().id();
    let threads: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));

    let recorded = threads.clone();
    let callable = Callable::blocking_generator("conn", move |_| {
        let on_enter = recorded.clone();
        let on_exit = recorded.clone();
        FnResource::new(
            move || {
                on_enter.lock().push(thread::current().id());
                Ok((json!("conn"), ()))
            },
            move |_, _: Option<&InvokeError>| {
                on_exit.lock().push(thread::current().id());
                ExitOutcome::Released
            },
        )
    });

    let value = invoker()
        .with_resource(&callable, Arguments::new(), |handle| async move { Ok(handle) })
        .await
        .unwrap();

    assert_eq!(value, Some(json!("conn")));
    let threads = threads.lock();
    assert_eq!(threads.len(), 2);
    assert!(threads.iter().all(|id| *id != scheduler));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_releases_run_in_reverse_order_on_success() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let first = logged_resource("a", log.clone(), released);
    let second = logged_resource("b", log.clone(), released);
    let invoker = invoker();

    let body_log = log.clone();
    let result = ExitScope::run(|scope| async move {
        let a = invoker.invoke(&first, Arguments::new(), &scope).await?;
        let b = invoker.invoke(&second, Arguments::new(), &scope).await?;
        body_log.lock().push("body".into());
        Ok(vec![a, b])
    })
    .await
    .unwrap();

    assert_eq!(result, Some(vec![json!("a"), json!("b")]));
    assert_eq!(
        *log.lock(),
        vec!["enter a", "enter b", "body", "exit b (none)", "exit a (none)"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_body_failure_reaches_every_release_and_propagates_unchanged() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let first = logged_resource("a", log.clone(), released);
    let second = logged_resource("b", log.clone(), released);
    let invoker = invoker();
    let original = InvokeError::callable(anyhow::anyhow!("body failed"));

    let raised = original.clone();
    let err = ExitScope::run(|scope| async move {
        invoker.invoke(&first, Arguments::new(), &scope).await?;
        invoker.invoke(&second, Arguments::new(), &scope).await?;
        Err::<(), _>(raised)
    })
    .await
    .unwrap_err();

    assert!(err.same_failure(&original));
    assert_eq!(
        *log.lock(),
        vec!["enter a", "enter b", "exit b (body failed)", "exit a (body failed)"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_error_supersedes_body_error() {
    let callable = Callable::blocking_generator("tx", |_| {
        FnResource::new(
            || Ok((json!("tx"), ())),
            |_, error: Option<&InvokeError>| {
                assert!(error.is_some());
                ExitOutcome::ReleasedWithNewError(anyhow::anyhow!("rollback failed"))
            },
        )
    });

    let err = invoker()
        .with_resource(&callable, Arguments::new(), |_| async {
            Err::<(), _>(InvokeError::callable(anyhow::anyhow!("insert failed")))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, InvokeError::Release(_)));
    assert_eq!(err.to_string(), "Release step failed: rollback failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_suppressed_body_error_does_not_propagate() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let callable = logged_resource("guard", log.clone(), suppressed);

    let result = invoker()
        .with_resource(&callable, Arguments::new(), |_| async {
            Err::<(), _>(InvokeError::callable(anyhow::anyhow!("handled")))
        })
        .await
        .unwrap();

    assert_eq!(result, None);
    assert_eq!(*log.lock(), vec!["enter guard", "exit guard (handled)"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exit_error_after_clean_region_propagates() {
    let callable = Callable::blocking_generator("answer", |_| {
        FnResource::new(
            || Ok((json!(42), ())),
            |_, error: Option<&InvokeError>| match error {
                None => ExitOutcome::ReleasedWithNewError(KeyError("answer").into()),
                Some(_) => ExitOutcome::Released,
            },
        )
    });

    let seen = Arc::new(Mutex::new(None));
    let observed = seen.clone();
    let err = invoker()
        .with_resource(&callable, Arguments::new(), |handle| async move {
            *observed.lock() = Some(handle);
            Ok(())
        })
        .await
        .unwrap_err();

    assert_eq!(*seen.lock(), Some(json!(42)));
    assert!(matches!(err, InvokeError::Release(_)));
    assert!(err.downcast_ref::<KeyError>().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clean_exit_leaks_nothing() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let callable = logged_resource("quiet", log.clone(), suppressed);
    let result = invoker()
        .with_resource(&callable, Arguments::new(), |handle| async move { Ok(handle) })
        .await
        .unwrap();
    assert_eq!(result, Some(json!("quiet")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_enter_failure_skips_release() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let exit_log = log.clone();
    let callable = Callable::blocking_generator("broken", move |_| {
        let exit_log = exit_log.clone();
        FnResource::new(
            || Err::<(Value, ()), _>(anyhow::anyhow!("cannot connect")),
            move |_, _: Option<&InvokeError>| {
                exit_log.lock().push("exit".to_string());
                ExitOutcome::Released
            },
        )
    });

    let scope = ExitScope::new();
    let err = invoker().invoke(&callable, Arguments::new(), &scope).await.unwrap_err();
    assert_eq!(err.to_string(), "cannot connect");
    assert_eq!(scope.pending(), 0);
    scope.close(None).await.unwrap();
    assert!(log.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_generator_release_sees_error() {
    let (tx, rx) = oneshot::channel::<String>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let callable = Callable::async_generator("session", move |_| {
        let tx = tx.clone();
        AsyncFnResource::new(
            || async { Ok((json!("session"), ())) },
            move |_, error: Option<&InvokeError>| {
                let seen = error.map(|e| e.to_string()).unwrap_or_default();
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(seen);
                }
                async { ExitOutcome::Released }.boxed()
            },
        )
    });

    let err = invoker()
        .with_resource(&callable, Arguments::new(), |_| async {
            Err::<(), _>(InvokeError::callable(anyhow::anyhow!("query failed")))
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "query failed");
    assert_eq!(rx.await.unwrap(), "query failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_region_still_releases() {
    let (tx, rx) = oneshot::channel::<bool>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let callable = Callable::blocking_generator("lease", move |_| {
        let tx = tx.clone();
        FnResource::new(
            || Ok((json!("lease"), ())),
            move |_, error: Option<&InvokeError>| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(matches!(error, Some(InvokeError::Cancelled)));
                }
                ExitOutcome::Released
            },
        )
    });

    let invoker = invoker();
    let region = invoker.with_resource(&callable, Arguments::new(), |_| async {
        futures::future::pending::<InvokeResult<()>>().await
    });
    assert!(tokio::time::timeout(Duration::from_millis(50), region).await.is_err());

    let cancelled = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("release must run after cancellation")
        .unwrap();
    assert!(cancelled);
}

#[tokio::test]
async fn test_scoped_acquire_body_release() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let release_log = log.clone();
    let body_log = log.clone();

    let result = scoped(
        async { Ok::<_, InvokeError>(7) },
        |handle| async move {
            body_log.lock().push(format!("body {}", handle));
            Ok(handle * 6)
        },
        move |error| {
            release_log.lock().push(format!("release {}", error.is_some()));
            async { ExitOutcome::Released }.boxed()
        },
    )
    .await
    .unwrap();

    assert_eq!(result, Some(42));
    assert_eq!(*log.lock(), vec!["body 7", "release false"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_cancelled_while_waiting_for_exit_worker_still_releases() {
    init_test_logging();
    let invoker = invoker();
    let offloader = invoker.offloader().clone();

    // The first scope's release holds the only exit worker
    let (unblock, gate) = gated();
    let slow = Callable::blocking_generator("slow", move |_| {
        let gate = gate.clone();
        FnResource::new(
            || Ok((json!("slow"), ())),
            move |_, _: Option<&InvokeError>| {
                wait_at(&gate);
                ExitOutcome::Released
            },
        )
    });
    let first = ExitScope::new();
    invoker.invoke(&slow, Arguments::new(), &first).await.unwrap();
    let closing_first = tokio::spawn(async move { first.close(None).await });
    wait_until(|| offloader.exit_segment().available() == 0).await;

    let (seen_tx, seen_rx) = oneshot::channel::<bool>();
    let seen_tx = Arc::new(Mutex::new(Some(seen_tx)));
    let quick = Callable::blocking_generator("quick", move |_| {
        let seen_tx = seen_tx.clone();
        FnResource::new(
            || Ok((json!("quick"), ())),
            move |_, error: Option<&InvokeError>| {
                if let Some(tx) = seen_tx.lock().take() {
                    let _ = tx.send(matches!(error, Some(InvokeError::Cancelled)));
                }
                ExitOutcome::Released
            },
        )
    });
    let second = ExitScope::new();
    invoker.invoke(&quick, Arguments::new(), &second).await.unwrap();

    // Abandon the close while its release waits for the exit worker
    let cut_short = tokio::time::timeout(Duration::from_millis(50), second.close(None)).await;
    assert!(cut_short.is_err());
    assert_eq!(second.pending(), 0);

    unblock.send(()).unwrap();
    closing_first.await.unwrap().unwrap();

    let cancelled = tokio::time::timeout(Duration::from_secs(5), seen_rx)
        .await
        .expect("abandoned release never ran")
        .unwrap();
    assert!(cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_proceeds_while_general_pool_is_saturated() {
    init_test_logging();
    let offloader = Arc::new(
        Offloader::new(&OffloadConfig {
            workers: 1,
            queue: QueuePolicy::Reject,
            exit_workers: 1,
        })
        .unwrap(),
    );
    let invoker = Invoker::new(offloader.clone());
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let scope = ExitScope::new();
    invoker
        .invoke(&logged_resource("conn", log.clone(), released), Arguments::new(), &scope)
        .await
        .unwrap();

    let (unblock, gate) = gated();
    let hog = Callable::blocking("hog", move |_| {
        wait_at(&gate);
        Ok(Value::Null)
    });
    let busy = {
        let invoker = invoker.clone();
        tokio::spawn(async move { invoker.run_async(&hog, Arguments::new()).await })
    };
    wait_until(|| offloader.general().available() == 0).await;

    let extra = Callable::blocking("extra", |_| Ok(Value::Null));
    let refused = invoker.run_async(&extra, Arguments::new()).await;
    assert!(matches!(refused, Err(InvokeError::OffloadExhausted { segment: "general", .. })));

    tokio::time::timeout(Duration::from_secs(5), scope.close(None))
        .await
        .expect("release starved by the general pool")
        .unwrap();
    assert_eq!(*log.lock(), vec!["enter conn", "exit conn (none)"]);

    unblock.send(()).unwrap();
    busy.await.unwrap().unwrap();
}
